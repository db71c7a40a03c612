//! # Walkway
//!
//! The per-request processing pipeline of a modular HTTP server: a
//! fixed-order state machine that takes a parsed request and resolves,
//! through pluggable hook phases interleaved with configuration-tree
//! walks, the effective per-request configuration, an authenticated
//! principal, an authorization decision, a resolved filesystem target
//! and a content type. A sub-request mechanism reuses the same pipeline
//! to resolve sibling URIs and directory entries without a network
//! round-trip.
//!
//! The crate deliberately stops at the pipeline: wire parsing, the
//! configuration-file parser that produces the section trees, expression
//! evaluation for `<If>` guards, `.htaccess` parsing and all content
//! generation live behind the [`FileSystem`], [`HtaccessLoader`] and
//! [`ConditionEval`] traits and the hook registry.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use walkway::{
//!     ConfigVector, CoreDirConfig, CoreServerConfig, Flow, Pipeline, Request,
//! };
//!
//! let defaults = Arc::new(ConfigVector::with_core(CoreDirConfig::default()));
//! let server = Arc::new(CoreServerConfig::new(defaults));
//! let mut pipeline = Pipeline::new(server);
//! pipeline.hooks_mut().translate_name.register("docroot", Box::new(|_, r| {
//!     r.filename = Some(format!("/var/www{}", r.uri));
//!     Flow::Ok
//! }));
//! pipeline.finalize();
//!
//! let mut request = pipeline.new_request("GET", "/index.html");
//! let _ = pipeline.process(&mut request);
//! ```

mod config;
mod error;
mod file_system;
mod hooks;
mod options;
mod pipeline;
mod request;
mod subrequest;
mod uri;
mod walk;

#[cfg(test)]
mod tests;

use std::{fmt, sync::Arc};

pub use crate::{
    config::{
        Condition, ConfigVector, CoreDirConfig, CoreServerConfig, DirConfig, Matcher,
        ModuleId, ModuleRegistry, Section, CORE_MODULE,
    },
    error::{DeniedStatus, PipelineError},
    file_system::{FileInfo, FileKind, FileSystem, FileSystemOs},
    hooks::{
        AuthScope, Flow, HookList, HookRegistry, QuickHook, RequestHook, StatFlow,
        StatHook, StatKind, VoidHook, HOOK_FIRST, HOOK_LAST, HOOK_MIDDLE,
        HOOK_REALLY_FIRST, HOOK_REALLY_LAST,
    },
    options::{AllowOptions, NormalizeFlags, OverrideSet, Satisfy, UnescapeFlags},
    request::{
        Canonical, ParentLink, ParsedUri, Request, BASIC_AUTH_PW_NOTE, SUBREQ_CORE_FILTER,
    },
    subrequest::DirentMerge,
    uri::{escape_uri, normalize_path, unescape_url, UnescapeFailure},
};

/// Supplies pre-parsed per-directory override files to the directory
/// walk. Parsing is external; the walk only decides *when* a directory
/// is consulted and folds the result into the running configuration.
pub trait HtaccessLoader: Send + Sync {
    /// Load the override file of `dir` (a directory path with a trailing
    /// slash), if present. `overrides`, `override_opts` and
    /// `override_list` describe what the file would be allowed to do;
    /// `access_name` is the configured file name.
    ///
    /// # Errors
    ///
    /// An error aborts the walk and is propagated verbatim.
    fn load(
        &self,
        r: &Request,
        dir: &str,
        overrides: OverrideSet,
        override_opts: AllowOptions,
        override_list: Option<&[String]>,
        access_name: &str,
    ) -> Result<Option<Arc<ConfigVector>>, PipelineError>;
}

/// The default loader: no override files anywhere.
#[derive(Debug, Default)]
pub struct NoHtaccess;

impl HtaccessLoader for NoHtaccess {
    fn load(
        &self,
        _r: &Request,
        _dir: &str,
        _overrides: OverrideSet,
        _override_opts: AllowOptions,
        _override_list: Option<&[String]>,
        _access_name: &str,
    ) -> Result<Option<Arc<ConfigVector>>, PipelineError> {
        Ok(None)
    }
}

/// Evaluates `<If>` guard expressions against a request.
pub trait ConditionEval: Send + Sync {
    /// # Errors
    ///
    /// The message is logged; the section is treated as non-matching.
    fn eval(&self, r: &Request, expr: &str) -> Result<bool, String>;
}

/// The default evaluator, for configurations without `<If>` sections.
#[derive(Debug, Default)]
pub struct NoConditions;

impl ConditionEval for NoConditions {
    fn eval(&self, _r: &Request, _expr: &str) -> Result<bool, String> {
        Err("no expression evaluator configured".to_string())
    }
}

/// Pipeline with the operating system as the file system.
pub type Pipeline = PipelineGeneric<FileSystemOs>;

/// Generic implementation of the pipeline, configured by the
/// [`FileSystem`] trait.
pub struct PipelineGeneric<Fs> {
    pub(crate) fs: Fs,
    pub(crate) server: Arc<CoreServerConfig>,
    pub(crate) hooks: HookRegistry<Fs>,
    pub(crate) htaccess: Box<dyn HtaccessLoader>,
    pub(crate) evaluator: Box<dyn ConditionEval>,
    pub(crate) auth_internal_per_conf: bool,
}

impl<Fs> fmt::Debug for PipelineGeneric<Fs> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineGeneric")
            .field("server", &self.server)
            .field("auth_internal_per_conf", &self.auth_internal_per_conf)
            .finish_non_exhaustive()
    }
}

impl<Fs: FileSystem + Default> PipelineGeneric<Fs> {
    #[must_use]
    pub fn new(server: Arc<CoreServerConfig>) -> Self {
        Self::new_with_file_system(Fs::default(), server)
    }
}

impl<Fs: FileSystem> PipelineGeneric<Fs> {
    #[must_use]
    pub fn new_with_file_system(fs: Fs, server: Arc<CoreServerConfig>) -> Self {
        Self {
            fs,
            server,
            hooks: HookRegistry::default(),
            htaccess: Box::new(NoHtaccess),
            evaluator: Box::new(NoConditions),
            auth_internal_per_conf: false,
        }
    }

    #[must_use]
    pub fn with_htaccess_loader(mut self, loader: Box<dyn HtaccessLoader>) -> Self {
        self.htaccess = loader;
        self
    }

    #[must_use]
    pub fn with_condition_eval(mut self, evaluator: Box<dyn ConditionEval>) -> Self {
        self.evaluator = evaluator;
        self
    }

    /// The hook registry, for module registration before [`finalize`].
    ///
    /// [`finalize`]: PipelineGeneric::finalize
    pub fn hooks_mut(&mut self) -> &mut HookRegistry<Fs> {
        &mut self.hooks
    }

    #[must_use]
    pub fn hooks(&self) -> &HookRegistry<Fs> {
        &self.hooks
    }

    #[must_use]
    pub fn server(&self) -> &Arc<CoreServerConfig> {
        &self.server
    }

    /// Resolve hook ordering and the auth-internal gate. Call once after
    /// all registrations; requests processed before this see unsorted
    /// hooks and pessimistic cache reuse.
    pub fn finalize(&mut self) {
        self.hooks.sort_all();
        self.auth_internal_per_conf = self.hooks.setup_auth_internal();
    }

    /// Match `<Location>` sections against the request URI and merge the
    /// winners onto the effective configuration.
    ///
    /// # Errors
    ///
    /// See [`PipelineError`].
    pub fn location_walk(&self, r: &mut Request) -> Result<(), PipelineError> {
        walk::location::location_walk(self, r)
    }

    /// Resolve `filename` against the filesystem, merging `<Directory>`
    /// sections and `.htaccess` files and enforcing the symlink policy.
    /// Usually invoked through the storage-mapping phase.
    ///
    /// # Errors
    ///
    /// See [`PipelineError`].
    pub fn directory_walk(&self, r: &mut Request) -> Result<(), PipelineError> {
        walk::directory::directory_walk(self, r)
    }

    /// Match `<Files>` sections against the basename of `filename`.
    ///
    /// # Errors
    ///
    /// See [`PipelineError`].
    pub fn file_walk(&self, r: &mut Request) -> Result<(), PipelineError> {
        walk::file::file_walk(self, r)
    }

    /// Evaluate `<If>` sections (including ones nested in matched
    /// sections) and merge the winners.
    ///
    /// # Errors
    ///
    /// See [`PipelineError`].
    pub fn if_walk(&self, r: &mut Request) -> Result<(), PipelineError> {
        walk::condition::if_walk(self, r)
    }

    pub(crate) fn fs(&self) -> &Fs {
        &self.fs
    }

    pub(crate) fn htaccess(&self) -> &dyn HtaccessLoader {
        self.htaccess.as_ref()
    }

    pub(crate) fn evaluator(&self) -> &dyn ConditionEval {
        self.evaluator.as_ref()
    }

    pub(crate) fn auth_internal_per_conf(&self) -> bool {
        self.auth_internal_per_conf
    }
}
