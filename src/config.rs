//! Configuration trees.
//!
//! Per-directory configuration is a *vector*: a mapping from module
//! identity to an opaque module-owned record. The pipeline core never
//! interprets module records beyond its own [`CoreDirConfig`]; merging is
//! a module-dispatched fold through the [`DirConfig`] trait.
//!
//! Section trees are built once at startup, wrapped in `Arc`s, and are
//! read-only while requests are in flight. Pointer identity of vectors
//! and section lists is the "configuration unchanged" relation relied on
//! by the walk caches and the authentication inheritance rule.

use std::{any::Any, fmt, sync::Arc};

use once_cell::sync::Lazy;

use crate::{
    options::{AllowOptions, OverrideSet, Satisfy},
    uri,
};

/// Identity of a registered module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleId(pub(crate) usize);

/// The pipeline core's own module slot.
pub const CORE_MODULE: ModuleId = ModuleId(0);

/// Hands out [`ModuleId`]s; the core module is pre-registered at slot 0.
#[derive(Debug)]
pub struct ModuleRegistry {
    names: Vec<&'static str>,
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self { names: vec!["core"] }
    }

    pub fn register(&mut self, name: &'static str) -> ModuleId {
        self.names.push(name);
        ModuleId(self.names.len() - 1)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    #[must_use]
    pub fn name(&self, id: ModuleId) -> Option<&'static str> {
        self.names.get(id.0).copied()
    }
}

/// A module's per-directory record.
///
/// `merge` folds an overlay of the *same module* onto `self`; the result
/// must behave as if the overlay's directives were written after the
/// base's.
pub trait DirConfig: Any + Send + Sync {
    fn merge(&self, overlay: &dyn DirConfig) -> Arc<dyn DirConfig>;

    fn as_any(&self) -> &dyn Any;
}

static DEFAULT_CORE: Lazy<CoreDirConfig> = Lazy::new(CoreDirConfig::default);

/// The module-pointer bag holding one optional record per module.
#[derive(Clone, Default)]
pub struct ConfigVector {
    slots: Vec<Option<Arc<dyn DirConfig>>>,
}

impl fmt::Debug for ConfigVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let filled: Vec<usize> =
            self.slots.iter().enumerate().filter_map(|(i, s)| s.as_ref().map(|_| i)).collect();
        f.debug_struct("ConfigVector").field("modules", &filled).finish()
    }
}

impl ConfigVector {
    #[must_use]
    pub fn new(modules: usize) -> Self {
        Self { slots: vec![None; modules.max(1)] }
    }

    /// A vector holding only the given core record.
    #[must_use]
    pub fn with_core(core: CoreDirConfig) -> Self {
        let mut vector = Self::new(1);
        vector.set(CORE_MODULE, Arc::new(core));
        vector
    }

    pub fn set(&mut self, id: ModuleId, config: Arc<dyn DirConfig>) {
        if id.0 >= self.slots.len() {
            self.slots.resize(id.0 + 1, None);
        }
        self.slots[id.0] = Some(config);
    }

    /// Typed accessor for a module's record.
    #[must_use]
    pub fn get<T: DirConfig>(&self, id: ModuleId) -> Option<&T> {
        self.slots.get(id.0)?.as_ref()?.as_any().downcast_ref::<T>()
    }

    /// The core record, falling back to the compiled-in defaults when a
    /// vector was built without one.
    #[must_use]
    pub fn core(&self) -> &CoreDirConfig {
        self.get::<CoreDirConfig>(CORE_MODULE).unwrap_or(&DEFAULT_CORE)
    }

    /// Module-dispatched fold of `overlay` onto `self`.
    #[must_use]
    pub fn merge(&self, overlay: &ConfigVector) -> ConfigVector {
        let len = self.slots.len().max(overlay.slots.len());
        let mut slots = Vec::with_capacity(len);
        for i in 0..len {
            let base = self.slots.get(i).and_then(Option::as_ref);
            let over = overlay.slots.get(i).and_then(Option::as_ref);
            slots.push(match (base, over) {
                (Some(base), Some(over)) => Some(base.merge(over.as_ref())),
                (Some(base), None) => Some(Arc::clone(base)),
                (None, Some(over)) => Some(Arc::clone(over)),
                (None, None) => None,
            });
        }
        ConfigVector { slots }
    }
}

/// The core module's per-directory record: the handful of knobs the
/// pipeline itself reads during walks and the auth protocol.
#[derive(Debug, Clone)]
pub struct CoreDirConfig {
    pub opts: AllowOptions,
    pub opts_add: AllowOptions,
    pub opts_remove: AllowOptions,
    pub overrides: OverrideSet,
    pub override_opts: AllowOptions,
    /// Directive names a `.htaccess` may use even when `overrides` says
    /// otherwise. `None` means no list was configured.
    pub override_list: Option<Arc<[String]>>,
    pub allow_encoded_slashes: Option<bool>,
    pub decode_encoded_slashes: Option<bool>,
    pub satisfy: Satisfy,
    /// `<Files>` sections nested in this scope.
    pub sec_file: Arc<[Section]>,
    /// `<If>`/`<ElseIf>`/`<Else>` sections nested in this scope.
    pub sec_if: Arc<[Section]>,
}

impl Default for CoreDirConfig {
    fn default() -> Self {
        Self {
            opts: AllowOptions::UNSET,
            opts_add: AllowOptions::empty(),
            opts_remove: AllowOptions::empty(),
            overrides: OverrideSet::UNSET,
            override_opts: AllowOptions::ALL,
            override_list: None,
            allow_encoded_slashes: None,
            decode_encoded_slashes: None,
            satisfy: Satisfy::NoSpec,
            sec_file: Arc::from([]),
            sec_if: Arc::from([]),
        }
    }
}

impl CoreDirConfig {
    /// The effective `Options` value, marker bit stripped.
    #[must_use]
    pub fn allow_options(&self) -> AllowOptions {
        self.opts - AllowOptions::UNSET
    }

    #[must_use]
    pub fn allow_encoded_slashes(&self) -> bool {
        self.allow_encoded_slashes.unwrap_or(false)
    }

    #[must_use]
    pub fn decode_encoded_slashes(&self) -> bool {
        self.decode_encoded_slashes.unwrap_or(false)
    }

    #[must_use]
    pub fn with_options(mut self, opts: AllowOptions) -> Self {
        self.opts = opts;
        self
    }

    #[must_use]
    pub fn with_options_relative(mut self, add: AllowOptions, remove: AllowOptions) -> Self {
        self.opts = AllowOptions::UNSET;
        self.opts_add = add;
        self.opts_remove = remove;
        self
    }

    #[must_use]
    pub fn with_overrides(mut self, overrides: OverrideSet) -> Self {
        self.overrides = overrides;
        self
    }

    #[must_use]
    pub fn with_override_list<I: IntoIterator<Item = String>>(mut self, list: I) -> Self {
        self.override_list = Some(list.into_iter().collect());
        self
    }

    #[must_use]
    pub fn with_encoded_slashes(mut self, allow: bool, decode: bool) -> Self {
        self.allow_encoded_slashes = Some(allow);
        self.decode_encoded_slashes = Some(decode);
        self
    }

    #[must_use]
    pub fn with_satisfy(mut self, satisfy: Satisfy) -> Self {
        self.satisfy = satisfy;
        self
    }

    #[must_use]
    pub fn with_file_sections(mut self, sections: Vec<Section>) -> Self {
        self.sec_file = sections.into();
        self
    }

    #[must_use]
    pub fn with_if_sections(mut self, sections: Vec<Section>) -> Self {
        self.sec_if = sections.into();
        self
    }
}

fn concat_sections(base: &Arc<[Section]>, overlay: &Arc<[Section]>) -> Arc<[Section]> {
    if overlay.is_empty() {
        Arc::clone(base)
    } else if base.is_empty() {
        Arc::clone(overlay)
    } else {
        base.iter().chain(overlay.iter()).cloned().collect()
    }
}

impl DirConfig for CoreDirConfig {
    fn merge(&self, overlay: &dyn DirConfig) -> Arc<dyn DirConfig> {
        let Some(over) = overlay.as_any().downcast_ref::<CoreDirConfig>() else {
            return Arc::new(self.clone());
        };
        let mut merged = self.clone();
        over.opts.merge_onto(
            over.opts_add,
            over.opts_remove,
            &mut merged.opts,
            &mut merged.opts_add,
            &mut merged.opts_remove,
        );
        if !over.overrides.contains(OverrideSet::UNSET) {
            merged.overrides = over.overrides;
            merged.override_opts = over.override_opts;
        }
        if over.override_list.is_some() {
            merged.override_list = over.override_list.clone();
        }
        if over.allow_encoded_slashes.is_some() {
            merged.allow_encoded_slashes = over.allow_encoded_slashes;
        }
        if over.decode_encoded_slashes.is_some() {
            merged.decode_encoded_slashes = over.decode_encoded_slashes;
        }
        if over.satisfy != Satisfy::NoSpec {
            merged.satisfy = over.satisfy;
        }
        merged.sec_file = concat_sections(&self.sec_file, &over.sec_file);
        merged.sec_if = concat_sections(&self.sec_if, &over.sec_if);
        Arc::new(merged)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// How a section decides whether it applies.
#[derive(Debug, Clone)]
pub enum Matcher {
    /// Exact (or, for URL sections, prefix) string match.
    Literal(String),
    /// Path-aware glob: `*` does not cross `/`.
    Glob(String),
    /// Regular expression; named captures are published to the request
    /// environment on match.
    Regex(Arc<regex::Regex>),
}

impl Matcher {
    #[must_use]
    pub fn literal<S: Into<String>>(pattern: S) -> Self {
        Self::Literal(pattern.into())
    }

    #[must_use]
    pub fn glob<S: Into<String>>(pattern: S) -> Self {
        Self::Glob(pattern.into())
    }

    /// # Errors
    ///
    /// Returns the underlying [`regex::Error`] for an invalid pattern.
    pub fn regex(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self::Regex(Arc::new(regex::Regex::new(pattern)?)))
    }

    #[must_use]
    pub(crate) fn is_regex(&self) -> bool {
        matches!(self, Self::Regex(_))
    }
}

/// Guard of an `<If>`-family section.
#[derive(Debug, Clone)]
pub enum Condition {
    If(Arc<str>),
    ElseIf(Arc<str>),
    Else,
}

impl Condition {
    /// Does this arm only fire when the preceding `<If>` did not?
    pub(crate) fn is_else(&self) -> bool {
        matches!(self, Self::ElseIf(_) | Self::Else)
    }

    pub(crate) fn expr(&self) -> Option<&str> {
        match self {
            Self::If(expr) | Self::ElseIf(expr) => Some(expr),
            Self::Else => None,
        }
    }
}

/// One configuration section: a matcher (or condition) scoping a config
/// vector.
#[derive(Debug, Clone)]
pub struct Section {
    pub(crate) matcher: Option<Matcher>,
    /// Directory-segment count; `<Directory>` sections are walked in
    /// non-decreasing order of this.
    pub(crate) segments: usize,
    pub(crate) condition: Option<Condition>,
    pub(crate) config: Arc<ConfigVector>,
}

impl Section {
    /// A `<Location>`-style section matched against the request URI.
    #[must_use]
    pub fn location(matcher: Matcher, config: Arc<ConfigVector>) -> Self {
        Self { matcher: Some(matcher), segments: 0, condition: None, config }
    }

    /// A `<Directory>`-style section. Literal and glob patterns are
    /// normalized to carry a trailing slash so they compare against the
    /// walk's directory spellings; `/` is classified as zero segments so
    /// it applies everywhere.
    #[must_use]
    pub fn directory(matcher: Matcher, config: Arc<ConfigVector>) -> Self {
        let (matcher, segments) = match matcher {
            Matcher::Literal(p) => normalized_dir_pattern(p, Matcher::Literal),
            Matcher::Glob(p) => normalized_dir_pattern(p, Matcher::Glob),
            regex @ Matcher::Regex(_) => (regex, 0),
        };
        Self { matcher: Some(matcher), segments, condition: None, config }
    }

    /// A `<Files>`-style section matched against the basename.
    #[must_use]
    pub fn files(matcher: Matcher, config: Arc<ConfigVector>) -> Self {
        Self { matcher: Some(matcher), segments: 0, condition: None, config }
    }

    /// An `<If>`-family section.
    #[must_use]
    pub fn condition(condition: Condition, config: Arc<ConfigVector>) -> Self {
        Self { matcher: None, segments: 0, condition: Some(condition), config }
    }

    #[must_use]
    pub fn config(&self) -> &Arc<ConfigVector> {
        &self.config
    }

    pub(crate) fn is_regex(&self) -> bool {
        self.matcher.as_ref().is_some_and(Matcher::is_regex)
    }
}

fn normalized_dir_pattern(mut pattern: String, wrap: fn(String) -> Matcher) -> (Matcher, usize) {
    if !pattern.ends_with('/') {
        pattern.push('/');
    }
    let segments = if pattern == "/" { 0 } else { uri::count_dirs(&pattern) };
    (wrap(pattern), segments)
}

/// Server-wide configuration the pipeline reads.
#[derive(Debug, Clone)]
pub struct CoreServerConfig {
    /// Collapse duplicate slashes before URL matching. Default `true`.
    pub merge_slashes: bool,
    /// Filename of the per-directory override file. Default `.htaccess`.
    pub access_name: String,
    /// `<Location>` sections in declared order.
    pub sec_url: Arc<[Section]>,
    /// `<Directory>` sections: literals in non-decreasing segment count,
    /// regexes after all literals (enforced by
    /// [`CoreServerConfig::with_dir_sections`]).
    pub sec_dir: Arc<[Section]>,
    /// The virtual host's default per-directory vector; every request
    /// and sub-request starts from it.
    pub lookup_defaults: Arc<ConfigVector>,
    /// Maximum sub-request nesting depth. Default 10.
    pub subreq_depth_limit: u32,
    /// Maximum internal-redirect chain length. Default 10.
    pub redirect_limit: u32,
}

impl CoreServerConfig {
    #[must_use]
    pub fn new(lookup_defaults: Arc<ConfigVector>) -> Self {
        Self {
            merge_slashes: true,
            access_name: ".htaccess".to_string(),
            sec_url: Arc::from([]),
            sec_dir: Arc::from([]),
            lookup_defaults,
            subreq_depth_limit: 10,
            redirect_limit: 10,
        }
    }

    #[must_use]
    pub fn with_merge_slashes(mut self, merge: bool) -> Self {
        self.merge_slashes = merge;
        self
    }

    #[must_use]
    pub fn with_access_name<S: Into<String>>(mut self, name: S) -> Self {
        self.access_name = name.into();
        self
    }

    #[must_use]
    pub fn with_url_sections(mut self, sections: Vec<Section>) -> Self {
        self.sec_url = sections.into();
        self
    }

    /// Installs `<Directory>` sections, restoring the walk-order
    /// invariant: literals stably sorted by ascending segment count,
    /// regexes moved after all literals in declared order.
    #[must_use]
    pub fn with_dir_sections(mut self, mut sections: Vec<Section>) -> Self {
        sections.sort_by_key(|s| if s.is_regex() { (true, 0) } else { (false, s.segments) });
        self.sec_dir = sections.into();
        self
    }

    #[must_use]
    pub fn with_recursion_limits(mut self, subreq_depth: u32, redirects: u32) -> Self {
        self.subreq_depth_limit = subreq_depth;
        self.redirect_limit = redirects;
        self
    }
}
