//! The per-request record.

use std::{sync::Arc, time::SystemTime};

use http::StatusCode;
use indexmap::IndexMap;
use rustc_hash::FxHashMap;

use crate::{
    config::{ConfigVector, CoreServerConfig},
    file_system::FileInfo,
    uri,
    walk::WalkCaches,
};

/// Note key flagging that a legacy credential API populated
/// [`Request::user`] ahead of the authentication phase; such a user is
/// cleared before authentication runs.
pub const BASIC_AUTH_PW_NOTE: &str = "get-basic-auth-pw";

/// The path/query split of the request target.
#[derive(Debug, Clone, Default)]
pub struct ParsedUri {
    /// The URI path as URL-matching sees it; normalization and the
    /// unescape pass mutate this.
    pub path: Option<String>,
    pub query: Option<String>,
}

/// State of the canonical-filename latch.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Canonical {
    /// No walk has canonicalized the filename yet.
    #[default]
    Unset,
    /// The filename is known canonical but has not been latched yet
    /// (sub-request construction ahead of its first walk).
    Pending,
    /// The canonical spelling, latched by the directory walk.
    Latched(String),
}

/// Immutable snapshot of the parent (or redirect predecessor) state a
/// child request consults: a lookup relation, never ownership.
#[derive(Clone)]
pub struct ParentLink {
    pub per_dir_config: Arc<ConfigVector>,
    pub user: Option<String>,
    pub auth_type: Option<String>,
    pub(crate) caches: WalkCaches,
    pub(crate) depth: u32,
    pub(crate) redirects: u32,
}

/// Name of the output filter that strips sub-request framing.
pub const SUBREQ_CORE_FILTER: &str = "subreq-core";

/// A request (or sub-request) being resolved by the pipeline.
///
/// All fields are owned by the request and dropped with it;
/// configuration vectors and section lists are shared, immutable `Arc`s.
pub struct Request {
    pub method: String,
    /// The logical path presented to URL matching. Mirrors
    /// [`ParsedUri::path`] while the two started out identical.
    pub uri: String,
    /// The original request target, for diagnostics only.
    pub unparsed_uri: String,
    pub parsed_uri: ParsedUri,
    pub args: Option<String>,
    /// The filesystem path; mutated by the directory walk until it names
    /// the resolved target.
    pub filename: Option<String>,
    pub canonical_filename: Canonical,
    /// The unconsumed tail of the path after the resolved target. Empty
    /// means none.
    pub path_info: String,
    pub finfo: FileInfo,
    /// The currently effective merged configuration; reassigned by every
    /// walk.
    pub per_dir_config: Arc<ConfigVector>,
    /// The authenticated principal, if any.
    pub user: Option<String>,
    pub auth_type: Option<String>,
    /// Module scratch space.
    pub notes: FxHashMap<String, String>,
    /// Environment handed to content generators; receives regex capture
    /// bindings from the walks.
    pub subprocess_env: IndexMap<String, String>,
    pub status: StatusCode,
    pub mtime: Option<SystemTime>,
    /// Request body retained for sub-requests, if the protocol kept one.
    pub kept_body: Option<Arc<[u8]>>,
    /// Output filter chain by name.
    pub output_filters: Vec<Arc<str>>,
    /// The protocol-owned tail of the output chain.
    pub proto_output_filters: Vec<Arc<str>>,
    pub(crate) server: Arc<CoreServerConfig>,
    pub(crate) caches: WalkCaches,
    pub(crate) main: Option<Arc<ParentLink>>,
    pub(crate) prev: Option<Arc<ParentLink>>,
    /// Sub-request nesting depth; 0 for the main request.
    pub(crate) depth: u32,
    /// Internal-redirect chain length.
    pub(crate) redirects: u32,
}

impl Request {
    /// A fresh main request for `uri` (path with optional query).
    #[must_use]
    pub fn new<M: Into<String>>(method: M, target: &str, server: Arc<CoreServerConfig>) -> Self {
        let mut r = Self::blank(server);
        r.method = method.into();
        r.parse_uri(target);
        r
    }

    pub(crate) fn blank(server: Arc<CoreServerConfig>) -> Self {
        Self {
            method: "GET".to_string(),
            uri: String::new(),
            unparsed_uri: String::new(),
            parsed_uri: ParsedUri::default(),
            args: None,
            filename: None,
            canonical_filename: Canonical::Unset,
            path_info: String::new(),
            finfo: FileInfo::default(),
            per_dir_config: Arc::clone(&server.lookup_defaults),
            user: None,
            auth_type: None,
            notes: FxHashMap::default(),
            subprocess_env: IndexMap::new(),
            status: StatusCode::OK,
            mtime: None,
            kept_body: None,
            output_filters: Vec::new(),
            proto_output_filters: Vec::new(),
            server,
            caches: WalkCaches::default(),
            main: None,
            prev: None,
            depth: 0,
            redirects: 0,
        }
    }

    /// A request replacing `predecessor` after an internal redirect; the
    /// predecessor's effective configuration and auth state stay
    /// reachable through the redirect link.
    #[must_use]
    pub fn internal_redirect(target: &str, predecessor: &Request) -> Self {
        let mut r = Self::new(
            predecessor.method.clone(),
            target,
            Arc::clone(&predecessor.server),
        );
        r.prev = Some(Arc::new(predecessor.parent_link()));
        r.redirects = predecessor.redirects + 1;
        r.depth = predecessor.depth;
        r
    }

    /// (Re)parse the request target into `uri`, `parsed_uri` and `args`.
    pub(crate) fn parse_uri(&mut self, target: &str) {
        self.unparsed_uri = target.to_string();
        let (path, query) = uri::split_uri(target);
        self.args = query.clone();
        self.uri = path.clone();
        self.parsed_uri = ParsedUri { path: Some(path), query };
    }

    #[must_use]
    pub fn server(&self) -> &Arc<CoreServerConfig> {
        &self.server
    }

    /// The parent of a sub-request chain, if this is a sub-request.
    #[must_use]
    pub fn main(&self) -> Option<&ParentLink> {
        self.main.as_deref()
    }

    /// The predecessor after an internal redirect, if any.
    #[must_use]
    pub fn prev(&self) -> Option<&ParentLink> {
        self.prev.as_deref()
    }

    #[must_use]
    pub fn is_sub_request(&self) -> bool {
        self.main.is_some()
    }

    /// Is this the initial request, seen exactly once per HTTP request?
    #[must_use]
    pub fn is_initial_req(&self) -> bool {
        self.main.is_none() && self.prev.is_none()
    }

    /// True when the directory walk has latched the current filename as
    /// canonical.
    #[must_use]
    pub fn has_canonical_filename(&self) -> bool {
        match (&self.canonical_filename, &self.filename) {
            (Canonical::Latched(canonical), Some(filename)) => canonical == filename,
            _ => false,
        }
    }

    /// Would one more sub-request or redirect exceed the configured
    /// nesting limits?
    #[must_use]
    pub fn is_recursion_limit_exceeded(&self) -> bool {
        self.depth + 1 > self.server.subreq_depth_limit
            || self.redirects > self.server.redirect_limit
    }

    /// Raise `mtime` to `dependency_mtime` if that is later.
    pub fn update_mtime(&mut self, dependency_mtime: SystemTime) {
        if self.mtime.is_none_or(|mtime| mtime < dependency_mtime) {
            self.mtime = Some(dependency_mtime);
        }
    }

    pub(crate) fn parent_link(&self) -> ParentLink {
        ParentLink {
            per_dir_config: Arc::clone(&self.per_dir_config),
            user: self.user.clone(),
            auth_type: self.auth_type.clone(),
            caches: self.caches.clone(),
            depth: self.depth,
            redirects: self.redirects,
        }
    }
}
