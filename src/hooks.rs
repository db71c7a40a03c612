//! Typed hook lists.
//!
//! Each extension point is a named, ordered list of callbacks. Three
//! dispatch disciplines exist: *run-first* (the first callback that does
//! not decline decides), *run-all* (every callback must succeed or
//! decline), and *void fan-out*. Ordering constraints (numeric tier plus
//! predecessor/successor names) are resolved once, before serving, by a
//! topological sort.

use std::io;

use http::StatusCode;

use crate::{
    file_system::FileInfo,
    request::Request,
    PipelineGeneric,
};

/// What a hook callback decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// The phase succeeded; continue.
    Ok,
    /// No opinion; the next callback (or the default) decides.
    Declined,
    /// The request is fully handled; stop transforming it.
    Done,
    /// An explicit HTTP status.
    Status(StatusCode),
}

impl Flow {
    /// True for 4xx and 5xx statuses.
    #[must_use]
    pub fn is_http_error(&self) -> bool {
        matches!(self, Self::Status(s) if s.is_client_error() || s.is_server_error())
    }
}

/// How a stat request should treat a terminal symlink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatKind {
    /// Dereference the link; report the target.
    Follow,
    /// Report the link itself.
    NoFollow,
}

/// Result of a `dirwalk_stat` callback.
#[derive(Debug)]
pub enum StatFlow {
    /// No opinion; the next callback or the real filesystem decides.
    Declined,
    /// The stat result to use.
    Stat(io::Result<FileInfo>),
}

pub const HOOK_REALLY_FIRST: i32 = -10;
pub const HOOK_FIRST: i32 = 0;
pub const HOOK_MIDDLE: i32 = 10;
pub const HOOK_LAST: i32 = 20;
pub const HOOK_REALLY_LAST: i32 = 30;

struct HookEntry<T> {
    name: &'static str,
    order: i32,
    pre: Vec<&'static str>,
    succ: Vec<&'static str>,
    callback: T,
}

/// An ordered list of callbacks for one extension point.
pub struct HookList<T> {
    entries: Vec<HookEntry<T>>,
}

impl<T> Default for HookList<T> {
    fn default() -> Self {
        Self { entries: Vec::new() }
    }
}

impl<T> HookList<T> {
    /// Register at the middle tier with no ordering constraints.
    pub fn register(&mut self, name: &'static str, callback: T) {
        self.register_ordered(name, HOOK_MIDDLE, &[], &[], callback);
    }

    /// Register with a tier and predecessor/successor constraints.
    /// `pre` names entries that must run before this one, `succ` entries
    /// that must run after it. Unknown names are ignored.
    pub fn register_ordered(
        &mut self,
        name: &'static str,
        order: i32,
        pre: &[&'static str],
        succ: &[&'static str],
        callback: T,
    ) {
        self.entries.push(HookEntry {
            name,
            order,
            pre: pre.to_vec(),
            succ: succ.to_vec(),
            callback,
        });
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.iter().map(|e| e.name)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        self.entries.iter().map(|e| &e.callback)
    }

    /// Resolve the final callback order: explicit constraints first, the
    /// numeric tier (then registration order) as tie-break.
    pub(crate) fn sort(&mut self) {
        let n = self.entries.len();
        if n < 2 {
            return;
        }

        let index_of = |name: &str, entries: &[HookEntry<T>]| {
            entries.iter().position(|e| e.name == name)
        };

        // after[a] holds the entries that must run after a.
        let mut after: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut indegree = vec![0usize; n];
        for i in 0..n {
            for name in self.entries[i].pre.clone() {
                if let Some(p) = index_of(name, &self.entries) {
                    after[p].push(i);
                    indegree[i] += 1;
                }
            }
            for name in self.entries[i].succ.clone() {
                if let Some(s) = index_of(name, &self.entries) {
                    after[i].push(s);
                    indegree[s] += 1;
                }
            }
        }

        let mut placed = vec![false; n];
        let mut order: Vec<usize> = Vec::with_capacity(n);
        while order.len() < n {
            let next = (0..n)
                .filter(|&i| !placed[i] && indegree[i] == 0)
                .min_by_key(|&i| (self.entries[i].order, i));
            let Some(next) = next else {
                // Constraint cycle; fall back to registration order for
                // whatever remains.
                tracing::warn!(id = "WW10100", "hook ordering constraints form a cycle");
                for i in 0..n {
                    if !placed[i] {
                        order.push(i);
                    }
                }
                break;
            };
            placed[next] = true;
            for &succ in &after[next] {
                indegree[succ] = indegree[succ].saturating_sub(1);
            }
            order.push(next);
        }

        let mut entries: Vec<Option<HookEntry<T>>> =
            self.entries.drain(..).map(Some).collect();
        self.entries = order.into_iter().filter_map(|i| entries[i].take()).collect();
    }

    /// First callback not declining decides; default is declined.
    pub(crate) fn run_first(&self, mut invoke: impl FnMut(&T) -> Flow) -> Flow {
        for entry in &self.entries {
            match invoke(&entry.callback) {
                Flow::Declined => {}
                decided => return decided,
            }
        }
        Flow::Declined
    }

    /// Every callback must succeed or decline; anything else
    /// short-circuits. Default is success.
    pub(crate) fn run_all(&self, mut invoke: impl FnMut(&T) -> Flow) -> Flow {
        for entry in &self.entries {
            match invoke(&entry.callback) {
                Flow::Ok | Flow::Declined => {}
                decided => return decided,
            }
        }
        Flow::Ok
    }

    /// Fan out to every callback, ignoring results.
    pub(crate) fn run_void(&self, mut invoke: impl FnMut(&T)) {
        for entry in &self.entries {
            invoke(&entry.callback);
        }
    }
}

/// Callback operating on the request.
pub type RequestHook<Fs> =
    Box<dyn Fn(&PipelineGeneric<Fs>, &mut Request) -> Flow + Send + Sync>;

/// Callback invoked for side effects only.
pub type VoidHook<Fs> = Box<dyn Fn(&PipelineGeneric<Fs>, &mut Request) + Send + Sync>;

/// Quick-handler callback; the flag is true for lookup sub-requests.
pub type QuickHook<Fs> =
    Box<dyn Fn(&PipelineGeneric<Fs>, &mut Request, bool) -> Flow + Send + Sync>;

/// Stat interposer consulted by the directory walk.
pub type StatHook = Box<dyn Fn(&Request, &str, StatKind) -> StatFlow + Send + Sync>;

/// Whether an auth participant keys its work purely off the merged
/// per-directory configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthScope {
    /// Decisions depend only on the effective configuration; identical
    /// configs may share walk-cache results.
    PerConf,
    /// Decisions may differ per URI even under one configuration.
    PerUri,
}

/// Every extension point the pipeline consumes.
pub struct HookRegistry<Fs> {
    pub pre_translate_name: HookList<RequestHook<Fs>>,
    pub translate_name: HookList<RequestHook<Fs>>,
    pub map_to_storage: HookList<RequestHook<Fs>>,
    pub header_parser: HookList<RequestHook<Fs>>,
    pub token_checker: HookList<RequestHook<Fs>>,
    pub access_checker: HookList<RequestHook<Fs>>,
    pub access_checker_ex: HookList<RequestHook<Fs>>,
    pub force_authn: HookList<RequestHook<Fs>>,
    pub check_user_id: HookList<RequestHook<Fs>>,
    pub auth_checker: HookList<RequestHook<Fs>>,
    pub type_checker: HookList<RequestHook<Fs>>,
    pub fixups: HookList<RequestHook<Fs>>,
    pub post_perdir_config: HookList<RequestHook<Fs>>,
    pub create_request: HookList<RequestHook<Fs>>,
    pub insert_filter: HookList<VoidHook<Fs>>,
    pub quick_handler: HookList<QuickHook<Fs>>,
    pub dirwalk_stat: HookList<StatHook>,
    auth_per_conf_hooks: usize,
    auth_per_conf_providers: usize,
    auth_total_providers: usize,
}

impl<Fs> Default for HookRegistry<Fs> {
    fn default() -> Self {
        Self {
            pre_translate_name: HookList::default(),
            translate_name: HookList::default(),
            map_to_storage: HookList::default(),
            header_parser: HookList::default(),
            token_checker: HookList::default(),
            access_checker: HookList::default(),
            access_checker_ex: HookList::default(),
            force_authn: HookList::default(),
            check_user_id: HookList::default(),
            auth_checker: HookList::default(),
            type_checker: HookList::default(),
            fixups: HookList::default(),
            post_perdir_config: HookList::default(),
            create_request: HookList::default(),
            insert_filter: HookList::default(),
            quick_handler: HookList::default(),
            dirwalk_stat: HookList::default(),
            auth_per_conf_hooks: 0,
            auth_per_conf_providers: 0,
            auth_total_providers: 0,
        }
    }
}

impl<Fs> HookRegistry<Fs> {
    /// Register an access checker, declaring its configuration scope.
    pub fn check_access(&mut self, name: &'static str, scope: AuthScope, f: RequestHook<Fs>) {
        self.count_auth_scope(scope);
        self.access_checker.register(name, f);
    }

    pub fn check_access_ex(&mut self, name: &'static str, scope: AuthScope, f: RequestHook<Fs>) {
        self.count_auth_scope(scope);
        self.access_checker_ex.register(name, f);
    }

    /// Register an authentication (user identification) hook.
    pub fn check_authn(&mut self, name: &'static str, scope: AuthScope, f: RequestHook<Fs>) {
        self.count_auth_scope(scope);
        self.check_user_id.register(name, f);
    }

    /// Register an authorization hook.
    pub fn check_authz(&mut self, name: &'static str, scope: AuthScope, f: RequestHook<Fs>) {
        self.count_auth_scope(scope);
        self.auth_checker.register(name, f);
    }

    /// Register a token checker.
    pub fn check_autht(&mut self, name: &'static str, scope: AuthScope, f: RequestHook<Fs>) {
        self.count_auth_scope(scope);
        self.token_checker.register(name, f);
    }

    /// Account for an authn/authz provider registered with the external
    /// provider registry.
    pub fn register_auth_provider(&mut self, scope: AuthScope) {
        self.auth_total_providers += 1;
        if scope == AuthScope::PerConf {
            self.auth_per_conf_providers += 1;
        }
    }

    /// Reset the auth-internal bookkeeping (configuration reload).
    pub fn clear_auth_internal(&mut self) {
        self.auth_per_conf_hooks = 0;
        self.auth_per_conf_providers = 0;
        self.auth_total_providers = 0;
    }

    fn count_auth_scope(&mut self, scope: AuthScope) {
        if scope == AuthScope::PerConf {
            self.auth_per_conf_hooks += 1;
        }
    }

    /// Decide whether every auth participant is per-configuration, which
    /// permits walk caches to reuse merge results across requests with
    /// identical configs.
    pub(crate) fn setup_auth_internal(&self) -> bool {
        let total_hooks = self.access_checker.len()
            + self.access_checker_ex.len()
            + self.check_user_id.len()
            + self.auth_checker.len();
        total_hooks <= self.auth_per_conf_hooks
            && self.auth_total_providers <= self.auth_per_conf_providers
    }

    pub(crate) fn sort_all(&mut self) {
        self.pre_translate_name.sort();
        self.translate_name.sort();
        self.map_to_storage.sort();
        self.header_parser.sort();
        self.token_checker.sort();
        self.access_checker.sort();
        self.access_checker_ex.sort();
        self.force_authn.sort();
        self.check_user_id.sort();
        self.auth_checker.sort();
        self.type_checker.sort();
        self.fixups.sort();
        self.post_perdir_config.sort();
        self.create_request.sort();
        self.insert_filter.sort();
        self.quick_handler.sort();
        self.dirwalk_stat.sort();
    }
}
