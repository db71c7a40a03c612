//! Configuration walks and their per-request caches.
//!
//! Each walk phase keeps one cache per invocation, in invocation order,
//! so the cache of invocation *n* in a sub-request can be seeded from
//! invocation *n* of the parent. A cache never leaves its request: `prep`
//! clones, sharing nothing mutable with the source.
//!
//! Section order in the configuration significantly impacts how much a
//! walk can reuse: common sections grouped at the front of the lists are
//! less likely to diverge between a request and its sub-requests.

pub(crate) mod condition;
pub(crate) mod directory;
pub(crate) mod file;
pub(crate) mod location;

use std::sync::Arc;

use indexmap::IndexMap;

use crate::{
    config::{ConfigVector, Section},
    request::{ParentLink, Request},
};

/// The four independently cached walk phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WalkPhase {
    Location = 0,
    Directory = 1,
    File = 2,
    If = 3,
}

pub(crate) const WALK_PHASES: usize = 4;

/// One section that matched, with the merge result up to that point.
#[derive(Clone)]
pub(crate) struct Walked {
    pub matched: Arc<ConfigVector>,
    pub merged: Arc<ConfigVector>,
}

/// Memo of one walk invocation.
#[derive(Clone, Default)]
pub(crate) struct WalkCache {
    /// The input signature: entry URI, canonical directory, basename, or
    /// a sentinel for the conditional walk.
    pub key: Option<String>,
    /// Identity of the section list that was scanned.
    pub sections: Option<Arc<[Section]>>,
    /// `per_dir_config` at walk entry.
    pub base_config: Option<Arc<ConfigVector>>,
    /// `per_dir_config` at walk exit.
    pub result_config: Option<Arc<ConfigVector>>,
    /// Matched sections with their running merges, in walk order.
    pub walked: Vec<Walked>,
}

impl WalkCache {
    /// True when this cache describes a walk over the same input against
    /// the same section list.
    pub fn hit(&self, key: &str, sections: &Arc<[Section]>) -> bool {
        self.key.as_deref() == Some(key)
            && self.sections.as_ref().is_some_and(|s| Arc::ptr_eq(s, sections))
    }
}

/// Per-request cache vectors, one per phase, indexed by invocation count.
#[derive(Clone, Default)]
pub(crate) struct WalkCaches {
    phases: [Vec<WalkCache>; WALK_PHASES],
}

impl WalkCaches {
    /// Find the most relevant prior cache for the next invocation of
    /// `phase` and clone it: the equivalent-count cache of the redirect
    /// predecessor or parent if one exists, else the previous invocation
    /// in this request, else a fresh cache.
    pub fn prep(
        &self,
        phase: WalkPhase,
        prev: Option<&ParentLink>,
        main: Option<&ParentLink>,
    ) -> WalkCache {
        let own = &self.phases[phase as usize];
        let count = own.len();

        let inherit = prev
            .filter(|link| !link.caches.phases[phase as usize].is_empty())
            .or_else(|| main.filter(|link| !link.caches.phases[phase as usize].is_empty()));
        if let Some(link) = inherit {
            if let Some(cache) = link.caches.phases[phase as usize].get(count) {
                return cache.clone();
            }
        }

        own.last().cloned().unwrap_or_default()
    }

    /// Record the cache of the invocation that just finished.
    pub fn push(&mut self, phase: WalkPhase, cache: WalkCache) {
        self.phases[phase as usize].push(cache);
    }
}

/// Drives the merge loop of a walk: matched sections either re-consume
/// the cached `walked` prefix while it stays in sync, or truncate it and
/// merge for real.
pub(crate) struct MergeTracker {
    pub cache: WalkCache,
    pub now_merged: Option<Arc<ConfigVector>>,
    /// Cached entries not yet re-consumed.
    remaining: usize,
    /// Cached entries re-consumed so far.
    consumed: usize,
    /// `walked` length at entry, to spot newly found matches.
    entry_matches: usize,
    pub cached: bool,
}

impl MergeTracker {
    pub fn new(cache: WalkCache, cached: bool) -> Self {
        let entry_matches = cache.walked.len();
        Self {
            cache,
            now_merged: None,
            remaining: entry_matches,
            consumed: 0,
            entry_matches,
            cached,
        }
    }

    /// Adopt a cache hit wholesale: the walk is skipped and the final
    /// running merge is taken from the cached walk.
    pub fn seed_from_cache(cache: WalkCache) -> Self {
        let entry_matches = cache.walked.len();
        let now_merged = cache.walked.last().map(|w| Arc::clone(&w.merged));
        Self {
            cache,
            now_merged,
            remaining: 0,
            consumed: entry_matches,
            entry_matches,
            cached: true,
        }
    }

    /// A section matched: reuse the cached running merge when the cached
    /// walk matched the same section at this position, otherwise truncate
    /// the stale suffix and merge.
    pub fn apply(&mut self, section_config: &Arc<ConfigVector>) {
        if self.remaining > 0 {
            let walked = &self.cache.walked[self.consumed];
            if Arc::ptr_eq(&walked.matched, section_config) {
                self.now_merged = Some(Arc::clone(&walked.merged));
                self.consumed += 1;
                self.remaining -= 1;
                return;
            }
            // Out of sync with the cached walk.
            self.cache.walked.truncate(self.consumed);
            self.remaining = 0;
            self.cached = false;
        }

        let merged = match &self.now_merged {
            Some(now) => Arc::new(now.merge(section_config)),
            None => Arc::clone(section_config),
        };
        self.cache
            .walked
            .push(Walked { matched: Arc::clone(section_config), merged: Arc::clone(&merged) });
        self.now_merged = Some(merged);
    }

    /// Close out the walk: drop cached matches the walk no longer made,
    /// then either reuse the cached end result (when everything stayed in
    /// sync and the base config is unchanged) or merge the running result
    /// onto the request and record it.
    pub fn conclude(mut self, r: &mut Request, sections: &Arc<[Section]>) -> WalkCache {
        if self.remaining > 0 {
            self.cache.walked.truncate(self.consumed);
            self.cached = false;
        } else if self.cache.walked.len() > self.entry_matches {
            self.cached = false;
        }

        if self.cached
            && self
                .cache
                .base_config
                .as_ref()
                .is_some_and(|base| Arc::ptr_eq(base, &r.per_dir_config))
        {
            if let Some(result) = &self.cache.result_config {
                r.per_dir_config = Arc::clone(result);
                return self.cache;
            }
        }

        self.cache.sections = Some(Arc::clone(sections));
        self.cache.base_config = Some(Arc::clone(&r.per_dir_config));
        if let Some(now) = &self.now_merged {
            r.per_dir_config = Arc::new(r.per_dir_config.merge(now));
        }
        self.cache.result_config = Some(Arc::clone(&r.per_dir_config));
        self.cache
    }
}

/// Publish a regex's named captures into the request environment.
/// Binding is an idempotent overwrite. Returns whether the regex matched.
pub(crate) fn bind_captures(
    re: &regex::Regex,
    text: &str,
    env: &mut IndexMap<String, String>,
) -> bool {
    let Some(caps) = re.captures(text) else {
        return false;
    };
    for name in re.capture_names().flatten() {
        if let Some(capture) = caps.name(name) {
            env.insert(name.to_string(), capture.as_str().to_string());
        }
    }
    true
}
