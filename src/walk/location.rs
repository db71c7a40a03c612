//! The `<Location>` walk: match URL sections against the request URI.

use std::sync::Arc;

use crate::{
    config::Matcher,
    error::PipelineError,
    file_system::FileSystem,
    request::Request,
    uri,
    walk::{bind_captures, MergeTracker, WalkPhase},
    PipelineGeneric,
};

/// A URL section matches when the URI equals the pattern, continues past
/// it at a `/`, or the pattern itself ends in `/`.
fn prefix_match(pattern: &str, uri: &str) -> bool {
    if !uri.starts_with(pattern) {
        return false;
    }
    pattern.is_empty()
        || pattern.ends_with('/')
        || matches!(uri.as_bytes().get(pattern.len()), None | Some(b'/'))
}

pub(crate) fn location_walk<Fs: FileSystem>(
    pipeline: &PipelineGeneric<Fs>,
    r: &mut Request,
) -> Result<(), PipelineError> {
    let sections = Arc::clone(&r.server.sec_url);

    // Nothing to match in this host. Leave the cache alone, in case a
    // later redirect lands somewhere with URL sections again.
    if sections.is_empty() {
        return Ok(());
    }

    let cache = r.caches.prep(WalkPhase::Location, r.prev.as_deref(), r.main.as_deref());
    let had_key = cache.key.is_some();

    // URL sections always match against merged slashes, even when the
    // server leaves them alone in the URI itself.
    let entry_uri =
        if r.server.merge_slashes { r.uri.clone() } else { uri::no2slash(&r.uri) };

    let tracker = if cache.hit(&entry_uri, &sections) {
        // Same URI against the same sections: if the end result is also
        // unchanged there is nothing to do at all.
        if cache
            .result_config
            .as_ref()
            .is_some_and(|result| Arc::ptr_eq(result, &r.per_dir_config))
        {
            r.caches.push(WalkPhase::Location, cache);
            return Ok(());
        }
        MergeTracker::seed_from_cache(cache)
    } else {
        let mut tracker =
            MergeTracker::new(cache, had_key && pipeline.auth_internal_per_conf());
        tracker.cache.key = Some(entry_uri.clone());

        for section in sections.iter() {
            let matched = match &section.matcher {
                Some(Matcher::Regex(re)) => {
                    bind_captures(re, &r.uri, &mut r.subprocess_env)
                }
                Some(Matcher::Glob(pattern)) => fast_glob::glob_match(pattern, &entry_uri),
                Some(Matcher::Literal(pattern)) => prefix_match(pattern, &entry_uri),
                None => false,
            };
            if matched {
                tracker.apply(&section.config);
            }
        }
        tracker
    };

    let cache = tracker.conclude(r, &sections);
    r.caches.push(WalkPhase::Location, cache);
    Ok(())
}
