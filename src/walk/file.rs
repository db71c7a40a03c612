//! The `<Files>` walk: match file sections against the basename.

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

pub(crate) fn file_walk<Fs: FileSystem>(
    pipeline: &PipelineGeneric<Fs>,
    r: &mut Request,
) -> Result<(), PipelineError> {
    let sections = Arc::clone(&r.per_dir_config.core().sec_file);

    // Missing filenames pass so that broken modules keep limping along;
    // the directory walk already posted a note for debugging, and later
    // phases will reject.
    let Some(filename) = r.filename.clone() else {
        return Ok(());
    };

    if sections.is_empty() {
        return Ok(());
    }

    let cache = r.caches.prep(WalkPhase::File, r.prev.as_deref(), r.main.as_deref());
    let had_key = cache.key.is_some();

    // Copy the basename: another module may munge r.filename later.
    let test_file = uri::basename(&filename).to_string();

    let tracker = if cache.hit(&test_file, &sections) {
        if cache
            .result_config
            .as_ref()
            .is_some_and(|result| Arc::ptr_eq(result, &r.per_dir_config))
        {
            r.caches.push(WalkPhase::File, cache);
            return Ok(());
        }
        MergeTracker::seed_from_cache(cache)
    } else {
        let mut tracker =
            MergeTracker::new(cache, had_key && pipeline.auth_internal_per_conf());
        tracker.cache.key = Some(test_file.clone());

        for section in sections.iter() {
            let matched = match &section.matcher {
                Some(Matcher::Regex(re)) => {
                    bind_captures(re, &test_file, &mut r.subprocess_env)
                }
                Some(Matcher::Glob(pattern)) => fast_glob::glob_match(pattern, &test_file),
                Some(Matcher::Literal(pattern)) => pattern == &test_file,
                None => false,
            };
            if matched {
                tracker.apply(&section.config);
            }
        }
        tracker
    };

    let cache = tracker.conclude(r, &sections);
    r.caches.push(WalkPhase::File, cache);
    Ok(())
}
