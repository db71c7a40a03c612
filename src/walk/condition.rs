//! The conditional walk: evaluate `<If>`/`<ElseIf>`/`<Else>` guards and
//! merge the sections whose guard holds.

use std::sync::Arc;

use crate::{
    error::PipelineError,
    file_system::FileSystem,
    request::Request,
    walk::{MergeTracker, WalkPhase},
    PipelineGeneric,
};

pub(crate) fn if_walk<Fs: FileSystem>(
    pipeline: &PipelineGeneric<Fs>,
    r: &mut Request,
) -> Result<(), PipelineError> {
    let mut sections = Arc::clone(&r.per_dir_config.core().sec_if);

    // Sections matched at one level may carry nested <If> blocks of their
    // own; those participate against the merged result, one cache
    // invocation per level.
    loop {
        if sections.is_empty() {
            return Ok(());
        }

        let cache = r.caches.prep(WalkPhase::If, r.prev.as_deref(), r.main.as_deref());
        let had_key = cache.key.is_some();
        let mut tracker =
            MergeTracker::new(cache, had_key && pipeline.auth_internal_per_conf());
        // The conditional walk has no input signature; the sentinel only
        // records that this invocation happened.
        tracker.cache.key = Some("1".to_string());

        // -1: no preceding <If>; 0: it was false; 1: it was true.
        let mut prev_result: i8 = -1;
        for section in sections.iter() {
            let Some(condition) = &section.condition else {
                continue;
            };

            if condition.is_else() {
                debug_assert!(prev_result != -1);
                if prev_result == 1 {
                    continue;
                }
            }

            if let Some(expr) = condition.expr() {
                match pipeline.evaluator().eval(r, expr) {
                    Ok(true) => prev_result = 1,
                    Ok(false) => {
                        prev_result = 0;
                        continue;
                    }
                    Err(message) => {
                        tracing::error!(
                            id = "WW00039",
                            error = %message,
                            "failed to evaluate <If> condition"
                        );
                        prev_result = 0;
                        continue;
                    }
                }
            } else {
                prev_result = -1;
            }

            tracker.apply(&section.config);
        }

        let now_merged = tracker.now_merged.clone();
        let cache = tracker.conclude(r, &sections);
        r.caches.push(WalkPhase::If, cache);

        match now_merged {
            Some(merged) => sections = Arc::clone(&merged.core().sec_if),
            None => return Ok(()),
        }
    }
}
