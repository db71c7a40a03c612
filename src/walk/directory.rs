//! The directory walk.
//!
//! Descends the resolved filesystem path segment by segment, merging the
//! `<Directory>` sections and `.htaccess` files that apply at each level,
//! and gates symlink traversal as the options stand *at that level*. The
//! check cannot wait for the final merged configuration: a directory with
//! symlinks disabled may contain a link into a tree whose own
//! configuration turns them back on, and such access must be denied.

use std::{io, sync::Arc};

use crate::{
    config::{ConfigVector, CoreDirConfig, Matcher, CORE_MODULE},
    error::PipelineError,
    file_system::{FileInfo, FileKind, FileSystem},
    hooks::StatKind,
    options::{AllowOptions, OverrideSet},
    request::{Canonical, Request},
    uri,
    walk::{bind_captures, MergeTracker, WalkPhase},
    PipelineGeneric,
};

/// The running mini-merge of the few core knobs the walk itself tests.
/// The full per-directory merge happens through the config vectors; this
/// one only governs symlink and `.htaccess` policy on the way down.
#[derive(Debug, Clone)]
pub(crate) struct WalkOpts {
    pub opts: AllowOptions,
    add: AllowOptions,
    remove: AllowOptions,
    pub overrides: OverrideSet,
    pub override_opts: AllowOptions,
    pub override_list: Option<Arc<[String]>>,
}

impl WalkOpts {
    pub fn from_core(core: &CoreDirConfig) -> Self {
        Self {
            opts: core.opts,
            add: core.opts_add,
            remove: core.opts_remove,
            overrides: core.overrides,
            override_opts: core.override_opts,
            override_list: core.override_list.clone(),
        }
    }

    /// Fold a matched section's core record into the running state.
    pub fn merge_section(&mut self, config: &ConfigVector) {
        let Some(core) = config.get::<CoreDirConfig>(CORE_MODULE) else {
            return;
        };
        core.opts.merge_onto(
            core.opts_add,
            core.opts_remove,
            &mut self.opts,
            &mut self.add,
            &mut self.remove,
        );
        if !core.overrides.contains(OverrideSet::UNSET) {
            self.overrides = core.overrides;
            self.override_opts = core.override_opts;
        }
        if core.override_list.is_some() {
            self.override_list = core.override_list.clone();
        }
    }

    fn htaccess_enabled(&self) -> bool {
        !self.overrides.is_empty()
            || self.override_list.as_ref().is_some_and(|list| !list.is_empty())
    }
}

/// Resolve a path known to be a symlink, applying the symlink policy.
///
/// The path must be clean: no trailing slash, no duplicate slashes, and
/// never the filesystem root. On success `lfi` is replaced by the
/// target's record, keeping the link's own reported name.
pub(crate) fn resolve_symlink<Fs: FileSystem>(
    fs: &Fs,
    path: &str,
    lfi: &mut FileInfo,
    opts: AllowOptions,
) -> Result<(), PipelineError> {
    if !opts.intersects(AllowOptions::SYM_OWNER | AllowOptions::SYM_LINKS) {
        return Err(PipelineError::SymlinkDenied(path.to_string()));
    }

    let denied = || PipelineError::SymlinkDenied(path.to_string());
    let savename = lfi.name.clone();

    if !opts.contains(AllowOptions::SYM_OWNER) {
        // Links are allowed wholesale; only the target must be reachable.
        let target = fs.stat(path.as_ref()).map_err(|_| denied())?;
        *lfi = target;
        if savename.is_some() {
            lfi.name = savename;
        }
        return Ok(());
    }

    // Owner matching needs the owner of both the link and its target.
    let link_owner = match lfi.owner {
        Some(owner) => owner,
        None => fs
            .lstat(path.as_ref())
            .ok()
            .and_then(|info| info.owner)
            .ok_or_else(denied)?,
    };
    let target = fs.stat(path.as_ref()).map_err(|_| denied())?;
    if target.owner != Some(link_owner) {
        return Err(denied());
    }

    *lfi = target;
    if savename.is_some() {
        lfi.name = savename;
    }
    Ok(())
}

pub(crate) fn directory_walk<Fs: FileSystem>(
    pipeline: &PipelineGeneric<Fs>,
    r: &mut Request,
) -> Result<(), PipelineError> {
    let sections = Arc::clone(&r.server.sec_dir);

    // "OK" for a missing or unusable filename is not OK, but broken
    // modules get to proceed and fail in a later phase instead.
    let Some(filename) = r.filename.clone() else {
        tracing::info!(
            id = "WW00029",
            uri = %r.uri,
            "module bug? request filename is missing"
        );
        return Ok(());
    };

    // Canonicalize without resolving name case or links, so the cache can
    // be checked against a stable spelling.
    let Some(entry) = uri::absolute_path(&filename) else {
        tracing::info!(
            id = "WW00030",
            filename = %filename,
            uri = %r.uri,
            "module bug? request filename path is invalid or not absolute"
        );
        return Ok(());
    };
    r.filename = Some(entry.clone());

    let cache = r.caches.prep(WalkPhase::Directory, r.prev.as_deref(), r.main.as_deref());
    let had_key = cache.key.is_some();

    // Unless a dirent sub-request preconstructed finfo, stat the whole
    // filename up front: an exact file match saves stat-per-component.
    if matches!(r.finfo.kind, FileKind::NoFile | FileKind::Link) {
        match pipeline.dirwalk_stat(r, &entry, StatKind::Follow) {
            Ok(info) => {
                r.finfo = info;
                // A name with a trailing slash that is not a directory is
                // treated as absent, whatever the platform said.
                if r.finfo.kind != FileKind::NoFile
                    && r.finfo.kind != FileKind::Dir
                    && entry.ends_with('/')
                {
                    r.finfo = FileInfo::default();
                }
            }
            Err(_) => r.finfo = FileInfo::default(),
        }
    }

    let entry_dir = if r.finfo.kind == FileKind::File {
        uri::dirstr_parent(&entry)
    } else if entry.ends_with('/') {
        entry.clone()
    } else {
        format!("{entry}/")
    };

    // Fast path: an exact match on the cached entry directory against an
    // unchanged section list.
    let tracker = if had_key
        && (r.finfo.kind == FileKind::File
            || (r.finfo.kind == FileKind::Dir && r.path_info.is_empty()))
        && cache.hit(&entry_dir, &sections)
    {
        let mut familiar = false;
        if cache
            .result_config
            .as_ref()
            .is_some_and(|result| Arc::ptr_eq(result, &r.per_dir_config))
        {
            familiar = true;
        }
        if cache
            .base_config
            .as_ref()
            .is_some_and(|base| Arc::ptr_eq(base, &r.per_dir_config))
        {
            if let Some(result) = &cache.result_config {
                r.per_dir_config = Arc::clone(result);
                familiar = true;
            }
        }

        if familiar {
            recheck_terminal_symlink(pipeline, r, &entry)?;
            r.canonical_filename = Canonical::Latched(entry);
            r.caches.push(WalkPhase::Directory, cache);
            return Ok(());
        }

        MergeTracker::seed_from_cache(cache)
    } else {
        let mut tracker =
            MergeTracker::new(cache, had_key && pipeline.auth_internal_per_conf());
        descend(pipeline, r, &mut tracker, &sections, &entry)?;
        tracker
    };

    // The walk is the canonicalizer of record: whatever it resolved is
    // what every later phase and sub-request sees.
    let final_name = r.filename.clone().unwrap_or(entry);
    r.canonical_filename = Canonical::Latched(final_name.clone());

    let mut tracker = tracker;
    tracker.cache.key = Some(if r.finfo.kind == FileKind::Dir {
        final_name
    } else {
        uri::dirstr_parent(&final_name)
    });

    let cache = tracker.conclude(r, &sections);
    r.caches.push(WalkPhase::Directory, cache);
    Ok(())
}

/// The fast path skipped the per-component checks, so unless symlinks
/// are allowed outright the terminal component must be re-examined with
/// link-following forbidden.
fn recheck_terminal_symlink<Fs: FileSystem>(
    pipeline: &PipelineGeneric<Fs>,
    r: &mut Request,
    entry: &str,
) -> Result<(), PipelineError> {
    let opts = r.per_dir_config.core().opts;
    if opts.contains(AllowOptions::SYM_LINKS) {
        return Ok(());
    }

    let mut thisinfo = match pipeline.dirwalk_stat(r, entry, StatKind::NoFollow) {
        Ok(info) => info,
        Err(_) => {
            // The same file stat'ed moments ago: only a race can fail
            // here, and a race gets the conservative answer.
            tracing::error!(
                id = "WW00031",
                uri = %r.uri,
                filename = %entry,
                "access failed; stat of cached filename failed"
            );
            return Err(PipelineError::StatRace {
                uri: r.uri.clone(),
                path: entry.to_string(),
            });
        }
    };

    if thisinfo.kind == FileKind::Link {
        resolve_symlink(pipeline.fs(), entry, &mut thisinfo, opts).map_err(|e| {
            tracing::error!(
                id = "WW00032",
                filename = %entry,
                "symbolic link not allowed or link target not accessible"
            );
            e
        })?;
    }
    Ok(())
}

/// The slow path: walk from the filesystem root down to the target,
/// merging sections and `.htaccess` files level by level.
fn descend<Fs: FileSystem>(
    pipeline: &PipelineGeneric<Fs>,
    r: &mut Request,
    tracker: &mut MergeTracker,
    sections: &Arc<[crate::config::Section]>,
    entry: &str,
) -> Result<(), PipelineError> {
    let mut opts = WalkOpts::from_core(r.per_dir_config.core());

    // r.path_info tracks the unconsumed source path, r.filename the path
    // as processed. A directory cannot have path_info of its own: either
    // re-root the stale tail below the filename, or set the whole
    // filename aside as the source and restore the tail afterwards.
    let save_path_info: Option<String>;
    let source: String;
    if r.finfo.kind == FileKind::Dir && !r.path_info.is_empty() {
        match uri::merge_paths(entry, &r.path_info) {
            Some(merged) => source = merged,
            None => {
                tracing::error!(
                    id = "WW00033",
                    path_info = %r.path_info,
                    filename = %entry,
                    uri = %r.uri,
                    "dir walk error, path_info is not relative to the filename path"
                );
                return Err(PipelineError::PathInfoNotRelative {
                    path_info: r.path_info.clone(),
                    filename: entry.to_string(),
                    uri: r.uri.clone(),
                });
            }
        }
        save_path_info = None;
    } else {
        save_path_info = Some(std::mem::take(&mut r.path_info));
        source = entry.to_string();
    }

    let Some(stripped) = source.strip_prefix('/') else {
        tracing::error!(
            id = "WW00034",
            filename = %source,
            uri = %r.uri,
            "dir walk error, could not determine the root path"
        );
        return Err(PipelineError::NoRootPath { filename: source, uri: r.uri.clone() });
    };

    let mut fname = String::from("/");
    let mut rest = stripped.to_string();
    let startseg = uri::count_dirs(&fname);
    let mut seg = startseg;
    let mut sec_idx = 0;
    // The root is a directory, of course.
    let mut thisinfo = FileInfo::new(FileKind::Dir);

    loop {
        // Sections and .htaccess compare against the directory spelling
        // with a trailing slash; drop it again before building on.
        let had_slash = fname.ends_with('/');
        if !had_slash {
            fname.push('/');
        }

        // Matching sections at this depth, in segment order. Regex and
        // deeper sections end the scan; they resume later.
        while sec_idx < sections.len() {
            let section = &sections[sec_idx];
            if section.is_regex() || section.segments > seg {
                break;
            }
            // Zero-segment sections apply everywhere; otherwise the
            // pattern must cover exactly this many segments and admit
            // the current prefix.
            let matched = section.segments == 0
                || (section.segments == seg
                    && match &section.matcher {
                        Some(Matcher::Glob(pattern)) => fast_glob::glob_match(pattern, &fname),
                        Some(Matcher::Literal(pattern)) => pattern == &fname,
                        _ => false,
                    });
            sec_idx += 1;
            if !matched {
                continue;
            }
            opts.merge_section(&section.config);
            tracker.apply(&section.config);
        }

        // A .htaccess at this level, if overrides give it any power and
        // we are inside a complete root.
        if seg >= startseg && opts.htaccess_enabled() {
            r.filename = Some(fname.clone());
            r.path_info = rest.clone();
            if let Some(htaccess) = pipeline.htaccess().load(
                r,
                &fname,
                opts.overrides,
                opts.override_opts,
                opts.override_list.as_deref(),
                &r.server.access_name,
            )? {
                opts.merge_section(&htaccess);
                tracker.apply(&htaccess);
            }
        }

        if !had_slash {
            fname.pop();
        }

        if rest.is_empty() {
            break;
        }

        // Consume the next segment from the source into the filename.
        let search_from = usize::from(rest.starts_with('/'));
        let (segment, remainder) = match rest[search_from..].find('/') {
            Some(i) => {
                let cut = search_from + i;
                (rest[..cut].to_string(), rest[cut..].to_string())
            }
            None => (rest.clone(), String::new()),
        };
        rest = remainder;
        let seg_name = segment.strip_prefix('/').unwrap_or(&segment).to_string();
        fname.push_str(&segment);

        // Only a bare slash remained: the directory itself is the target.
        if seg_name.is_empty() {
            break;
        }

        // When the entry stat already identified the target and symlinks
        // are allowed without owner checks, a directory component can be
        // assumed without touching the filesystem.
        if r.finfo.kind != FileKind::NoFile
            && (opts.opts & (AllowOptions::SYM_OWNER | AllowOptions::SYM_LINKS))
                == AllowOptions::SYM_LINKS
        {
            thisinfo = FileInfo::new(FileKind::Dir);
            seg += 1;
            continue;
        }

        // Link-preserving stat: we want this path object, not its target,
        // and especially its name when fixing filename case.
        r.filename = Some(fname.clone());
        r.path_info = rest.clone();
        match pipeline.dirwalk_stat(r, &fname, StatKind::NoFollow) {
            Ok(info) => thisinfo = info,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                // Nothing there; the descent is over and the remainder is
                // path_info.
                thisinfo = FileInfo::default();
                break;
            }
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                tracing::error!(
                    id = "WW00035",
                    uri = %r.uri,
                    filename = %fname,
                    "access denied because search permissions are missing on a component"
                );
                return Err(PipelineError::SearchPermission {
                    uri: r.uri.clone(),
                    path: fname,
                });
            }
            Err(_) => {
                tracing::error!(
                    id = "WW00036",
                    uri = %r.uri,
                    filename = %fname,
                    "access failed (stat of path component)"
                );
                return Err(PipelineError::StatFailed { uri: r.uri.clone(), path: fname });
            }
        }

        // The filesystem knows this component under a canonical spelling.
        if let Some(name) = thisinfo.name.clone() {
            if name != seg_name {
                fname.truncate(fname.len() - seg_name.len());
                fname.push_str(&name);
                r.filename = Some(fname.clone());
            }
        }

        if thisinfo.kind == FileKind::Link {
            resolve_symlink(pipeline.fs(), &fname, &mut thisinfo, opts.opts).map_err(|e| {
                tracing::error!(
                    id = "WW00037",
                    filename = %fname,
                    "symbolic link not allowed or link target not accessible"
                );
                e
            })?;
        }

        match thisinfo.kind {
            // A file (or nothing) ends the descent; the remainder is
            // path_info.
            FileKind::File | FileKind::NoFile => break,
            FileKind::Dir => seg += 1,
            FileKind::Link | FileKind::Other => {
                tracing::error!(
                    id = "WW00038",
                    filename = %fname,
                    "forbidden: not a file or directory"
                );
                return Err(PipelineError::NotFileOrDir(fname));
            }
        }
    }

    // Unless a dirent sub-request supplied finfo up front, the last
    // component examined is the answer.
    if matches!(r.finfo.kind, FileKind::NoFile | FileKind::Link) {
        r.finfo = thisinfo;
    }

    // Splice the saved tail back onto whatever new tail the descent left.
    r.path_info = rest;
    if let Some(saved) = save_path_info {
        if !saved.is_empty() {
            if r.path_info.is_empty() {
                r.path_info = saved;
            } else {
                let tail = saved.trim_start_matches('/');
                r.path_info = uri::full_path(&r.path_info, tail);
            }
        }
    }

    // Deferred regex sections run over the full resolved filename.
    while sec_idx < sections.len() {
        let section = &sections[sec_idx];
        sec_idx += 1;
        let Some(Matcher::Regex(re)) = &section.matcher else {
            continue;
        };
        if !bind_captures(re, &fname, &mut r.subprocess_env) {
            continue;
        }
        opts.merge_section(&section.config);
        tracker.apply(&section.config);
    }

    r.filename = Some(fname);
    Ok(())
}
