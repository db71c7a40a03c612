//! The sub-request mechanism.
//!
//! Sub-requests resolve a sibling URI, a directory entry or a file
//! through the full pipeline without touching the network. They perform
//! every access check; running the resulting content is the embedder's
//! business. Construction inherits the parent's walk caches, so a
//! sub-request whose configuration matches the parent re-merges nothing.

use std::sync::Arc;

use http::StatusCode;

use crate::{
    file_system::{FileInfo, FileKind, FileSystem},
    hooks::{Flow, StatKind},
    options::AllowOptions,
    request::{Canonical, Request, SUBREQ_CORE_FILTER},
    uri,
    walk::directory::resolve_symlink,
    PipelineGeneric,
};

/// Whether a dirent lookup re-appends the parent's `path_info` and query
/// arguments onto the child URI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirentMerge {
    NoArgs,
    MergeArgs,
}

impl<Fs: FileSystem> PipelineGeneric<Fs> {
    /// Construct a main request for `target` and announce it to the
    /// `create_request` hooks.
    pub fn new_request(&self, method: &str, target: &str) -> Request {
        let mut r = Request::new(method, target, Arc::clone(&self.server));
        let _ = self.hooks.create_request.run_all(|f| f(self, &mut r));
        r
    }

    /// The common skeleton of every sub-request.
    ///
    /// `next_filter` is the output chain the caller wants the response
    /// routed through; `None` announces an expected internal fast
    /// redirect, which drills the chain down to the protocol filters.
    fn make_sub_request(&self, parent: &Request, next_filter: Option<&[Arc<str>]>) -> Request {
        let mut rnew = Request::blank(Arc::clone(&self.server));

        // A clean config from the host defaults: the walk caches coming
        // through the parent link assure that matching blocks of the
        // parent merge for free.
        match next_filter {
            Some(chain) => {
                rnew.output_filters = chain.to_vec();
                rnew.proto_output_filters = parent.proto_output_filters.clone();
                if !chain.iter().any(|name| name.as_ref() == SUBREQ_CORE_FILTER) {
                    rnew.output_filters.insert(0, Arc::from(SUBREQ_CORE_FILTER));
                }
            }
            None => {
                // Ignore the parent's request-level filters entirely.
                rnew.output_filters = parent.proto_output_filters.clone();
                rnew.proto_output_filters = parent.proto_output_filters.clone();
            }
        }

        // Pass on any kept body.
        rnew.kept_body = parent.kept_body.clone();

        rnew.main = Some(Arc::new(parent.parent_link()));
        rnew.depth = parent.depth + 1;
        rnew.redirects = parent.redirects;

        let _ = self.hooks.create_request.run_all(|f| f(self, &mut rnew));
        rnew
    }

    /// Resolve a possibly-relative URI as a GET sub-request.
    pub fn lookup_uri(
        &self,
        new_uri: &str,
        parent: &Request,
        next_filter: Option<&[Arc<str>]>,
    ) -> Request {
        self.lookup_method_uri("GET", new_uri, parent, next_filter)
    }

    /// Resolve a possibly-relative URI as a sub-request with the given
    /// method.
    pub fn lookup_method_uri(
        &self,
        method: &str,
        new_uri: &str,
        parent: &Request,
        next_filter: Option<&[Arc<str>]>,
    ) -> Request {
        let mut rnew = self.make_sub_request(parent, next_filter);
        rnew.method = method.to_string();

        let target = if new_uri.starts_with('/') {
            new_uri.to_string()
        } else {
            // Relative to the parent's directory, re-escaped: the
            // parent URI is stored decoded.
            let udir = uri::escape_uri(&uri::dirstr_parent(&parent.uri));
            uri::full_path(&udir, new_uri)
        };
        rnew.parse_uri(&target);

        // The API cannot return nothing, so a blown recursion limit
        // turns the sub-request itself into a 500.
        if parent.is_recursion_limit_exceeded() {
            rnew.status = StatusCode::INTERNAL_SERVER_ERROR;
            return rnew;
        }

        // A quick handler may serve lookups outright, but never when an
        // internal fast redirect is expected: that happens too late for
        // it.
        let mut flow = Flow::Declined;
        if next_filter.is_some() {
            flow = self.quick_handler(&mut rnew, true);
        }
        match flow {
            Flow::Declined => {
                _ = self.process(&mut rnew);
            }
            Flow::Status(status) => rnew.status = status,
            Flow::Ok | Flow::Done => {}
        }
        rnew
    }

    /// Resolve a directory entry whose name just came from the
    /// filesystem: a same-directory lookup that reuses the parent's
    /// `path_info` and stat knowledge.
    pub fn lookup_dirent(
        &self,
        dirent: &FileInfo,
        parent: &Request,
        subtype: DirentMerge,
        next_filter: Option<&[Arc<str>]>,
    ) -> Request {
        let mut rnew = self.make_sub_request(parent, next_filter);

        let Some(name) = dirent.name.clone() else {
            // A dirent without a name cannot have come from a directory
            // scan.
            rnew.status = StatusCode::INTERNAL_SERVER_ERROR;
            return rnew;
        };

        let mut new_uri;
        if parent.path_info.is_empty() {
            new_uri = uri::full_path(&uri::dirstr_parent(&parent.uri), &name);
        } else {
            // Strip path_info off the parent URI to keep it in sync with
            // the filename (already stripped by the directory walk), then
            // re-append it if the caller asked for a merge.
            let mut udir = parent.uri.clone();
            udir.truncate(uri::find_path_info(&udir, &parent.path_info));
            new_uri = uri::full_path(&uri::dirstr_parent(&udir), &name);
            if subtype == DirentMerge::MergeArgs {
                let tail =
                    parent.path_info.strip_prefix('/').unwrap_or(&parent.path_info);
                new_uri = uri::full_path(&new_uri, tail);
                rnew.path_info = parent.path_info.clone();
            }
        }
        let mut new_uri = uri::escape_uri(&new_uri);

        let fdir = uri::dirstr_parent(parent.filename.as_deref().unwrap_or(""));
        let mut filename = uri::full_path(&fdir, &name);
        rnew.filename = Some(filename.clone());
        if parent.has_canonical_filename() {
            rnew.canonical_filename = Canonical::Latched(filename.clone());
        }

        if dirent.kind == FileKind::NoFile {
            // The directory scan left the entry unidentified; stat it
            // under the link policy the defaults allow. A link resolving
            // to a directory reruns everything anyway.
            rnew.finfo = self.stat_for_lookup(&rnew, &filename).unwrap_or_default();
        } else {
            rnew.finfo = dirent.clone();
        }

        if rnew.finfo.kind == FileKind::Link {
            let opts = rnew.per_dir_config.core().allow_options();
            let mut finfo = rnew.finfo.clone();
            if let Err(e) = resolve_symlink(&self.fs, &filename, &mut finfo, opts) {
                rnew.status = e.status();
                return rnew;
            }
            rnew.finfo = finfo;
        }

        if rnew.finfo.kind == FileKind::Dir {
            filename.push('/');
            rnew.filename = Some(filename);
            if rnew.path_info.is_empty() {
                new_uri.push('/');
            }
        }

        let target = match (subtype, parent.args.as_deref()) {
            (DirentMerge::MergeArgs, Some(args)) if !args.is_empty() => {
                format!("{new_uri}?{args}")
            }
            _ => new_uri,
        };
        rnew.parse_uri(&target);

        if parent.is_recursion_limit_exceeded() {
            rnew.status = StatusCode::INTERNAL_SERVER_ERROR;
            return rnew;
        }

        _ = self.process(&mut rnew);
        rnew
    }

    /// Resolve a file path relative to the parent's directory.
    pub fn lookup_file(
        &self,
        new_file: &str,
        parent: &Request,
        next_filter: Option<&[Arc<str>]>,
    ) -> Request {
        let mut rnew = self.make_sub_request(parent, next_filter);

        let fdir = uri::dirstr_parent(parent.filename.as_deref().unwrap_or(""));

        // If the parent's filename was canonical, the merge result stays
        // canonical.
        if parent.has_canonical_filename() {
            rnew.canonical_filename = Canonical::Pending;
        }

        let Some(filename) = uri::merge_file_path(&fdir, new_file) else {
            rnew.status = StatusCode::FORBIDDEN;
            return rnew;
        };
        rnew.filename = Some(filename.clone());
        if rnew.canonical_filename == Canonical::Pending {
            rnew.canonical_filename = Canonical::Latched(filename.clone());
        }

        // With no further slashes and the same directory, this is a
        // relative lookup beside the parent; fix the URI up to match.
        let remainder = filename.strip_prefix(&fdir);
        if remainder.is_some_and(|rest| !rest.is_empty() && !rest.contains('/')) {
            rnew.finfo = self.stat_for_lookup(&rnew, &filename).unwrap_or_default();

            if parent.uri.is_empty() {
                rnew.parse_uri(new_file);
                rnew.uri = String::new();
            } else {
                let udir = uri::dirstr_parent(&parent.uri);
                let target = uri::full_path(&udir, remainder.unwrap_or(&filename));
                rnew.parse_uri(&target);
            }
        } else {
            // The file may not have a URI at all; leave it empty rather
            // than fabricate one.
            rnew.parse_uri(new_file);
            rnew.uri = String::new();
        }

        if parent.is_recursion_limit_exceeded() {
            rnew.status = StatusCode::INTERNAL_SERVER_ERROR;
            return rnew;
        }

        _ = self.process(&mut rnew);
        rnew
    }

    /// Stat a lookup target, preserving links unless the effective
    /// options follow them freely.
    fn stat_for_lookup(&self, rnew: &Request, filename: &str) -> Option<FileInfo> {
        let kind = if rnew.per_dir_config.core().allow_options().contains(AllowOptions::SYM_LINKS)
        {
            StatKind::Follow
        } else {
            StatKind::NoFollow
        };
        match kind {
            StatKind::Follow => self.fs.stat(filename.as_ref()).ok(),
            StatKind::NoFollow => self.fs.lstat(filename.as_ref()).ok(),
        }
    }
}
