//! The master per-request state machine.
//!
//! This is the one place that knows the phase order; duplicating the
//! sequence elsewhere would break the security model, since every phase
//! is individually optimized to absorb redundant calls from sub-requests
//! and redirects.

use std::{io, sync::Arc};

use crate::{
    error::PipelineError,
    file_system::{FileInfo, FileSystem},
    hooks::{Flow, StatFlow, StatKind},
    options::{NormalizeFlags, Satisfy, UnescapeFlags},
    request::{Request, BASIC_AUTH_PW_NOTE},
    uri::{self, UnescapeFailure},
    PipelineGeneric,
};

/// Whether processing continues after a phase, or the request was fully
/// handled early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PhaseOutcome {
    Continue,
    Halt,
}

/// States of the access/authentication protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthState {
    Tokens,
    Access,
    AccessEx,
    Authn,
    Authz,
    Done,
}

impl<Fs: FileSystem> PipelineGeneric<Fs> {
    /// Resolve a request through the full phase sequence: normalization,
    /// URL/conditional walks, translation, storage mapping, per-directory
    /// configuration, access control and authentication, type checking
    /// and fixups.
    ///
    /// On success the request carries its final `per_dir_config`,
    /// `filename`, `finfo`, `path_info` and principal. `Ok` is also
    /// returned when a phase reported the request fully handled.
    ///
    /// # Errors
    ///
    /// The first failing phase wins; nothing is recovered. See
    /// [`PipelineError::status`] for the response status.
    pub fn process(&self, r: &mut Request) -> Result<(), PipelineError> {
        match self.process_internal(r) {
            Ok(_) => Ok(()),
            Err(e) => {
                r.status = e.status();
                Err(e)
            }
        }
    }

    fn process_internal(&self, r: &mut Request) -> Result<PhaseOutcome, PipelineError> {
        // File sub-requests skip all URI transformation; they are the
        // only requests allowed an empty URI, and may carry a relative
        // path.
        let file_req = r.main.is_some() && r.filename.is_some();

        let mut normalize_flags = NormalizeFlags::NOT_ABOVE_ROOT;
        if self.server.merge_slashes {
            normalize_flags |= NormalizeFlags::MERGE_SLASHES;
        }
        if file_req {
            normalize_flags |= NormalizeFlags::ALLOW_RELATIVE;
        }

        // While `uri` and the parsed path were born identical, keep them
        // identical through the rewrites below.
        let mirror = r.parsed_uri.path.as_deref() == Some(r.uri.as_str());

        if let Some(path) = r.parsed_uri.path.clone() {
            // Unreserved characters are decoded here, once; the later
            // unescape pass leaves them alone to avoid double decoding.
            let Some(normalized) =
                uri::normalize_path(&path, normalize_flags | NormalizeFlags::DECODE_UNRESERVED)
            else {
                tracing::error!(id = "WW10244", uri = %r.unparsed_uri, "invalid URI path");
                return Err(PipelineError::InvalidUriPath(r.unparsed_uri.clone()));
            };
            set_path(r, normalized, mirror);
        }

        let mut uri_rewriting_done = false;
        if !file_req {
            // Snapshot before the walks: whatever pre_translate_name and
            // these walks merged is thrown away afterwards.
            let snapshot = Arc::clone(&r.per_dir_config);

            self.walk_location_and_if(r)?;

            // pre_translate_name sees the still-encoded URI and may end
            // URI transformation by returning done.
            let flow = self.hooks.pre_translate_name.run_first(|f| f(self, r));
            if flow.is_http_error() {
                if let Flow::Status(status) = flow {
                    return Err(PipelineError::from_status(status));
                }
            }
            uri_rewriting_done = flow == Flow::Done;

            r.per_dir_config = snapshot;
        }

        if !uri_rewriting_done && r.parsed_uri.path.is_some() {
            self.unescape_step(r, normalize_flags, mirror)?;
        }

        if !file_req {
            self.walk_location_and_if(r)?;
            let flow = self.hooks.translate_name.run_first(|f| f(self, r));
            if flow != Flow::Ok {
                return self.phase_result(flow, "translate", r);
            }
        }

        // Storage mapping starts over from the host defaults; everything
        // merged so far was URI-space configuration.
        r.per_dir_config = Arc::clone(&self.server.lookup_defaults);

        match self.hooks.map_to_storage.run_first(|f| f(self, r)) {
            Flow::Ok => {}
            Flow::Declined => {
                // Nothing claimed the request; apply the standard
                // filesystem mapping.
                self.directory_walk(r)?;
                self.file_walk(r)?;
            }
            // This request is not in storage (TRACE and friends).
            Flow::Done => return Ok(PhaseOutcome::Halt),
            Flow::Status(status) => return Err(PipelineError::from_status(status)),
        }

        // Rerun the URL walks: location configuration overrides whatever
        // the storage mapping merged.
        self.walk_location_and_if(r)?;

        match self.hooks.post_perdir_config.run_all(|f| f(self, r)) {
            Flow::Ok => {}
            flow => return self.short_circuit(flow),
        }

        // Only on the main request.
        if r.main.is_none() {
            match self.hooks.header_parser.run_all(|f| f(self, r)) {
                Flow::Ok => {}
                flow => return self.short_circuit(flow),
            }
        }

        if self.authenticate(r)? == PhaseOutcome::Halt {
            return Ok(PhaseOutcome::Halt);
        }

        let flow = self.hooks.type_checker.run_first(|f| f(self, r));
        if flow != Flow::Ok {
            return self.phase_result(flow, "find types", r);
        }

        let flow = self.hooks.fixups.run_all(|f| f(self, r));
        if flow != Flow::Ok {
            tracing::trace!(uri = %r.uri, "fixups hook short-circuited");
            return self.short_circuit(flow);
        }

        Ok(PhaseOutcome::Continue)
    }

    /// Decode the remaining percent-escapes under the effective
    /// encoded-slash policy, then re-normalize if slashes were decoded.
    fn unescape_step(
        &self,
        r: &mut Request,
        normalize_flags: NormalizeFlags,
        mirror: bool,
    ) -> Result<(), PipelineError> {
        let core = r.per_dir_config.core();
        let allow_slashes = core.allow_encoded_slashes();
        let decode_slashes = core.decode_encoded_slashes();

        let mut unescape_flags = UnescapeFlags::KEEP_UNRESERVED;
        if !allow_slashes {
            unescape_flags |= UnescapeFlags::FORBID_SLASHES;
        } else if !decode_slashes {
            unescape_flags |= UnescapeFlags::KEEP_SLASHES;
        }

        let path = r.parsed_uri.path.clone().unwrap_or_default();
        match uri::unescape_url(&path, unescape_flags) {
            Ok(unescaped) => set_path(r, unescaped, mirror),
            Err(UnescapeFailure::EncodedSlash) => {
                tracing::info!(
                    id = "WW00026",
                    uri = %r.unparsed_uri,
                    "found %2f (encoded '/') in URI path, returning 404"
                );
                return Err(PipelineError::EncodedSlash(r.unparsed_uri.clone()));
            }
            Err(UnescapeFailure::EncodedNul) => {
                return Err(PipelineError::EncodedNul(r.unparsed_uri.clone()));
            }
            Err(UnescapeFailure::BadEscape) => {
                return Err(PipelineError::BadEscape(r.unparsed_uri.clone()));
            }
        }

        if allow_slashes && decode_slashes {
            // Decoding slashes may have surfaced new dot segments
            // (e.g. "/.%2F"), so close them again.
            let path = r.parsed_uri.path.clone().unwrap_or_default();
            match uri::normalize_path(&path, normalize_flags) {
                Some(normalized) => set_path(r, normalized, mirror),
                None => {
                    tracing::error!(id = "WW10244", uri = %r.unparsed_uri, "invalid URI path");
                    return Err(PipelineError::InvalidUriPath(r.unparsed_uri.clone()));
                }
            }
        }
        Ok(())
    }

    /// The URL-space walks always travel together.
    fn walk_location_and_if(&self, r: &mut Request) -> Result<(), PipelineError> {
        self.location_walk(r)?;
        self.if_walk(r)
    }

    /// The access/authentication protocol.
    ///
    /// When the effective configuration is identical to the parent's or
    /// the redirect predecessor's, their outcome is inherited and no auth
    /// hook runs. (The walks guarantee identical merge results for
    /// identical inputs, so pointer equality is the right test.)
    fn authenticate(&self, r: &mut Request) -> Result<PhaseOutcome, PipelineError> {
        let inherited = r
            .prev
            .as_ref()
            .filter(|link| Arc::ptr_eq(&link.per_dir_config, &r.per_dir_config))
            .or_else(|| {
                r.main
                    .as_ref()
                    .filter(|link| Arc::ptr_eq(&link.per_dir_config, &r.per_dir_config))
            })
            .cloned();
        if let Some(link) = inherited {
            r.user = link.user.clone();
            r.auth_type = link.auth_type.clone();
            return Ok(PhaseOutcome::Continue);
        }

        // A module using a legacy credential API may have populated the
        // user ahead of authentication; treat that as inadvertent.
        if r.user.is_some() && r.notes.contains_key(BASIC_AUTH_PW_NOTE) {
            r.user = None;
        }

        let satisfy = r.per_dir_config.core().satisfy;
        let mut state = AuthState::Tokens;
        loop {
            state = match state {
                AuthState::Tokens => {
                    let flow = self.hooks.token_checker.run_first(|f| f(self, r));
                    if satisfy == Satisfy::Any {
                        if flow == Flow::Ok {
                            tracing::trace!(
                                uri = %r.uri,
                                "request authorized bypassing access_checker by \
                                 token_checker hook and 'Satisfy any'"
                            );
                            AuthState::Done
                        } else {
                            AuthState::Access
                        }
                    } else {
                        if flow != Flow::Ok && flow != Flow::Declined {
                            return self.phase_result(
                                flow,
                                "check token (with Satisfy All)",
                                r,
                            );
                        }
                        AuthState::Access
                    }
                }
                AuthState::Access => {
                    let flow = self.hooks.access_checker.run_all(|f| f(self, r));
                    if satisfy == Satisfy::Any {
                        if flow == Flow::Ok {
                            tracing::trace!(
                                uri = %r.uri,
                                "request authorized without authentication by \
                                 access_checker hook and 'Satisfy any'"
                            );
                            AuthState::Done
                        } else {
                            AuthState::AccessEx
                        }
                    } else {
                        if flow != Flow::Ok {
                            return self.phase_result(
                                flow,
                                "check access (with Satisfy All)",
                                r,
                            );
                        }
                        AuthState::AccessEx
                    }
                }
                AuthState::AccessEx => {
                    let flow = self.hooks.access_checker_ex.run_first(|f| f(self, r));
                    if flow == Flow::Declined
                        || (flow == Flow::Ok
                            && self.hooks.force_authn.run_first(|f| f(self, r)) == Flow::Ok)
                    {
                        AuthState::Authn
                    } else if flow == Flow::Ok {
                        tracing::trace!(
                            uri = %r.uri,
                            "request authorized without authentication by \
                             access_checker_ex hook"
                        );
                        AuthState::Done
                    } else {
                        return self.phase_result(flow, "check access", r);
                    }
                }
                AuthState::Authn => {
                    let flow = self.hooks.check_user_id.run_first(|f| f(self, r));
                    if flow != Flow::Ok {
                        return self.phase_result(flow, "check user", r);
                    }
                    if r.user.is_none() {
                        // Don't let a buggy authn module crash authz.
                        tracing::error!(
                            id = "WW00027",
                            uri = %r.uri,
                            "no authentication done but request not allowed without \
                             authentication; authentication not configured?"
                        );
                        return Err(PipelineError::MissingUser(r.uri.clone()));
                    }
                    AuthState::Authz
                }
                AuthState::Authz => {
                    let flow = self.hooks.auth_checker.run_first(|f| f(self, r));
                    if flow != Flow::Ok {
                        return self.phase_result(flow, "check authorization", r);
                    }
                    AuthState::Done
                }
                AuthState::Done => return Ok(PhaseOutcome::Continue),
            };
        }
    }

    /// Would this request demand authentication? Runs the access phases
    /// with the principal shielded from modification.
    pub fn some_authn_required(&self, r: &mut Request) -> bool {
        let saved_user = r.user.clone();
        let satisfy = r.per_dir_config.core().satisfy;

        let access_ok = self.hooks.access_checker.run_all(|f| f(self, r)) == Flow::Ok;
        let required = match satisfy {
            Satisfy::All | Satisfy::NoSpec => {
                access_ok
                    && self.hooks.access_checker_ex.run_first(|f| f(self, r)) == Flow::Declined
            }
            Satisfy::Any => {
                !access_ok
                    && self.hooks.access_checker_ex.run_first(|f| f(self, r)) == Flow::Declined
            }
        };

        r.user = saved_user;
        required
    }

    /// Stat through the `dirwalk_stat` interposers, falling back to the
    /// real filesystem.
    pub(crate) fn dirwalk_stat(
        &self,
        r: &Request,
        path: &str,
        kind: StatKind,
    ) -> io::Result<FileInfo> {
        for hook in self.hooks.dirwalk_stat.iter() {
            match hook(r, path, kind) {
                StatFlow::Declined => {}
                StatFlow::Stat(result) => return result,
            }
        }
        match kind {
            StatKind::Follow => self.fs.stat(path.as_ref()),
            StatKind::NoFollow => self.fs.lstat(path.as_ref()),
        }
    }

    /// Fan the `insert_filter` hook out; the embedder calls this right
    /// before content generation.
    pub fn insert_filters(&self, r: &mut Request) {
        self.hooks.insert_filter.run_void(|f| f(self, r));
    }

    pub(crate) fn quick_handler(&self, r: &mut Request, lookup: bool) -> Flow {
        self.hooks.quick_handler.run_first(|f| f(self, r, lookup))
    }

    /// Uniform translation of a phase result: declining a mandatory
    /// phase is a configuration error, an explicit status propagates,
    /// and "done" halts processing successfully.
    fn phase_result(
        &self,
        flow: Flow,
        phase: &'static str,
        r: &Request,
    ) -> Result<PhaseOutcome, PipelineError> {
        match flow {
            Flow::Ok => Ok(PhaseOutcome::Continue),
            Flow::Declined => {
                tracing::error!(
                    id = "WW00025",
                    phase,
                    uri = %r.uri,
                    "configuration error: nothing configured to handle this phase"
                );
                Err(PipelineError::PhaseDeclined { phase, uri: r.uri.clone() })
            }
            Flow::Done => {
                tracing::trace!(phase, uri = %r.uri, "phase fully handled the request");
                Ok(PhaseOutcome::Halt)
            }
            Flow::Status(status) => {
                tracing::trace!(phase, status = %status, uri = %r.uri, "phase gave status");
                Err(PipelineError::PhaseStatus { phase, status, uri: r.uri.clone() })
            }
        }
    }

    /// For advisory run-all phases: done halts, a status propagates.
    fn short_circuit(&self, flow: Flow) -> Result<PhaseOutcome, PipelineError> {
        match flow {
            Flow::Ok | Flow::Declined => Ok(PhaseOutcome::Continue),
            Flow::Done => Ok(PhaseOutcome::Halt),
            Flow::Status(status) => Err(PipelineError::from_status(status)),
        }
    }
}

fn set_path(r: &mut Request, path: String, mirror: bool) {
    if mirror {
        r.uri = path.clone();
    }
    r.parsed_uri.path = Some(path);
}
