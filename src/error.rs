use std::fmt;

use http::StatusCode;
use thiserror::Error;

/// All pipeline errors.
///
/// `thiserror` is used to display meaningful error messages; every variant
/// also maps to the HTTP status the response path should emit, see
/// [`PipelineError::status`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum PipelineError {
    /// The URI path could not be normalized (escape above root, bad
    /// percent-escape, or a relative path where none is allowed).
    #[error("invalid URI path ({0})")]
    InvalidUriPath(/* unparsed uri */ String),

    /// A malformed percent-escape was found while decoding the path.
    #[error("malformed escape sequence in URI path ({0})")]
    BadEscape(/* unparsed uri */ String),

    /// An encoded `/` was found and the configuration forbids it.
    #[error("found %2f (encoded '/') in URI path ({0})")]
    EncodedSlash(/* unparsed uri */ String),

    /// An encoded NUL byte was found in the path.
    #[error("found %00 (encoded NUL) in URI path ({0})")]
    EncodedNul(/* unparsed uri */ String),

    /// A mandatory phase declined: nothing was configured to handle it.
    #[error("configuration error: couldn't {phase}: {uri}")]
    PhaseDeclined { phase: &'static str, uri: String },

    /// A phase returned an explicit HTTP status.
    #[error("phase '{phase}' gave status {status}: {uri}")]
    PhaseStatus { phase: &'static str, status: StatusCode, uri: String },

    /// The cached-directory re-check could not stat a file it stat'ed
    /// moments before. Treated as a filesystem race and denied.
    #[error("access to {uri} failed; stat of '{path}' failed")]
    StatRace { uri: String, path: String },

    /// Symlink traversal denied by policy, or the link target vanished.
    #[error("symbolic link not allowed or link target not accessible: {0}")]
    SymlinkDenied(/* filename */ String),

    /// A path component was not searchable.
    #[error(
        "access to {uri} denied (filesystem path '{path}') because search \
         permissions are missing on a component of the path"
    )]
    SearchPermission { uri: String, path: String },

    /// A path component could not be identified at all.
    #[error("access to {uri} failed (filesystem path '{path}')")]
    StatFailed { uri: String, path: String },

    /// The resolved component is neither a file nor a directory.
    #[error("forbidden: {0} does not point to a file or directory")]
    NotFileOrDir(/* filename */ String),

    /// A stale `path_info` could not be re-rooted under the filename.
    #[error(
        "path_info {path_info} is not relative to the filename path \
         {filename} for uri {uri}"
    )]
    PathInfoNotRelative { path_info: String, filename: String, uri: String },

    /// The filename handed to the directory walk has no root.
    #[error("could not determine the root path of filename {filename} for uri {uri}")]
    NoRootPath { filename: String, uri: String },

    /// Authentication reported success but never named a principal.
    #[error(
        "no authentication done but request not allowed without \
         authentication for {0}"
    )]
    MissingUser(/* uri */ String),

    /// The sub-request or redirect nesting limit was exceeded.
    #[error("sub-request recursion limit exceeded")]
    RecursionLimit,

    /// A status propagated verbatim from an external collaborator.
    #[error("{0}")]
    Status(DeniedStatus),
}

impl PipelineError {
    /// The HTTP status the response path should emit for this error.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidUriPath(_) | Self::BadEscape(_) => StatusCode::BAD_REQUEST,
            Self::EncodedSlash(_) | Self::EncodedNul(_) => StatusCode::NOT_FOUND,
            Self::PhaseDeclined { .. }
            | Self::PathInfoNotRelative { .. }
            | Self::NoRootPath { .. }
            | Self::MissingUser(_)
            | Self::RecursionLimit => StatusCode::INTERNAL_SERVER_ERROR,
            Self::PhaseStatus { status, .. } => *status,
            Self::StatRace { .. }
            | Self::SymlinkDenied(_)
            | Self::SearchPermission { .. }
            | Self::StatFailed { .. }
            | Self::NotFileOrDir(_) => StatusCode::FORBIDDEN,
            Self::Status(denied) => denied.0,
        }
    }

    pub(crate) fn from_status(status: StatusCode) -> Self {
        Self::Status(DeniedStatus(status))
    }
}

/// Newtype giving a bare [`StatusCode`] a display form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeniedStatus(pub StatusCode);

impl fmt::Display for DeniedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "request denied with status {}", self.0)
    }
}

#[test]
fn status_mapping() {
    let error = PipelineError::InvalidUriPath("/../x".to_string());
    assert_eq!(error.status(), StatusCode::BAD_REQUEST);
    assert_eq!(format!("{error}"), "invalid URI path (/../x)");

    let error = PipelineError::EncodedSlash("/x%2Fy".to_string());
    assert_eq!(error.status(), StatusCode::NOT_FOUND);

    let error = PipelineError::PhaseDeclined { phase: "translate", uri: "/a".to_string() };
    assert_eq!(error.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(format!("{error}"), "configuration error: couldn't translate: /a");

    let error = PipelineError::from_status(StatusCode::UNAUTHORIZED);
    assert_eq!(error.status(), StatusCode::UNAUTHORIZED);
}
