use bitflags::bitflags;

bitflags! {
    /// Per-directory feature options (`Options` directive).
    ///
    /// The pipeline itself only consults [`AllowOptions::SYM_LINKS`] and
    /// [`AllowOptions::SYM_OWNER`]; the remaining bits ride along so that
    /// content modules can share the same merged value.
    ///
    /// [`AllowOptions::UNSET`] marks a value that composes with its base
    /// through the add/remove sets instead of replacing it, see
    /// [`AllowOptions::merge_onto`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AllowOptions: u16 {
        /// Directory indexing may be generated.
        const INDEXES = 1 << 0;
        /// Server-side includes are enabled.
        const INCLUDES = 1 << 1;
        /// Symbolic links may be followed regardless of ownership.
        const SYM_LINKS = 1 << 2;
        /// CGI execution is enabled.
        const EXEC_CGI = 1 << 3;
        /// The value is relative; compose with the inherited value.
        const UNSET = 1 << 4;
        /// Includes are enabled but `#exec` is not.
        const INC_NO_EXEC = 1 << 5;
        /// Symbolic links may be followed only when link and target share
        /// an owner.
        const SYM_OWNER = 1 << 6;
        /// Content negotiation over multiple views.
        const MULTI_VIEWS = 1 << 7;

        /// Everything except `SYM_OWNER`, `MULTI_VIEWS` and the markers.
        const ALL = Self::INDEXES.bits()
            | Self::INCLUDES.bits()
            | Self::SYM_LINKS.bits()
            | Self::EXEC_CGI.bits();
    }
}

bitflags! {
    /// What a `.htaccess` file (or nested section) may override.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct OverrideSet: u16 {
        /// Access-limiting directives.
        const LIMIT = 1 << 0;
        /// `Options` directives.
        const OPTIONS = 1 << 1;
        /// Document-type directives.
        const FILE_INFO = 1 << 2;
        /// Authentication directives.
        const AUTH_CFG = 1 << 3;
        /// Indexing directives.
        const INDEXES = 1 << 4;
        /// The value is unset; inherit from the base.
        const UNSET = 1 << 5;

        const ALL = Self::LIMIT.bits()
            | Self::OPTIONS.bits()
            | Self::FILE_INFO.bits()
            | Self::AUTH_CFG.bits()
            | Self::INDEXES.bits();
    }
}

bitflags! {
    /// Flags steering [`crate::normalize_path`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct NormalizeFlags: u8 {
        /// Permit paths that do not start with `/` (file sub-requests).
        const ALLOW_RELATIVE = 1 << 0;
        /// Fail instead of resolving `..` past the root segment.
        const NOT_ABOVE_ROOT = 1 << 1;
        /// Collapse runs of `/` into one.
        const MERGE_SLASHES = 1 << 2;
        /// Decode percent-escapes of unreserved characters in the same
        /// pass. Only the first normalization of a path may carry this,
        /// otherwise escapes would be decoded twice.
        const DECODE_UNRESERVED = 1 << 3;
    }
}

bitflags! {
    /// Flags steering [`crate::unescape_url`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct UnescapeFlags: u8 {
        /// Leave escapes of unreserved characters untouched (they were
        /// already decoded during normalization).
        const KEEP_UNRESERVED = 1 << 0;
        /// An encoded `/` fails the request instead of decoding.
        const FORBID_SLASHES = 1 << 1;
        /// An encoded `/` stays encoded instead of decoding.
        const KEEP_SLASHES = 1 << 2;
    }
}

/// Policy for combining the access and authentication phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Satisfy {
    /// Host-based access *and* authentication must both pass.
    All,
    /// Either host-based access or authentication suffices.
    Any,
    /// Not configured; inherits, and behaves like [`Satisfy::All`].
    #[default]
    NoSpec,
}

impl AllowOptions {
    /// Applies `self` onto a running `(opts, add, remove)` triple.
    ///
    /// A value carrying [`AllowOptions::UNSET`] composes: its add/remove
    /// sets are folded into the running sets and then applied. A value
    /// without the marker replaces the running state wholesale.
    pub fn merge_onto(
        self,
        self_add: AllowOptions,
        self_remove: AllowOptions,
        opts: &mut AllowOptions,
        add: &mut AllowOptions,
        remove: &mut AllowOptions,
    ) {
        if self.contains(AllowOptions::UNSET) {
            *add = (*add - self_remove) | self_add;
            *remove = (*remove - self_add) | self_remove;
            *opts = (*opts - *remove) | *add;
        } else {
            *opts = self;
            *add = self_add;
            *remove = self_remove;
        }
    }
}
