use cfg_if::cfg_if;
use std::{fs, io, path::Path};

/// File system abstraction used by `PipelineGeneric`.
///
/// The pipeline only ever inspects inode metadata; reading file contents
/// (`.htaccess` included) is the business of external collaborators.
pub trait FileSystem: Send + Sync {
    /// Stat `path`, following symbolic links.
    ///
    /// # Errors
    ///
    /// * See [std::fs::metadata]
    ///
    /// ## Warning
    /// Use `&Path` instead of a generic `P: AsRef<Path>` here because of
    /// object safety requirements.
    fn stat(&self, path: &Path) -> io::Result<FileInfo>;

    /// Stat `path` without following a terminal symbolic link.
    ///
    /// # Errors
    ///
    /// * See [std::fs::symlink_metadata]
    fn lstat(&self, path: &Path) -> io::Result<FileInfo>;
}

/// What kind of inode a stat found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileKind {
    /// Nothing there (also the pre-stat sentinel).
    #[default]
    NoFile,
    File,
    Dir,
    Link,
    /// A device, socket, pipe or other special inode.
    Other,
}

/// Metadata record for a path component.
///
/// Optional fields stand in for the validity bitmap of a classic stat
/// record: `owner` is present when the platform exposes one, `name` only
/// when the filesystem reported a canonical spelling different from the
/// queried one (case-remembering filesystems).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FileInfo {
    pub kind: FileKind,
    pub owner: Option<u32>,
    pub name: Option<String>,
}

impl FileInfo {
    #[must_use]
    pub fn new(kind: FileKind) -> Self {
        Self { kind, owner: None, name: None }
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Dir
    }

    #[must_use]
    pub fn is_file(&self) -> bool {
        self.kind == FileKind::File
    }

    /// True until some stat has filled this record in.
    #[must_use]
    pub fn is_absent(&self) -> bool {
        self.kind == FileKind::NoFile
    }
}

impl From<fs::Metadata> for FileInfo {
    fn from(metadata: fs::Metadata) -> Self {
        let kind = if metadata.is_symlink() {
            FileKind::Link
        } else if metadata.is_dir() {
            FileKind::Dir
        } else if metadata.is_file() {
            FileKind::File
        } else {
            FileKind::Other
        };
        cfg_if! {
            if #[cfg(unix)] {
                use std::os::unix::fs::MetadataExt;
                let owner = Some(metadata.uid());
            } else {
                let owner = None;
            }
        }
        Self { kind, owner, name: None }
    }
}

/// Operating system file system.
#[derive(Debug, Default)]
pub struct FileSystemOs;

impl FileSystem for FileSystemOs {
    fn stat(&self, path: &Path) -> io::Result<FileInfo> {
        fs::metadata(path).map(FileInfo::from)
    }

    fn lstat(&self, path: &Path) -> io::Result<FileInfo> {
        fs::symlink_metadata(path).map(FileInfo::from)
    }
}

#[test]
fn file_info() {
    let info = FileInfo::new(FileKind::Dir);
    assert!(info.is_dir());
    assert!(!info.is_file());
    assert!(!info.is_absent());
    assert_eq!(format!("{info:?}"), "FileInfo { kind: Dir, owner: None, name: None }");

    assert!(FileInfo::default().is_absent());
}
