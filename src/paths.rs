//! Absolute-path handling and small filesystem helpers.
//!
//! Everything downstream compares paths byte-for-byte (the published symlink
//! target, worktree directories), so all externally-supplied paths are pushed
//! through [`AbsPath::canonical`] once at startup and stay normalized from
//! then on.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use eyre::{Context, Result};
use tracing::{debug, warn};

/// Directory mode for everything we create, subject to the process umask.
pub const DEFAULT_DIR_MODE: u32 = 0o775;

/// An absolute filesystem path.
///
/// Constructed either by canonicalizing an arbitrary path (resolves symlinks,
/// requires the path to exist) or by joining onto an already-absolute path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AbsPath(PathBuf);

impl AbsPath {
    /// Canonicalize `path`: make it absolute and resolve all symlinks.
    ///
    /// The path must exist.
    pub fn canonical(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let resolved = fs::canonicalize(path)
            .with_context(|| format!("can't canonicalize {}", path.display()))?;
        Ok(Self(resolved))
    }

    /// Wrap a path that is already known to be absolute.
    ///
    /// Returns `None` if `path` is relative.
    pub fn from_absolute(path: impl Into<PathBuf>) -> Option<Self> {
        let path = path.into();
        if path.is_absolute() {
            Some(Self(path))
        } else {
            None
        }
    }

    /// Append a path, resolving `.` and `..` components lexically.
    ///
    /// Symlink targets read back from disk are relative and may climb out of
    /// the link directory; joining must normalize them so that paths compare
    /// equal byte-for-byte.
    pub fn join(&self, rel: impl AsRef<Path>) -> Self {
        use std::path::Component;

        let rel = rel.as_ref();
        let mut out = if rel.is_absolute() {
            PathBuf::from("/")
        } else {
            self.0.clone()
        };
        for comp in rel.components() {
            match comp {
                Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
                Component::ParentDir => {
                    out.pop();
                }
                Component::Normal(c) => out.push(c),
            }
        }
        Self(out)
    }

    /// Split into the parent directory and the final component.
    pub fn split(&self) -> (AbsPath, String) {
        let dir = self.dir();
        (dir, self.base())
    }

    /// The final path component, or "" for the root.
    pub fn base(&self) -> String {
        self.0
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// The parent directory. The root directory is its own parent.
    pub fn dir(&self) -> AbsPath {
        match self.0.parent() {
            Some(p) => Self(p.to_path_buf()),
            None => self.clone(),
        }
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }

    pub fn exists(&self) -> bool {
        self.0.exists()
    }
}

impl fmt::Display for AbsPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

impl AsRef<Path> for AbsPath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

/// Make an absolute path from one that might be relative.
///
/// An absolute `path` is used as-is; a relative one is joined onto `root`.
/// Empty input produces `None`.
pub fn make_absolute(path: &str, root: &AbsPath) -> Option<AbsPath> {
    if path.is_empty() {
        return None;
    }
    let p = Path::new(path);
    if p.is_absolute() {
        Some(AbsPath(p.to_path_buf()))
    } else {
        Some(root.join(p))
    }
}

/// Create a directory and any missing parents with [`DEFAULT_DIR_MODE`].
pub fn mkdir_all(path: impl AsRef<Path>) -> Result<()> {
    use std::os::unix::fs::DirBuilderExt;

    let path = path.as_ref();
    fs::DirBuilder::new()
        .recursive(true)
        .mode(DEFAULT_DIR_MODE)
        .create(path)
        .with_context(|| format!("can't create directory {}", path.display()))
}

/// Compute the path of `target` relative to the directory `base`.
///
/// Both inputs are absolute; the result is the relative path that, joined
/// onto `base`, reaches `target` again.
pub fn relative_to(base: &AbsPath, target: &AbsPath) -> PathBuf {
    let base_parts: Vec<_> = base.as_path().components().collect();
    let target_parts: Vec<_> = target.as_path().components().collect();

    let common = base_parts
        .iter()
        .zip(target_parts.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut rel = PathBuf::new();
    for _ in common..base_parts.len() {
        rel.push("..");
    }
    for part in &target_parts[common..] {
        rel.push(part.as_os_str());
    }
    if rel.as_os_str().is_empty() {
        rel.push(".");
    }
    rel
}

/// Ensure the path exists and bump its timestamps to now.
///
/// Works for regular files and directories; a missing file is created along
/// with its parent directories.
pub fn touch(path: &AbsPath) -> Result<()> {
    mkdir_all(path.dir().as_path())?;
    let now = SystemTime::now();
    // Read-only open is enough for futimens and also works on directories.
    match fs::File::open(path.as_path()) {
        Ok(file) => file
            .set_modified(now)
            .with_context(|| format!("can't update mtime of {path}")),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            fs::File::create(path.as_path())
                .with_context(|| format!("can't create {path}"))?;
            Ok(())
        }
        Err(err) => Err(err).with_context(|| format!("can't open {path}")),
    }
}

/// True if the directory has no entries.
pub fn dir_is_empty(dir: &AbsPath) -> Result<bool> {
    let mut entries =
        fs::read_dir(dir.as_path()).with_context(|| format!("can't list {dir}"))?;
    Ok(entries.next().is_none())
}

/// Remove every entry under `dir`, leaving `dir` itself in place.
///
/// The directory itself is preserved because it is commonly a mount point.
pub fn remove_dir_contents(dir: &AbsPath) -> Result<()> {
    remove_dir_contents_if(dir, |_, _| true)
}

/// Remove entries under `dir` for which the predicate returns true.
///
/// The predicate receives the entry name and its metadata. Errors on
/// individual entries are collected; the first is returned after the full
/// scan so one bad entry doesn't shadow the rest.
pub fn remove_dir_contents_if(
    dir: &AbsPath,
    mut should_delete: impl FnMut(&str, &fs::Metadata) -> bool,
) -> Result<()> {
    let entries =
        fs::read_dir(dir.as_path()).with_context(|| format!("can't list {dir}"))?;

    let mut first_err: Option<eyre::Report> = None;
    for entry in entries {
        let entry = entry.with_context(|| format!("can't read entry in {dir}"))?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        let meta = match fs::metadata(&path) {
            Ok(m) => m,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "failed to stat path, skipping");
                continue;
            }
        };
        if !should_delete(&name, &meta) {
            continue;
        }
        debug!(path = %path.display(), is_dir = meta.is_dir(), "removing path recursively");
        let res = if meta.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        if let Err(err) = res {
            let report =
                eyre::Report::new(err).wrap_err(format!("can't remove {}", path.display()));
            if first_err.is_none() {
                first_err = Some(report);
            } else {
                warn!(path = %path.display(), "additional removal failure");
            }
        }
    }

    match first_err {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn abs(dir: &TempDir) -> AbsPath {
        AbsPath::canonical(dir.path()).unwrap()
    }

    #[test]
    fn test_canonical_resolves_symlinks() {
        let temp = TempDir::new().unwrap();
        let real = temp.path().join("real");
        fs::create_dir(&real).unwrap();
        let link = temp.path().join("link");
        std::os::unix::fs::symlink(&real, &link).unwrap();

        let canon = AbsPath::canonical(&link).unwrap();
        assert_eq!(canon.as_path(), fs::canonicalize(&real).unwrap());
    }

    #[test]
    fn test_canonical_missing_path_fails() {
        assert!(AbsPath::canonical("/definitely/not/a/path").is_err());
    }

    #[test]
    fn test_join_split_base_dir() {
        let temp = TempDir::new().unwrap();
        let root = abs(&temp);

        let child = root.join("a").join("b.txt");
        assert_eq!(child.base(), "b.txt");
        assert_eq!(child.dir(), root.join("a"));

        let (dir, file) = child.split();
        assert_eq!(dir, root.join("a"));
        assert_eq!(file, "b.txt");
    }

    #[test]
    fn test_make_absolute() {
        let temp = TempDir::new().unwrap();
        let root = abs(&temp);

        assert_eq!(make_absolute("", &root), None);
        assert_eq!(
            make_absolute("/etc/hosts", &root).unwrap().as_path(),
            Path::new("/etc/hosts")
        );
        assert_eq!(make_absolute("sub/file", &root).unwrap(), root.join("sub/file"));
    }

    #[test]
    fn test_join_normalizes_dot_segments() {
        let temp = TempDir::new().unwrap();
        let root = abs(&temp);

        assert_eq!(root.join("a/./b"), root.join("a/b"));
        assert_eq!(root.join("a").join("../c"), root.join("c"));
        assert_eq!(
            root.join("sub").join("../.worktrees/abc"),
            root.join(".worktrees/abc")
        );
    }

    #[test]
    fn test_relative_to() {
        let temp = TempDir::new().unwrap();
        let root = abs(&temp);

        let base = root.join("links");
        let target = root.join(".worktrees/abc");
        let rel = relative_to(&base, &target);
        assert_eq!(rel, PathBuf::from("../.worktrees/abc"));
        assert_eq!(base.join(&rel), target);

        assert_eq!(relative_to(&root, &root), PathBuf::from("."));
        assert_eq!(relative_to(&root, &root.join("x")), PathBuf::from("x"));
    }

    #[test]
    fn test_touch_directory_updates_mtime() {
        let temp = TempDir::new().unwrap();
        let root = abs(&temp);
        let dir = root.join("wt");
        fs::create_dir(dir.as_path()).unwrap();

        let before = fs::metadata(dir.as_path()).unwrap().modified().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        touch(&dir).unwrap();
        let after = fs::metadata(dir.as_path()).unwrap().modified().unwrap();
        assert!(after > before);
    }

    #[test]
    fn test_touch_creates_and_updates() {
        let temp = TempDir::new().unwrap();
        let root = abs(&temp);
        let file = root.join("deep/nested/touched");

        touch(&file).unwrap();
        assert!(file.exists());
        let first = fs::metadata(file.as_path()).unwrap().modified().unwrap();

        std::thread::sleep(std::time::Duration::from_millis(20));
        touch(&file).unwrap();
        let second = fs::metadata(file.as_path()).unwrap().modified().unwrap();
        assert!(second > first);
    }

    #[test]
    fn test_dir_is_empty() {
        let temp = TempDir::new().unwrap();
        let root = abs(&temp);
        assert!(dir_is_empty(&root).unwrap());

        fs::write(root.join("f").as_path(), "x").unwrap();
        assert!(!dir_is_empty(&root).unwrap());
    }

    #[test]
    fn test_remove_dir_contents_preserves_dir() {
        let temp = TempDir::new().unwrap();
        let root = abs(&temp);
        fs::write(root.join("f").as_path(), "x").unwrap();
        fs::create_dir_all(root.join("d/e").as_path()).unwrap();

        remove_dir_contents(&root).unwrap();
        assert!(root.exists());
        assert!(dir_is_empty(&root).unwrap());
    }

    #[test]
    fn test_remove_dir_contents_if_predicate() {
        let temp = TempDir::new().unwrap();
        let root = abs(&temp);
        fs::write(root.join("keep").as_path(), "x").unwrap();
        fs::write(root.join("drop").as_path(), "x").unwrap();

        remove_dir_contents_if(&root, |name, _| name == "drop").unwrap();
        assert!(root.join("keep").exists());
        assert!(!root.join("drop").exists());
    }
}
