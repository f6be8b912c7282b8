//! Atomic publication of a worktree through the consumer-visible symlink.
//!
//! The link is the only filesystem object shared with consumers. It is
//! replaced by creating a temporary symlink next to it and renaming it over
//! the old one; the rename is the single atomic step a reader can observe.

use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use eyre::{Context, Result};
use tracing::{debug, info};

use crate::paths::{mkdir_all, relative_to, touch, AbsPath};
use crate::repo::Worktree;

const TMP_LINK: &str = "tmp-link";

/// Owns the published link, the optional touch-file, and the ready flag.
pub struct Publisher {
    link: AbsPath,
    touch_file: Option<AbsPath>,
    ready: Arc<AtomicBool>,
}

impl Publisher {
    pub fn new(link: AbsPath, touch_file: Option<AbsPath>) -> Self {
        Self {
            link,
            touch_file,
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A readable handle on the ready flag, for the liveness probe.
    pub fn ready_flag(&self) -> Arc<AtomicBool> {
        self.ready.clone()
    }

    /// Mark the first successful publication; never unset.
    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::Relaxed);
    }

    /// Read the link and return the worktree it currently points at.
    ///
    /// A missing link is the initial state, not an error.
    pub fn read_current(&self) -> Result<Option<Worktree>> {
        let target = match fs::read_link(self.link.as_path()) {
            Ok(target) => target,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("can't read link {}", self.link))
            }
        };
        let worktree = if target.is_absolute() {
            // Only this engine writes the link, and it writes relative
            // targets; accept absolute ones from older layouts anyway.
            match AbsPath::from_absolute(&target) {
                Some(path) => Worktree::at(path),
                None => return Ok(None),
            }
        } else {
            Worktree::at(self.link.dir().join(&target))
        };
        Ok(Some(worktree))
    }

    /// Atomically point the link at `worktree`.
    ///
    /// The stored target is relative to the link's directory so the whole
    /// arrangement keeps working when mounted at a different path.
    pub fn publish(&self, worktree: &Worktree) -> Result<()> {
        let (link_dir, link_name) = self.link.split();
        mkdir_all(link_dir.as_path()).wrap_err("can't make symlink dir")?;

        let target = relative_to(&link_dir, worktree.path());
        let tmp = link_dir.join(TMP_LINK);

        debug!(dir = %link_dir, target = %target.display(), "creating tmp symlink");
        // A crashed previous attempt can leave the tmp link behind.
        match fs::remove_file(tmp.as_path()) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err).wrap_err("can't clear old tmp symlink"),
        }
        std::os::unix::fs::symlink(&target, tmp.as_path()).wrap_err("can't create symlink")?;

        debug!(old = TMP_LINK, new = %link_name, "renaming symlink");
        fs::rename(tmp.as_path(), self.link.as_path()).wrap_err("can't replace symlink")?;

        info!(link = %self.link, hash = %worktree.hash(), "published");
        Ok(())
    }

    /// Bump the touch-file's mtime, creating it if missing.
    pub fn touch_touch_file(&self) -> Result<()> {
        if let Some(path) = &self.touch_file {
            touch(path)?;
            debug!(path = %path, "touched touch-file");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup(temp: &TempDir) -> (AbsPath, Publisher) {
        let root = AbsPath::canonical(temp.path()).unwrap();
        let publisher = Publisher::new(root.join("current"), None);
        (root, publisher)
    }

    fn worktree(root: &AbsPath, hash: &str) -> Worktree {
        let wt = Worktree::at(root.join(".worktrees").join(hash));
        mkdir_all(wt.path().as_path()).unwrap();
        wt
    }

    #[test]
    fn test_read_current_missing_link() {
        let temp = TempDir::new().unwrap();
        let (_, publisher) = setup(&temp);
        assert_eq!(publisher.read_current().unwrap(), None);
    }

    #[test]
    fn test_publish_and_read_back() {
        let temp = TempDir::new().unwrap();
        let (root, publisher) = setup(&temp);
        let hash = "a".repeat(40);
        let wt = worktree(&root, &hash);

        publisher.publish(&wt).unwrap();

        // The link target is relative and its basename is the hash.
        let raw = fs::read_link(root.join("current").as_path()).unwrap();
        assert!(raw.is_relative());
        assert_eq!(raw.file_name().unwrap().to_str().unwrap(), hash);

        let current = publisher.read_current().unwrap().unwrap();
        assert_eq!(current, wt);
        assert_eq!(current.hash(), hash);
    }

    #[test]
    fn test_publish_replaces_previous_target() {
        let temp = TempDir::new().unwrap();
        let (root, publisher) = setup(&temp);
        let a = worktree(&root, &"a".repeat(40));
        let b = worktree(&root, &"b".repeat(40));

        publisher.publish(&a).unwrap();
        publisher.publish(&b).unwrap();

        let current = publisher.read_current().unwrap().unwrap();
        assert_eq!(current, b);
        // The link resolves to the live directory.
        assert!(root.join("current").as_path().canonicalize().unwrap().ends_with("b".repeat(40)));
    }

    #[test]
    fn test_publish_survives_stale_tmp_link() {
        let temp = TempDir::new().unwrap();
        let (root, publisher) = setup(&temp);
        let wt = worktree(&root, &"c".repeat(40));

        // Simulate a crash between symlink and rename.
        std::os::unix::fs::symlink("nowhere", root.join(TMP_LINK).as_path()).unwrap();
        publisher.publish(&wt).unwrap();
        assert_eq!(publisher.read_current().unwrap().unwrap(), wt);
    }

    #[test]
    fn test_ready_flag() {
        let temp = TempDir::new().unwrap();
        let (_, publisher) = setup(&temp);
        let flag = publisher.ready_flag();

        assert!(!flag.load(Ordering::Relaxed));
        publisher.set_ready();
        assert!(flag.load(Ordering::Relaxed));
    }

    #[test]
    fn test_touch_file() {
        let temp = TempDir::new().unwrap();
        let root = AbsPath::canonical(temp.path()).unwrap();
        let touch_path = root.join("state/touched");
        let publisher = Publisher::new(root.join("current"), Some(touch_path.clone()));

        publisher.touch_touch_file().unwrap();
        assert!(touch_path.exists());
    }
}
