//! Test environment abstraction for isolated testing.
//!
//! Provides `TestTree` to manage an isolated on-disk tree for lock and stream
//! tests, with helpers to lay out files and directories.
//!
//! # Usage
//!
//! ```ignore
//! use trib_config::testing::TestTree;
//!
//! #[test]
//! fn test_something() {
//!     let tree = TestTree::new().unwrap();
//!     let f = tree.create_file("dir/child.txt", b"payload").unwrap();
//!     // f lives under an isolated tempdir, removed on drop
//! }
//! ```

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use tempfile::TempDir;

/// Atomic counter for unique test IDs
static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Isolated on-disk tree for a single test
pub struct TestTree {
    /// Temporary directory (dropped on cleanup)
    _temp_dir: TempDir,
    /// Root of the isolated tree
    pub root: PathBuf,
    /// Unique test ID
    pub test_id: u32,
}

impl TestTree {
    /// Create a new isolated test tree
    pub fn new() -> anyhow::Result<Self> {
        let test_id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path().join(format!("tree-{}", test_id));
        std::fs::create_dir_all(&root)?;

        Ok(Self {
            _temp_dir: temp_dir,
            root,
            test_id,
        })
    }

    /// Root of the tree
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Create a test file with content, creating parent directories as needed
    pub fn create_file(&self, relative_path: &str, content: &[u8]) -> anyhow::Result<PathBuf> {
        let path = self.root.join(relative_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, content)?;
        Ok(path)
    }

    /// Create a test directory
    pub fn create_dir(&self, relative_path: &str) -> anyhow::Result<PathBuf> {
        let path = self.root.join(relative_path);
        std::fs::create_dir_all(&path)?;
        Ok(path)
    }

    /// Path for an entry that does not exist yet
    pub fn planned(&self, relative_path: &str) -> PathBuf {
        self.root.join(relative_path)
    }
}

impl Default for TestTree {
    fn default() -> Self {
        Self::new().expect("Failed to create test tree")
    }
}
