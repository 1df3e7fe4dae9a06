// ABOUTME: Host-to-sandbox path translation for the bind-mounted repository root
// ABOUTME: Rewrites paths under the host repos dir to where the sandbox sees them

use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq)]
pub struct PathTranslator {
    host_root: PathBuf,
    sandbox_root: PathBuf,
}

impl PathTranslator {
    pub fn new(host_root: impl Into<PathBuf>, sandbox_root: impl Into<PathBuf>) -> Self {
        Self {
            host_root: host_root.into(),
            sandbox_root: sandbox_root.into(),
        }
    }

    /// e.g. `/tmp/orkee-repos/proj/abc` -> `/home/opencode/repos/proj/abc`.
    /// Paths outside the host root come back unchanged.
    pub fn to_sandbox_path(&self, host_path: &Path) -> PathBuf {
        match host_path.strip_prefix(&self.host_root) {
            Ok(rest) if rest.as_os_str().is_empty() => self.sandbox_root.clone(),
            Ok(rest) => self.sandbox_root.join(rest),
            Err(_) => host_path.to_path_buf(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn translator() -> PathTranslator {
        PathTranslator::new("/tmp/orkee-repos", "/home/opencode/repos")
    }

    #[test]
    fn test_translates_paths_under_host_root() {
        assert_eq!(
            translator().to_sandbox_path(Path::new("/tmp/orkee-repos/proj/abc")),
            PathBuf::from("/home/opencode/repos/proj/abc")
        );
    }

    #[test]
    fn test_root_itself() {
        assert_eq!(
            translator().to_sandbox_path(Path::new("/tmp/orkee-repos")),
            PathBuf::from("/home/opencode/repos")
        );
    }

    #[test]
    fn test_other_paths_unchanged() {
        assert_eq!(
            translator().to_sandbox_path(Path::new("/var/lib/other")),
            PathBuf::from("/var/lib/other")
        );
        // Sibling directory sharing a string prefix is not under the root
        assert_eq!(
            translator().to_sandbox_path(Path::new("/tmp/orkee-repos-old/x")),
            PathBuf::from("/tmp/orkee-repos-old/x")
        );
    }
}
