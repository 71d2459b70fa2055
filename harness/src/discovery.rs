//! Bundle discovery.

use crate::error::RunnerError;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Executable regular files matching `pattern`, sorted by path.
pub fn discover_bundles(pattern: &str) -> Result<Vec<PathBuf>, RunnerError> {
    let entries = glob::glob(pattern)
        .map_err(|e| RunnerError::BadArgs(format!("invalid bundle glob {pattern:?}: {e}")))?;

    let mut bundles = Vec::new();
    for entry in entries {
        match entry {
            Ok(path) if is_executable_file(&path) => bundles.push(path),
            Ok(path) => debug!(path = %path.display(), "Skipping non-executable match"),
            Err(e) => warn!("Unreadable bundle candidate: {e}"),
        }
    }
    bundles.sort();
    debug!(pattern, count = bundles.len(), "Discovered bundles");
    Ok(bundles)
}

fn is_executable_file(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn touch(path: &Path, mode: u32) {
        fs::write(path, "#!/bin/sh\n").unwrap();
        fs::set_permissions(path, fs::Permissions::from_mode(mode)).unwrap();
    }

    #[test]
    fn test_only_executable_files_sorted() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("zeta"), 0o755);
        touch(&dir.path().join("alpha"), 0o700);
        touch(&dir.path().join("notes"), 0o644);
        fs::create_dir(dir.path().join("subdir")).unwrap();

        let pattern = format!("{}/*", dir.path().display());
        let found = discover_bundles(&pattern).unwrap();
        assert_eq!(found, vec![dir.path().join("alpha"), dir.path().join("zeta")]);
    }

    #[test]
    fn test_no_matches_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let pattern = format!("{}/*", dir.path().display());
        assert!(discover_bundles(&pattern).unwrap().is_empty());
    }

    #[test]
    fn test_bad_pattern() {
        let err = discover_bundles("/tmp/[").unwrap_err();
        assert!(matches!(err, RunnerError::BadArgs(_)));
    }
}
