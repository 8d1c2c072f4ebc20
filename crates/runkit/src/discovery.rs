//! Test discovery
//!
//! Walks the given files and directories collecting test files by suffix.
//! Traversal is sorted so the resulting unit list is deterministic
//! regardless of directory iteration order; the scheduler is then free to
//! interleave execution however it likes.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::config::RunConfig;
use crate::error::{Error, Result};
use crate::runner::TestUnit;

/// Discover test units beneath `paths`. Explicitly named files are always
/// included; directory walks take only files whose extension is in the
/// config's suffix set. A file that cannot be read is logged and skipped
/// rather than failing the whole discovery.
pub fn discover(paths: &[PathBuf], config: &RunConfig) -> Result<Vec<TestUnit>> {
    let mut files = Vec::new();
    for path in paths {
        if path.is_dir() {
            walk(path, config, &mut files)?;
        } else if path.is_file() {
            files.push(path.clone());
        } else {
            return Err(Error::io(
                path,
                std::io::Error::new(std::io::ErrorKind::NotFound, "no such file or directory"),
            ));
        }
    }
    files.sort();
    files.dedup();

    let mut units = Vec::new();
    for file in files {
        if let Some(filter) = &config.filter {
            if !file.to_string_lossy().contains(filter.as_str()) {
                continue;
            }
        }
        match TestUnit::from_file(&file, config) {
            Ok(unit) => units.push(unit),
            Err(e) => warn!(file = %file.display(), error = %e, "skipping unreadable test file"),
        }
    }
    debug!(units = units.len(), "discovery finished");
    Ok(units)
}

fn walk(dir: &Path, config: &RunConfig, out: &mut Vec<PathBuf>) -> Result<()> {
    let entries = std::fs::read_dir(dir).map_err(|e| Error::io(dir, e))?;
    let mut children: Vec<PathBuf> = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| Error::io(dir, e))?;
        children.push(entry.path());
    }
    children.sort();
    for child in children {
        if child.is_dir() {
            walk(&child, config, out)?;
        } else if has_test_suffix(&child, config) {
            out.push(child);
        }
    }
    Ok(())
}

fn has_test_suffix(path: &Path, config: &RunConfig) -> bool {
    let Some(extension) = path.extension().and_then(|e| e.to_str()) else {
        return false;
    };
    config.suffixes.iter().any(|s| s == extension)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn touch(path: &Path, contents: &str) {
        std::fs::write(path, contents).expect("write fixture");
    }

    #[test]
    fn walks_directories_by_suffix_sorted() {
        let root = tempfile::tempdir().expect("tempdir");
        let nested = root.path().join("nested");
        std::fs::create_dir(&nested).expect("mkdir");
        touch(&root.path().join("b.test"), "// RUN: true\n");
        touch(&root.path().join("a.test"), "// RUN: true\n");
        touch(&root.path().join("notes.txt"), "not a test\n");
        touch(&nested.join("c.test"), "// RUN: true\n");

        let config = RunConfig::default();
        let units = discover(&[root.path().to_path_buf()], &config).expect("discover");
        let names: Vec<String> = units
            .iter()
            .map(|u| {
                u.path
                    .strip_prefix(root.path())
                    .expect("under root")
                    .display()
                    .to_string()
            })
            .collect();
        assert_eq!(names, vec!["a.test", "b.test", "nested/c.test"]);
    }

    #[test]
    fn explicit_files_bypass_suffix_check() {
        let root = tempfile::tempdir().expect("tempdir");
        let odd = root.path().join("odd.sample");
        touch(&odd, "// RUN: true\n");
        let units = discover(&[odd.clone()], &RunConfig::default()).expect("discover");
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].path, odd);
    }

    #[test]
    fn filter_narrows_by_substring() {
        let root = tempfile::tempdir().expect("tempdir");
        touch(&root.path().join("alpha.test"), "// RUN: true\n");
        touch(&root.path().join("beta.test"), "// RUN: true\n");
        let config = RunConfig {
            filter: Some("alpha".into()),
            ..RunConfig::default()
        };
        let units = discover(&[root.path().to_path_buf()], &config).expect("discover");
        assert_eq!(units.len(), 1);
        assert!(units[0].path.ends_with("alpha.test"));
    }

    #[test]
    fn missing_path_is_an_error() {
        let missing = PathBuf::from("/definitely/not/here");
        assert!(discover(&[missing], &RunConfig::default()).is_err());
    }
}
