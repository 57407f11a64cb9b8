//! Architectural Enforcement Integration Tests
//!
//! This package contains integration tests that enforce architectural principles
//! across the arbiter crates:
//! - No sleep() calls in production code
//! - No blocking I/O inside async functions
//!
//! The library half holds the source scanning shared by the tests.

use std::fs;
use std::path::{Path, PathBuf};

/// Production source trees checked by every rule, relative to the workspace root
pub const PRODUCTION_DIRS: &[&str] = &["arbiter/core/src", "arbiter/daemon/src"];

/// Workspace root, two levels above this crate
#[must_use]
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .ancestors()
        .nth(2)
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
}

/// A loaded source file
pub struct SourceFile {
    /// Path as found on disk
    pub path: PathBuf,
    lines: Vec<String>,
    test_start: usize,
}

impl SourceFile {
    /// Read a file; `None` if it cannot be read
    #[must_use]
    pub fn load(path: &Path) -> Option<Self> {
        let content = fs::read_to_string(path).ok()?;
        let lines: Vec<String> = content.lines().map(str::to_owned).collect();
        // test modules sit at the bottom of each file
        let test_start = lines
            .iter()
            .position(|l| l.trim().starts_with("#[cfg(test)]"))
            .unwrap_or(lines.len());
        Some(Self {
            path: path.to_path_buf(),
            lines,
            test_start,
        })
    }

    /// Production lines as `(line_number, code)` with trailing comments removed
    pub fn production_lines(&self) -> impl Iterator<Item = (usize, &str)> {
        self.lines[..self.test_start]
            .iter()
            .enumerate()
            .map(|(idx, line)| (idx + 1, line.split("//").next().unwrap_or(line)))
    }

    /// Whether the function enclosing a line is `async`
    ///
    /// Async blocks inside a plain function count as async too.
    #[must_use]
    pub fn in_async_context(&self, line_number: usize) -> bool {
        for line in self.lines[..line_number].iter().rev() {
            let trimmed = line.trim();
            if trimmed.contains("async move") || trimmed.contains("async {") {
                return true;
            }
            if is_fn_signature(trimmed) {
                return trimmed.contains("async fn");
            }
        }
        false
    }

    /// The raw text of a line
    #[must_use]
    pub fn line(&self, line_number: usize) -> &str {
        self.lines.get(line_number - 1).map_or("", String::as_str)
    }
}

fn is_fn_signature(line: &str) -> bool {
    let line = line
        .trim_start_matches("pub(crate) ")
        .trim_start_matches("pub ");
    line.starts_with("fn ") || line.starts_with("async fn ")
}

/// Every `.rs` file under the production trees
#[must_use]
pub fn production_sources() -> Vec<SourceFile> {
    let root = workspace_root();
    PRODUCTION_DIRS
        .iter()
        .map(|dir| root.join(dir))
        .filter(|dir| dir.exists())
        .flat_map(|dir| {
            walkdir::WalkDir::new(dir)
                .into_iter()
                .filter_map(Result::ok)
                .filter(|e| e.path().extension().and_then(|s| s.to_str()) == Some("rs"))
                .filter_map(|e| SourceFile::load(e.path()))
                .collect::<Vec<_>>()
        })
        .collect()
}

/// Format a violation the way every rule reports it
#[must_use]
pub fn violation(file: &SourceFile, line_number: usize, what: &str) -> String {
    format!(
        "{}:{} - {}: {}",
        file.path.display(),
        line_number,
        what,
        file.line(line_number).trim()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(content: &str) -> (tempfile::TempDir, SourceFile) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.rs");
        fs::write(&path, content).unwrap();
        let file = SourceFile::load(&path).unwrap();
        (dir, file)
    }

    #[test]
    fn test_production_lines_stop_at_test_module() {
        let (_dir, file) = write("fn a() {}\n#[cfg(test)]\nmod tests {\n    fn b() {}\n}\n");
        let lines: Vec<usize> = file.production_lines().map(|(n, _)| n).collect();
        assert_eq!(lines, vec![1]);
    }

    #[test]
    fn test_async_context_detection() {
        let (_dir, file) = write(
            "async fn load() {\n    read();\n}\nfn sync_load() {\n    read();\n}\nfn spawner() {\n    tokio::spawn(async move {\n        read();\n    });\n}\n",
        );
        assert!(file.in_async_context(2));
        assert!(!file.in_async_context(5));
        assert!(file.in_async_context(9));
    }

    #[test]
    fn test_workspace_root_holds_members() {
        assert!(workspace_root().join("Cargo.toml").exists());
    }
}
