// Recursive wildcard search over a mounted namespace.

use crate::mount::MountSession;
use crate::paths::{combine_paths, ensure_rooted};
use extbridge_core::{BridgeError, EntryKind};
use log::debug;
use regex::{Regex, RegexBuilder};

/// Compile a `*`-style wildcard into an anchored, case-insensitive matcher.
///
/// Two long-standing quirks are kept on purpose: a pattern without a literal
/// `.` gets one appended before conversion, and the dot itself is converted
/// to "any run of characters", exactly like `*`. `"*.txt"` therefore also
/// matches names like `"atxt"`. Callers have depended on this behavior since
/// the wildcard conversion first shipped; do not "fix" it here.
pub fn wildcard_to_regex(pattern: &str) -> Result<Regex, BridgeError> {
    let mut pattern = pattern.to_string();
    if !pattern.contains('.') {
        pattern.push('.');
    }
    let query = format!(
        "^{}$",
        regex::escape(&pattern).replace("\\*", ".*").replace("\\.", ".*")
    );
    RegexBuilder::new(&query)
        .case_insensitive(true)
        .build()
        .map_err(|e| BridgeError::InvalidArgument(format!("bad search pattern '{}': {}", pattern, e)))
}

impl MountSession<'_> {
    /// Files under `path` whose names match the wildcard `pattern`.
    ///
    /// Returned paths are relative to the search root, in traversal order:
    /// entries in listing order, descending into a subdirectory the moment it
    /// is encountered. Order is deterministic for a fixed directory state.
    pub fn get_files(
        &self,
        path: &str,
        pattern: &str,
        recursive: bool,
    ) -> Result<Vec<String>, BridgeError> {
        self.search(path, pattern, recursive, false, true)
    }

    /// Directories under `path` whose names match the wildcard `pattern`.
    pub fn get_directories(
        &self,
        path: &str,
        pattern: &str,
        recursive: bool,
    ) -> Result<Vec<String>, BridgeError> {
        self.search(path, pattern, recursive, true, false)
    }

    fn search(
        &self,
        path: &str,
        pattern: &str,
        recursive: bool,
        dirs: bool,
        files: bool,
    ) -> Result<Vec<String>, BridgeError> {
        self.ensure_open()?;
        let regex = wildcard_to_regex(pattern)?;
        let rooted = ensure_rooted(path);
        let root = combine_paths(self.mount_point(), &rooted);
        let mut results = Vec::new();
        self.do_search(&mut results, &root, &regex, recursive, dirs, files)
            .map_err(|e| match e {
                BridgeError::Disposed => BridgeError::Disposed,
                _ => BridgeError::NotFound(format!("the directory '{}' was not found", rooted)),
            })?;
        Ok(results)
    }

    fn do_search(
        &self,
        results: &mut Vec<String>,
        full_path: &str,
        regex: &Regex,
        recursive: bool,
        dirs: bool,
        files: bool,
    ) -> Result<(), BridgeError> {
        let entries = self.list_directory_full(full_path)?;
        let mount_point = self.mount_point();
        // Results are rooted at the search origin, not the mount point: the
        // mount-point length is stripped whenever the traversal path is at
        // least that long, otherwise the prefix collapses to "/". Kept
        // exactly as-is, length-equality boundary included.
        let prefix = if mount_point.len() <= full_path.len() {
            &full_path[mount_point.len() - 1..]
        } else {
            "/"
        };
        for entry in entries {
            // Residual self/parent markers keep their trailing dot; skip them.
            if entry.name.ends_with('.') {
                continue;
            }
            let is_dir = entry.kind == EntryKind::Directory;
            if ((is_dir && dirs) || (!is_dir && files)) && regex.is_match(&entry.name) {
                if prefix == "/" {
                    results.push(format!("/{}", entry.name));
                } else {
                    results.push(combine_paths(prefix, &entry.name));
                }
            }
            if recursive && is_dir {
                let child = combine_paths(full_path, &entry.name);
                if let Err(e) = self.do_search(results, &child, regex, recursive, dirs, files) {
                    // A subtree we cannot list is skipped; its siblings are
                    // still walked.
                    debug!("skipping unreadable directory '{}': {}", child, e);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn star_expands_to_any_run() {
        let regex = wildcard_to_regex("*.txt").unwrap();
        assert!(regex.is_match("a.txt"));
        assert!(regex.is_match("A.TXT"));
        assert!(!regex.is_match("a.log"));
    }

    #[test]
    fn literal_dot_also_matches_any_run() {
        // The conversion treats an escaped dot like a wildcard; "a.txt"
        // matches "azztxt" too.
        let regex = wildcard_to_regex("a.txt").unwrap();
        assert!(regex.is_match("a.txt"));
        assert!(regex.is_match("azztxt"));
        assert!(!regex.is_match("b.txt"));
    }

    #[test]
    fn dotless_pattern_gets_a_dot_appended() {
        // "*" becomes "*." before conversion and still matches everything.
        let regex = wildcard_to_regex("*").unwrap();
        assert!(regex.is_match("anything"));
        assert!(regex.is_match("file.ext"));
        // A fixed name without a dot anchors on the appended any-run token.
        let regex = wildcard_to_regex("readme").unwrap();
        assert!(regex.is_match("readme"));
        assert!(regex.is_match("readme.md"));
        assert!(!regex.is_match("a-readme"));
    }

    #[test]
    fn matching_is_anchored() {
        let regex = wildcard_to_regex("b.txt").unwrap();
        assert!(!regex.is_match("ab.txt2"));
    }
}
