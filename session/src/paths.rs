// Path resolution for the mounted namespace.

/// Join two path fragments with a single `/`.
///
/// An empty side returns the other unchanged. Nothing else is normalized:
/// `..` segments and repeated separators inside either fragment pass through
/// as-is. This is not a sandbox boundary.
pub fn combine_paths(a: &str, b: &str) -> String {
    if a.is_empty() {
        b.to_string()
    } else if b.is_empty() {
        a.to_string()
    } else {
        format!("{}/{}", a.trim_end_matches('/'), b.trim_start_matches('/'))
    }
}

/// Force a leading `/` onto a session-relative path.
pub(crate) fn ensure_rooted(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_with_single_separator() {
        assert_eq!(combine_paths("/a/", "/b"), "/a/b");
        assert_eq!(combine_paths("/a", "b"), "/a/b");
        assert_eq!(combine_paths("/a///", "///b"), "/a/b");
    }

    #[test]
    fn empty_side_returns_the_other_unchanged() {
        assert_eq!(combine_paths("", "b"), "b");
        assert_eq!(combine_paths("a", ""), "a");
        assert_eq!(combine_paths("", ""), "");
    }

    #[test]
    fn mount_point_prefixing() {
        assert_eq!(combine_paths("/ab12cd34/", "data/a.txt"), "/ab12cd34/data/a.txt");
        assert_eq!(combine_paths("/ab12cd34/", "/"), "/ab12cd34/");
    }

    #[test]
    fn rooting_relative_paths() {
        assert_eq!(ensure_rooted("data"), "/data");
        assert_eq!(ensure_rooted("/data"), "/data");
        assert_eq!(ensure_rooted(""), "/");
    }
}
