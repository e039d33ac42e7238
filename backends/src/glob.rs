//! The small glob dialect every backend's `list` understands.
//!
//! A single `*` may appear at the start, the end or anywhere in between.
//! A pattern with no `*` or with more than one is compared literally.

/// Returns true when `name` matches `pattern`.
pub fn matches(name: &str, pattern: &str) -> bool {
    let mut pieces = pattern.splitn(3, '*');
    let prefix = pieces.next().unwrap_or_default();
    let suffix = match (pieces.next(), pieces.next()) {
        (Some(suffix), None) => suffix,
        _ => return name == pattern,
    };

    name.len() >= prefix.len() + suffix.len() && name.starts_with(prefix) && name.ends_with(suffix)
}

/// The part of `pattern` before the first `*`, usable as a listing prefix
/// for object stores.
pub fn literal_prefix(pattern: &str) -> &str {
    match pattern.find('*') {
        Some(idx) => &pattern[..idx],
        None => pattern,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_wildcard_positions() {
        assert!(matches("anything", "*"));
        assert!(matches("mydb--2024.backup", "*.backup"));
        assert!(!matches("mydb--2024.log", "*.backup"));
        assert!(matches("mydb--2024.backup", "mydb*"));
        assert!(!matches("other.backup", "mydb*"));
        assert!(matches("mydb--daily--2024-12-17T03-00-00.backup", "mydb--daily--*.backup"));
        assert!(!matches("mydb--hourly--2024-12-17T03-00-00.backup", "mydb--daily--*.backup"));
        assert!(matches("mydb_2024-12-17_03-00-00.backup", "mydb*.backup"));
    }

    #[test]
    fn test_overlapping_prefix_and_suffix() {
        // "ab" starts with "ab" and ends with "b" but is too short for both.
        assert!(!matches("ab", "ab*b"));
        assert!(matches("abb", "ab*b"));
    }

    #[test]
    fn test_literal_shapes() {
        assert!(matches("exact.backup", "exact.backup"));
        assert!(!matches("exact.backupx", "exact.backup"));
        assert!(matches("a*b*c", "a*b*c"));
        assert!(!matches("axbxc", "a*b*c"));
    }

    #[test]
    fn test_literal_prefix() {
        assert_eq!(literal_prefix("mydb--*.backup"), "mydb--");
        assert_eq!(literal_prefix("mydb--hourly--*.backup"), "mydb--hourly--");
        assert_eq!(literal_prefix("*.backup"), "");
        assert_eq!(literal_prefix("plain"), "plain");
    }
}
