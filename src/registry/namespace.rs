//! Namespacing: `${serverId}_${name}` encode/decode, and the RFC 6570
//! subset used for resource-template matching.

/// Encode an upstream-advertised name under its owning server's namespace.
pub fn namespace(server_id: &str, name: &str) -> String {
    format!("{server_id}_{name}")
}

/// Invert [`namespace`]: split `${serverId}_${name}` back into its parts
/// given the set of known server ids (the prefix alone is ambiguous — a
/// server id itself may contain underscores, so we match against what's
/// actually configured rather than splitting on the first `_`).
pub fn denamespace<'a>(id: &'a str, known_server_ids: &[String]) -> Option<(&'a str, &'a str)> {
    known_server_ids
        .iter()
        .filter(|s| id.starts_with(s.as_str()) && id.as_bytes().get(s.len()) == Some(&b'_'))
        .max_by_key(|s| s.len())
        .map(|s| (s.as_str(), &id[s.len() + 1..]))
        .and_then(|(s, rest)| known_server_ids.iter().find(|k| k.as_str() == s).map(|k| (k.as_str(), rest)))
}

/// A minimal RFC 6570 level-1 template matcher: `{var}` segments match one
/// non-`/` path segment. Good enough for the common `scheme://host/{id}`
/// upstream template shapes; nested/reserved expansions are out of scope.
pub fn template_matches(template: &str, uri: &str) -> bool {
    let mut t = template.split('/');
    let mut u = uri.split('/');
    loop {
        match (t.next(), u.next()) {
            (Some(tpart), Some(upart)) => {
                if tpart.starts_with('{') && tpart.ends_with('}') {
                    if upart.is_empty() {
                        return false;
                    }
                    continue;
                }
                if tpart != upart {
                    return false;
                }
            }
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespacing_is_invertible() {
        let servers = vec!["fs".to_string(), "gh".to_string()];
        let id = namespace("fs", "read_file");
        assert_eq!(denamespace(&id, &servers), Some(("fs", "read_file")));
    }

    #[test]
    fn denamespace_prefers_the_longest_matching_server_id() {
        let servers = vec!["fs".to_string(), "fs_backup".to_string()];
        let id = namespace("fs_backup", "read_file");
        assert_eq!(denamespace(&id, &servers), Some(("fs_backup", "read_file")));
    }

    #[test]
    fn denamespace_returns_none_for_unknown_server() {
        let servers = vec!["fs".to_string()];
        assert_eq!(denamespace("gh_init", &servers), None);
    }

    #[test]
    fn template_matches_single_segment_variable() {
        assert!(template_matches("file:///{path}", "file:///etc"));
        assert!(!template_matches("file:///{path}", "file:///"));
    }

    #[test]
    fn template_matches_requires_equal_segment_count() {
        assert!(!template_matches("file:///{path}", "file:///a/b"));
    }
}
