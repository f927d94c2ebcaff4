//! Username glob matching.
//!
//! Only `*` is special; it matches any run of characters, including none
//! and including `/`. Every other character, `?` and `[` included, matches
//! itself. Patterns are compiled through [`glob::Pattern`] after escaping the
//! literal segments between stars.

use glob::Pattern;

/// Compile a `*`-only glob into a [`glob::Pattern`].
fn compile(pattern: &str) -> Option<Pattern> {
    let escaped: Vec<String> = pattern.split('*').map(Pattern::escape).collect();
    Pattern::new(&escaped.join("*")).ok()
}

/// Returns `true` when `value` matches `pattern` in its entirety.
#[must_use]
pub fn glob_matches(pattern: &str, value: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if !pattern.contains('*') {
        return pattern == value;
    }
    compile(pattern).is_some_and(|p| p.matches(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn middle_star_requires_both_ends() {
        assert!(glob_matches("user3*x", "user3foobarx"));
        assert!(glob_matches("user3*x", "user3x"));
        assert!(!glob_matches("user3*x", "user3foobar"));
        assert!(!glob_matches("user3*x", "xuser3x1"));
    }

    #[test]
    fn literal_patterns_match_exactly() {
        assert!(glob_matches("user1", "user1"));
        assert!(!glob_matches("user1", "user10"));
        assert!(!glob_matches("user1", "USER1"));
    }

    #[test]
    fn lone_star_matches_everything() {
        assert!(glob_matches("*", ""));
        assert!(glob_matches("*", "anyone@example.com"));
    }

    #[test]
    fn other_glob_metacharacters_are_literal() {
        // GIVEN: patterns using ? and [] which are not wildcards here
        // THEN: they only match themselves
        assert!(glob_matches("a?*", "a?bc"));
        assert!(!glob_matches("a?*", "abc"));
        assert!(glob_matches("[x]*", "[x]y"));
        assert!(!glob_matches("[x]*", "xy"));
    }

    #[test]
    fn star_crosses_path_separators() {
        assert!(glob_matches("cn=*,o=corp", "cn=ops/admin,o=corp"));
        assert!(glob_matches("*@corp.example", "alice@corp.example"));
    }
}
