//! Header name canonicalization.
//!
//! The canonical form upper-cases the first letter and every letter that
//! follows a hyphen, and lower-cases the rest (`x-forwarded-user` becomes
//! `X-Forwarded-User`). Names containing bytes outside the HTTP token
//! alphabet are returned unchanged, so canonicalization never corrupts a key
//! it does not understand.

/// Returns `true` for bytes allowed in an HTTP header field name (RFC 7230 `tchar`).
const fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric()
        || matches!(
            b,
            b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.' | b'^' | b'_'
                | b'`' | b'|' | b'~'
        )
}

/// Canonicalize a header name to MIME form.
///
/// The function is idempotent: `canonical_header_key(canonical_header_key(h))`
/// equals `canonical_header_key(h)` for every input.
#[must_use]
pub fn canonical_header_key(name: &str) -> String {
    if !name.bytes().all(is_token_byte) {
        return name.to_string();
    }

    let mut upper = true;
    name.bytes()
        .map(|b| {
            let out = if upper {
                b.to_ascii_uppercase()
            } else {
                b.to_ascii_lowercase()
            };
            upper = b == b'-';
            char::from(out)
        })
        .collect()
}

/// Case-insensitive header name comparison through the canonical form.
#[must_use]
pub fn same_header(a: &str, b: &str) -> bool {
    canonical_header_key(a) == canonical_header_key(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalizes_hyphenated_names() {
        assert_eq!(canonical_header_key("a-b-c"), "A-B-C");
        assert_eq!(canonical_header_key("x-FORWARDED-user"), "X-Forwarded-User");
        assert_eq!(canonical_header_key("Foobar"), "Foobar");
    }

    #[test]
    fn underscores_do_not_start_a_new_word() {
        // GIVEN: a CGI-style header name
        // WHEN: canonicalized
        // THEN: only the first letter stays upper-case
        assert_eq!(canonical_header_key("REMOTE_USER"), "Remote_user");
        assert_eq!(canonical_header_key("req_hdr_1"), "Req_hdr_1");
    }

    #[test]
    fn invalid_names_are_returned_unchanged() {
        assert_eq!(canonical_header_key("bad header"), "bad header");
        assert_eq!(canonical_header_key("x:y"), "x:y");
        assert_eq!(canonical_header_key(""), "");
    }

    #[test]
    fn canonicalization_is_idempotent() {
        for name in ["a-b-c", "REMOTE_USER", "x-Vault-TOKEN", "-lead", "trail-", "with space"] {
            let once = canonical_header_key(name);
            assert_eq!(canonical_header_key(&once), once, "not idempotent for {name:?}");
        }
    }

    #[test]
    fn same_header_ignores_case() {
        assert!(same_header("X-Foo", "x-foo"));
        assert!(same_header("remote_user", "REMOTE_USER"));
        assert!(!same_header("X-Foo", "X-Bar"));
    }
}
