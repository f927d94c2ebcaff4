//! Policy list parsing and comparison.
//!
//! Policies arrive either as a comma-separated string or as a list. Both
//! forms funnel through [`normalize_policies`]:
//!
//! 1. every element is trimmed and lower-cased;
//! 2. empty elements are dropped;
//! 3. duplicates are removed, keeping the first occurrence;
//! 4. if `root` is present the whole set collapses to `["root"]`.

/// The built-in policy every token implicitly carries.
pub const DEFAULT_POLICY: &str = "default";

/// The policy that grants everything; it subsumes every other policy.
pub const ROOT_POLICY: &str = "root";

/// Split a comma-separated string into trimmed, non-empty elements.
#[must_use]
pub fn parse_comma_list(input: &str) -> Vec<String> {
    input
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

/// Normalize a policy list.
///
/// The result order is the order of first appearance, so normalizing twice
/// yields the same list.
#[must_use]
pub fn normalize_policies<I, S>(policies: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out: Vec<String> = Vec::new();
    for policy in policies {
        let policy = policy.as_ref().trim().to_lowercase();
        if policy.is_empty() {
            continue;
        }
        if policy == ROOT_POLICY {
            return vec![ROOT_POLICY.to_string()];
        }
        if !out.contains(&policy) {
            out.push(policy);
        }
    }
    out
}

/// Compare two policy sets, ignoring order, duplicates and `default`.
#[must_use]
pub fn equivalent_policies<A, B>(a: &[A], b: &[B]) -> bool
where
    A: AsRef<str>,
    B: AsRef<str>,
{
    let strip = |items: Vec<String>| -> Vec<String> {
        let mut set: Vec<String> = items.into_iter().filter(|p| p != DEFAULT_POLICY).collect();
        set.sort();
        set
    };
    strip(normalize_policies(a)) == strip(normalize_policies(b))
}
