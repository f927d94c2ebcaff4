//! Primitives shared by the proxy backend and the CLI.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`header`] | MIME-style header name canonicalization |
//! | [`policy`] | Policy list parsing, normalization and equivalence |
//! | [`pattern`] | `*`-wildcard username globs |

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod header;
pub mod pattern;
pub mod policy;

pub use header::canonical_header_key;
pub use pattern::glob_matches;
pub use policy::{equivalent_policies, normalize_policies, parse_comma_list};
