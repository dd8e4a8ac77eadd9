//! Fast hash maps and sets for internal use.
//!
//! The compiler never hashes untrusted input, so we use the rustc hash
//! everywhere instead of the DoS-resistant default.

pub use rustc_hash::FxHashMap;
pub use rustc_hash::FxHashSet;
