//! URL canonicalization and product fingerprinting

mod normalize;

pub use normalize::{canonicalize_url, fingerprint, param_matches_blacklist};
