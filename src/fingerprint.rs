//! Request-fingerprint helpers (C7, §4.7).
//!
//! Deterministic hashes used as HTTP `ETag`s for ACL lists, metadata
//! maps, namespace child listings, and version tags. All three are
//! order-independent and collision-stable across equal sets/maps
//! (testable property 5 in §8).

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use md5::{Digest, Md5};

/// MD5 of the UTF-8 bytes of `s`, base64-encoded.
pub fn hash_value(s: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(s.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Escape a list element so concatenation cannot create ambiguous
/// boundaries between adjacent elements, then sort distinct elements,
/// join, and MD5/base64 the result. Order-independent because the sort
/// happens before hashing.
pub fn hash_list<I, S>(items: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut escaped: Vec<String> = items
        .into_iter()
        .map(|s| escape_element(s.as_ref()))
        .collect();
    escaped.sort();
    escaped.dedup();
    let joined = escaped.join("\u{1}");
    let mut hasher = Md5::new();
    hasher.update(joined.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// `hash_list` of `hash(k) + hash(v)` pairs, making the result
/// insensitive to map iteration order.
pub fn hash_dict<I, K, V>(entries: I) -> String
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    let pairs: Vec<String> = entries
        .into_iter()
        .map(|(k, v)| format!("{}{}", hash_value(k.as_ref()), hash_value(v.as_ref())))
        .collect();
    hash_list(pairs)
}

fn escape_element(s: &str) -> String {
    s.replace('\u{1}', "\u{1}\u{1}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn hash_value_is_stable() {
        assert_eq!(hash_value("foo"), hash_value("foo"));
        assert_ne!(hash_value("foo"), hash_value("bar"));
    }

    #[test]
    fn hash_list_is_order_independent() {
        let a = hash_list(vec!["alpha", "beta", "gamma"]);
        let b = hash_list(vec!["gamma", "alpha", "beta"]);
        assert_eq!(a, b);
    }

    #[test]
    fn hash_list_dedups() {
        let a = hash_list(vec!["x", "x", "y"]);
        let b = hash_list(vec!["x", "y"]);
        assert_eq!(a, b);
    }

    #[test]
    fn hash_list_distinguishes_different_sets() {
        assert_ne!(hash_list(vec!["a", "b"]), hash_list(vec!["a", "c"]));
    }

    #[test]
    fn hash_dict_is_order_independent() {
        let mut m1 = BTreeMap::new();
        m1.insert("k1", "v1");
        m1.insert("k2", "v2");

        let entries_a: Vec<(&str, &str)> = m1.iter().map(|(k, v)| (*k, *v)).collect();
        let mut entries_b = entries_a.clone();
        entries_b.reverse();

        assert_eq!(hash_dict(entries_a), hash_dict(entries_b));
    }

    #[test]
    fn hash_dict_distinguishes_different_maps() {
        let a = hash_dict(vec![("k", "v1")]);
        let b = hash_dict(vec![("k", "v2")]);
        assert_ne!(a, b);
    }
}
