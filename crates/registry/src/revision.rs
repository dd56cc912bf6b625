//! Composite revision computation.
//!
//! A per-service revision is a deterministic hash over the sorted set of
//! member revisions, so it is stable across iteration order and can serve as
//! an opaque ETag: equal revision means identical content.

use sha1::{Digest, Sha1};

/// Hashes the given member revisions into one opaque revision string.
pub fn composite_revision(revisions: &[String]) -> String {
    let mut sorted: Vec<&str> = revisions.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    let mut hasher = Sha1::new();
    for revision in sorted {
        hasher.update(revision.as_bytes());
        hasher.update(b"|");
    }
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(40);
    for byte in digest {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_independent() {
        let a = composite_revision(&["r1".into(), "r2".into(), "r3".into()]);
        let b = composite_revision(&["r3".into(), "r1".into(), "r2".into()]);
        assert_eq!(a, b);
    }

    #[test]
    fn sensitive_to_membership() {
        let a = composite_revision(&["r1".into(), "r2".into()]);
        let b = composite_revision(&["r1".into()]);
        assert_ne!(a, b);
        assert_ne!(composite_revision(&[]), a);
    }
}
