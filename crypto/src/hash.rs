//! Blake2b hashing for identities, fingerprints and ranking.

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use proxy_types::{Fingerprint, NodeId, TaskId};

type Blake2b256 = Blake2b<U32>;

/// Domain separator for public-key fingerprints.
const FINGERPRINT_DOMAIN: &[u8] = b"proxy-fp";

/// Compute a 256-bit Blake2b hash of arbitrary data.
pub fn blake2b_256(data: &[u8]) -> [u8; 32] {
    blake2b_256_multi(&[data])
}

/// Hash multiple byte slices in sequence (avoids concatenation allocation).
pub fn blake2b_256_multi(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Blake2b256::new();
    for part in parts {
        hasher.update(part);
    }
    let result = hasher.finalize();
    let mut output = [0u8; 32];
    output.copy_from_slice(&result);
    output
}

fn truncate16(hash: [u8; 32]) -> [u8; 16] {
    let mut out = [0u8; 16];
    out.copy_from_slice(&hash[..16]);
    out
}

/// The node id bound to an attested public key.
pub fn node_id_for_key(public_key: &[u8]) -> NodeId {
    NodeId::new(truncate16(blake2b_256(public_key)))
}

/// The fingerprint that seeds a node's heartbeat key.
pub fn fingerprint_for_key(public_key: &[u8]) -> Fingerprint {
    Fingerprint::new(truncate16(blake2b_256_multi(&[
        FINGERPRINT_DOMAIN,
        public_key,
    ])))
}

/// Reference to an opaque proof blob.
pub fn proof_ref(proof_blob: &[u8]) -> [u8; 32] {
    blake2b_256(proof_blob)
}

/// Deterministic per-task tie-break key for candidate ranking.
///
/// Different tasks order equally-ranked nodes differently, so no single
/// node wins every tie.
pub fn rank_key(task_id: &TaskId, node_id: &NodeId) -> [u8; 32] {
    blake2b_256_multi(&[task_id.as_bytes(), node_id.as_bytes()])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blake2b_deterministic() {
        assert_eq!(blake2b_256(b"hello proxy"), blake2b_256(b"hello proxy"));
        assert_ne!(blake2b_256(b"hello"), blake2b_256(b"world"));
    }

    #[test]
    fn blake2b_multi_equivalent() {
        let single = blake2b_256(b"helloworld");
        let multi = blake2b_256_multi(&[b"hello", b"world"]);
        assert_eq!(single, multi);
    }

    #[test]
    fn node_id_and_fingerprint_differ() {
        let key = [7u8; 32];
        let id = node_id_for_key(&key);
        let fp = fingerprint_for_key(&key);
        assert_ne!(id.as_bytes(), fp.as_bytes());
        assert_eq!(id, node_id_for_key(&key));
    }

    #[test]
    fn rank_key_depends_on_task() {
        let node = NodeId::new([1; 16]);
        let a = rank_key(&TaskId::new([2; 16]), &node);
        let b = rank_key(&TaskId::new([3; 16]), &node);
        assert_ne!(a, b);
    }
}
