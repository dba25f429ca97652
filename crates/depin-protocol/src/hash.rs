use sha2::{Digest, Sha256};
use tiny_keccak::{Hasher, Keccak};

/// Keccak-256 hash of the input bytes.
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut k = Keccak::v256();
    let mut out = [0u8; 32];
    k.update(data);
    k.finalize(&mut out);
    out
}

/// SHA-256 hash of the input bytes.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Internal node hash: sha256(min(a, b) || max(a, b)).
pub fn hash_sorted_pair(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    let mut combined = [0u8; 64];
    combined[..32].copy_from_slice(lo);
    combined[32..].copy_from_slice(hi);
    sha256(&combined)
}

/// Merkle root over already-hashed leaves.
///
/// - Internal hash: sha256 over the sorted pair (see `hash_sorted_pair`)
/// - A trailing odd node is paired with itself.
///
/// Returns [0u8; 32] for an empty input; a single leaf is its own root.
pub fn merkle_root(leaves: &[[u8; 32]]) -> [u8; 32] {
    if leaves.is_empty() {
        return [0u8; 32];
    }

    let mut layer = leaves.to_vec();
    while layer.len() > 1 {
        layer = layer
            .chunks(2)
            .map(|pair| match pair {
                [a, b] => hash_sorted_pair(a, b),
                [a] => hash_sorted_pair(a, a),
                _ => unreachable!("chunks(2) yields one or two nodes"),
            })
            .collect();
    }

    layer[0]
}
