//! Fold a period's raw proofs into one aggregate proof.

use std::collections::HashSet;

use crate::brand::AssignmentSet;
use crate::constants::{CHECKER_BITMAP_BYTES, METRIC_SCALE};
use crate::error::ProtocolError;
use crate::hash::{merkle_root, sha256};
use crate::payload::ProofWithIndex;
use crate::signature::canonical_json;

/// One worker's summary for one period, as submitted to the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateProof {
    pub merkle_root: [u8; 32],
    /// Bit `i` set when the checker at assignment position `i` submitted.
    pub checkers: [u8; CHECKER_BITMAP_BYTES],
    /// Mean latency (ms) × 100_000.
    pub latency: u32,
    /// Mean uptime (%) × 100_000.
    pub uptime: u32,
}

impl AggregateProof {
    pub fn submitted_slots(&self) -> u32 {
        self.checkers.iter().map(|b| b.count_ones()).sum()
    }

    pub fn is_slot_set(&self, position: usize) -> bool {
        position < CHECKER_BITMAP_BYTES * 8 && self.checkers[position / 8] & (1 << (position % 8)) != 0
    }
}

/// sha256 of the canonical JSON of `{checkerIndex, proof}`.
pub fn proof_leaf(proof: &ProofWithIndex) -> Result<[u8; 32], ProtocolError> {
    Ok(sha256(canonical_json(proof)?.as_bytes()))
}

/// Merkle root over proofs ordered by checker index. Input order is
/// irrelevant; an empty list yields the zero root.
pub fn proof_merkle_root(proofs: &[ProofWithIndex]) -> Result<[u8; 32], ProtocolError> {
    let mut leaves = proofs
        .iter()
        .map(|p| Ok((p.checker_index, proof_leaf(p)?)))
        .collect::<Result<Vec<_>, ProtocolError>>()?;
    leaves.sort_unstable();
    let hashes: Vec<[u8; 32]> = leaves.into_iter().map(|(_, h)| h).collect();
    Ok(merkle_root(&hashes))
}

/// Build the aggregate for `proofs`, or `None` when nothing was submitted.
pub fn aggregate(
    assignment: &AssignmentSet,
    proofs: &[ProofWithIndex],
) -> Result<Option<AggregateProof>, ProtocolError> {
    if proofs.is_empty() {
        return Ok(None);
    }

    let submitted: HashSet<u64> = proofs.iter().map(|p| p.checker_index).collect();
    let mut checkers = [0u8; CHECKER_BITMAP_BYTES];
    for (position, slot) in assignment.iter().enumerate() {
        if submitted.contains(&slot) {
            checkers[position / 8] |= 1 << (position % 8);
        }
    }

    let count = proofs.len() as f64;
    let mean_latency = proofs.iter().map(|p| p.proof.payload.metrics.latency).sum::<f64>() / count;
    let mean_uptime = proofs.iter().map(|p| p.proof.payload.metrics.uptime).sum::<f64>() / count;

    Ok(Some(AggregateProof {
        merkle_root: proof_merkle_root(proofs)?,
        checkers,
        latency: scale(mean_latency),
        uptime: scale(mean_uptime),
    }))
}

fn scale(mean: f64) -> u32 {
    // `as` saturates at the u32 bounds and maps NaN to 0.
    (mean * METRIC_SCALE).round() as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brand::assignment_set;
    use crate::payload::{ProofMetrics, WorkerProofPayload};
    use crate::signature::SignedPayload;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    fn proof(key: &SigningKey, index: u64, latency: f64, uptime: f64) -> ProofWithIndex {
        let payload = WorkerProofPayload {
            checker: bs58::encode(key.verifying_key().to_bytes()).into_string(),
            checker_license: "Lic".into(),
            worker: "Worker".into(),
            period: 7,
            metrics: ProofMetrics { latency, uptime },
        };
        ProofWithIndex {
            checker_index: index,
            proof: SignedPayload::sign(payload, key).unwrap(),
        }
    }

    #[test]
    fn empty_list_has_zero_root_and_no_aggregate() {
        assert_eq!(proof_merkle_root(&[]).unwrap(), [0u8; 32]);
        let set = assignment_set(b"w", 7, 10).unwrap();
        assert_eq!(aggregate(&set, &[]).unwrap(), None);
    }

    #[test]
    fn root_ignores_input_order() {
        let key = SigningKey::generate(&mut OsRng);
        let proofs: Vec<_> = (0..5).map(|i| proof(&key, i * 3, 100.0 + i as f64, 99.0)).collect();
        let mut shuffled = proofs.clone();
        shuffled.reverse();
        shuffled.swap(0, 2);
        assert_eq!(
            proof_merkle_root(&proofs).unwrap(),
            proof_merkle_root(&shuffled).unwrap()
        );
    }

    #[test]
    fn root_changes_on_add_remove_mutate() {
        let key = SigningKey::generate(&mut OsRng);
        let proofs: Vec<_> = (0..4).map(|i| proof(&key, i, 50.0, 100.0)).collect();
        let base = proof_merkle_root(&proofs).unwrap();

        let mut added = proofs.clone();
        added.push(proof(&key, 9, 50.0, 100.0));
        assert_ne!(proof_merkle_root(&added).unwrap(), base);

        assert_ne!(proof_merkle_root(&proofs[..3]).unwrap(), base);

        let mut mutated = proofs.clone();
        mutated[1].proof.payload.metrics.latency = 51.0;
        assert_ne!(proof_merkle_root(&mutated).unwrap(), base);
    }

    #[test]
    fn bitmap_marks_submitting_slots() {
        let key = SigningKey::generate(&mut OsRng);
        let set = assignment_set(b"worker-license", 7, 2_000).unwrap();
        let chosen: Vec<u64> = set.iter().step_by(37).collect();
        let mut proofs: Vec<_> = chosen.iter().map(|&i| proof(&key, i, 10.0, 100.0)).collect();
        // Not in the assignment set: counts toward the averages only.
        let outsider = (0..2_000).find(|i| !set.contains(*i)).unwrap();
        proofs.push(proof(&key, outsider, 10.0, 100.0));

        let agg = aggregate(&set, &proofs).unwrap().unwrap();
        assert_eq!(agg.submitted_slots() as usize, chosen.len());
        for &slot in &chosen {
            assert!(agg.is_slot_set(set.position(slot).unwrap()));
        }
    }

    #[test]
    fn averages_are_fixed_point() {
        let key = SigningKey::generate(&mut OsRng);
        let set = assignment_set(b"w", 7, 4).unwrap();
        let proofs = vec![proof(&key, 0, 100.0, 100.0), proof(&key, 1, 150.5, 50.0)];
        let agg = aggregate(&set, &proofs).unwrap().unwrap();
        assert_eq!(agg.latency, 12_525_000);
        assert_eq!(agg.uptime, 7_500_000);
        assert_eq!(agg.submitted_slots(), 2);
    }
}
