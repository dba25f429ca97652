//! Folds a period's stored checker proofs into the aggregate this worker
//! submits to the ledger.

use std::sync::Arc;

use anyhow::{anyhow, Context};
use depin_ledger::BmbStateReader;
use depin_protocol::aggregate::{aggregate, AggregateProof};
use depin_protocol::{assignment_set, Period};
use solana_sdk::pubkey::Pubkey;

use crate::store::ProofStore;

pub struct ProofAggregator {
    store: Arc<dyn ProofStore>,
    bmb: Arc<BmbStateReader>,
    /// Worker license; its bytes seed the assignment set.
    license: Pubkey,
}

impl ProofAggregator {
    pub fn new(store: Arc<dyn ProofStore>, bmb: Arc<BmbStateReader>, license: Pubkey) -> Self {
        Self { store, bmb, license }
    }

    /// `None` when no checker submitted a proof for `period`.
    pub async fn get_aggregate_proof(&self, period: Period) -> anyhow::Result<Option<AggregateProof>> {
        let proofs = self
            .store
            .list(period)
            .await
            .with_context(|| format!("listing proofs for period {period}"))?;
        if proofs.is_empty() {
            return Ok(None);
        }

        let population = self
            .bmb
            .checker_count(period)
            .await
            .context("reading BMB state")?
            .ok_or_else(|| anyhow!("no checker count recorded for period {period}"))?;
        let assignment = assignment_set(self.license.as_ref(), period, i64::from(population))?;

        let proof = aggregate(&assignment, &proofs)?;
        if let Some(proof) = &proof {
            tracing::debug!(
                period,
                proofs = proofs.len(),
                assigned = proof.submitted_slots(),
                "Aggregated proofs"
            );
        }
        Ok(proof)
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::bmb_with_count;
    use super::*;
    use crate::store::fixtures::raw_proof;
    use crate::store::MemoryProofStore;
    use depin_ledger::memory::MemoryLedger;
    use depin_ledger::ProgramAddresses;
    use ed25519_dalek::SigningKey;

    struct Harness {
        store: Arc<MemoryProofStore>,
        aggregator: ProofAggregator,
        license: Pubkey,
    }

    fn harness(count: Option<u32>) -> Harness {
        let ledger = Arc::new(MemoryLedger::new());
        let addresses = ProgramAddresses::new(Pubkey::new_unique());
        let bmb = match count {
            Some(count) => bmb_with_count(ledger, &addresses, 5, count),
            None => Arc::new(BmbStateReader::new(
                ledger,
                addresses.bmb_state(),
                4,
                std::time::Duration::from_secs(60),
            )),
        };
        let store = Arc::new(MemoryProofStore::new());
        let license = Pubkey::new_unique();
        Harness {
            aggregator: ProofAggregator::new(store.clone(), bmb, license),
            store,
            license,
        }
    }

    #[tokio::test]
    async fn no_proofs_means_nothing_to_submit() {
        let h = harness(None);
        assert_eq!(h.aggregator.get_aggregate_proof(5).await.unwrap(), None);
    }

    #[tokio::test]
    async fn bitmap_follows_assignment_positions() {
        let h = harness(Some(20));
        let assignment = assignment_set(h.license.as_ref(), 5, 20).unwrap();
        let submitters = [assignment.as_slice()[0], assignment.as_slice()[7]];
        for (i, &slot) in submitters.iter().enumerate() {
            let key = SigningKey::from_bytes(&[i as u8 + 1; 32]);
            h.store
                .put_if_absent(5, slot, &raw_proof(&key, 5, 100.0 * (i + 1) as f64, 100.0))
                .await
                .unwrap();
        }

        let proof = h.aggregator.get_aggregate_proof(5).await.unwrap().unwrap();
        assert_eq!(proof.submitted_slots(), 2);
        assert!(proof.is_slot_set(0));
        assert!(proof.is_slot_set(7));
        assert_eq!(proof.latency, 150 * 100_000);
        assert_eq!(proof.uptime, 100 * 100_000);
    }

    #[tokio::test]
    async fn missing_checker_count_is_an_error() {
        let h = harness(None);
        let key = SigningKey::from_bytes(&[1; 32]);
        h.store.put_if_absent(5, 0, &raw_proof(&key, 5, 10.0, 50.0)).await.unwrap();
        assert!(h.aggregator.get_aggregate_proof(5).await.is_err());
    }
}
