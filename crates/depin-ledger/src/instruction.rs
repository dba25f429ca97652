//! `SubmitWorkerProof` instruction builder.

use std::str::FromStr;

use depin_protocol::aggregate::AggregateProof;
use depin_protocol::constants::ACCOUNT_COMPRESSION_PROGRAM_ID;
use depin_protocol::Period;
use solana_sdk::instruction::{AccountMeta, Instruction};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::system_program;

use crate::accounts::ProgramAddresses;
use crate::das::LicenseWithProof;
use crate::error::LedgerError;

/// Program instruction discriminators.
const IX_SUBMIT_WORKER_PROOF: u8 = 1;

/// Leaf of a compressed license NFT, as the program re-hashes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CnftContext {
    pub owner: Pubkey,
    pub delegate: Pubkey,
    pub nonce: u64,
    pub index: u32,
    pub root: [u8; 32],
    pub data_hash: [u8; 32],
    pub creator_hash: [u8; 32],
    pub collection_hash: [u8; 32],
    pub asset_data_hash: [u8; 32],
    pub flags: u8,
}

impl CnftContext {
    pub const LEN: usize = 32 + 32 + 8 + 4 + 32 * 5 + 1;

    pub fn write_to(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self.owner.as_ref());
        buf.extend_from_slice(self.delegate.as_ref());
        buf.extend_from_slice(&self.nonce.to_le_bytes());
        buf.extend_from_slice(&self.index.to_le_bytes());
        buf.extend_from_slice(&self.root);
        buf.extend_from_slice(&self.data_hash);
        buf.extend_from_slice(&self.creator_hash);
        buf.extend_from_slice(&self.collection_hash);
        buf.extend_from_slice(&self.asset_data_hash);
        buf.push(self.flags);
    }
}

/// Instruction data: tag, license leaf, then the aggregate fields.
pub fn submit_worker_proof_data(
    context: &CnftContext,
    period: Period,
    aggregate: &AggregateProof,
) -> Vec<u8> {
    let mut data = Vec::with_capacity(1 + CnftContext::LEN + 32 + 2 + 64 + 8);
    data.push(IX_SUBMIT_WORKER_PROOF);
    context.write_to(&mut data);
    data.extend_from_slice(&aggregate.merkle_root);
    data.extend_from_slice(&period.to_le_bytes());
    data.extend_from_slice(&aggregate.checkers);
    data.extend_from_slice(&aggregate.uptime.to_le_bytes());
    data.extend_from_slice(&aggregate.latency.to_le_bytes());
    data
}

pub fn submit_worker_proof_ix(
    addresses: &ProgramAddresses,
    payer: &Pubkey,
    license: &LicenseWithProof,
    period: Period,
    aggregate: &AggregateProof,
) -> Result<Instruction, LedgerError> {
    let compression = Pubkey::from_str(ACCOUNT_COMPRESSION_PROGRAM_ID)
        .map_err(|e| LedgerError::InvalidPubkey(e.to_string()))?;

    let mut accounts = vec![
        AccountMeta::new_readonly(*payer, true),
        AccountMeta::new(addresses.global_rewards(), false),
        AccountMeta::new(addresses.worker_proof(&license.asset, period), false),
        AccountMeta::new_readonly(
            addresses.worker_metadata(&license.asset, &license.context.owner),
            false,
        ),
        AccountMeta::new_readonly(addresses.worker_license_metadata(&license.asset), false),
        AccountMeta::new_readonly(compression, false),
        AccountMeta::new_readonly(license.tree, false),
        AccountMeta::new_readonly(addresses.bmb_state(), false),
        AccountMeta::new_readonly(system_program::id(), false),
    ];
    accounts.extend(
        license
            .proof_path
            .iter()
            .map(|node| AccountMeta::new_readonly(*node, false)),
    );

    Ok(Instruction {
        program_id: addresses.program_id,
        accounts,
        data: submit_worker_proof_data(&license.context, period, aggregate),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn license() -> LicenseWithProof {
        let owner = Pubkey::new_unique();
        LicenseWithProof {
            asset: Pubkey::new_unique(),
            index: 3,
            owner,
            tree: Pubkey::new_unique(),
            context: CnftContext {
                owner,
                delegate: owner,
                nonce: 3,
                index: 3,
                root: [1; 32],
                data_hash: [2; 32],
                creator_hash: [3; 32],
                collection_hash: [0; 32],
                asset_data_hash: [0; 32],
                flags: 0,
            },
            proof_path: vec![Pubkey::new_unique(); 3],
        }
    }

    fn aggregate() -> AggregateProof {
        let mut checkers = [0u8; 64];
        checkers[0] = 0b101;
        AggregateProof {
            merkle_root: [9; 32],
            checkers,
            latency: 12_500_000,
            uptime: 9_950_000,
        }
    }

    #[test]
    fn data_layout() {
        let data = submit_worker_proof_data(&license().context, 0x0102, &aggregate());
        assert_eq!(data.len(), 1 + 237 + 32 + 2 + 64 + 4 + 4);
        assert_eq!(data[0], 1);
        let tail = 1 + CnftContext::LEN;
        assert_eq!(&data[tail..tail + 32], &[9; 32]);
        assert_eq!(&data[tail + 32..tail + 34], &[0x02, 0x01]);
        assert_eq!(data[tail + 34], 0b101);
        assert_eq!(&data[tail + 98..tail + 102], &9_950_000u32.to_le_bytes());
        assert_eq!(&data[tail + 102..], &12_500_000u32.to_le_bytes());
    }

    #[test]
    fn account_list() {
        let addresses = ProgramAddresses::mainnet().unwrap();
        let payer = Pubkey::new_unique();
        let license = license();
        let ix = submit_worker_proof_ix(&addresses, &payer, &license, 7, &aggregate()).unwrap();
        assert_eq!(ix.accounts.len(), 9 + 3);
        assert!(ix.accounts[0].is_signer && !ix.accounts[0].is_writable);
        assert_eq!(ix.accounts[2].pubkey, addresses.worker_proof(&license.asset, 7));
        assert!(ix.accounts[1].is_writable && ix.accounts[2].is_writable);
        assert!(ix.accounts[3..].iter().all(|a| !a.is_writable && !a.is_signer));
        assert_eq!(ix.accounts[6].pubkey, license.tree);
    }
}
