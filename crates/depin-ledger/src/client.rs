//! Ledger client seam and its Solana RPC implementation.

use std::sync::Arc;

use async_trait::async_trait;
use solana_account_decoder::UiAccountEncoding;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_client::rpc_config::{RpcAccountInfoConfig, RpcProgramAccountsConfig};
use solana_client::rpc_filter::{Memcmp, RpcFilterType};
use solana_sdk::{
    commitment_config::{CommitmentConfig, CommitmentLevel},
    instruction::Instruction,
    pubkey::Pubkey,
    signature::Signer,
    transaction::Transaction,
};

use crate::accounts::{AccountType, WorkerMetadata, WorkerRegistration};
use crate::error::LedgerError;
use crate::identity::NodeIdentity;

/// One page of a by-type scan.
#[derive(Debug, Clone, Default)]
pub struct AccountPage {
    pub entries: Vec<(Pubkey, Vec<u8>)>,
    /// Opaque token for the next page; `None` on the last page.
    pub next: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitReceipt {
    pub signature: String,
    pub logs: Vec<String>,
}

/// Read and write access to the program's accounts.
///
/// Implementations must be safe to share across tasks.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Raw account data, `None` if the account doesn't exist.
    async fn read_account(&self, address: &Pubkey) -> Result<Option<Vec<u8>>, LedgerError>;

    /// Program accounts whose first byte is `account_type`.
    async fn scan_accounts_by_type(
        &self,
        account_type: AccountType,
        page_token: Option<String>,
    ) -> Result<AccountPage, LedgerError>;

    /// Sign, send and confirm `instructions` in one transaction.
    /// A duplicate account initialization maps to `AlreadyInitialized`.
    async fn submit_transaction(
        &self,
        instructions: &[Instruction],
        commitment: CommitmentLevel,
    ) -> Result<SubmitReceipt, LedgerError>;
}

/// Follow `next` tokens until the scan is exhausted.
pub async fn scan_all(
    ledger: &dyn LedgerClient,
    account_type: AccountType,
) -> Result<Vec<(Pubkey, Vec<u8>)>, LedgerError> {
    let mut out = Vec::new();
    let mut token = None;
    loop {
        let page = ledger.scan_accounts_by_type(account_type, token).await?;
        out.extend(page.entries);
        match page.next {
            Some(next) => token = Some(next),
            None => return Ok(out),
        }
    }
}

/// All worker registrations that are unsuspended and advertise a discovery
/// URI. Undecodable accounts are logged and skipped.
pub async fn fetch_active_workers(
    ledger: &dyn LedgerClient,
) -> Result<Vec<WorkerRegistration>, LedgerError> {
    let accounts = scan_all(ledger, AccountType::WorkerMetadata).await?;
    let total = accounts.len();
    let active: Vec<WorkerRegistration> = accounts
        .into_iter()
        .filter_map(|(account, data)| match WorkerMetadata::decode(&data) {
            Ok(metadata) => Some(WorkerRegistration { account, metadata }),
            Err(e) => {
                tracing::warn!(account = %account, "skipping worker account: {e}");
                None
            }
        })
        .filter(WorkerRegistration::is_active)
        .collect();
    tracing::debug!(total, active = active.len(), "worker registrations scanned");
    Ok(active)
}

// ============================================================================
// Solana RPC implementation
// ============================================================================

pub struct SolanaLedger {
    rpc: RpcClient,
    payer: Arc<NodeIdentity>,
    program_id: Pubkey,
}

impl SolanaLedger {
    pub fn new(rpc_url: &str, payer: Arc<NodeIdentity>, program_id: Pubkey) -> Self {
        Self {
            rpc: RpcClient::new_with_commitment(rpc_url.to_owned(), CommitmentConfig::confirmed()),
            payer,
            program_id,
        }
    }
}

#[async_trait]
impl LedgerClient for SolanaLedger {
    async fn read_account(&self, address: &Pubkey) -> Result<Option<Vec<u8>>, LedgerError> {
        let resp = self
            .rpc
            .get_account_with_commitment(address, self.rpc.commitment())
            .await
            .map_err(|e| LedgerError::Rpc(e.to_string()))?;
        Ok(resp.value.map(|account| account.data))
    }

    // getProgramAccounts returns everything in one response, so there is
    // only ever one page.
    async fn scan_accounts_by_type(
        &self,
        account_type: AccountType,
        page_token: Option<String>,
    ) -> Result<AccountPage, LedgerError> {
        if page_token.is_some() {
            return Ok(AccountPage::default());
        }
        let config = RpcProgramAccountsConfig {
            filters: Some(vec![RpcFilterType::Memcmp(Memcmp::new_raw_bytes(
                0,
                vec![account_type.tag()],
            ))]),
            account_config: RpcAccountInfoConfig {
                encoding: Some(UiAccountEncoding::Base64),
                commitment: Some(self.rpc.commitment()),
                ..Default::default()
            },
            ..Default::default()
        };
        let accounts = self
            .rpc
            .get_program_accounts_with_config(&self.program_id, config)
            .await
            .map_err(|e| LedgerError::Rpc(e.to_string()))?;
        Ok(AccountPage {
            entries: accounts.into_iter().map(|(k, a)| (k, a.data)).collect(),
            next: None,
        })
    }

    async fn submit_transaction(
        &self,
        instructions: &[Instruction],
        commitment: CommitmentLevel,
    ) -> Result<SubmitReceipt, LedgerError> {
        let blockhash = self
            .rpc
            .get_latest_blockhash()
            .await
            .map_err(|e| LedgerError::Rpc(e.to_string()))?;
        let tx = Transaction::new_signed_with_payer(
            instructions,
            Some(&self.payer.keypair.pubkey()),
            &[&self.payer.keypair],
            blockhash,
        );

        // Simulate first: semantic rejections come back with logs attached.
        let sim = self
            .rpc
            .simulate_transaction(&tx)
            .await
            .map_err(|e| LedgerError::Rpc(e.to_string()))?;
        let logs = sim.value.logs.unwrap_or_default();
        if let Some(err) = sim.value.err {
            return Err(classify_rejection(format!("{err:?}"), logs));
        }

        let signature = self
            .rpc
            .send_and_confirm_transaction_with_spinner_and_commitment(
                &tx,
                CommitmentConfig { commitment },
            )
            .await
            .map_err(|e| {
                let detail = format!("{e:?}");
                if is_already_initialized(&detail, &[]) {
                    LedgerError::AlreadyInitialized
                } else {
                    LedgerError::Rpc(e.to_string())
                }
            })?;

        tracing::info!(tx = %signature, "transaction confirmed");
        Ok(SubmitReceipt {
            signature: signature.to_string(),
            logs,
        })
    }
}

fn is_already_initialized(detail: &str, logs: &[String]) -> bool {
    detail.contains("AccountAlreadyInitialized")
        || logs.iter().any(|l| {
            l.contains("already in use") || l.contains("account already initialized")
        })
}

pub(crate) fn classify_rejection(detail: String, logs: Vec<String>) -> LedgerError {
    if is_already_initialized(&detail, &logs) {
        LedgerError::AlreadyInitialized
    } else {
        LedgerError::TransactionFailed { reason: detail, logs }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryLedger;

    fn worker(ledger: &MemoryLedger, uri: &str, suspended: Option<u64>) {
        let meta = WorkerMetadata {
            suspended_at: suspended,
            delegated_to: Pubkey::new_unique(),
            license: Pubkey::new_unique(),
            owner: Pubkey::new_unique(),
            discovery_uri: uri.into(),
        };
        ledger.put(Pubkey::new_unique(), meta.encode());
    }

    #[tokio::test]
    async fn scan_follows_page_tokens() {
        let ledger = MemoryLedger::with_page_size(3);
        for i in 0..7 {
            worker(&ledger, &format!("https://w{i}"), None);
        }
        ledger.put(Pubkey::new_unique(), vec![AccountType::BmbState.tag(), 0]);
        let all = scan_all(&ledger, AccountType::WorkerMetadata).await.unwrap();
        assert_eq!(all.len(), 7);
        assert_eq!(ledger.scans(), 3);
    }

    #[tokio::test]
    async fn active_workers_filter() {
        let ledger = MemoryLedger::with_page_size(2);
        worker(&ledger, "https://ok", None);
        worker(&ledger, "", None);
        worker(&ledger, "https://suspended", Some(10));
        worker(&ledger, "   ", None);
        // Right tag, truncated body.
        ledger.put(Pubkey::new_unique(), vec![1, 0, 1]);
        let active = fetch_active_workers(&ledger).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].discovery_uri(), "https://ok");
    }

    #[test]
    fn duplicate_proof_is_already_initialized() {
        let err = classify_rejection("InstructionError(0, AccountAlreadyInitialized)".into(), vec![]);
        assert!(matches!(err, LedgerError::AlreadyInitialized));

        let err = classify_rejection(
            "InstructionError(0, Custom(0))".into(),
            vec!["Allocate: account Address { .. } already in use".into()],
        );
        assert!(matches!(err, LedgerError::AlreadyInitialized));

        let err = classify_rejection("InstructionError(0, InvalidArgument)".into(), vec![]);
        assert!(matches!(err, LedgerError::TransactionFailed { .. }));
    }
}
