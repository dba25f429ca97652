//! In-memory `LedgerClient` for tests.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use solana_sdk::{commitment_config::CommitmentLevel, instruction::Instruction, pubkey::Pubkey};

use crate::accounts::AccountType;
use crate::client::{AccountPage, LedgerClient, SubmitReceipt};
use crate::error::LedgerError;

#[derive(Default)]
pub struct MemoryLedger {
    accounts: Mutex<BTreeMap<Pubkey, Vec<u8>>>,
    /// Scan page size; 0 = everything in one page.
    page_size: usize,
    reads: AtomicUsize,
    scans: AtomicUsize,
    submitted: Mutex<Vec<Vec<Instruction>>>,
    scripted: Mutex<VecDeque<Result<(), LedgerError>>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page_size(page_size: usize) -> Self {
        Self { page_size, ..Self::default() }
    }

    pub fn put(&self, address: Pubkey, data: Vec<u8>) {
        self.accounts.lock().unwrap().insert(address, data);
    }

    /// Queue the outcome of the next `submit_transaction` call.
    pub fn script_submit(&self, outcome: Result<(), LedgerError>) {
        self.scripted.lock().unwrap().push_back(outcome);
    }

    pub fn submitted(&self) -> Vec<Vec<Instruction>> {
        self.submitted.lock().unwrap().clone()
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn scans(&self) -> usize {
        self.scans.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LedgerClient for MemoryLedger {
    async fn read_account(&self, address: &Pubkey) -> Result<Option<Vec<u8>>, LedgerError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.accounts.lock().unwrap().get(address).cloned())
    }

    async fn scan_accounts_by_type(
        &self,
        account_type: AccountType,
        page_token: Option<String>,
    ) -> Result<AccountPage, LedgerError> {
        self.scans.fetch_add(1, Ordering::SeqCst);
        let matching: Vec<(Pubkey, Vec<u8>)> = self
            .accounts
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, data)| data.first() == Some(&account_type.tag()))
            .map(|(k, v)| (*k, v.clone()))
            .collect();
        let start = match page_token {
            Some(t) => t.parse().map_err(|_| LedgerError::Rpc(format!("bad page token {t}")))?,
            None => 0,
        };
        let end = if self.page_size == 0 {
            matching.len()
        } else {
            (start + self.page_size).min(matching.len())
        };
        Ok(AccountPage {
            entries: matching.get(start..end).map(<[_]>::to_vec).unwrap_or_default(),
            next: (end < matching.len()).then(|| end.to_string()),
        })
    }

    async fn submit_transaction(
        &self,
        instructions: &[Instruction],
        _commitment: CommitmentLevel,
    ) -> Result<SubmitReceipt, LedgerError> {
        self.submitted.lock().unwrap().push(instructions.to_vec());
        let outcome = self.scripted.lock().unwrap().pop_front().unwrap_or(Ok(()));
        outcome.map(|()| SubmitReceipt {
            signature: format!("sig{}", self.submitted.lock().unwrap().len()),
            logs: Vec::new(),
        })
    }
}
