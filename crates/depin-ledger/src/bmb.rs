//! BMB state: the ring buffer recording the checker population per period.

use std::sync::Arc;
use std::time::Duration;

use depin_protocol::Period;
use solana_sdk::pubkey::Pubkey;

use crate::accounts::{AccountType, Cursor};
use crate::cache::TtlCache;
use crate::client::LedgerClient;
use crate::error::LedgerError;

pub const BMB_RING_SIZE: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BmbState {
    /// `(period << 48) | checker_count`; zero marks an unused slot.
    pub entries: [u64; BMB_RING_SIZE],
    /// Next slot to be written.
    pub current_index: u8,
}

impl BmbState {
    pub fn decode(data: &[u8]) -> Result<Self, LedgerError> {
        let mut c = Cursor::typed("BMBState", data, AccountType::BmbState)?;
        let mut entries = [0u64; BMB_RING_SIZE];
        for entry in entries.iter_mut() {
            *entry = c.u64()?;
        }
        let current_index = c.u8()?;
        Ok(Self { entries, current_index })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(2 + 8 * BMB_RING_SIZE);
        buf.push(AccountType::BmbState.tag());
        for entry in &self.entries {
            buf.extend_from_slice(&entry.to_le_bytes());
        }
        buf.push(self.current_index);
        buf
    }

    pub fn pack(period: Period, checker_count: u32) -> u64 {
        ((period as u64) << 48) | checker_count as u64
    }

    pub fn unpack(entry: u64) -> (Period, u32) {
        ((entry >> 48) as Period, (entry & 0xFFFF_FFFF) as u32)
    }

    /// Append an entry the way the program does.
    pub fn push(&mut self, period: Period, checker_count: u32) {
        let idx = self.current_index as usize % BMB_RING_SIZE;
        self.entries[idx] = Self::pack(period, checker_count);
        self.current_index = ((idx + 1) % BMB_RING_SIZE) as u8;
    }

    /// Checker count in effect for `period`: the first non-empty entry not
    /// after `period`, walking backwards from `current_index`.
    ///
    /// The walk order is the program's. Once the ring has wrapped, the slot at
    /// `current_index` holds the oldest entry and is visited first; rewards
    /// are credited against that answer, so it is reproduced as-is.
    pub fn checker_count(&self, period: Period) -> Option<u32> {
        let start = self.current_index as usize % BMB_RING_SIZE;
        (0..BMB_RING_SIZE)
            .map(|back| self.entries[(start + BMB_RING_SIZE - back) % BMB_RING_SIZE])
            .filter(|&entry| entry != 0)
            .map(Self::unpack)
            .find(|&(p, _)| p <= period)
            .map(|(_, count)| count)
    }
}

/// Cached BMB state reads, shared by the proof route and the aggregator.
pub struct BmbStateReader {
    ledger: Arc<dyn LedgerClient>,
    address: Pubkey,
    cache: TtlCache<Pubkey, BmbState>,
}

impl BmbStateReader {
    pub fn new(
        ledger: Arc<dyn LedgerClient>,
        address: Pubkey,
        capacity: usize,
        ttl: Duration,
    ) -> Self {
        Self {
            ledger,
            address,
            cache: TtlCache::new(capacity, ttl),
        }
    }

    pub async fn load(&self) -> Result<BmbState, LedgerError> {
        self.cache
            .get_or_try_insert_with(self.address, || async move {
                let data = self
                    .ledger
                    .read_account(&self.address)
                    .await?
                    .ok_or_else(|| LedgerError::AccountNotFound(self.address.to_string()))?;
                BmbState::decode(&data)
            })
            .await
    }

    pub async fn checker_count(&self, period: Period) -> Result<Option<u32>, LedgerError> {
        Ok(self.load().await?.checker_count(period))
    }
}
