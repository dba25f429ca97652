//! Program account layouts and PDA derivation.
//!
//! Every account starts with a one-byte type tag; the rest is borsh:
//! `Option<u64>` is a 0/1 tag followed by the LE value when present, strings
//! are a u32 LE length followed by UTF-8.

use std::str::FromStr;

use depin_protocol::constants::DEPIN_PROGRAM_ID;
use depin_protocol::Period;
use solana_sdk::pubkey::Pubkey;

use crate::error::LedgerError;

// ============================================================================
// Account types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AccountType {
    WorkerMetadata = 1,
    WorkerLicenseMetadata = 2,
    GlobalRewards = 3,
    WorkerProof = 4,
    BmbState = 5,
    CheckerMetadata = 6,
    CheckerLicenseMetadata = 7,
}

impl AccountType {
    pub fn tag(self) -> u8 {
        self as u8
    }
}

// ============================================================================
// Cursor
// ============================================================================

pub(crate) struct Cursor<'a> {
    account: &'static str,
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    /// Start after the type tag, checking it matches `expected`.
    pub(crate) fn typed(
        account: &'static str,
        data: &'a [u8],
        expected: AccountType,
    ) -> Result<Self, LedgerError> {
        let found = *data.first().ok_or_else(|| LedgerError::Decode {
            account,
            reason: "empty account data".into(),
        })?;
        if found != expected.tag() {
            return Err(LedgerError::WrongAccountType {
                expected: expected.tag(),
                found,
            });
        }
        Ok(Self { account, data, pos: 1 })
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], LedgerError> {
        let end = self.pos.checked_add(len).filter(|&e| e <= self.data.len());
        let end = end.ok_or_else(|| LedgerError::Decode {
            account: self.account,
            reason: format!("truncated at offset {} (need {len} bytes)", self.pos),
        })?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub(crate) fn u8(&mut self) -> Result<u8, LedgerError> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u32(&mut self) -> Result<u32, LedgerError> {
        let mut b = [0u8; 4];
        b.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(b))
    }

    pub(crate) fn u64(&mut self) -> Result<u64, LedgerError> {
        let mut b = [0u8; 8];
        b.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(b))
    }

    pub(crate) fn pubkey(&mut self) -> Result<Pubkey, LedgerError> {
        let mut b = [0u8; 32];
        b.copy_from_slice(self.take(32)?);
        Ok(Pubkey::new_from_array(b))
    }

    pub(crate) fn option_u64(&mut self) -> Result<Option<u64>, LedgerError> {
        match self.u8()? {
            0 => Ok(None),
            1 => Ok(Some(self.u64()?)),
            tag => Err(LedgerError::Decode {
                account: self.account,
                reason: format!("invalid option tag {tag}"),
            }),
        }
    }

    pub(crate) fn string(&mut self) -> Result<String, LedgerError> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|e| LedgerError::Decode {
            account: self.account,
            reason: e.to_string(),
        })
    }
}

fn put_option_u64(buf: &mut Vec<u8>, value: Option<u64>) {
    match value {
        None => buf.push(0),
        Some(v) => {
            buf.push(1);
            buf.extend_from_slice(&v.to_le_bytes());
        }
    }
}

// ============================================================================
// Worker / checker metadata
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerMetadata {
    pub suspended_at: Option<u64>,
    pub delegated_to: Pubkey,
    pub license: Pubkey,
    pub owner: Pubkey,
    pub discovery_uri: String,
}

impl WorkerMetadata {
    pub fn decode(data: &[u8]) -> Result<Self, LedgerError> {
        let mut c = Cursor::typed("WorkerMetadata", data, AccountType::WorkerMetadata)?;
        Ok(Self {
            suspended_at: c.option_u64()?,
            delegated_to: c.pubkey()?,
            license: c.pubkey()?,
            owner: c.pubkey()?,
            discovery_uri: c.string()?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![AccountType::WorkerMetadata.tag()];
        put_option_u64(&mut buf, self.suspended_at);
        buf.extend_from_slice(self.delegated_to.as_ref());
        buf.extend_from_slice(self.license.as_ref());
        buf.extend_from_slice(self.owner.as_ref());
        buf.extend_from_slice(&(self.discovery_uri.len() as u32).to_le_bytes());
        buf.extend_from_slice(self.discovery_uri.as_bytes());
        buf
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended_at.is_some()
    }
}

/// A worker registration as read from the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerRegistration {
    /// WorkerMetadata account address.
    pub account: Pubkey,
    pub metadata: WorkerMetadata,
}

impl WorkerRegistration {
    pub fn discovery_uri(&self) -> &str {
        self.metadata.discovery_uri.trim()
    }

    /// Unsuspended with a non-blank discovery URI.
    pub fn is_active(&self) -> bool {
        !self.metadata.is_suspended() && !self.discovery_uri().is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckerMetadata {
    pub suspended_at: Option<u64>,
    pub delegated_to: Pubkey,
}

impl CheckerMetadata {
    pub fn decode(data: &[u8]) -> Result<Self, LedgerError> {
        let mut c = Cursor::typed("CheckerMetadata", data, AccountType::CheckerMetadata)?;
        Ok(Self {
            suspended_at: c.option_u64()?,
            delegated_to: c.pubkey()?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![AccountType::CheckerMetadata.tag()];
        put_option_u64(&mut buf, self.suspended_at);
        buf.extend_from_slice(self.delegated_to.as_ref());
        buf
    }
}

/// Worker- or checker-license metadata; both carry only a suspension flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LicenseMetadata {
    pub suspended_at: Option<u64>,
}

impl LicenseMetadata {
    pub fn decode(data: &[u8], kind: AccountType) -> Result<Self, LedgerError> {
        let mut c = Cursor::typed("LicenseMetadata", data, kind)?;
        Ok(Self {
            suspended_at: c.option_u64()?,
        })
    }

    pub fn encode(&self, kind: AccountType) -> Vec<u8> {
        let mut buf = vec![kind.tag()];
        put_option_u64(&mut buf, self.suspended_at);
        buf
    }
}

// ============================================================================
// PDAs
// ============================================================================

const WORKER_SEED: &[u8] = b"worker";
const CHECKER_SEED: &[u8] = b"checker";
const METADATA_SEED: &[u8] = b"meta";
const LICENSE_SEED: &[u8] = b"license";
const PROOF_SEED: &[u8] = b"proof";
const GLOBAL_SEED: &[u8] = b"global";
const STATE_SEED: &[u8] = b"state";
const REWARDS_SEED: &[u8] = b"rewards";

/// PDA derivation under one program id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramAddresses {
    pub program_id: Pubkey,
}

impl ProgramAddresses {
    pub fn new(program_id: Pubkey) -> Self {
        Self { program_id }
    }

    pub fn mainnet() -> Result<Self, LedgerError> {
        let program_id = Pubkey::from_str(DEPIN_PROGRAM_ID)
            .map_err(|e| LedgerError::InvalidPubkey(e.to_string()))?;
        Ok(Self::new(program_id))
    }

    fn find(&self, seeds: &[&[u8]]) -> Pubkey {
        Pubkey::find_program_address(seeds, &self.program_id).0
    }

    pub fn worker_metadata(&self, license: &Pubkey, worker: &Pubkey) -> Pubkey {
        self.find(&[WORKER_SEED, METADATA_SEED, license.as_ref(), worker.as_ref()])
    }

    pub fn worker_license_metadata(&self, license: &Pubkey) -> Pubkey {
        self.find(&[WORKER_SEED, LICENSE_SEED, license.as_ref()])
    }

    pub fn checker_metadata(&self, license: &Pubkey, checker: &Pubkey) -> Pubkey {
        self.find(&[CHECKER_SEED, METADATA_SEED, license.as_ref(), checker.as_ref()])
    }

    pub fn checker_license_metadata(&self, license: &Pubkey) -> Pubkey {
        self.find(&[CHECKER_SEED, LICENSE_SEED, METADATA_SEED, license.as_ref()])
    }

    pub fn worker_proof(&self, license: &Pubkey, period: Period) -> Pubkey {
        self.find(&[PROOF_SEED, &period.to_le_bytes(), license.as_ref()])
    }

    pub fn global_rewards(&self) -> Pubkey {
        self.find(&[GLOBAL_SEED, REWARDS_SEED])
    }

    pub fn bmb_state(&self) -> Pubkey {
        self.find(&[GLOBAL_SEED, STATE_SEED])
    }
}
