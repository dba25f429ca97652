// depin-ledger: everything that touches the on-chain program.
// Account layouts and PDA seeds must match the deployed program; the
// `LedgerClient` trait is the seam node code and tests plug into.

pub mod accounts;
pub mod bmb;
pub mod cache;
pub mod client;
pub mod das;
pub mod error;
pub mod identity;
pub mod instruction;
pub mod license;

pub use accounts::{AccountType, ProgramAddresses, WorkerRegistration};
pub use bmb::{BmbState, BmbStateReader};
pub use cache::{CacheStats, TtlCache};
pub use client::{fetch_active_workers, scan_all, AccountPage, LedgerClient, SolanaLedger, SubmitReceipt};
pub use das::{DasClient, LicenseDirectory, LicenseWithProof};
pub use error::LedgerError;
pub use identity::NodeIdentity;
pub use license::{check_checker_license, LicenseRejection};

#[cfg(any(test, feature = "test-util"))]
pub mod memory;
