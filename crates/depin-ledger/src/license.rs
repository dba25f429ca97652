//! Checker license checks against the ledger.

use solana_sdk::pubkey::Pubkey;
use thiserror::Error;

use crate::accounts::{AccountType, CheckerMetadata, LicenseMetadata, ProgramAddresses};
use crate::client::LedgerClient;
use crate::error::LedgerError;

#[derive(Debug, Error)]
pub enum LicenseRejection {
    #[error("checker license is not activated for this checker")]
    NotActivated,

    #[error("checker is suspended")]
    CheckerSuspended,

    #[error("checker license is delegated to {delegated_to}")]
    NotDelegated { delegated_to: Pubkey },

    #[error("checker license is suspended")]
    LicenseSuspended,

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl LicenseRejection {
    /// Stable error code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            LicenseRejection::NotActivated | LicenseRejection::NotDelegated { .. } => {
                "invalid_checker_license"
            }
            LicenseRejection::CheckerSuspended => "checker_suspended",
            LicenseRejection::LicenseSuspended => "checker_license_suspended",
            LicenseRejection::Ledger(_) => "checker_license_unavailable",
        }
    }
}

/// `checker` holds an activated, unsuspended `license` delegated to itself.
pub async fn check_checker_license(
    ledger: &dyn LedgerClient,
    addresses: &ProgramAddresses,
    license: &Pubkey,
    checker: &Pubkey,
) -> Result<(), LicenseRejection> {
    let meta_address = addresses.checker_metadata(license, checker);
    let data = ledger
        .read_account(&meta_address)
        .await?
        .ok_or(LicenseRejection::NotActivated)?;
    let meta = CheckerMetadata::decode(&data)?;
    if meta.suspended_at.is_some() {
        return Err(LicenseRejection::CheckerSuspended);
    }
    if meta.delegated_to != *checker {
        return Err(LicenseRejection::NotDelegated {
            delegated_to: meta.delegated_to,
        });
    }

    // License metadata only exists once the license itself has been touched
    // by an admin action; absence means not suspended.
    let license_address = addresses.checker_license_metadata(license);
    if let Some(data) = ledger.read_account(&license_address).await? {
        let license_meta = LicenseMetadata::decode(&data, AccountType::CheckerLicenseMetadata)?;
        if license_meta.suspended_at.is_some() {
            return Err(LicenseRejection::LicenseSuspended);
        }
    }
    Ok(())
}
