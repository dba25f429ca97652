use std::path::Path;

use ed25519_dalek::SigningKey;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{read_keypair_file, Keypair, Signer};

use crate::error::LedgerError;

/// Node identity: the Solana keypair that pays for transactions, and the
/// same secret as an ed25519 key for signing JSON envelopes.
pub struct NodeIdentity {
    pub keypair: Keypair,
    pub signing_key: SigningKey,
}

impl NodeIdentity {
    pub fn from_keypair(keypair: Keypair) -> Self {
        let mut secret = [0u8; 32];
        secret.copy_from_slice(&keypair.to_bytes()[..32]);
        Self {
            keypair,
            signing_key: SigningKey::from_bytes(&secret),
        }
    }

    /// Load a Solana CLI keypair file (JSON array of 64 bytes).
    pub fn load(path: &Path) -> Result<Self, LedgerError> {
        let keypair = read_keypair_file(path)
            .map_err(|e| LedgerError::Keypair(format!("{}: {e}", path.display())))?;
        Ok(Self::from_keypair(keypair))
    }

    pub fn address(&self) -> Pubkey {
        self.keypair.pubkey()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use solana_sdk::signature::write_keypair_file;

    #[test]
    fn signing_key_matches_address() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("id.json");
        let kp = Keypair::new();
        write_keypair_file(&kp, &path).unwrap();

        let id = NodeIdentity::load(&path).unwrap();
        assert_eq!(id.address(), kp.pubkey());
        assert_eq!(id.signing_key.verifying_key().to_bytes(), kp.pubkey().to_bytes());
    }

    #[test]
    fn missing_file_is_a_keypair_error() {
        let err = NodeIdentity::load(Path::new("/nonexistent/id.json")).err().unwrap();
        assert!(matches!(err, LedgerError::Keypair(_)));
    }
}
