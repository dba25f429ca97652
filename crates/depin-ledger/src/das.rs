//! License lookup through the Digital Asset Standard (DAS) JSON-RPC API.
//!
//! Licenses are compressed NFTs. A license's leaf index is the holder's
//! checker slot; the leaf data plus its merkle path are what the program
//! needs to verify ownership inside `SubmitWorkerProof`.
//!
//! Methods used:
//!   getAsset       : leaf index, owner/delegate and leaf hashes
//!   getAssetProof  : current tree root and the proof path

use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use solana_sdk::pubkey::Pubkey;

use crate::error::LedgerError;
use crate::instruction::CnftContext;

// ============================================================================
// JSON-RPC primitives
// ============================================================================

#[derive(Serialize)]
struct JsonRpcRequest<P: Serialize> {
    jsonrpc: &'static str,
    id: u64,
    method: &'static str,
    params: P,
}

#[derive(Deserialize)]
struct JsonRpcResponse<T> {
    result: Option<T>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

#[derive(Serialize)]
struct AssetParams<'a> {
    id: &'a str,
}

// ============================================================================
// Method-specific types
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct DasAsset {
    pub id: String,
    pub compression: DasCompression,
    pub ownership: DasOwnership,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DasCompression {
    pub data_hash: String,
    pub creator_hash: String,
    pub tree: String,
    pub leaf_id: u64,
    #[serde(default)]
    pub seq: u64,
    #[serde(default)]
    pub collection_hash: Option<String>,
    #[serde(default)]
    pub asset_data_hash: Option<String>,
    #[serde(default)]
    pub flags: Option<u8>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DasOwnership {
    pub owner: String,
    #[serde(default)]
    pub delegate: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DasAssetProof {
    pub root: String,
    pub proof: Vec<String>,
    pub tree_id: String,
}

/// A license resolved far enough to build a proof submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LicenseWithProof {
    pub asset: Pubkey,
    /// Leaf index in the license tree; doubles as the holder's slot index.
    pub index: u64,
    pub owner: Pubkey,
    pub tree: Pubkey,
    pub context: CnftContext,
    pub proof_path: Vec<Pubkey>,
}

fn pubkey(field: &str, value: &str) -> Result<Pubkey, LedgerError> {
    Pubkey::from_str(value).map_err(|e| LedgerError::InvalidPubkey(format!("{field}: {e}")))
}

fn hash32(field: &str, value: &str) -> Result<[u8; 32], LedgerError> {
    bs58::decode(value)
        .into_vec()
        .ok()
        .and_then(|v| v.try_into().ok())
        .ok_or_else(|| LedgerError::Das(format!("{field} is not a 32-byte base58 hash")))
}

fn optional_hash32(field: &str, value: Option<&str>) -> Result<[u8; 32], LedgerError> {
    match value {
        Some(v) if !v.is_empty() => hash32(field, v),
        _ => Ok([0u8; 32]),
    }
}

impl LicenseWithProof {
    pub fn from_das(asset: &DasAsset, proof: &DasAssetProof) -> Result<Self, LedgerError> {
        let c = &asset.compression;
        if c.tree != proof.tree_id {
            return Err(LedgerError::Das(format!(
                "asset tree {} does not match proof tree {}",
                c.tree, proof.tree_id
            )));
        }
        let owner = pubkey("owner", &asset.ownership.owner)?;
        // An undelegated leaf has the owner as its delegate.
        let delegate = match asset.ownership.delegate.as_deref() {
            Some(d) if !d.is_empty() => pubkey("delegate", d)?,
            _ => owner,
        };
        let index = u32::try_from(c.leaf_id)
            .map_err(|_| LedgerError::Das(format!("leaf id {} out of range", c.leaf_id)))?;

        let context = CnftContext {
            owner,
            delegate,
            nonce: c.leaf_id,
            index,
            root: hash32("root", &proof.root)?,
            data_hash: hash32("data_hash", &c.data_hash)?,
            creator_hash: hash32("creator_hash", &c.creator_hash)?,
            collection_hash: optional_hash32("collection_hash", c.collection_hash.as_deref())?,
            asset_data_hash: optional_hash32("asset_data_hash", c.asset_data_hash.as_deref())?,
            flags: c.flags.unwrap_or(0),
        };

        Ok(Self {
            asset: pubkey("id", &asset.id)?,
            index: c.leaf_id,
            owner,
            tree: pubkey("tree", &c.tree)?,
            context,
            proof_path: proof
                .proof
                .iter()
                .map(|p| pubkey("proof", p))
                .collect::<Result<_, _>>()?,
        })
    }
}

// ============================================================================
// LicenseDirectory
// ============================================================================

#[async_trait]
pub trait LicenseDirectory: Send + Sync {
    /// Slot index of `license` (its leaf index).
    async fn license_index(&self, license: &Pubkey) -> Result<u64, LedgerError>;

    async fn license_with_proof(&self, license: &Pubkey) -> Result<LicenseWithProof, LedgerError>;
}

pub struct DasClient {
    url: String,
    http: reqwest::Client,
}

impl DasClient {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_owned(),
            http: reqwest::Client::new(),
        }
    }

    async fn call<T: for<'de> Deserialize<'de>>(
        &self,
        method: &'static str,
        id: &str,
    ) -> Result<T, LedgerError> {
        let req = JsonRpcRequest {
            jsonrpc: "2.0",
            id: 1,
            method,
            params: AssetParams { id },
        };

        let resp: JsonRpcResponse<T> = self
            .http
            .post(&self.url)
            .json(&req)
            .send()
            .await
            .map_err(|e| LedgerError::Das(format!("{method} HTTP error: {e}")))?
            .json()
            .await
            .map_err(|e| LedgerError::Das(format!("{method} response parse error: {e}")))?;

        resp.result.ok_or_else(|| {
            let msg = resp
                .error
                .map(|e| format!("code={} msg={}", e.code, e.message))
                .unwrap_or_else(|| "no result and no error".into());
            LedgerError::Das(format!("{method} failed: {msg}"))
        })
    }

    pub async fn get_asset(&self, license: &Pubkey) -> Result<DasAsset, LedgerError> {
        self.call("getAsset", &license.to_string()).await
    }

    pub async fn get_asset_proof(&self, license: &Pubkey) -> Result<DasAssetProof, LedgerError> {
        self.call("getAssetProof", &license.to_string()).await
    }
}

#[async_trait]
impl LicenseDirectory for DasClient {
    async fn license_index(&self, license: &Pubkey) -> Result<u64, LedgerError> {
        Ok(self.get_asset(license).await?.compression.leaf_id)
    }

    async fn license_with_proof(&self, license: &Pubkey) -> Result<LicenseWithProof, LedgerError> {
        let asset = self.get_asset(license).await?;
        let proof = self.get_asset_proof(license).await?;
        LicenseWithProof::from_das(&asset, &proof)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn b58(byte: u8) -> String {
        bs58::encode([byte; 32]).into_string()
    }

    fn sample() -> (DasAsset, DasAssetProof, Pubkey, Pubkey) {
        let asset_id = Pubkey::new_unique();
        let tree = Pubkey::new_unique();
        let owner = Pubkey::new_unique();
        let asset: DasAsset = serde_json::from_value(json!({
            "id": asset_id.to_string(),
            "compression": {
                "eligible": false, "compressed": true,
                "data_hash": b58(1), "creator_hash": b58(2), "asset_hash": b58(3),
                "tree": tree.to_string(), "seq": 12, "leaf_id": 9
            },
            "ownership": { "owner": owner.to_string(), "delegate": null, "delegated": false }
        }))
        .unwrap();
        let proof: DasAssetProof = serde_json::from_value(json!({
            "root": b58(4),
            "proof": [Pubkey::new_unique().to_string(), Pubkey::new_unique().to_string()],
            "node_index": 16393,
            "leaf": b58(3),
            "tree_id": tree.to_string()
        }))
        .unwrap();
        (asset, proof, owner, tree)
    }

    #[test]
    fn v1_asset_defaults_optional_hashes() {
        let (asset, proof, owner, tree) = sample();
        let license = LicenseWithProof::from_das(&asset, &proof).unwrap();
        assert_eq!(license.index, 9);
        assert_eq!(license.tree, tree);
        assert_eq!(license.context.owner, owner);
        assert_eq!(license.context.delegate, owner);
        assert_eq!(license.context.nonce, 9);
        assert_eq!(license.context.root, [4u8; 32]);
        assert_eq!(license.context.collection_hash, [0u8; 32]);
        assert_eq!(license.context.flags, 0);
        assert_eq!(license.proof_path.len(), 2);
    }

    #[test]
    fn mismatched_tree_is_rejected() {
        let (asset, mut proof, _, _) = sample();
        proof.tree_id = Pubkey::new_unique().to_string();
        assert!(matches!(
            LicenseWithProof::from_das(&asset, &proof),
            Err(LedgerError::Das(_))
        ));
    }

    #[test]
    fn bad_hash_is_rejected() {
        let (mut asset, proof, _, _) = sample();
        asset.compression.data_hash = "short".into();
        assert!(LicenseWithProof::from_das(&asset, &proof).is_err());
    }
}
