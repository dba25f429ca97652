//! Signed JSON envelope `{signature, publicKey, scheme, payload}`.
//!
//! The signed message is the canonical JSON of `payload`: object keys sorted
//! recursively, no whitespace, integral numbers written without a fraction.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

use crate::error::ProtocolError;

pub const SCHEME_ED25519: &str = "ed25519";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedPayload<T> {
    /// Base58 ed25519 signature over `canonical_json(payload)`.
    pub signature: String,
    /// Base58 public key of the signer.
    pub public_key: String,
    pub scheme: String,
    pub payload: T,
}

impl<T: Serialize> SignedPayload<T> {
    pub fn sign(payload: T, key: &SigningKey) -> Result<Self, ProtocolError> {
        let message = canonical_json(&payload)?;
        let signature = key.sign(message.as_bytes());
        Ok(Self {
            signature: bs58::encode(signature.to_bytes()).into_string(),
            public_key: bs58::encode(key.verifying_key().to_bytes()).into_string(),
            scheme: SCHEME_ED25519.to_string(),
            payload,
        })
    }

    /// Check the signature against `public_key`.
    pub fn verify(&self) -> Result<(), ProtocolError> {
        if self.scheme != SCHEME_ED25519 {
            return Err(ProtocolError::UnsupportedScheme(self.scheme.clone()));
        }
        let key = VerifyingKey::from_bytes(&self.signer()?)
            .map_err(|_| ProtocolError::InvalidSignature)?;
        let sig_bytes: [u8; 64] = bs58::decode(&self.signature)
            .into_vec()
            .ok()
            .and_then(|v| v.try_into().ok())
            .ok_or(ProtocolError::InvalidSignature)?;
        let message = canonical_json(&self.payload)?;
        key.verify(message.as_bytes(), &Signature::from_bytes(&sig_bytes))
            .map_err(|_| ProtocolError::InvalidSignature)
    }

    /// Raw signer public key.
    pub fn signer(&self) -> Result<[u8; 32], ProtocolError> {
        decode_address(&self.public_key).map_err(|_| ProtocolError::InvalidSignature)
    }
}

/// Decode a base58 32-byte address.
pub fn decode_address(address: &str) -> Result<[u8; 32], ProtocolError> {
    bs58::decode(address)
        .into_vec()
        .ok()
        .and_then(|v| v.try_into().ok())
        .ok_or_else(|| ProtocolError::InvalidAddress(address.to_string()))
}

pub fn is_valid_address(address: &str) -> bool {
    decode_address(address).is_ok()
}

/// Canonical JSON text of `value`.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String, ProtocolError> {
    let value =
        serde_json::to_value(value).map_err(|e| ProtocolError::Serialization(e.to_string()))?;
    serde_json::to_string(&canonicalize(value))
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, canonicalize(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        Value::Number(n) => Value::Number(integral(n)),
        other => other,
    }
}

fn integral(n: Number) -> Number {
    match n.as_f64() {
        Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < 9.0e15 => Number::from(f as i64),
        _ => n,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;
    use serde_json::json;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Probe {
        zeta: u32,
        alpha: String,
        latency: f64,
    }

    fn probe() -> Probe {
        Probe { zeta: 1, alpha: "x".into(), latency: 12.0 }
    }

    #[test]
    fn sign_and_verify() {
        let key = SigningKey::generate(&mut OsRng);
        let signed = SignedPayload::sign(probe(), &key).unwrap();
        assert_eq!(signed.scheme, "ed25519");
        assert!(signed.verify().is_ok());
        assert_eq!(signed.signer().unwrap(), key.verifying_key().to_bytes());
    }

    #[test]
    fn tampered_payload_fails() {
        let key = SigningKey::generate(&mut OsRng);
        let mut signed = SignedPayload::sign(probe(), &key).unwrap();
        signed.payload.zeta = 2;
        assert!(matches!(signed.verify(), Err(ProtocolError::InvalidSignature)));
    }

    #[test]
    fn foreign_public_key_fails() {
        let key = SigningKey::generate(&mut OsRng);
        let other = SigningKey::generate(&mut OsRng);
        let mut signed = SignedPayload::sign(probe(), &key).unwrap();
        signed.public_key = bs58::encode(other.verifying_key().to_bytes()).into_string();
        assert!(matches!(signed.verify(), Err(ProtocolError::InvalidSignature)));
    }

    #[test]
    fn garbage_signature_fails() {
        let key = SigningKey::generate(&mut OsRng);
        let mut signed = SignedPayload::sign(probe(), &key).unwrap();
        signed.signature = "not-base58!".into();
        assert!(matches!(signed.verify(), Err(ProtocolError::InvalidSignature)));
    }

    #[test]
    fn unknown_scheme_is_rejected() {
        let key = SigningKey::generate(&mut OsRng);
        let mut signed = SignedPayload::sign(probe(), &key).unwrap();
        signed.scheme = "secp256k1".into();
        assert!(matches!(signed.verify(), Err(ProtocolError::UnsupportedScheme(_))));
    }

    #[test]
    fn survives_json_round_trip() {
        let key = SigningKey::generate(&mut OsRng);
        let signed = SignedPayload::sign(probe(), &key).unwrap();
        let wire = serde_json::to_string(&signed).unwrap();
        assert!(wire.contains("\"publicKey\""));
        let back: SignedPayload<Probe> = serde_json::from_str(&wire).unwrap();
        assert!(back.verify().is_ok());
    }

    #[test]
    fn canonical_json_sorts_nested_keys() {
        let v = json!({"b": {"z": 1, "a": [ {"y": 2.0, "x": 1.5} ]}, "a": true});
        assert_eq!(
            canonical_json(&v).unwrap(),
            r#"{"a":true,"b":{"a":[{"x":1.5,"y":2}],"z":1}}"#
        );
    }
}
