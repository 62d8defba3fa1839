//! Rotating root-key trust store.
//!
//! Manifest signing keys are not baked into the agent; they arrive in a
//! root-key package, a JSON document signed by long-lived trust anchors.
//! The package also ships the revocation lists consulted before any
//! signing key is used. Once loaded the package is read-only.

use crate::jws::rs256_validation;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use jsonwebtoken::DecodingKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RootKeyError {
    #[error("root-key package is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("failed to read root-key package: {0}")]
    Io(#[from] std::io::Error),
    #[error("root-key package has no signature from a trusted anchor")]
    NoTrustedSignature,
    #[error("trust store is empty")]
    EmptyTrustStore,
}

pub type Result<T> = std::result::Result<T, RootKeyError>;

/// An RSA public key as shipped in trust documents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SigningKey {
    #[serde(default = "default_alg")]
    pub alg: String,
    /// Base64url modulus.
    pub n: String,
    /// Base64url exponent.
    pub e: String,
}

fn default_alg() -> String {
    "RS256".to_string()
}

/// Revocation lists shipped inside the package.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisabledKeys {
    /// Revoked signing-key ids.
    #[serde(default)]
    pub signing_keys: Vec<String>,
    /// Revoked key hashes, for keys re-published under a new id.
    #[serde(default)]
    pub key_hashes: Vec<String>,
}

/// The signed body of a root-key package.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtectedProperties {
    pub version: u64,
    #[serde(default)]
    pub published: i64,
    #[serde(default)]
    pub signing_keys: BTreeMap<String, SigningKey>,
    #[serde(default)]
    pub disabled: DisabledKeys,
}

/// On-disk/downloaded form: the protected properties carried as the
/// payload of one or more compact JWS strings, one per anchor that
/// signed this package revision.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SignedPackage {
    signatures: Vec<String>,
}

/// A verified root-key package.
#[derive(Debug, Clone)]
pub struct RootKeyPackage {
    protected: ProtectedProperties,
}

impl RootKeyPackage {
    /// Build a package directly from its parts. Intended for tooling and
    /// tests; production loading goes through [`RootKeyPackage::verify`].
    pub fn new(signing_keys: BTreeMap<String, SigningKey>, disabled: DisabledKeys) -> Self {
        Self {
            protected: ProtectedProperties {
                version: 1,
                published: 0,
                signing_keys,
                disabled,
            },
        }
    }

    /// Parse and verify a signed package against the trust anchors.
    /// The first signature made by a known anchor that verifies wins.
    pub fn verify(json: &str, trust: &TrustStore) -> Result<Self> {
        if trust.anchors.is_empty() {
            return Err(RootKeyError::EmptyTrustStore);
        }
        let signed: SignedPackage =
            serde_json::from_str(json).map_err(|e| RootKeyError::InvalidJson(e.to_string()))?;

        for jws in &signed.signatures {
            let Ok(header) = jsonwebtoken::decode_header(jws) else {
                continue;
            };
            let Some(kid) = header.kid else { continue };
            let Some(anchor) = trust.anchors.get(&kid) else {
                continue;
            };
            let Ok(decoding_key) = DecodingKey::from_rsa_components(&anchor.n, &anchor.e) else {
                continue;
            };
            if let Ok(token) =
                jsonwebtoken::decode::<ProtectedProperties>(jws, &decoding_key, &rs256_validation())
            {
                return Ok(Self {
                    protected: token.claims,
                });
            }
        }
        Err(RootKeyError::NoTrustedSignature)
    }

    /// Load and verify a package file.
    pub fn load(path: &Path, trust: &TrustStore) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::verify(&json, trust)
    }

    pub fn version(&self) -> u64 {
        self.protected.version
    }

    pub fn signing_key(&self, kid: &str) -> Option<&SigningKey> {
        self.protected.signing_keys.get(kid)
    }

    /// A key is disabled when its id or its modulus hash is revoked.
    pub fn is_disabled(&self, kid: &str, key: &SigningKey) -> bool {
        if self
            .protected
            .disabled
            .signing_keys
            .iter()
            .any(|k| k == kid)
        {
            return true;
        }
        let hash = key_hash(&key.n);
        self.protected.disabled.key_hashes.iter().any(|h| *h == hash)
    }
}

/// Hash identifying a key independent of its id: base64url SHA-256 of
/// the raw modulus bytes.
pub fn key_hash(n_b64url: &str) -> String {
    let bytes = URL_SAFE_NO_PAD
        .decode(n_b64url)
        .unwrap_or_else(|_| n_b64url.as_bytes().to_vec());
    URL_SAFE_NO_PAD.encode(Sha256::digest(bytes))
}

/// The anchors the agent is provisioned with. Loaded once at startup and
/// never mutated afterwards.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrustStore {
    #[serde(default)]
    pub anchors: BTreeMap<String, SigningKey>,
}

impl TrustStore {
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        serde_json::from_str(&json).map_err(|e| RootKeyError::InvalidJson(e.to_string()))
    }
}
