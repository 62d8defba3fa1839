//! Detached-manifest signature validation.
//!
//! The twin delivers the update manifest as a string plus a compact JWS
//! whose payload carries the SHA-256 of that exact string. The JWS is
//! verified against a signing key from the root-key package, after the
//! revocation lists in the package have been consulted.

use crate::rootkey::RootKeyPackage;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("malformed manifest signature: {0}")]
    Malformed(String),
    #[error("signing key {0} is not in the trust package")]
    UnknownSigningKey(String),
    #[error("signing key {0} is disabled")]
    SigningKeyDisabled(String),
    #[error("manifest signature verification failed")]
    SignatureMismatch,
    #[error("manifest hash does not match signed claim")]
    HashMismatch,
}

pub type Result<T> = std::result::Result<T, SignatureError>;

/// Claims carried by the manifest JWS payload.
#[derive(Debug, Serialize, Deserialize)]
pub struct ManifestClaims {
    /// Base64 SHA-256 of the manifest string.
    pub sha256: String,
}

/// RS256 validation with every time/audience claim check disabled; the
/// payload is a bare hash claim, not an identity token.
pub fn rs256_validation() -> Validation {
    let mut validation = Validation::new(Algorithm::RS256);
    validation.validate_exp = false;
    validation.validate_nbf = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();
    validation
}

/// Base64 SHA-256 digest of a byte string, as the signing service
/// computes it.
pub fn base64_sha256(data: &[u8]) -> String {
    BASE64.encode(Sha256::digest(data))
}

/// Verify the detached JWS over a manifest string.
///
/// Checks, in order: signature header well-formedness, signing-key
/// presence in the package, revocation, the RS256 signature itself, and
/// the SHA-256 claim against the manifest bytes.
pub fn validate_manifest(
    manifest_json: &str,
    signature: &str,
    package: &RootKeyPackage,
) -> Result<()> {
    let header = jsonwebtoken::decode_header(signature)
        .map_err(|e| SignatureError::Malformed(e.to_string()))?;
    let kid = header
        .kid
        .ok_or_else(|| SignatureError::Malformed("missing kid".to_string()))?;

    let key = package
        .signing_key(&kid)
        .ok_or_else(|| SignatureError::UnknownSigningKey(kid.clone()))?;
    if package.is_disabled(&kid, key) {
        return Err(SignatureError::SigningKeyDisabled(kid));
    }

    let decoding_key = DecodingKey::from_rsa_components(&key.n, &key.e)
        .map_err(|e| SignatureError::Malformed(e.to_string()))?;
    let token = jsonwebtoken::decode::<ManifestClaims>(signature, &decoding_key, &rs256_validation())
        .map_err(|_| SignatureError::SignatureMismatch)?;

    if token.claims.sha256 != base64_sha256(manifest_json.as_bytes()) {
        return Err(SignatureError::HashMismatch);
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::test_support::{sign_manifest, signing_key};
    use super::*;
    use crate::rootkey::{DisabledKeys, RootKeyPackage, SigningKey};
    use std::collections::BTreeMap;

    const MANIFEST: &str =
        r#"{"manifestVersion":"4","updateId":{"provider":"contoso","name":"toaster","version":"1.0"}}"#;

    fn package_with(kid: &str, disabled: DisabledKeys) -> RootKeyPackage {
        let key = signing_key();
        let mut signing_keys = BTreeMap::new();
        signing_keys.insert(
            kid.to_string(),
            SigningKey {
                alg: "RS256".to_string(),
                n: key.n.clone(),
                e: key.e.clone(),
            },
        );
        RootKeyPackage::new(signing_keys, disabled)
    }

    #[test]
    fn valid_signature_round_trips() {
        let package = package_with("signing-1", DisabledKeys::default());
        let jws = sign_manifest(MANIFEST, "signing-1");
        assert_eq!(validate_manifest(MANIFEST, &jws, &package), Ok(()));
    }

    #[test]
    fn tampered_manifest_fails() {
        let package = package_with("signing-1", DisabledKeys::default());
        let jws = sign_manifest(MANIFEST, "signing-1");
        let tampered = MANIFEST.replace("1.0", "1.1");
        assert_eq!(
            validate_manifest(&tampered, &jws, &package),
            Err(SignatureError::HashMismatch)
        );
    }

    #[test]
    fn tampered_signature_fails() {
        let package = package_with("signing-1", DisabledKeys::default());
        let jws = sign_manifest(MANIFEST, "signing-1");
        // Flip one character inside the signature segment.
        let mut chars: Vec<char> = jws.chars().collect();
        let last = chars.len() - 1;
        chars[last] = if chars[last] == 'A' { 'B' } else { 'A' };
        let tampered: String = chars.into_iter().collect();
        assert_eq!(
            validate_manifest(MANIFEST, &tampered, &package),
            Err(SignatureError::SignatureMismatch)
        );
    }

    #[test]
    fn unknown_kid_is_rejected() {
        let package = package_with("other-kid", DisabledKeys::default());
        let jws = sign_manifest(MANIFEST, "signing-1");
        assert_eq!(
            validate_manifest(MANIFEST, &jws, &package),
            Err(SignatureError::UnknownSigningKey("signing-1".to_string()))
        );
    }

    #[test]
    fn disabled_kid_is_rejected() {
        let disabled = DisabledKeys {
            signing_keys: vec!["signing-1".to_string()],
            key_hashes: Vec::new(),
        };
        let package = package_with("signing-1", disabled);
        let jws = sign_manifest(MANIFEST, "signing-1");
        assert_eq!(
            validate_manifest(MANIFEST, &jws, &package),
            Err(SignatureError::SigningKeyDisabled("signing-1".to_string()))
        );
    }

    #[test]
    fn disabled_key_hash_is_rejected() {
        let key = signing_key();
        let disabled = DisabledKeys {
            signing_keys: Vec::new(),
            key_hashes: vec![crate::rootkey::key_hash(&key.n)],
        };
        let package = package_with("signing-1", disabled);
        let jws = sign_manifest(MANIFEST, "signing-1");
        assert_eq!(
            validate_manifest(MANIFEST, &jws, &package),
            Err(SignatureError::SigningKeyDisabled("signing-1".to_string()))
        );
    }

    #[test]
    fn garbage_signature_is_malformed() {
        let package = package_with("signing-1", DisabledKeys::default());
        assert!(matches!(
            validate_manifest(MANIFEST, "not-a-jws", &package),
            Err(SignatureError::Malformed(_))
        ));
    }
}
