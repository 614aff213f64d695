//! Payload trust verification.
//!
//! # Security
//!
//! No payload reaches the installer unless one of these holds:
//! - its detached signature verifies against a pinned public key, or
//! - the operator explicitly opted in to unsigned updates
//!   ([`UnsignedPolicy::Permit`]).
//!
//! The signature is checked over the exact downloaded bytes. A declared
//! SHA-256 is checked in constant time whether or not a signature is present.

use std::path::Path;

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::error::VerificationError;
use crate::feed::{DownloadVariant, SignatureAlgorithm, SignatureBlock};

/// Whether variants without a signature may be installed.
///
/// `Reject` is the default. `Permit` must be chosen explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnsignedPolicy {
    /// Refuse payloads that carry no signature
    #[default]
    Reject,
    /// Accept payloads that carry no signature
    Permit,
}

/// Verifies downloaded payloads against pinned public keys.
///
/// Several keys may be trusted at once to allow key rotation; a signature is
/// accepted if any of them verifies it.
#[derive(Debug, Clone)]
pub struct TrustVerifier {
    trusted_keys: Vec<VerifyingKey>,
    unsigned_policy: UnsignedPolicy,
}

impl TrustVerifier {
    /// Create a verifier that rejects unsigned payloads.
    pub fn new(trusted_keys: Vec<VerifyingKey>) -> Self {
        Self {
            trusted_keys,
            unsigned_policy: UnsignedPolicy::Reject,
        }
    }

    /// Set the unsigned-payload policy.
    pub fn with_unsigned_policy(mut self, policy: UnsignedPolicy) -> Self {
        if policy == UnsignedPolicy::Permit {
            tracing::warn!("Unsigned updates are permitted by operator override");
        }
        self.unsigned_policy = policy;
        self
    }

    /// Get the trusted keys.
    pub fn trusted_keys(&self) -> &[VerifyingKey] {
        &self.trusted_keys
    }

    /// Get the unsigned-payload policy.
    pub fn unsigned_policy(&self) -> UnsignedPolicy {
        self.unsigned_policy
    }

    /// Verify a signature over `payload`.
    ///
    /// # Errors
    ///
    /// - [`VerificationError::MissingSignature`] if `signature` is `None` and
    ///   unsigned payloads are not permitted
    /// - [`VerificationError::UnsupportedAlgorithm`] for an unknown tag
    /// - [`VerificationError::MalformedSignature`] for undecodable bytes
    /// - [`VerificationError::NoTrustedKeys`] if no key is pinned
    /// - [`VerificationError::InvalidSignature`] if no trusted key verifies it
    pub fn verify(
        &self,
        payload: &[u8],
        signature: Option<&SignatureBlock>,
    ) -> Result<(), VerificationError> {
        let Some(block) = signature else {
            return match self.unsigned_policy {
                UnsignedPolicy::Permit => {
                    tracing::warn!("Accepting unsigned payload under operator override");
                    Ok(())
                }
                UnsignedPolicy::Reject => {
                    tracing::error!("Payload is unsigned");
                    Err(VerificationError::MissingSignature)
                }
            };
        };

        let algorithm = SignatureAlgorithm::from_tag(&block.algorithm).ok_or_else(|| {
            tracing::error!(algorithm = %block.algorithm, "Unsupported signature algorithm");
            VerificationError::UnsupportedAlgorithm(block.algorithm.clone())
        })?;

        match algorithm {
            SignatureAlgorithm::Ed25519 => self.verify_ed25519(payload, &block.bytes),
        }
    }

    fn verify_ed25519(&self, payload: &[u8], bytes: &[u8]) -> Result<(), VerificationError> {
        let bytes: [u8; 64] = bytes.try_into().map_err(|_| {
            VerificationError::MalformedSignature(format!(
                "Ed25519 signature must be 64 bytes, got {}",
                bytes.len()
            ))
        })?;
        let signature = Signature::from_bytes(&bytes);

        if self.trusted_keys.is_empty() {
            tracing::error!("No trusted keys configured; cannot verify payload");
            return Err(VerificationError::NoTrustedKeys);
        }

        for (index, key) in self.trusted_keys.iter().enumerate() {
            if key.verify(payload, &signature).is_ok() {
                tracing::debug!(key_index = index, "Payload signature verified");
                return Ok(());
            }
        }

        tracing::error!(
            keys = self.trusted_keys.len(),
            "Payload signature did not verify against any trusted key"
        );
        Err(VerificationError::InvalidSignature)
    }

    /// Verify a payload held in memory against a variant's declarations.
    ///
    /// Checks the signature (or unsigned policy), then the declared SHA-256
    /// if any. Returns the payload's SHA-256.
    pub fn verify_variant(
        &self,
        payload: &[u8],
        variant: &DownloadVariant,
    ) -> Result<[u8; 32], VerificationError> {
        self.verify(payload, variant.signature.as_ref())?;

        let actual: [u8; 32] = Sha256::digest(payload).into();
        if let Some(expected) = &variant.sha256 {
            if actual[..].ct_eq(&expected[..]).unwrap_u8() != 1 {
                tracing::error!(
                    expected = %hex::encode(expected),
                    actual = %hex::encode(actual),
                    "Payload hash mismatch"
                );
                return Err(VerificationError::HashMismatch {
                    expected: hex::encode(expected),
                    actual: hex::encode(actual),
                });
            }
        }

        tracing::debug!(hash = %hex::encode(actual), "Payload verified");
        Ok(actual)
    }

    /// Verify a payload file against a variant's declarations.
    ///
    /// The file is read in full; Ed25519 signs the whole message.
    pub async fn verify_file(
        &self,
        path: &Path,
        variant: &DownloadVariant,
    ) -> Result<[u8; 32], VerificationError> {
        let payload = tokio::fs::read(path).await?;
        let hash = self.verify_variant(&payload, variant)?;
        tracing::info!(path = %path.display(), "Payload verification complete");
        Ok(hash)
    }
}
