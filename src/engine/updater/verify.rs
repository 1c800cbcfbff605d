//! Cryptographic Verification
//!
//! SHA256 checksums for bundle artifacts and ED25519 signatures over package metadata.

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use super::descriptor::{BundleDescriptor, PackageMetadata};
use crate::engine::error::{Result, UpdateError};

/// Verifier for downloaded bundles and their metadata
#[derive(Debug, Clone, Default)]
pub struct BundleVerifier {
    /// When unset, metadata signatures are not checked
    public_key: Option<VerifyingKey>,
}

impl BundleVerifier {
    pub fn new() -> Self {
        Self { public_key: None }
    }

    pub fn with_public_key(key_bytes: &[u8; 32]) -> Result<Self> {
        let public_key = VerifyingKey::from_bytes(key_bytes)
            .map_err(|e| UpdateError::InvalidMetadata(format!("invalid public key: {}", e)))?;
        Ok(Self {
            public_key: Some(public_key),
        })
    }

    /// Parse a hex-encoded 32 byte ed25519 public key
    pub fn with_public_key_hex(key_hex: &str) -> Result<Self> {
        let bytes = hex::decode(key_hex.trim())
            .map_err(|e| UpdateError::InvalidMetadata(format!("invalid public key: {}", e)))?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| UpdateError::InvalidMetadata("public key must be 32 bytes".to_string()))?;
        Self::with_public_key(&key)
    }

    pub fn requires_signature(&self) -> bool {
        self.public_key.is_some()
    }

    pub fn sha256_bytes(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    /// Calculate SHA256 checksum of a file
    pub fn calculate_sha256(path: &Path) -> Result<String> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        let mut hasher = Sha256::new();

        let mut buffer = [0u8; 8192];
        loop {
            let bytes_read = reader.read(&mut buffer)?;
            if bytes_read == 0 {
                break;
            }
            hasher.update(&buffer[..bytes_read]);
        }

        Ok(hex::encode(hasher.finalize()))
    }

    /// Check downloaded bytes against the descriptor's checksum and size
    pub fn verify_bytes(descriptor: &BundleDescriptor, bytes: &[u8]) -> Result<()> {
        if let Some(size) = descriptor.size {
            if size != bytes.len() as u64 {
                return Err(UpdateError::ChecksumMismatch {
                    version: descriptor.version_id.to_string(),
                    expected: format!("{} bytes", size),
                    actual: format!("{} bytes", bytes.len()),
                });
            }
        }
        Self::compare(descriptor, Self::sha256_bytes(bytes))
    }

    /// Check a file on disk against the descriptor's checksum
    pub fn verify_file(descriptor: &BundleDescriptor, path: &Path) -> Result<()> {
        Self::compare(descriptor, Self::calculate_sha256(path)?)
    }

    fn compare(descriptor: &BundleDescriptor, actual: String) -> Result<()> {
        if !actual.eq_ignore_ascii_case(&descriptor.checksum) {
            return Err(UpdateError::ChecksumMismatch {
                version: descriptor.version_id.to_string(),
                expected: descriptor.checksum.clone(),
                actual,
            });
        }
        Ok(())
    }

    /// The signed message: the metadata serialized with an empty signature
    pub fn signing_payload(metadata: &PackageMetadata) -> Result<Vec<u8>> {
        let mut unsigned = metadata.clone();
        unsigned.signature = None;
        Ok(serde_json::to_vec(&unsigned)?)
    }

    pub fn verify_metadata_signature(&self, metadata: &PackageMetadata) -> Result<()> {
        let Some(public_key) = &self.public_key else {
            return Ok(());
        };

        let sig_hex = metadata
            .signature
            .as_deref()
            .ok_or(UpdateError::InvalidSignature)?;
        let sig_bytes = hex::decode(sig_hex).map_err(|_| UpdateError::InvalidSignature)?;
        let sig_array: [u8; 64] = sig_bytes
            .try_into()
            .map_err(|_| UpdateError::InvalidSignature)?;
        let signature = Signature::from_bytes(&sig_array);

        let message = Self::signing_payload(metadata)?;
        public_key
            .verify(&message, &signature)
            .map_err(|_| UpdateError::InvalidSignature)
    }
}
