//! Artifact fingerprints

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use vision_core::{BatchProfile, Precision};

/// Bumped whenever the compiled plan layout changes
pub const PLAN_FORMAT_VERSION: u32 = 1;

/// Identity of one artifact configuration, hex SHA-256
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Hash precision, batch bounds, weights identity and input geometry
    pub fn compute(precision: Precision, profile: BatchProfile, weights_checksum: &str, input_size: u32) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"visiond-plan");
        hasher.update(PLAN_FORMAT_VERSION.to_le_bytes());
        hasher.update(precision.to_string().as_bytes());
        hasher.update(profile.min.to_le_bytes());
        hasher.update(profile.opt.to_le_bytes());
        hasher.update(profile.max.to_le_bytes());
        hasher.update(input_size.to_le_bytes());
        hasher.update(weights_checksum.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 16 hex characters, used in file names
    pub fn short(&self) -> &str {
        &self.0[..16.min(self.0.len())]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Fingerprint {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}
