//! Verification requests and the identifiers that key them.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::domain::error::ValidationError;

/// SHA-256 content hash of a submitted document image (lowercase hex).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Hash raw image bytes.
    pub fn of_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(hex::encode(hasher.finalize()))
    }

    /// Accept a precomputed hex digest.
    pub fn from_hex(hex_digest: &str) -> Result<Self, ValidationError> {
        let valid = hex_digest.len() == 64
            && hex_digest
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));
        if !valid {
            return Err(ValidationError::InvalidFingerprint(hex_digest.to_string()));
        }
        Ok(Self(hex_digest.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex chars, for log lines.
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_hex(&value)
    }
}

impl From<Fingerprint> for String {
    fn from(value: Fingerprint) -> Self {
        value.0
    }
}

/// Opaque identifier handed back to the submitter of a verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VerificationId(Uuid);

impl VerificationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for VerificationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for VerificationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vrf-{}", self.0)
    }
}

impl FromStr for VerificationId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.strip_prefix("vrf-").unwrap_or(s);
        Uuid::parse_str(raw)
            .map(Self)
            .map_err(|_| ValidationError::InvalidVerificationId(s.to_string()))
    }
}

/// Optional information about who submitted the document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequesterContext {
    /// Network origin (IP address or other network identifier).
    pub origin: Option<String>,
    /// Account that submitted the request.
    pub account_id: Option<String>,
}

impl RequesterContext {
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn with_account(mut self, account_id: impl Into<String>) -> Self {
        self.account_id = Some(account_id.into());
        self
    }
}

/// Where the raw image lives.
#[derive(Clone)]
pub enum ImageRef {
    /// Bytes supplied with the request.
    Inline(Arc<[u8]>),
    /// An external location resolved by an [`crate::services::ImageSource`].
    Location(String),
}

impl fmt::Debug for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageRef::Inline(bytes) => write!(f, "Inline({} bytes)", bytes.len()),
            ImageRef::Location(location) => write!(f, "Location({location})"),
        }
    }
}

/// Idempotency key: the fingerprint, optionally scoped to one requester.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FingerprintKey {
    pub fingerprint: Fingerprint,
    pub scope: Option<String>,
}

impl fmt::Display for FingerprintKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scope {
            Some(scope) => write!(f, "{}@{}", self.fingerprint.short(), scope),
            None => f.write_str(self.fingerprint.short()),
        }
    }
}

/// A document submitted for verification. Immutable once built.
#[derive(Debug, Clone)]
pub struct VerificationRequest {
    fingerprint: Fingerprint,
    image: ImageRef,
    context: RequesterContext,
    created_at: DateTime<Utc>,
}

impl VerificationRequest {
    /// Build a request from inline bytes, hashing them for the fingerprint.
    pub fn from_bytes(bytes: impl Into<Arc<[u8]>>, context: RequesterContext) -> Self {
        let bytes: Arc<[u8]> = bytes.into();
        Self {
            fingerprint: Fingerprint::of_bytes(&bytes),
            image: ImageRef::Inline(bytes),
            context,
            created_at: Utc::now(),
        }
    }

    /// Build a request for an image stored elsewhere whose hash is already known.
    ///
    /// The engine re-hashes the loaded bytes and rejects a mismatch.
    pub fn from_location(
        fingerprint: Fingerprint,
        location: impl Into<String>,
        context: RequesterContext,
    ) -> Self {
        Self {
            fingerprint,
            image: ImageRef::Location(location.into()),
            context,
            created_at: Utc::now(),
        }
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub fn image(&self) -> &ImageRef {
        &self.image
    }

    pub fn context(&self) -> &RequesterContext {
        &self.context
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Idempotency key. With `isolate_by_requester` the account id scopes it.
    pub fn key(&self, isolate_by_requester: bool) -> FingerprintKey {
        FingerprintKey {
            fingerprint: self.fingerprint.clone(),
            scope: if isolate_by_requester {
                self.context.account_id.clone()
            } else {
                None
            },
        }
    }
}
