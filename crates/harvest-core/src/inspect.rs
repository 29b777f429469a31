//! Boundary to the credential inspector.
//!
//! Parsing the container format and fingerprinting its key material is done
//! by an external tool. The orchestrator only calls it once per recovered
//! target to enrich the stored result.

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Metadata about an unlocked credential container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialInfo {
    pub primary_alias: String,
    pub fingerprint_md5: String,
    pub fingerprint_sha1: String,
    /// Container kind reported by the inspector (e.g. "JKS", "PKCS12")
    pub container_kind: String,
}

#[derive(Debug, Error)]
pub enum InspectError {
    #[error("Inspector unavailable: {0}")]
    Unavailable(String),

    #[error("Inspection of {path} failed: {message}")]
    Failed { path: String, message: String },
}

/// Extracts metadata from a container once its secret is known.
#[async_trait]
pub trait CredentialInspector: Send + Sync {
    async fn inspect(&self, target_path: &Path, secret: &str)
        -> Result<CredentialInfo, InspectError>;
}
