//! Signer resolution - signing capabilities for ledger addresses
//!
//! The core never persists raw signing secrets; it asks a [`SignerProvider`]
//! for a capability at submission time. The fallback from a user-held
//! credential to a service-operated one is an explicit, named policy
//! ([`FallbackSignerProvider`]) rather than an exception-driven branch.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use crate::{error::EscrowError, EscrowResult};

/// A signing capability for one ledger address.
#[async_trait]
pub trait Signer: Send + Sync {
    /// The address this signer signs for.
    fn address(&self) -> &str;

    /// Sign a transaction, returning the hex-encoded signed blob ready for
    /// submission.
    async fn sign(&self, tx: &Value) -> EscrowResult<String>;
}

/// Resolves a signing capability for an address.
#[async_trait]
pub trait SignerProvider: Send + Sync {
    /// # Errors
    ///
    /// Returns [`EscrowError::NoSignerAvailable`] when no credential exists
    /// for the address.
    async fn resolve_signer(&self, address: &str) -> EscrowResult<Arc<dyn Signer>>;
}

/// A fixed set of in-process signers, keyed by address.
#[derive(Default)]
pub struct StaticSignerProvider {
    signers: HashMap<String, Arc<dyn Signer>>,
}

impl StaticSignerProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a signer under its own address.
    pub fn with_signer(mut self, signer: Arc<dyn Signer>) -> Self {
        self.signers.insert(signer.address().to_string(), signer);
        self
    }
}

#[async_trait]
impl SignerProvider for StaticSignerProvider {
    async fn resolve_signer(&self, address: &str) -> EscrowResult<Arc<dyn Signer>> {
        self.signers
            .get(address)
            .cloned()
            .ok_or_else(|| EscrowError::NoSignerAvailable {
                address: address.to_string(),
            })
    }
}

/// Tries the primary provider (the user's stored credential) and falls back
/// to a service-operated provider only when the primary has no credential.
/// Any other primary failure propagates unchanged.
pub struct FallbackSignerProvider {
    primary: Arc<dyn SignerProvider>,
    service: Arc<dyn SignerProvider>,
}

impl FallbackSignerProvider {
    pub fn new(primary: Arc<dyn SignerProvider>, service: Arc<dyn SignerProvider>) -> Self {
        Self { primary, service }
    }
}

#[async_trait]
impl SignerProvider for FallbackSignerProvider {
    async fn resolve_signer(&self, address: &str) -> EscrowResult<Arc<dyn Signer>> {
        match self.primary.resolve_signer(address).await {
            Ok(signer) => Ok(signer),
            Err(EscrowError::NoSignerAvailable { .. }) => {
                warn!(%address, "no user credential, falling back to service signer");
                self.service.resolve_signer(address).await
            }
            Err(e) => Err(e),
        }
    }
}
