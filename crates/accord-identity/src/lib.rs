//! Accord Identity - signature verification seam
//!
//! The only component that talks to the opaque identity subsystem. Given a
//! canonical message and a declared sender, it answers `valid` or one of four
//! specific failure kinds. Every other component receives already-verified
//! messages and may treat the sender as authoritative.

use accord_crypto::PublicKeyInfo;
use accord_types::{HumanId, ParticipantId};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use thiserror::Error;

/// The specific ways identity verification can fail.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthFailure {
    #[error("unknown sender {0}")]
    UnknownSender(ParticipantId),

    #[error("bad signature from {0}")]
    BadSignature(ParticipantId),

    #[error("human binding mismatch for {0}")]
    BindingMismatch(ParticipantId),

    #[error("expired key for {0}")]
    ExpiredKey(ParticipantId),
}

/// Verifies device/human signatures on inbound messages.
///
/// Implementations may be remote; callers treat every verification as a
/// suspension point.
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    /// Verify `signature` over the canonical `message` bytes for the declared
    /// sender, including the optional human binding.
    async fn verify(
        &self,
        message: &[u8],
        sender: &ParticipantId,
        human: Option<&HumanId>,
        signature: &str,
    ) -> Result<(), AuthFailure>;
}

/// One registered participant: key material plus the optional human binding.
#[derive(Debug, Clone)]
struct Registration {
    key: PublicKeyInfo,
    bound_human: Option<HumanId>,
}

/// An in-process key directory.
///
/// Serves as the identity subsystem for embedded brokers and tests;
/// production deployments substitute a remote verifier behind the same trait.
#[derive(Default)]
pub struct KeyDirectory {
    registrations: RwLock<HashMap<ParticipantId, Registration>>,
}

impl KeyDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a participant's public key.
    pub fn register(&self, sender: ParticipantId, key: PublicKeyInfo) {
        self.registrations.write().insert(
            sender,
            Registration {
                key,
                bound_human: None,
            },
        );
    }

    /// Register a participant's public key with a human binding.
    pub fn register_bound(&self, sender: ParticipantId, key: PublicKeyInfo, human: HumanId) {
        self.registrations.write().insert(
            sender,
            Registration {
                key,
                bound_human: Some(human),
            },
        );
    }

    /// Replace a participant's key, keeping any binding.
    pub fn rotate(&self, sender: &ParticipantId, key: PublicKeyInfo) -> bool {
        let mut registrations = self.registrations.write();
        match registrations.get_mut(sender) {
            Some(registration) => {
                registration.key = key;
                true
            }
            None => false,
        }
    }

    /// Remove a participant entirely.
    pub fn remove(&self, sender: &ParticipantId) -> bool {
        self.registrations.write().remove(sender).is_some()
    }
}

#[async_trait]
impl IdentityVerifier for KeyDirectory {
    async fn verify(
        &self,
        message: &[u8],
        sender: &ParticipantId,
        human: Option<&HumanId>,
        signature: &str,
    ) -> Result<(), AuthFailure> {
        let registration = {
            let registrations = self.registrations.read();
            registrations
                .get(sender)
                .cloned()
                .ok_or_else(|| AuthFailure::UnknownSender(sender.clone()))?
        };

        if registration.key.is_expired() {
            return Err(AuthFailure::ExpiredKey(sender.clone()));
        }

        if let Some(declared) = human {
            if registration.bound_human.as_ref() != Some(declared) {
                return Err(AuthFailure::BindingMismatch(sender.clone()));
            }
        }

        registration
            .key
            .verify(message, signature)
            .map_err(|_| AuthFailure::BadSignature(sender.clone()))
    }
}

/// A verifier that accepts everything. Test-only convenience for exercising
/// the pipeline without key management.
#[derive(Debug, Default, Clone)]
pub struct AcceptAll;

#[async_trait]
impl IdentityVerifier for AcceptAll {
    async fn verify(
        &self,
        _message: &[u8],
        _sender: &ParticipantId,
        _human: Option<&HumanId>,
        _signature: &str,
    ) -> Result<(), AuthFailure> {
        Ok(())
    }
}
