//! Accord Broker - the coordination core
//!
//! Mediates authenticated, time-bounded, context-carrying intents between
//! autonomous participants. Inbound intents are verified, checked against
//! the declared trust relationship by the admission pipeline, recorded on a
//! tamper-evident event chain, and delivered to the subscribed responder;
//! responses travel the same path in reverse.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use accord_broker::{Broker, BrokerConfig, UniformTrustPolicy};
//! use accord_identity::KeyDirectory;
//! use accord_policy::{PolicyEntry, PolicyRegistry};
//! use accord_store::MemoryStore;
//! use accord_types::TrustLevel;
//!
//! let policies = PolicyRegistry::builder()
//!     .entry_from_floor("greet", PolicyEntry::baseline(TrustLevel::MIN))
//!     .build();
//! let broker = Broker::new(
//!     Arc::new(KeyDirectory::new()),
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(policies),
//!     Arc::new(UniformTrustPolicy::new(TrustLevel::new(1)?)),
//!     BrokerConfig::default(),
//! );
//! ```

mod admission;
mod api;
mod broker;
mod config;
mod lifecycle;

pub use api::{
    CloseSummary, EstablishProposal, EstablishReceipt, IntentReceipt, PairTrustPolicy,
    RespondReceipt, TrustPolicy, UniformTrustPolicy,
};
pub use broker::Broker;
pub use config::BrokerConfig;
