//! Refnet Backend Library
//!
//! Binary referral network engine: placement, referral-point propagation,
//! binary-match commissions and downline reporting over a SQLite store.
//! Transport, auth and payment gateways live outside this crate.

pub mod config;
pub mod engine;
pub mod errors;
pub mod events;
pub mod models;
pub mod store;
pub mod tree;

pub use config::{CashBackTiming, EngineConfig};
pub use engine::ReferralEngine;
pub use errors::{EngineError, EngineResult};
pub use events::{DomainEvent, EventBus};
pub use store::MemberStore;
pub use tree::{TreeNode, TreeQueryService};
