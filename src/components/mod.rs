//! Middleware components
//!
//! The routing pipeline, leaves first: value comparison and rule matching,
//! session identity, weighted backend selection, orchestration, and the
//! proxy boundary.

pub mod forwarder;
pub mod matcher;
pub mod router;
pub mod selector;
pub mod session;

pub use forwarder::{Forwarder, ProxyBody};
pub use matcher::{RequestView, RuleEngine};
pub use router::{RouteDecision, Router};
pub use selector::Selection;
