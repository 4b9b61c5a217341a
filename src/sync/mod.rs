//! Pending-edit reconciliation, entity unification and payment convergence.

mod engine;
mod poller;
pub mod reconcile;
mod sequence;
pub mod unify;

pub use engine::SyncEngine;
pub use poller::ConvergenceOutcome;
