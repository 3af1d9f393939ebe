//! Core services: identity, the session gate, both stores, and the
//! transaction managers that keep the stores consistent.

pub mod delete_manager;
pub mod identity;
pub mod ledger;
pub mod object_store;
pub mod progress;
pub mod reconcile;
pub mod session_gate;
pub mod upload_manager;
