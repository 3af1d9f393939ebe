//! Per-user cloud file backup.
//!
//! Payloads live in an [`services::object_store::ObjectStore`], their
//! metadata in a [`services::ledger::FileLedger`]. The upload and delete
//! transaction managers keep the two consistent, and every operation is
//! gated on a live session from [`services::session_gate::SessionGate`].

pub mod config;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;
