//! Core data models for the backup service.
//!
//! File records map to the `files` table via `sqlx::FromRow` and serialize
//! as JSON via `serde`; sessions and upload progress are in-memory only.

pub mod file_record;
pub mod session;
pub mod upload;
