//! Core data models for the upload broker.
//!
//! Sessions map to database rows via `sqlx::FromRow` and serialize as JSON
//! via `serde`. Capability descriptors are what clients receive in place of
//! file bytes.

pub mod capability;
pub mod session;
