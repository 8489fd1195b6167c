//! Auxiliary HTTP handlers.
//!
//! The session and action endpoints live in [`crate::tunnel::gateway`]; what
//! is here does not touch sessions. [`health`] is public, [`token`] is only
//! mounted when token issuance is exposed.

pub mod health;
pub mod token;
