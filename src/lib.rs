#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::unused_async)]

//! actions-gateway library: the gateway, the client connector, and the pieces
//! they share.
//!
//! - `tunnel`: session registry, gateway routes, client connector
//! - `actions`: action catalog and executor
//! - `auth`: bearer-token signing and middleware
//! - `config`: gateway and client configuration
//! - `protocol`: JSON wire types
//! - `status`: connector status record
//! - `routes`: auxiliary HTTP handlers

pub mod actions;
pub mod auth;
pub mod config;
pub mod protocol;
pub mod routes;
pub mod status;
pub mod tunnel;

// Re-export key types at crate root for convenience.
pub use auth::{ClientId, TokenSigner};
pub use config::{ClientConfig, Config};
pub use tunnel::client::{Connector, HttpTransport};
pub use tunnel::gateway::{gateway_router, GatewayState};
pub use tunnel::router::SessionRouter;
