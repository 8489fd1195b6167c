//! Reverse tunnel between the gateway and its clients.
//!
//! Two sides:
//!
//! - **Gateway** ([`gateway`], [`router`], [`session`]): admits one session per
//!   client, accepts the client's tunnel, and forwards `POST /actions/{name}`
//!   calls over it, waiting for the result to come back on `/api/notify`.
//! - **Client** ([`client`]): dials out to the gateway, keeps the tunnel alive
//!   with reconnect backoff, and runs local actions on request.

pub mod client;
pub mod gateway;
pub mod router;
pub mod session;
