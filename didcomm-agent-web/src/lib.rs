//! HTTP transport for the `DIDComm` agent.
//!
//! This crate exposes an [`Agent`](didcomm_agent_node::Agent) over HTTP:
//! - `POST <path>` receives packed `DIDComm` messages
//! - `GET /invitations/{id}` serves invitations by their short URL
//! - `GET /status` reports the agent's label and endpoints
//!
//! It also wires CORS and request tracing middleware.

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod handlers;
pub mod server;


// Re-export main types for convenience
pub use error::{Error, Result};
pub use handlers::*;
pub use server::{AgentServer, CorsConfig, ServerConfig};
