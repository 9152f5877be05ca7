//! Peer RPC for the Stagehand staging controller
//!
//! Two directions share one wire format (JSON over HTTP POST, one path per
//! method, authenticated by a shared secret header):
//!
//! - Outbound to the peer service: reporting finished runs and asking which
//!   images are missing from its registry ([`PeerClient`]).
//! - Inbound to this controller: health and configuration pushes
//!   ([`server::router`]).

#![deny(missing_docs)]

pub mod auth;
pub mod client;
pub mod error;
pub mod server;
pub mod types;

pub use client::{HttpPeerClient, PeerClient};
pub use error::{Error, Result};
pub use server::{router, serve, QueueStatusProvider, ServerState};

/// Header carrying the shared secret on every RPC call
pub const AUTH_HEADER: &str = "x-stagehand-auth";

/// Path prefix of the peer service's methods
pub const PEER_RPC_PREFIX: &str = "/twirp/stagehand.rpc.RPC";

/// Path prefix of this controller's methods
pub const STAGING_RPC_PREFIX: &str = "/twirp/stagehand.staging.RPC";
