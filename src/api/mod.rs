pub mod client;
pub mod models;

pub use client::{Credentials, GatewayClient, Upstream, UpstreamReply};
