//! Control panel backend for a messaging gateway: a credential-holding proxy
//! and the controller that pairs instances through it.

pub mod api;
pub mod app;
pub mod controller;
pub mod error;
pub mod proxy;
pub mod server;
pub mod session;
pub mod utils;
