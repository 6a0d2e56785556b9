//! Courier monitoring HTTP API.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod handlers;
pub mod server;

pub use server::{create_router, start_server, AppState};
