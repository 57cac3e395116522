//! The delegation gateway: orchestration, downstream forwarding and the HTTP surface.

pub mod handler;
pub mod proxy;
pub mod server;

pub use server::{build_router, AppState};
