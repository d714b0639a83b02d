//! HTTP surface of the token broker

pub mod auth;
pub mod handlers;
mod router;
mod server;

pub use auth::{Caller, auth_middleware};
pub use router::{AppState, IdentityProvider, create_router};
pub use server::{Gateway, build_state, run_maintenance};
