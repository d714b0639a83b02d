//! Upstream OAuth providers: provider capabilities, the HTTP client and the
//! tokens it obtains.

pub mod client;
pub mod provider;
pub mod token;

pub use client::UpstreamClient;
pub use provider::{Provider, ProviderKind, ProviderRegistry};
pub use token::OAuthToken;
