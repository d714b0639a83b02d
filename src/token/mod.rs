//! Session tokens, refresh tokens and service-account PATs

pub mod issuer;
pub mod service_account;

pub use issuer::{AuthToken, Claims, TokenData, TokenIssuer, TokenKind};
pub use service_account::{GrantType, ServiceAccount, ServiceAccountAuthenticator};
