//! OAuth 2.1 authorization core
//!
//! Dynamic client registration, PKCE-gated authorization codes, DPoP-bound
//! access tokens, rotating refresh-token families with replay detection,
//! introspection, and revocation.

pub mod dpop;
mod model;
pub mod pkce;
mod server;
pub mod store;

pub use dpop::{DpopProof, DpopVerifier};
pub use model::{
    join_scopes, parse_scopes, AccessToken, AuthorizationCode, AuthorizeRequest,
    AuthorizeResponse, ClientAuthMethod, ClientRegistration, GrantType, IntrospectionResponse,
    RefreshToken, RegisteredClient, ServerMetadata, TokenRequest, TokenResponse, TokenType,
};
pub use server::AuthorizationServer;
