//! OAuth entities and wire shapes

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Grant types the server issues tokens for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantType {
    /// Authorization-code grant (PKCE-gated)
    AuthorizationCode,
    /// Refresh-token grant (rotating)
    RefreshToken,
}

impl std::fmt::Display for GrantType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AuthorizationCode => write!(f, "authorization_code"),
            Self::RefreshToken => write!(f, "refresh_token"),
        }
    }
}

/// How a client authenticates at the token endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientAuthMethod {
    /// Public client, no credential
    #[serde(rename = "none")]
    None,
    /// Secret in the Authorization header
    #[serde(rename = "client_secret_basic")]
    SecretBasic,
    /// Secret in the form body
    #[serde(rename = "client_secret_post")]
    SecretPost,
}

impl std::fmt::Display for ClientAuthMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::SecretBasic => write!(f, "client_secret_basic"),
            Self::SecretPost => write!(f, "client_secret_post"),
        }
    }
}

/// Kind of access token issued
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenType {
    /// Plain bearer token
    Bearer,
    /// Token bound to a DPoP key
    #[serde(rename = "DPoP")]
    Dpop,
}

impl std::fmt::Display for TokenType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bearer => write!(f, "Bearer"),
            Self::Dpop => write!(f, "DPoP"),
        }
    }
}

/// A dynamically registered client
///
/// Immutable after registration; deleting the client revokes everything
/// derived from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredClient {
    /// Opaque client identifier
    pub client_id: String,
    /// Secret held by confidential clients
    pub client_secret: Option<String>,
    /// Human-readable name
    pub client_name: String,
    /// Exact-match redirect URIs
    pub redirect_uris: Vec<String>,
    /// Grants the client may use
    pub grant_types: Vec<GrantType>,
    /// Always `["code"]`
    pub response_types: Vec<String>,
    /// Token endpoint authentication method
    pub auth_method: ClientAuthMethod,
    /// Scopes the client may be granted
    pub allowed_scopes: BTreeSet<String>,
    /// Unix ms of registration
    pub created_at: i64,
    /// True when the client holds a secret
    pub is_confidential: bool,
}

/// Input to dynamic client registration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientRegistration {
    /// Human-readable name
    pub client_name: String,
    /// Redirect URIs, absolute URLs
    pub redirect_uris: Vec<String>,
    /// Requested auth method; defaults to `none`
    #[serde(default)]
    pub token_endpoint_auth_method: Option<ClientAuthMethod>,
    /// Requested grants; defaults to both supported grants
    #[serde(default)]
    pub grant_types: Option<Vec<GrantType>>,
    /// Requested scope, space-delimited; defaults to the server's allowed set
    #[serde(default)]
    pub scope: Option<String>,
}

/// A single-use authorization code
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationCode {
    /// The opaque code value
    pub code: String,
    /// Issuing client
    pub client_id: String,
    /// Redirect URI the code was bound to
    pub redirect_uri: String,
    /// Granted scope
    pub scope: BTreeSet<String>,
    /// S256 PKCE challenge
    pub code_challenge: String,
    /// Unix ms expiry; the code is invalid at exactly this instant
    pub expires_at: i64,
    /// Authenticated end user
    pub user_id: String,
    /// OpenID-style nonce, carried through opaquely
    pub nonce: Option<String>,
    /// DPoP key thumbprint when bound at authorization time
    pub dpop_key_thumbprint: Option<String>,
}

/// A server-side access token record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessToken {
    /// The opaque token value
    pub token: String,
    /// Bearer or DPoP
    pub token_type: TokenType,
    /// Issuing client
    pub client_id: String,
    /// End user
    pub user_id: String,
    /// Granted scope
    pub scope: BTreeSet<String>,
    /// Unix ms of issuance
    pub issued_at: i64,
    /// Unix ms expiry
    pub expires_at: i64,
    /// Bound DPoP key thumbprint
    pub dpop_key_thumbprint: Option<String>,
}

/// A server-side refresh token record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshToken {
    /// The opaque token value
    pub token: String,
    /// Issuing client
    pub client_id: String,
    /// End user
    pub user_id: String,
    /// Granted scope
    pub scope: BTreeSet<String>,
    /// Unix ms expiry
    pub expires_at: i64,
    /// Position in the rotation chain
    pub rotation_counter: u32,
    /// Rotation family id
    pub family: String,
}

/// Authorization request, already authenticated
#[derive(Debug, Clone)]
pub struct AuthorizeRequest {
    /// Must be `code`
    pub response_type: String,
    /// Requesting client
    pub client_id: String,
    /// Requested redirect URI
    pub redirect_uri: String,
    /// Space-delimited scope; empty requests the client's full allowed set
    pub scope: String,
    /// Opaque CSRF state echoed back
    pub state: Option<String>,
    /// S256 PKCE challenge
    pub code_challenge: Option<String>,
    /// Must be `S256`
    pub code_challenge_method: Option<String>,
    /// OpenID-style nonce
    pub nonce: Option<String>,
    /// Optional DPoP key thumbprint binding the code
    pub dpop_jkt: Option<String>,
    /// Authenticated end user
    pub user_id: String,
}

/// Successful authorization response
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthorizeResponse {
    /// The minted authorization code
    pub code: String,
    /// Echoed state
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
}

/// Token endpoint request
#[derive(Debug, Clone, Default)]
pub struct TokenRequest {
    /// `authorization_code` or `refresh_token`
    pub grant_type: String,
    /// Requesting client
    pub client_id: String,
    /// Secret for confidential clients
    pub client_secret: Option<String>,
    /// Authorization code being redeemed
    pub code: Option<String>,
    /// Redirect URI the code was bound to
    pub redirect_uri: Option<String>,
    /// PKCE verifier
    pub code_verifier: Option<String>,
    /// Refresh token being rotated
    pub refresh_token: Option<String>,
    /// Optional narrower scope on refresh, space-delimited
    pub scope: Option<String>,
    /// DPoP proof from the `DPoP` header
    pub dpop_proof: Option<String>,
}

/// Token endpoint success response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    /// The access token value
    pub access_token: String,
    /// `Bearer` or `DPoP`
    pub token_type: String,
    /// Access token lifetime in seconds
    pub expires_in: u64,
    /// Rotating refresh token
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Granted scope, space-delimited
    pub scope: String,
}

/// Introspection response
///
/// Inactive tokens report nothing but `active: false`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntrospectionResponse {
    /// Whether the token is live
    pub active: bool,
    /// Granted scope
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Issuing client
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// End user
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// `Bearer`, `DPoP`, or `refresh_token`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    /// Expiry, unix seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    /// Issuance, unix seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
}

/// Discovery metadata document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerMetadata {
    /// Issuer URL
    pub issuer: String,
    /// Authorization endpoint URL
    pub authorization_endpoint: String,
    /// Token endpoint URL
    pub token_endpoint: String,
    /// Revocation endpoint URL
    pub revocation_endpoint: String,
    /// Introspection endpoint URL
    pub introspection_endpoint: String,
    /// Registration endpoint URL
    pub registration_endpoint: String,
    /// Scopes the server grants
    pub scopes_supported: Vec<String>,
    /// Always `["code"]`
    pub response_types_supported: Vec<String>,
    /// Supported grant types
    pub grant_types_supported: Vec<String>,
    /// Supported client auth methods
    pub token_endpoint_auth_methods_supported: Vec<String>,
    /// Always `["S256"]`
    pub code_challenge_methods_supported: Vec<String>,
    /// DPoP algorithms, present only when DPoP is enabled
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dpop_signing_alg_values_supported: Option<Vec<String>>,
}

/// Parse a space-delimited scope string into a set
pub fn parse_scopes(scope: &str) -> BTreeSet<String> {
    scope
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

/// Join a scope set back into the wire form
pub fn join_scopes(scopes: &BTreeSet<String>) -> String {
    scopes.iter().cloned().collect::<Vec<_>>().join(" ")
}

/// Generate a 32-byte high-entropy opaque value, base64url without padding
pub(crate) fn generate_opaque() -> String {
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
    use rand::Rng;
    let bytes: [u8; 32] = rand::rng().random();
    URL_SAFE_NO_PAD.encode(bytes)
}
