//! OAuth 2.1 authorization server core
//!
//! Client registration, PKCE-gated authorization codes, token issuance with
//! rotating refresh-token families, DPoP binding, introspection, revocation,
//! and expiry cleanup. Transport binding (HTTP form parsing, headers) lives
//! outside; this core works on the parsed requests.

use std::collections::BTreeSet;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;
use uuid::Uuid;

use super::dpop::{DpopProof, DpopVerifier};
use super::model::{
    join_scopes, parse_scopes, AccessToken, AuthorizationCode, AuthorizeRequest,
    AuthorizeResponse, ClientAuthMethod, ClientRegistration, GrantType, IntrospectionResponse,
    RefreshToken, RegisteredClient, ServerMetadata, TokenRequest, TokenResponse, TokenType,
};
use super::pkce;
use super::store::{
    AccessTokenStore, ClientStore, CodeStore, InMemoryAccessTokenStore, InMemoryClientStore,
    InMemoryCodeStore, InMemoryRefreshTokenStore, RefreshTokenStore,
};
use crate::audit::{AuditLog, AuditSeverity};
use crate::bus::EventBus;
use crate::clock::Clock;
use crate::config::OAuthConfig;
use crate::error::{Error, OAuthError, OAuthErrorKind, Result};

static ABSOLUTE_URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z][a-zA-Z0-9+.\-]*://\S+$").expect("static pattern"));

/// Topic announced when a rotated refresh token is replayed
pub(crate) const TOPIC_REUSE_DETECTED: &str = "oauth.token.reuse_detected";

/// The OAuth core
pub struct AuthorizationServer {
    config: OAuthConfig,
    clock: Arc<dyn Clock>,
    clients: Arc<dyn ClientStore>,
    codes: Arc<dyn CodeStore>,
    access_tokens: Arc<dyn AccessTokenStore>,
    refresh_tokens: Arc<dyn RefreshTokenStore>,
    dpop: DpopVerifier,
    audit: Option<AuditLog>,
    bus: Option<EventBus>,
}

impl AuthorizationServer {
    /// Create a server over map-backed stores
    pub fn in_memory(config: OAuthConfig, clock: Arc<dyn Clock>) -> Self {
        let high_water = config.revoked_family_high_water;
        Self::with_stores(
            config,
            clock,
            Arc::new(InMemoryClientStore::new()),
            Arc::new(InMemoryCodeStore::new()),
            Arc::new(InMemoryAccessTokenStore::new()),
            Arc::new(InMemoryRefreshTokenStore::new(high_water)),
        )
    }

    /// Create a server over caller-provided stores
    pub fn with_stores(
        config: OAuthConfig,
        clock: Arc<dyn Clock>,
        clients: Arc<dyn ClientStore>,
        codes: Arc<dyn CodeStore>,
        access_tokens: Arc<dyn AccessTokenStore>,
        refresh_tokens: Arc<dyn RefreshTokenStore>,
    ) -> Self {
        let dpop = DpopVerifier::new(&config.dpop_algs, config.dpop_max_age_secs, clock.clone());
        Self {
            config,
            clock,
            clients,
            codes,
            access_tokens,
            refresh_tokens,
            dpop,
            audit: None,
            bus: None,
        }
    }

    /// Record security events through `audit`
    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Announce security events on `bus`
    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Discovery metadata for this server
    pub fn metadata(&self) -> ServerMetadata {
        let base = self.config.issuer.trim_end_matches('/');
        ServerMetadata {
            issuer: self.config.issuer.clone(),
            authorization_endpoint: format!("{}{}", base, self.config.authorization_endpoint),
            token_endpoint: format!("{}{}", base, self.config.token_endpoint),
            revocation_endpoint: format!("{}{}", base, self.config.revocation_endpoint),
            introspection_endpoint: format!("{}{}", base, self.config.introspection_endpoint),
            registration_endpoint: format!("{}{}", base, self.config.registration_endpoint),
            scopes_supported: self.config.allowed_scopes.clone(),
            response_types_supported: vec!["code".to_string()],
            grant_types_supported: vec![
                "authorization_code".to_string(),
                "refresh_token".to_string(),
            ],
            token_endpoint_auth_methods_supported: vec![
                "none".to_string(),
                "client_secret_basic".to_string(),
                "client_secret_post".to_string(),
            ],
            code_challenge_methods_supported: vec!["S256".to_string()],
            dpop_signing_alg_values_supported: if self.config.dpop_enabled {
                Some(self.config.dpop_algs.clone())
            } else {
                None
            },
        }
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Register a new client
    pub async fn register_client(
        &self,
        registration: ClientRegistration,
    ) -> Result<RegisteredClient> {
        if registration.redirect_uris.is_empty() {
            return Err(oauth(OAuthError::invalid_request(
                "at least one redirect_uri is required",
            )));
        }
        for uri in &registration.redirect_uris {
            if !ABSOLUTE_URL.is_match(uri) {
                return Err(oauth(OAuthError::invalid_request(format!(
                    "redirect_uri '{}' is not an absolute URL",
                    uri
                ))));
            }
        }

        let auth_method = registration
            .token_endpoint_auth_method
            .unwrap_or(ClientAuthMethod::None);
        let is_confidential = auth_method != ClientAuthMethod::None;

        let server_scopes: BTreeSet<String> =
            self.config.allowed_scopes.iter().cloned().collect();
        let allowed_scopes = match registration.scope.as_deref() {
            Some(scope) => &parse_scopes(scope) & &server_scopes,
            None => server_scopes,
        };

        let client = RegisteredClient {
            client_id: super::model::generate_opaque(),
            client_secret: is_confidential.then(super::model::generate_opaque),
            client_name: registration.client_name,
            redirect_uris: registration.redirect_uris,
            grant_types: registration
                .grant_types
                .unwrap_or_else(|| vec![GrantType::AuthorizationCode, GrantType::RefreshToken]),
            response_types: vec!["code".to_string()],
            auth_method,
            allowed_scopes,
            created_at: self.clock.now_ms(),
            is_confidential,
        };

        self.clients.insert(client.clone()).await?;
        tracing::info!(client_id = %client.client_id, confidential = is_confidential, "client registered");
        self.record_audit(&client.client_id, "client_registered", AuditSeverity::Informational, None)
            .await;
        Ok(client)
    }

    /// Delete a client and revoke everything derived from it
    pub async fn delete_client(&self, client_id: &str) -> Result<bool> {
        let existed = self.clients.delete(client_id).await?;
        if existed {
            let access = self.access_tokens.delete_for_client(client_id).await?;
            let refresh = self.refresh_tokens.delete_for_client(client_id).await?;
            tracing::info!(client_id, access, refresh, "client deleted, derived tokens revoked");
            self.record_audit(client_id, "client_deleted", AuditSeverity::Notice, None)
                .await;
        }
        Ok(existed)
    }

    // ------------------------------------------------------------------
    // Authorize
    // ------------------------------------------------------------------

    /// Handle an authorization request for an authenticated user
    pub async fn authorize(&self, request: AuthorizeRequest) -> Result<AuthorizeResponse> {
        let Some(client) = self.clients.get(&request.client_id).await? else {
            return Err(oauth(OAuthError::invalid_client("unknown client")));
        };

        if request.response_type != "code" {
            return Err(oauth(OAuthError::with_description(
                OAuthErrorKind::UnsupportedResponseType,
                "only response_type=code is supported",
            )));
        }

        if !client
            .redirect_uris
            .iter()
            .any(|uri| uri == &request.redirect_uri)
        {
            return Err(oauth(OAuthError::invalid_request(
                "redirect_uri is not registered for this client",
            )));
        }

        let Some(code_challenge) = request
            .code_challenge
            .as_deref()
            .filter(|c| !c.is_empty())
        else {
            return Err(oauth(OAuthError::invalid_request(
                "code_challenge is required",
            )));
        };
        if request.code_challenge_method.as_deref() != Some("S256") {
            return Err(oauth(OAuthError::invalid_request(
                "code_challenge_method must be S256",
            )));
        }

        let scope = self.grant_scope(&client, &request.scope)?;

        let code = AuthorizationCode {
            code: super::model::generate_opaque(),
            client_id: client.client_id.clone(),
            redirect_uri: request.redirect_uri,
            scope,
            code_challenge: code_challenge.to_string(),
            expires_at: self.clock.now_ms() + (self.config.auth_code_ttl_secs as i64) * 1_000,
            user_id: request.user_id,
            nonce: request.nonce,
            dpop_key_thumbprint: request.dpop_jkt,
        };
        let minted = code.code.clone();
        self.codes.insert(code).await?;

        Ok(AuthorizeResponse {
            code: minted,
            state: request.state,
        })
    }

    /// Requested scope intersected with server- and client-allowed sets
    fn grant_scope(
        &self,
        client: &RegisteredClient,
        requested: &str,
    ) -> Result<BTreeSet<String>> {
        let server_scopes: BTreeSet<String> =
            self.config.allowed_scopes.iter().cloned().collect();
        let requested = if requested.trim().is_empty() {
            client.allowed_scopes.clone()
        } else {
            parse_scopes(requested)
        };
        let granted = &(&requested & &client.allowed_scopes) & &server_scopes;
        if granted.is_empty() {
            return Err(oauth(OAuthError::invalid_scope(
                "no requested scope is allowed",
            )));
        }
        Ok(granted)
    }

    // ------------------------------------------------------------------
    // Token endpoint
    // ------------------------------------------------------------------

    /// Handle a token request
    pub async fn token(&self, request: TokenRequest) -> Result<TokenResponse> {
        let Some(client) = self.clients.get(&request.client_id).await? else {
            return Err(oauth(OAuthError::invalid_client("unknown client")));
        };

        if client.is_confidential {
            let presented = request.client_secret.as_deref().unwrap_or("");
            let expected = client.client_secret.as_deref().unwrap_or("");
            if !pkce::constant_time_eq(presented, expected) {
                return Err(oauth(OAuthError::invalid_client(
                    "client authentication failed",
                )));
            }
        }

        let proof = match request.dpop_proof.as_deref() {
            Some(proof) if self.config.dpop_enabled => Some(self.dpop.verify(
                proof,
                "POST",
                &self.token_endpoint_url(),
                None,
                None,
            )?),
            Some(_) => {
                return Err(oauth(OAuthError::invalid_dpop_proof(
                    "DPoP is not enabled on this server",
                )))
            }
            None => None,
        };

        match request.grant_type.as_str() {
            "authorization_code" => self.redeem_code(&client, &request, proof).await,
            "refresh_token" => self.rotate_refresh(&client, &request, proof).await,
            other => Err(oauth(OAuthError::with_description(
                OAuthErrorKind::UnsupportedGrantType,
                format!("grant_type '{}' is not supported", other),
            ))),
        }
    }

    async fn redeem_code(
        &self,
        client: &RegisteredClient,
        request: &TokenRequest,
        proof: Option<DpopProof>,
    ) -> Result<TokenResponse> {
        let Some(code_value) = request.code.as_deref() else {
            return Err(oauth(OAuthError::invalid_request("code is required")));
        };

        // One-time use: the code leaves the store before any other check.
        let Some(code) = self.codes.take(code_value).await? else {
            return Err(oauth(OAuthError::invalid_grant(
                "authorization code is invalid or consumed",
            )));
        };

        let now = self.clock.now_ms();
        if now >= code.expires_at {
            return Err(oauth(OAuthError::invalid_grant(
                "authorization code expired",
            )));
        }
        if code.client_id != client.client_id {
            return Err(oauth(OAuthError::invalid_grant(
                "authorization code was issued to another client",
            )));
        }
        if request.redirect_uri.as_deref() != Some(code.redirect_uri.as_str()) {
            return Err(oauth(OAuthError::invalid_grant("redirect_uri mismatch")));
        }

        let Some(verifier) = request.code_verifier.as_deref() else {
            return Err(oauth(OAuthError::invalid_request(
                "code_verifier is required",
            )));
        };
        if !pkce::verify(verifier, &code.code_challenge) {
            return Err(oauth(OAuthError::invalid_grant("PKCE verification failed")));
        }

        let thumbprint = match (&code.dpop_key_thumbprint, &proof) {
            (Some(bound), Some(presented)) => {
                if !pkce::constant_time_eq(bound, &presented.thumbprint) {
                    return Err(oauth(OAuthError::invalid_dpop_proof(
                        "proof key does not match the bound key",
                    )));
                }
                Some(bound.clone())
            }
            (Some(_), None) => {
                return Err(oauth(OAuthError::invalid_dpop_proof(
                    "a DPoP proof is required for this code",
                )))
            }
            (None, Some(presented)) => Some(presented.thumbprint.clone()),
            (None, None) => None,
        };

        self.issue(
            client,
            &code.user_id,
            code.scope.clone(),
            thumbprint,
            Uuid::new_v4().to_string(),
            0,
        )
        .await
    }

    async fn rotate_refresh(
        &self,
        client: &RegisteredClient,
        request: &TokenRequest,
        proof: Option<DpopProof>,
    ) -> Result<TokenResponse> {
        let Some(token_value) = request.refresh_token.as_deref() else {
            return Err(oauth(OAuthError::invalid_request(
                "refresh_token is required",
            )));
        };

        let Some(stored) = self.refresh_tokens.get(token_value).await? else {
            return Err(oauth(OAuthError::invalid_grant("unknown refresh token")));
        };
        let token = stored.token;

        if self.refresh_tokens.is_family_revoked(&token.family).await? {
            self.flag_reuse(&token).await;
            return Err(oauth(OAuthError::invalid_grant("refresh token revoked")));
        }

        if stored.rotated {
            // Replay of a rotated token: the whole family is burned.
            self.refresh_tokens.revoke_family(&token.family).await?;
            self.flag_reuse(&token).await;
            return Err(oauth(OAuthError::invalid_grant("refresh token reused")));
        }

        let now = self.clock.now_ms();
        if now >= token.expires_at {
            return Err(oauth(OAuthError::invalid_grant("refresh token expired")));
        }
        if token.client_id != client.client_id {
            return Err(oauth(OAuthError::invalid_grant(
                "refresh token was issued to another client",
            )));
        }

        let scope = match request.scope.as_deref() {
            Some(requested) if !requested.trim().is_empty() => {
                let narrowed = parse_scopes(requested);
                if !narrowed.is_subset(&token.scope) {
                    return Err(oauth(OAuthError::invalid_scope(
                        "requested scope exceeds the refresh token's scope",
                    )));
                }
                narrowed
            }
            _ => token.scope.clone(),
        };

        // Rotation order matters: retire the presented token before the
        // replacement exists so a replay can never find two live tokens.
        self.refresh_tokens.mark_rotated(&token.token).await?;

        self.issue(
            client,
            &token.user_id,
            scope,
            proof.map(|p| p.thumbprint),
            token.family.clone(),
            token.rotation_counter + 1,
        )
        .await
    }

    async fn issue(
        &self,
        client: &RegisteredClient,
        user_id: &str,
        scope: BTreeSet<String>,
        thumbprint: Option<String>,
        family: String,
        rotation_counter: u32,
    ) -> Result<TokenResponse> {
        let now = self.clock.now_ms();
        let token_type = if thumbprint.is_some() {
            TokenType::Dpop
        } else {
            TokenType::Bearer
        };

        let access = AccessToken {
            token: super::model::generate_opaque(),
            token_type,
            client_id: client.client_id.clone(),
            user_id: user_id.to_string(),
            scope: scope.clone(),
            issued_at: now,
            expires_at: now + (self.config.access_token_ttl_secs as i64) * 1_000,
            dpop_key_thumbprint: thumbprint,
        };
        let refresh = RefreshToken {
            token: super::model::generate_opaque(),
            client_id: client.client_id.clone(),
            user_id: user_id.to_string(),
            scope: scope.clone(),
            expires_at: now + (self.config.refresh_token_ttl_secs as i64) * 1_000,
            rotation_counter,
            family,
        };

        self.access_tokens.insert(access.clone()).await?;
        self.refresh_tokens.insert(refresh.clone()).await?;

        Ok(TokenResponse {
            access_token: access.token,
            token_type: token_type.to_string(),
            expires_in: self.config.access_token_ttl_secs,
            refresh_token: Some(refresh.token),
            scope: join_scopes(&scope),
        })
    }

    async fn flag_reuse(&self, token: &RefreshToken) {
        tracing::error!(
            family = %token.family,
            user_id = %token.user_id,
            client_id = %token.client_id,
            "refresh token replay detected; family revoked"
        );
        self.record_audit(
            &token.family,
            "reuse_attempt",
            AuditSeverity::Critical,
            Some(&token.user_id),
        )
        .await;
        if let Some(ref bus) = self.bus {
            let payload = json!({
                "family": token.family,
                "userId": token.user_id,
                "clientId": token.client_id,
            });
            if let Err(e) = bus.publish(TOPIC_REUSE_DETECTED, payload).await {
                tracing::warn!(error = %e, "failed to announce reuse detection");
            }
        }
    }

    // ------------------------------------------------------------------
    // Introspection / revocation / resource access
    // ------------------------------------------------------------------

    /// Report whether a token is live, and its metadata when it is
    pub async fn introspect(&self, token: &str) -> Result<IntrospectionResponse> {
        let now = self.clock.now_ms();

        if let Some(access) = self.access_tokens.get(token).await? {
            if now < access.expires_at {
                return Ok(IntrospectionResponse {
                    active: true,
                    scope: Some(join_scopes(&access.scope)),
                    client_id: Some(access.client_id),
                    username: Some(access.user_id),
                    token_type: Some(access.token_type.to_string()),
                    exp: Some(access.expires_at / 1_000),
                    iat: Some(access.issued_at / 1_000),
                });
            }
            return Ok(IntrospectionResponse::default());
        }

        if let Some(stored) = self.refresh_tokens.get(token).await? {
            let token = stored.token;
            let revoked = self.refresh_tokens.is_family_revoked(&token.family).await?;
            if !stored.rotated && !revoked && now < token.expires_at {
                return Ok(IntrospectionResponse {
                    active: true,
                    scope: Some(join_scopes(&token.scope)),
                    client_id: Some(token.client_id),
                    username: Some(token.user_id),
                    token_type: Some("refresh_token".to_string()),
                    exp: Some(token.expires_at / 1_000),
                    iat: None,
                });
            }
        }

        Ok(IntrospectionResponse::default())
    }

    /// Revoke a token
    ///
    /// Revoking a refresh token burns its whole family; revoking an access
    /// token deletes just that token. Unknown tokens succeed silently.
    pub async fn revoke(&self, token: &str) -> Result<()> {
        if self.access_tokens.delete(token).await? {
            self.record_audit(token, "token_revoked", AuditSeverity::Notice, None)
                .await;
            return Ok(());
        }
        if let Some(stored) = self.refresh_tokens.get(token).await? {
            let family = stored.token.family;
            self.refresh_tokens.revoke_family(&family).await?;
            self.refresh_tokens.delete_family(&family).await?;
            self.record_audit(&family, "family_revoked", AuditSeverity::Notice, None)
                .await;
        }
        Ok(())
    }

    /// Validate an access token presented to a resource
    ///
    /// DPoP-bound tokens require a proof over the actual request whose key
    /// matches the bound thumbprint.
    pub async fn verify_access(
        &self,
        token: &str,
        dpop_proof: Option<&str>,
        method: &str,
        uri: &str,
    ) -> Result<AccessToken> {
        let Some(access) = self.access_tokens.get(token).await? else {
            return Err(oauth(OAuthError::invalid_grant("unknown access token")));
        };
        if self.clock.now_ms() >= access.expires_at {
            return Err(oauth(OAuthError::invalid_grant("access token expired")));
        }

        if let Some(ref bound) = access.dpop_key_thumbprint {
            let Some(proof) = dpop_proof else {
                return Err(oauth(OAuthError::invalid_dpop_proof(
                    "a DPoP proof is required for this token",
                )));
            };
            let verified = self.dpop.verify(proof, method, uri, Some(token), None)?;
            if !pkce::constant_time_eq(bound, &verified.thumbprint) {
                return Err(oauth(OAuthError::invalid_dpop_proof(
                    "proof key does not match the bound key",
                )));
            }
        }

        Ok(access)
    }

    // ------------------------------------------------------------------
    // Cleanup
    // ------------------------------------------------------------------

    /// Purge expired codes and tokens; returns (codes, access, refresh) counts
    pub async fn cleanup_expired(&self) -> Result<(u64, u64, u64)> {
        let now = self.clock.now_ms();
        let codes = self.codes.purge_expired(now).await?;
        let access = self.access_tokens.purge_expired(now).await?;
        let refresh = self.refresh_tokens.purge_expired(now).await?;
        if codes + access + refresh > 0 {
            tracing::debug!(codes, access, refresh, "purged expired oauth state");
        }
        Ok((codes, access, refresh))
    }

    fn token_endpoint_url(&self) -> String {
        format!(
            "{}{}",
            self.config.issuer.trim_end_matches('/'),
            self.config.token_endpoint
        )
    }

    async fn record_audit(
        &self,
        subject: &str,
        action: &str,
        severity: AuditSeverity,
        actor: Option<&str>,
    ) {
        if let Some(ref audit) = self.audit {
            if let Err(e) = audit.record_security(subject, action, severity, actor).await {
                tracing::warn!(error = %e, action, "failed to write audit entry");
            }
        }
    }
}

fn oauth(error: OAuthError) -> Error {
    Error::OAuth(error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditQuery, AuditStore, InMemoryAuditStore};
    use crate::clock::ManualClock;
    use crate::config::AuditConfig;
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};

    struct Harness {
        server: AuthorizationServer,
        clock: Arc<ManualClock>,
        audit_store: Arc<InMemoryAuditStore>,
    }

    fn harness() -> Harness {
        let clock = Arc::new(ManualClock::new(0));
        let audit_store = Arc::new(InMemoryAuditStore::new(1_000));
        let audit = AuditLog::new(audit_store.clone(), AuditConfig::default(), clock.clone());
        let server =
            AuthorizationServer::in_memory(OAuthConfig::default(), clock.clone()).with_audit(audit);
        Harness {
            server,
            clock,
            audit_store,
        }
    }

    async fn register_public(server: &AuthorizationServer) -> RegisteredClient {
        server
            .register_client(ClientRegistration {
                client_name: "c".to_string(),
                redirect_uris: vec!["https://x/cb".to_string()],
                token_endpoint_auth_method: Some(ClientAuthMethod::None),
                grant_types: None,
                scope: None,
            })
            .await
            .unwrap()
    }

    fn zero_verifier() -> String {
        URL_SAFE_NO_PAD.encode([0u8; 32])
    }

    async fn authorize_code(server: &AuthorizationServer, client_id: &str, verifier: &str) -> String {
        server
            .authorize(AuthorizeRequest {
                response_type: "code".to_string(),
                client_id: client_id.to_string(),
                redirect_uri: "https://x/cb".to_string(),
                scope: "read write".to_string(),
                state: Some("S".to_string()),
                code_challenge: Some(pkce::challenge_for(verifier)),
                code_challenge_method: Some("S256".to_string()),
                nonce: None,
                dpop_jkt: None,
                user_id: "U".to_string(),
            })
            .await
            .unwrap()
            .code
    }

    fn code_grant(client_id: &str, code: &str, verifier: &str) -> TokenRequest {
        TokenRequest {
            grant_type: "authorization_code".to_string(),
            client_id: client_id.to_string(),
            code: Some(code.to_string()),
            redirect_uri: Some("https://x/cb".to_string()),
            code_verifier: Some(verifier.to_string()),
            ..Default::default()
        }
    }

    fn refresh_grant(client_id: &str, refresh_token: &str) -> TokenRequest {
        TokenRequest {
            grant_type: "refresh_token".to_string(),
            client_id: client_id.to_string(),
            refresh_token: Some(refresh_token.to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn code_redemption_end_to_end() {
        let h = harness();
        let client = register_public(&h.server).await;
        let verifier = zero_verifier();

        let code = authorize_code(&h.server, &client.client_id, &verifier).await;

        h.clock.set(10);
        let response = h
            .server
            .token(code_grant(&client.client_id, &code, &verifier))
            .await
            .unwrap();
        assert_eq!(response.token_type, "Bearer");
        assert_eq!(response.expires_in, 3_600);
        assert_eq!(response.scope, "read write");
        assert!(response.refresh_token.is_some());

        // Second redemption of the same code fails: one-shot.
        h.clock.set(20);
        let err = h
            .server
            .token(code_grant(&client.client_id, &code, &verifier))
            .await
            .unwrap_err();
        assert_eq!(err.oauth_kind(), Some(OAuthErrorKind::InvalidGrant));
    }

    #[tokio::test]
    async fn refresh_reuse_revokes_family_and_audits() {
        let h = harness();
        let client = register_public(&h.server).await;
        let verifier = zero_verifier();
        let code = authorize_code(&h.server, &client.client_id, &verifier).await;

        let first = h
            .server
            .token(code_grant(&client.client_id, &code, &verifier))
            .await
            .unwrap();
        let r1 = first.refresh_token.unwrap();

        h.clock.set(30);
        let second = h
            .server
            .token(refresh_grant(&client.client_id, &r1))
            .await
            .unwrap();
        let r2 = second.refresh_token.unwrap();

        // Replaying the rotated token burns the family.
        h.clock.set(40);
        let err = h
            .server
            .token(refresh_grant(&client.client_id, &r1))
            .await
            .unwrap_err();
        assert_eq!(err.oauth_kind(), Some(OAuthErrorKind::InvalidGrant));

        let entries = h
            .audit_store
            .query(&AuditQuery {
                limit: 100,
                ..Default::default()
            })
            .await
            .unwrap();
        let reuse = entries
            .iter()
            .find(|e| e.action.as_deref() == Some("reuse_attempt"))
            .expect("reuse audit entry");
        assert_eq!(reuse.severity, AuditSeverity::Critical);
        assert_eq!(reuse.actor.as_deref(), Some("U"));

        // The surviving sibling is dead too.
        h.clock.set(50);
        let err = h
            .server
            .token(refresh_grant(&client.client_id, &r2))
            .await
            .unwrap_err();
        assert_eq!(err.oauth_kind(), Some(OAuthErrorKind::InvalidGrant));
    }

    #[tokio::test]
    async fn pkce_mismatch_consumes_the_code() {
        let h = harness();
        let client = register_public(&h.server).await;
        let verifier = zero_verifier();
        let code = authorize_code(&h.server, &client.client_id, &verifier).await;

        let wrong = URL_SAFE_NO_PAD.encode([1u8; 32]);
        let err = h
            .server
            .token(code_grant(&client.client_id, &code, &wrong))
            .await
            .unwrap_err();
        let Error::OAuth(oauth_err) = &err else {
            panic!("expected oauth error");
        };
        assert_eq!(oauth_err.kind, OAuthErrorKind::InvalidGrant);
        assert_eq!(
            oauth_err.description.as_deref(),
            Some("PKCE verification failed")
        );

        // The failed attempt consumed the code; the right verifier is too late.
        let err = h
            .server
            .token(code_grant(&client.client_id, &code, &verifier))
            .await
            .unwrap_err();
        assert_eq!(err.oauth_kind(), Some(OAuthErrorKind::InvalidGrant));
    }

    #[tokio::test]
    async fn code_at_exact_expiry_is_expired() {
        let h = harness();
        let client = register_public(&h.server).await;
        let verifier = zero_verifier();
        let code = authorize_code(&h.server, &client.client_id, &verifier).await;

        h.clock.set(60_000);
        let err = h
            .server
            .token(code_grant(&client.client_id, &code, &verifier))
            .await
            .unwrap_err();
        assert_eq!(err.oauth_kind(), Some(OAuthErrorKind::InvalidGrant));
    }

    #[tokio::test]
    async fn code_just_before_expiry_redeems() {
        let h = harness();
        let client = register_public(&h.server).await;
        let verifier = zero_verifier();
        let code = authorize_code(&h.server, &client.client_id, &verifier).await;

        h.clock.set(59_999);
        h.server
            .token(code_grant(&client.client_id, &code, &verifier))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn refresh_scope_narrows_but_never_widens() {
        let h = harness();
        let client = register_public(&h.server).await;
        let verifier = zero_verifier();
        let code = authorize_code(&h.server, &client.client_id, &verifier).await;
        let first = h
            .server
            .token(code_grant(&client.client_id, &code, &verifier))
            .await
            .unwrap();

        let mut narrow = refresh_grant(&client.client_id, first.refresh_token.as_ref().unwrap());
        narrow.scope = Some("read".to_string());
        let narrowed = h.server.token(narrow).await.unwrap();
        assert_eq!(narrowed.scope, "read");

        let mut widen = refresh_grant(&client.client_id, narrowed.refresh_token.as_ref().unwrap());
        widen.scope = Some("read write".to_string());
        let err = h.server.token(widen).await.unwrap_err();
        assert_eq!(err.oauth_kind(), Some(OAuthErrorKind::InvalidScope));
    }

    #[tokio::test]
    async fn authorize_rejections_use_exact_codes() {
        let h = harness();
        let client = register_public(&h.server).await;

        let base = AuthorizeRequest {
            response_type: "code".to_string(),
            client_id: client.client_id.clone(),
            redirect_uri: "https://x/cb".to_string(),
            scope: "read".to_string(),
            state: None,
            code_challenge: Some("challenge".to_string()),
            code_challenge_method: Some("S256".to_string()),
            nonce: None,
            dpop_jkt: None,
            user_id: "U".to_string(),
        };

        let mut unknown = base.clone();
        unknown.client_id = "nope".to_string();
        assert_eq!(
            h.server.authorize(unknown).await.unwrap_err().oauth_kind(),
            Some(OAuthErrorKind::InvalidClient)
        );

        let mut bad_type = base.clone();
        bad_type.response_type = "token".to_string();
        assert_eq!(
            h.server.authorize(bad_type).await.unwrap_err().oauth_kind(),
            Some(OAuthErrorKind::UnsupportedResponseType)
        );

        let mut bad_redirect = base.clone();
        bad_redirect.redirect_uri = "https://evil/cb".to_string();
        assert_eq!(
            h.server
                .authorize(bad_redirect)
                .await
                .unwrap_err()
                .oauth_kind(),
            Some(OAuthErrorKind::InvalidRequest)
        );

        let mut no_pkce = base.clone();
        no_pkce.code_challenge = None;
        assert_eq!(
            h.server.authorize(no_pkce).await.unwrap_err().oauth_kind(),
            Some(OAuthErrorKind::InvalidRequest)
        );

        let mut plain = base.clone();
        plain.code_challenge_method = Some("plain".to_string());
        assert_eq!(
            h.server.authorize(plain).await.unwrap_err().oauth_kind(),
            Some(OAuthErrorKind::InvalidRequest)
        );

        let mut bad_scope = base.clone();
        bad_scope.scope = "admin".to_string();
        assert_eq!(
            h.server.authorize(bad_scope).await.unwrap_err().oauth_kind(),
            Some(OAuthErrorKind::InvalidScope)
        );
    }

    #[tokio::test]
    async fn confidential_client_requires_matching_secret() {
        let h = harness();
        let client = h
            .server
            .register_client(ClientRegistration {
                client_name: "conf".to_string(),
                redirect_uris: vec!["https://x/cb".to_string()],
                token_endpoint_auth_method: Some(ClientAuthMethod::SecretPost),
                grant_types: None,
                scope: None,
            })
            .await
            .unwrap();
        assert!(client.is_confidential);
        let secret = client.client_secret.clone().unwrap();

        let verifier = zero_verifier();
        let code = authorize_code(&h.server, &client.client_id, &verifier).await;

        let mut bad = code_grant(&client.client_id, &code, &verifier);
        bad.client_secret = Some("wrong".to_string());
        assert_eq!(
            h.server.token(bad).await.unwrap_err().oauth_kind(),
            Some(OAuthErrorKind::InvalidClient)
        );

        // The code survived the failed client authentication.
        let mut good = code_grant(&client.client_id, &code, &verifier);
        good.client_secret = Some(secret);
        h.server.token(good).await.unwrap();
    }

    #[tokio::test]
    async fn introspection_reports_live_tokens_only() {
        let h = harness();
        let client = register_public(&h.server).await;
        let verifier = zero_verifier();
        let code = authorize_code(&h.server, &client.client_id, &verifier).await;
        let issued = h
            .server
            .token(code_grant(&client.client_id, &code, &verifier))
            .await
            .unwrap();

        let info = h.server.introspect(&issued.access_token).await.unwrap();
        assert!(info.active);
        assert_eq!(info.scope.as_deref(), Some("read write"));
        assert_eq!(info.username.as_deref(), Some("U"));
        assert_eq!(info.token_type.as_deref(), Some("Bearer"));

        let refresh = issued.refresh_token.unwrap();
        let info = h.server.introspect(&refresh).await.unwrap();
        assert!(info.active);
        assert_eq!(info.token_type.as_deref(), Some("refresh_token"));

        assert!(!h.server.introspect("unknown").await.unwrap().active);

        // Expired access token goes inactive and reports nothing else.
        h.clock.set(3_600_000 + 1);
        let info = h.server.introspect(&issued.access_token).await.unwrap();
        assert!(!info.active);
        assert!(info.scope.is_none());
    }

    #[tokio::test]
    async fn revoking_refresh_burns_the_family() {
        let h = harness();
        let client = register_public(&h.server).await;
        let verifier = zero_verifier();
        let code = authorize_code(&h.server, &client.client_id, &verifier).await;
        let issued = h
            .server
            .token(code_grant(&client.client_id, &code, &verifier))
            .await
            .unwrap();
        let refresh = issued.refresh_token.unwrap();

        h.server.revoke(&refresh).await.unwrap();
        let err = h
            .server
            .token(refresh_grant(&client.client_id, &refresh))
            .await
            .unwrap_err();
        assert_eq!(err.oauth_kind(), Some(OAuthErrorKind::InvalidGrant));

        // Revoking an access token deletes just that token.
        h.server.revoke(&issued.access_token).await.unwrap();
        assert!(!h.server.introspect(&issued.access_token).await.unwrap().active);

        // Unknown tokens revoke silently.
        h.server.revoke("unknown").await.unwrap();
    }

    #[tokio::test]
    async fn dpop_bound_code_requires_a_proof() {
        let h = harness();
        let client = register_public(&h.server).await;
        let verifier = zero_verifier();

        let code = h
            .server
            .authorize(AuthorizeRequest {
                response_type: "code".to_string(),
                client_id: client.client_id.clone(),
                redirect_uri: "https://x/cb".to_string(),
                scope: "read".to_string(),
                state: None,
                code_challenge: Some(pkce::challenge_for(&verifier)),
                code_challenge_method: Some("S256".to_string()),
                nonce: None,
                dpop_jkt: Some("thumb-1".to_string()),
                user_id: "U".to_string(),
            })
            .await
            .unwrap()
            .code;

        let err = h
            .server
            .token(code_grant(&client.client_id, &code, &verifier))
            .await
            .unwrap_err();
        assert_eq!(err.oauth_kind(), Some(OAuthErrorKind::InvalidDpopProof));
    }

    #[tokio::test]
    async fn dpop_bound_access_token_fails_without_proof() {
        let h = harness();
        let client = register_public(&h.server).await;

        // A token bound to a key, presented bare.
        let bound = AccessToken {
            token: "bound-token".to_string(),
            token_type: TokenType::Dpop,
            client_id: client.client_id.clone(),
            user_id: "U".to_string(),
            scope: BTreeSet::from(["read".to_string()]),
            issued_at: 0,
            expires_at: 1_000_000,
            dpop_key_thumbprint: Some("thumb-1".to_string()),
        };
        h.server.access_tokens.insert(bound).await.unwrap();

        let err = h
            .server
            .verify_access("bound-token", None, "GET", "https://rs/data")
            .await
            .unwrap_err();
        assert_eq!(err.oauth_kind(), Some(OAuthErrorKind::InvalidDpopProof));
    }

    #[tokio::test]
    async fn bearer_access_token_verifies_without_proof() {
        let h = harness();
        let client = register_public(&h.server).await;
        let verifier = zero_verifier();
        let code = authorize_code(&h.server, &client.client_id, &verifier).await;
        let issued = h
            .server
            .token(code_grant(&client.client_id, &code, &verifier))
            .await
            .unwrap();

        let access = h
            .server
            .verify_access(&issued.access_token, None, "GET", "https://rs/data")
            .await
            .unwrap();
        assert_eq!(access.user_id, "U");

        h.clock.set(3_600_000 + 10);
        let err = h
            .server
            .verify_access(&issued.access_token, None, "GET", "https://rs/data")
            .await
            .unwrap_err();
        assert_eq!(err.oauth_kind(), Some(OAuthErrorKind::InvalidGrant));
    }

    #[tokio::test]
    async fn cleanup_purges_expired_state() {
        let h = harness();
        let client = register_public(&h.server).await;
        let verifier = zero_verifier();
        let _code = authorize_code(&h.server, &client.client_id, &verifier).await;

        // Past the code TTL but before token expiry nothing else purges.
        h.clock.set(61_000);
        let (codes, access, refresh) = h.server.cleanup_expired().await.unwrap();
        assert_eq!((codes, access, refresh), (1, 0, 0));
    }

    #[tokio::test]
    async fn registration_validates_redirect_uris() {
        let h = harness();
        let err = h
            .server
            .register_client(ClientRegistration {
                client_name: "bad".to_string(),
                redirect_uris: vec!["not-a-url".to_string()],
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.oauth_kind(), Some(OAuthErrorKind::InvalidRequest));

        let err = h
            .server
            .register_client(ClientRegistration {
                client_name: "empty".to_string(),
                redirect_uris: vec![],
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.oauth_kind(), Some(OAuthErrorKind::InvalidRequest));
    }

    #[tokio::test]
    async fn deleting_a_client_revokes_its_tokens() {
        let h = harness();
        let client = register_public(&h.server).await;
        let verifier = zero_verifier();
        let code = authorize_code(&h.server, &client.client_id, &verifier).await;
        let issued = h
            .server
            .token(code_grant(&client.client_id, &code, &verifier))
            .await
            .unwrap();

        assert!(h.server.delete_client(&client.client_id).await.unwrap());
        assert!(!h.server.introspect(&issued.access_token).await.unwrap().active);
        assert!(!h
            .server
            .introspect(issued.refresh_token.as_ref().unwrap())
            .await
            .unwrap()
            .active);
    }

    #[tokio::test]
    async fn metadata_reports_the_contract() {
        let h = harness();
        let metadata = h.server.metadata();
        assert_eq!(metadata.issuer, "https://warden.local");
        assert_eq!(
            metadata.token_endpoint,
            "https://warden.local/oauth/token"
        );
        assert_eq!(metadata.response_types_supported, vec!["code"]);
        assert_eq!(
            metadata.grant_types_supported,
            vec!["authorization_code", "refresh_token"]
        );
        assert_eq!(metadata.code_challenge_methods_supported, vec!["S256"]);
        assert_eq!(
            metadata.dpop_signing_alg_values_supported,
            Some(vec!["ES256".to_string(), "RS256".to_string()])
        );
    }

    #[tokio::test]
    async fn unsupported_grant_type_is_rejected() {
        let h = harness();
        let client = register_public(&h.server).await;
        let err = h
            .server
            .token(TokenRequest {
                grant_type: "password".to_string(),
                client_id: client.client_id,
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(
            err.oauth_kind(),
            Some(OAuthErrorKind::UnsupportedGrantType)
        );
    }
}
