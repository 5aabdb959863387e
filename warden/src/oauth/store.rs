//! OAuth state storage
//!
//! One trait per concern (clients, codes, access tokens, refresh tokens),
//! each with a map-backed implementation and one driving the durable
//! [`KeyValueStore`] capability. The authorization server only ever sees the
//! traits.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::model::{AccessToken, AuthorizationCode, RefreshToken, RegisteredClient};
use crate::error::{Error, Result};
use crate::store::KeyValueStore;

/// Registered client persistence
#[async_trait]
pub trait ClientStore: Send + Sync {
    /// Store a newly registered client
    async fn insert(&self, client: RegisteredClient) -> Result<()>;

    /// Fetch a client by id
    async fn get(&self, client_id: &str) -> Result<Option<RegisteredClient>>;

    /// Delete a client, reporting whether it existed
    async fn delete(&self, client_id: &str) -> Result<bool>;
}

/// Authorization code persistence
#[async_trait]
pub trait CodeStore: Send + Sync {
    /// Store a freshly minted code
    async fn insert(&self, code: AuthorizationCode) -> Result<()>;

    /// Remove and return a code in one step
    ///
    /// The removal makes codes single-use regardless of what the caller does
    /// with the result.
    async fn take(&self, code: &str) -> Result<Option<AuthorizationCode>>;

    /// Delete codes expired at `now_ms`, returning the count
    async fn purge_expired(&self, now_ms: i64) -> Result<u64>;
}

/// Access token persistence
#[async_trait]
pub trait AccessTokenStore: Send + Sync {
    /// Store an issued token
    async fn insert(&self, token: AccessToken) -> Result<()>;

    /// Fetch a token by value
    async fn get(&self, token: &str) -> Result<Option<AccessToken>>;

    /// Delete a token, reporting whether it existed
    async fn delete(&self, token: &str) -> Result<bool>;

    /// Delete every token issued to a client, returning the count
    async fn delete_for_client(&self, client_id: &str) -> Result<u64>;

    /// Delete tokens expired at `now_ms`, returning the count
    async fn purge_expired(&self, now_ms: i64) -> Result<u64>;
}

/// A refresh token with its rotation flag
///
/// Rotated tokens stay on record until they expire; presenting one is the
/// replay signal that revokes the family.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredRefreshToken {
    /// The token record
    pub token: RefreshToken,
    /// True once the token has been rotated away
    pub rotated: bool,
}

/// Refresh token and family persistence
#[async_trait]
pub trait RefreshTokenStore: Send + Sync {
    /// Store an issued token as live
    async fn insert(&self, token: RefreshToken) -> Result<()>;

    /// Fetch a token (live or rotated) by value
    async fn get(&self, token: &str) -> Result<Option<StoredRefreshToken>>;

    /// Flag a token as rotated, keeping it on record for replay detection
    async fn mark_rotated(&self, token: &str) -> Result<()>;

    /// Delete every token in a family, returning the count
    async fn delete_family(&self, family: &str) -> Result<u64>;

    /// Delete every token issued to a client, returning the count
    async fn delete_for_client(&self, client_id: &str) -> Result<u64>;

    /// Add a family to the revoked set
    async fn revoke_family(&self, family: &str) -> Result<()>;

    /// Whether a family has been revoked
    async fn is_family_revoked(&self, family: &str) -> Result<bool>;

    /// Delete tokens expired at `now_ms`, returning the count
    async fn purge_expired(&self, now_ms: i64) -> Result<u64>;
}

// ============================================================================
// Map-backed implementations
// ============================================================================

/// Map-backed client store
#[derive(Default)]
pub struct InMemoryClientStore {
    clients: DashMap<String, RegisteredClient>,
}

impl InMemoryClientStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ClientStore for InMemoryClientStore {
    async fn insert(&self, client: RegisteredClient) -> Result<()> {
        self.clients.insert(client.client_id.clone(), client);
        Ok(())
    }

    async fn get(&self, client_id: &str) -> Result<Option<RegisteredClient>> {
        Ok(self.clients.get(client_id).map(|c| c.clone()))
    }

    async fn delete(&self, client_id: &str) -> Result<bool> {
        Ok(self.clients.remove(client_id).is_some())
    }
}

/// Map-backed code store
#[derive(Default)]
pub struct InMemoryCodeStore {
    codes: DashMap<String, AuthorizationCode>,
}

impl InMemoryCodeStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CodeStore for InMemoryCodeStore {
    async fn insert(&self, code: AuthorizationCode) -> Result<()> {
        self.codes.insert(code.code.clone(), code);
        Ok(())
    }

    async fn take(&self, code: &str) -> Result<Option<AuthorizationCode>> {
        Ok(self.codes.remove(code).map(|(_, v)| v))
    }

    async fn purge_expired(&self, now_ms: i64) -> Result<u64> {
        let before = self.codes.len();
        self.codes.retain(|_, code| code.expires_at > now_ms);
        Ok((before - self.codes.len()) as u64)
    }
}

/// Map-backed access token store
#[derive(Default)]
pub struct InMemoryAccessTokenStore {
    tokens: DashMap<String, AccessToken>,
}

impl InMemoryAccessTokenStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AccessTokenStore for InMemoryAccessTokenStore {
    async fn insert(&self, token: AccessToken) -> Result<()> {
        self.tokens.insert(token.token.clone(), token);
        Ok(())
    }

    async fn get(&self, token: &str) -> Result<Option<AccessToken>> {
        Ok(self.tokens.get(token).map(|t| t.clone()))
    }

    async fn delete(&self, token: &str) -> Result<bool> {
        Ok(self.tokens.remove(token).is_some())
    }

    async fn delete_for_client(&self, client_id: &str) -> Result<u64> {
        let before = self.tokens.len();
        self.tokens.retain(|_, token| token.client_id != client_id);
        Ok((before - self.tokens.len()) as u64)
    }

    async fn purge_expired(&self, now_ms: i64) -> Result<u64> {
        let before = self.tokens.len();
        self.tokens.retain(|_, token| token.expires_at > now_ms);
        Ok((before - self.tokens.len()) as u64)
    }
}

/// Bounded set of revoked families, oldest-half discard above the mark
#[derive(Debug)]
struct RevokedFamilies {
    order: VecDeque<String>,
    set: HashSet<String>,
    high_water: usize,
}

impl RevokedFamilies {
    fn new(high_water: usize) -> Self {
        Self {
            order: VecDeque::new(),
            set: HashSet::new(),
            high_water: high_water.max(2),
        }
    }

    fn insert(&mut self, family: &str) {
        if self.set.insert(family.to_string()) {
            self.order.push_back(family.to_string());
        }
        if self.set.len() > self.high_water {
            // Refresh TTLs are long expired by the time the mark is reached.
            let drop_count = self.set.len() / 2;
            for _ in 0..drop_count {
                if let Some(old) = self.order.pop_front() {
                    self.set.remove(&old);
                }
            }
        }
    }

    fn contains(&self, family: &str) -> bool {
        self.set.contains(family)
    }
}

/// Map-backed refresh token store
pub struct InMemoryRefreshTokenStore {
    tokens: DashMap<String, StoredRefreshToken>,
    revoked: Mutex<RevokedFamilies>,
}

impl InMemoryRefreshTokenStore {
    /// Create an empty store bounding the revoked set at `high_water`
    pub fn new(high_water: usize) -> Self {
        Self {
            tokens: DashMap::new(),
            revoked: Mutex::new(RevokedFamilies::new(high_water)),
        }
    }
}

#[async_trait]
impl RefreshTokenStore for InMemoryRefreshTokenStore {
    async fn insert(&self, token: RefreshToken) -> Result<()> {
        self.tokens.insert(
            token.token.clone(),
            StoredRefreshToken {
                token,
                rotated: false,
            },
        );
        Ok(())
    }

    async fn get(&self, token: &str) -> Result<Option<StoredRefreshToken>> {
        Ok(self.tokens.get(token).map(|t| t.clone()))
    }

    async fn mark_rotated(&self, token: &str) -> Result<()> {
        if let Some(mut stored) = self.tokens.get_mut(token) {
            stored.rotated = true;
        }
        Ok(())
    }

    async fn delete_family(&self, family: &str) -> Result<u64> {
        let before = self.tokens.len();
        self.tokens.retain(|_, stored| stored.token.family != family);
        Ok((before - self.tokens.len()) as u64)
    }

    async fn delete_for_client(&self, client_id: &str) -> Result<u64> {
        let before = self.tokens.len();
        self.tokens
            .retain(|_, stored| stored.token.client_id != client_id);
        Ok((before - self.tokens.len()) as u64)
    }

    async fn revoke_family(&self, family: &str) -> Result<()> {
        self.revoked
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(family);
        Ok(())
    }

    async fn is_family_revoked(&self, family: &str) -> Result<bool> {
        Ok(self
            .revoked
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(family))
    }

    async fn purge_expired(&self, now_ms: i64) -> Result<u64> {
        let before = self.tokens.len();
        self.tokens
            .retain(|_, stored| stored.token.expires_at > now_ms);
        Ok((before - self.tokens.len()) as u64)
    }
}

// ============================================================================
// Key-value-backed implementations
// ============================================================================

fn decode<T: for<'de> Deserialize<'de>>(value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| Error::Store(format!("decode failed: {}", e)))
}

fn encode<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| Error::Store(format!("encode failed: {}", e)))
}

/// Key-value-backed client store
pub struct KvClientStore {
    kv: Arc<dyn KeyValueStore>,
}

impl KvClientStore {
    /// Create a store persisting through `kv`
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    fn key(client_id: &str) -> String {
        format!("oauth:client:{}", client_id)
    }
}

#[async_trait]
impl ClientStore for KvClientStore {
    async fn insert(&self, client: RegisteredClient) -> Result<()> {
        self.kv
            .put(&Self::key(&client.client_id), encode(&client)?)
            .await
    }

    async fn get(&self, client_id: &str) -> Result<Option<RegisteredClient>> {
        match self.kv.get(&Self::key(client_id)).await? {
            Some(value) => Ok(Some(decode(value)?)),
            None => Ok(None),
        }
    }

    async fn delete(&self, client_id: &str) -> Result<bool> {
        self.kv.delete(&Self::key(client_id)).await
    }
}

/// Key-value-backed code store
pub struct KvCodeStore {
    kv: Arc<dyn KeyValueStore>,
}

impl KvCodeStore {
    /// Create a store persisting through `kv`
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    fn key(code: &str) -> String {
        format!("oauth:code:{}", code)
    }
}

#[async_trait]
impl CodeStore for KvCodeStore {
    async fn insert(&self, code: AuthorizationCode) -> Result<()> {
        self.kv.put(&Self::key(&code.code), encode(&code)?).await
    }

    async fn take(&self, code: &str) -> Result<Option<AuthorizationCode>> {
        let key = Self::key(code);
        let Some(value) = self.kv.get(&key).await? else {
            return Ok(None);
        };
        self.kv.delete(&key).await?;
        Ok(Some(decode(value)?))
    }

    async fn purge_expired(&self, now_ms: i64) -> Result<u64> {
        let mut purged = 0u64;
        for (key, value) in self.kv.scan_prefix("oauth:code:").await? {
            let code: AuthorizationCode = decode(value)?;
            if code.expires_at <= now_ms {
                self.kv.delete(&key).await?;
                purged += 1;
            }
        }
        Ok(purged)
    }
}

/// Key-value-backed access token store
pub struct KvAccessTokenStore {
    kv: Arc<dyn KeyValueStore>,
}

impl KvAccessTokenStore {
    /// Create a store persisting through `kv`
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    fn key(token: &str) -> String {
        format!("oauth:access:{}", token)
    }
}

#[async_trait]
impl AccessTokenStore for KvAccessTokenStore {
    async fn insert(&self, token: AccessToken) -> Result<()> {
        self.kv.put(&Self::key(&token.token), encode(&token)?).await
    }

    async fn get(&self, token: &str) -> Result<Option<AccessToken>> {
        match self.kv.get(&Self::key(token)).await? {
            Some(value) => Ok(Some(decode(value)?)),
            None => Ok(None),
        }
    }

    async fn delete(&self, token: &str) -> Result<bool> {
        self.kv.delete(&Self::key(token)).await
    }

    async fn delete_for_client(&self, client_id: &str) -> Result<u64> {
        let mut deleted = 0u64;
        for (key, value) in self.kv.scan_prefix("oauth:access:").await? {
            let token: AccessToken = decode(value)?;
            if token.client_id == client_id {
                self.kv.delete(&key).await?;
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn purge_expired(&self, now_ms: i64) -> Result<u64> {
        let mut purged = 0u64;
        for (key, value) in self.kv.scan_prefix("oauth:access:").await? {
            let token: AccessToken = decode(value)?;
            if token.expires_at <= now_ms {
                self.kv.delete(&key).await?;
                purged += 1;
            }
        }
        Ok(purged)
    }
}

/// Key-value-backed refresh token store
///
/// Revoked families are persisted, so replay detection survives restarts
/// when the deployment provides a durable store.
pub struct KvRefreshTokenStore {
    kv: Arc<dyn KeyValueStore>,
    high_water: usize,
}

impl KvRefreshTokenStore {
    /// Create a store persisting through `kv`
    pub fn new(kv: Arc<dyn KeyValueStore>, high_water: usize) -> Self {
        Self {
            kv,
            high_water: high_water.max(2),
        }
    }

    fn token_key(token: &str) -> String {
        format!("oauth:refresh:{}", token)
    }

    fn family_key(family: &str) -> String {
        format!("oauth:family:{}", family)
    }
}

#[async_trait]
impl RefreshTokenStore for KvRefreshTokenStore {
    async fn insert(&self, token: RefreshToken) -> Result<()> {
        let stored = StoredRefreshToken {
            token,
            rotated: false,
        };
        self.kv
            .put(&Self::token_key(&stored.token.token), encode(&stored)?)
            .await
    }

    async fn get(&self, token: &str) -> Result<Option<StoredRefreshToken>> {
        match self.kv.get(&Self::token_key(token)).await? {
            Some(value) => Ok(Some(decode(value)?)),
            None => Ok(None),
        }
    }

    async fn mark_rotated(&self, token: &str) -> Result<()> {
        let key = Self::token_key(token);
        if let Some(value) = self.kv.get(&key).await? {
            let mut stored: StoredRefreshToken = decode(value)?;
            stored.rotated = true;
            self.kv.put(&key, encode(&stored)?).await?;
        }
        Ok(())
    }

    async fn delete_family(&self, family: &str) -> Result<u64> {
        let mut deleted = 0u64;
        for (key, value) in self.kv.scan_prefix("oauth:refresh:").await? {
            let stored: StoredRefreshToken = decode(value)?;
            if stored.token.family == family {
                self.kv.delete(&key).await?;
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn delete_for_client(&self, client_id: &str) -> Result<u64> {
        let mut deleted = 0u64;
        for (key, value) in self.kv.scan_prefix("oauth:refresh:").await? {
            let stored: StoredRefreshToken = decode(value)?;
            if stored.token.client_id == client_id {
                self.kv.delete(&key).await?;
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn revoke_family(&self, family: &str) -> Result<()> {
        let revoked = self.kv.scan_prefix("oauth:family:").await?;
        if revoked.len() >= self.high_water {
            // Discard the oldest half; their refresh TTLs are long expired.
            let mut entries: Vec<(String, i64)> = revoked
                .iter()
                .map(|(key, value)| (key.clone(), value.as_i64().unwrap_or(0)))
                .collect();
            entries.sort_by_key(|(_, at)| *at);
            for (key, _) in entries.iter().take(entries.len() / 2) {
                self.kv.delete(key).await?;
            }
        }
        self.kv
            .put(
                &Self::family_key(family),
                Value::from(chrono::Utc::now().timestamp_millis()),
            )
            .await
    }

    async fn is_family_revoked(&self, family: &str) -> Result<bool> {
        Ok(self.kv.get(&Self::family_key(family)).await?.is_some())
    }

    async fn purge_expired(&self, now_ms: i64) -> Result<u64> {
        let mut purged = 0u64;
        for (key, value) in self.kv.scan_prefix("oauth:refresh:").await? {
            let stored: StoredRefreshToken = decode(value)?;
            if stored.token.expires_at <= now_ms {
                self.kv.delete(&key).await?;
                purged += 1;
            }
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryKeyValueStore;
    use std::collections::BTreeSet;

    fn refresh_token(token: &str, family: &str, expires_at: i64) -> RefreshToken {
        RefreshToken {
            token: token.to_string(),
            client_id: "c1".to_string(),
            user_id: "u1".to_string(),
            scope: BTreeSet::from(["read".to_string()]),
            expires_at,
            rotation_counter: 0,
            family: family.to_string(),
        }
    }

    #[tokio::test]
    async fn code_take_is_single_use() {
        let store = InMemoryCodeStore::new();
        store
            .insert(AuthorizationCode {
                code: "k1".to_string(),
                client_id: "c1".to_string(),
                redirect_uri: "https://x/cb".to_string(),
                scope: BTreeSet::new(),
                code_challenge: "ch".to_string(),
                expires_at: 60_000,
                user_id: "u1".to_string(),
                nonce: None,
                dpop_key_thumbprint: None,
            })
            .await
            .unwrap();

        assert!(store.take("k1").await.unwrap().is_some());
        assert!(store.take("k1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rotated_tokens_stay_on_record() {
        let store = InMemoryRefreshTokenStore::new(100);
        store.insert(refresh_token("r1", "f1", 1_000)).await.unwrap();
        store.mark_rotated("r1").await.unwrap();

        let stored = store.get("r1").await.unwrap().unwrap();
        assert!(stored.rotated);
        assert_eq!(stored.token.family, "f1");
    }

    #[tokio::test]
    async fn family_revocation_is_sticky_and_bounded() {
        let store = InMemoryRefreshTokenStore::new(4);
        for i in 0..5 {
            store.revoke_family(&format!("f{}", i)).await.unwrap();
        }
        // Above the mark the oldest half was discarded; the newest survive.
        assert!(store.is_family_revoked("f4").await.unwrap());
        assert!(!store.is_family_revoked("f0").await.unwrap());
    }

    #[tokio::test]
    async fn purge_drops_expired_tokens() {
        let store = InMemoryRefreshTokenStore::new(100);
        store.insert(refresh_token("old", "f1", 100)).await.unwrap();
        store.insert(refresh_token("new", "f1", 10_000)).await.unwrap();

        assert_eq!(store.purge_expired(5_000).await.unwrap(), 1);
        assert!(store.get("old").await.unwrap().is_none());
        assert!(store.get("new").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn kv_refresh_store_roundtrip() {
        let kv = Arc::new(InMemoryKeyValueStore::new());
        let store = KvRefreshTokenStore::new(kv, 100);

        store.insert(refresh_token("r1", "f1", 10_000)).await.unwrap();
        store.mark_rotated("r1").await.unwrap();
        assert!(store.get("r1").await.unwrap().unwrap().rotated);

        store.revoke_family("f1").await.unwrap();
        assert!(store.is_family_revoked("f1").await.unwrap());
        assert!(!store.is_family_revoked("f2").await.unwrap());

        assert_eq!(store.delete_family("f1").await.unwrap(), 1);
        assert!(store.get("r1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn kv_access_store_deletes_per_client() {
        let kv = Arc::new(InMemoryKeyValueStore::new());
        let store = KvAccessTokenStore::new(kv);

        for (token, client) in [("a1", "c1"), ("a2", "c1"), ("a3", "c2")] {
            store
                .insert(AccessToken {
                    token: token.to_string(),
                    token_type: super::super::model::TokenType::Bearer,
                    client_id: client.to_string(),
                    user_id: "u".to_string(),
                    scope: BTreeSet::new(),
                    issued_at: 0,
                    expires_at: 10_000,
                    dpop_key_thumbprint: None,
                })
                .await
                .unwrap();
        }

        assert_eq!(store.delete_for_client("c1").await.unwrap(), 2);
        assert!(store.get("a1").await.unwrap().is_none());
        assert!(store.get("a3").await.unwrap().is_some());
    }
}
