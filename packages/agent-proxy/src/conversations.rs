//! In-memory conversation registry and token lifecycle for the polling
//! backend.
//!
//! Records are held behind per-conversation async locks so that "ensure the
//! token is fresh, then act" runs as one critical section. Two requests on
//! the same conversation serialize; requests on different conversations
//! never contend.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use agent_proxy_directline::{DirectLineClient, DirectLineError};
use tokio::sync::Mutex;
use tracing::debug;

/// Refresh when less than this much lifetime remains.
const REFRESH_MARGIN: Duration = Duration::from_secs(60);
/// Lifetime assumed when the backend omits `expires_in`.
const DEFAULT_EXPIRY_SECS: i64 = 1800;

#[derive(Debug, Clone)]
pub struct ConversationRecord {
    pub id: String,
    pub plugin_id: Option<String>,
    pub token: String,
    pub expires_at: Instant,
    pub endpoint: String,
    pub user_id: String,
    pub bot_id: Option<String>,
    pub stream_url: Option<String>,
    pub watermark: Option<String>,
    pub delivered: HashSet<String>,
    pub created_at: Instant,
}

impl ConversationRecord {
    pub fn new(
        id: String,
        plugin_id: Option<String>,
        token: String,
        expires_in: Option<i64>,
        endpoint: String,
        user_id: String,
        bot_id: Option<String>,
        stream_url: Option<String>,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            plugin_id,
            token,
            expires_at: now + token_lifetime(expires_in),
            endpoint,
            user_id,
            bot_id,
            stream_url,
            watermark: None,
            delivered: HashSet::new(),
            created_at: now,
        }
    }

    fn set_expiry(&mut self, expires_in: Option<i64>) {
        self.expires_at = Instant::now() + token_lifetime(expires_in);
    }
}

/// Safe local lifetime for a server-reported expiry: shave 30 seconds so we
/// refresh before the backend cuts us off, floor at 30 so a tiny expiry
/// cannot produce a refresh storm.
pub fn token_lifetime(expires_in: Option<i64>) -> Duration {
    let seconds = expires_in.unwrap_or(DEFAULT_EXPIRY_SECS);
    Duration::from_secs(seconds.saturating_sub(30).max(30) as u64)
}

#[derive(Debug, Default)]
pub struct ConversationStore {
    records: std::sync::Mutex<HashMap<String, Arc<Mutex<ConversationRecord>>>>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: ConversationRecord) {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.insert(record.id.clone(), Arc::new(Mutex::new(record)));
    }

    pub fn contains(&self, id: &str) -> bool {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.contains_key(id)
    }

    /// Handle to the record's lock, if the conversation exists.
    pub fn get(&self, id: &str) -> Option<Arc<Mutex<ConversationRecord>>> {
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.get(id).cloned()
    }

    pub async fn snapshot(&self, id: &str) -> Option<ConversationRecord> {
        let handle = self.get(id)?;
        let record = handle.lock().await;
        Some(record.clone())
    }

    /// Remove a conversation. Deleting an absent id is not an error.
    pub fn remove(&self, id: &str) -> bool {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.remove(id).is_some()
    }
}

/// Return a token with at least the refresh margin of lifetime left,
/// refreshing through the backend if needed. Must be called with the
/// record's lock held (the `&mut` enforces it); a failed refresh leaves
/// the record untouched.
pub async fn ensure_token(
    client: &DirectLineClient,
    record: &mut ConversationRecord,
) -> Result<(), DirectLineError> {
    let remaining = record.expires_at.saturating_duration_since(Instant::now());
    if remaining > REFRESH_MARGIN {
        return Ok(());
    }
    let refreshed = client.refresh_token(&record.endpoint, &record.token).await?;
    if let Some(token) = refreshed.token {
        record.token = token;
    }
    record.set_expiry(refreshed.expires_in);
    debug!(conversation_id = %record.id, "refreshed transport token");
    Ok(())
}
