use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tower_sessions::{
    session::{Id, Record},
    session_store, ExpiredDeletion, Session, SessionStore,
};

const USER_KEY: &str = "user";

#[derive(serde::Serialize, serde::Deserialize, Debug, Clone, PartialEq)]
pub struct SessionUser {
    pub user_id: i64,
    pub username: String,
}

/// The logged-in user, if any.
pub async fn user(session: &Session) -> anyhow::Result<Option<SessionUser>> {
    session
        .get(USER_KEY)
        .await
        .context("Failed to read session")
}

/// Binds the session to `user` under a fresh id, so a token the client held
/// before stops working.
pub async fn begin(session: &Session, user: &SessionUser) -> anyhow::Result<()> {
    session.cycle_id().await.context("Failed to cycle session id")?;
    session
        .insert(USER_KEY, user)
        .await
        .context("Failed to write session")
}

pub async fn end(session: &Session) -> anyhow::Result<()> {
    session.flush().await.context("Failed to flush session")
}

/// Session records held in process memory. Lost on restart.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    records: Arc<Mutex<HashMap<Id, Record>>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records held, expired or not.
    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Runs forever, dropping expired records every `period`.
    pub async fn sweep_every(self, period: Duration) {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            if let Err(error) = self.delete_expired().await {
                tracing::error!(?error, "Failed to sweep expired sessions.");
            }
        }
    }
}

fn is_live(record: &Record) -> bool {
    record.expiry_date > OffsetDateTime::now_utc()
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn create(&self, record: &mut Record) -> session_store::Result<()> {
        let mut records = self.records.lock().await;
        while records.contains_key(&record.id) {
            record.id = Id::default();
        }
        records.insert(record.id, record.clone());
        Ok(())
    }

    async fn save(&self, record: &Record) -> session_store::Result<()> {
        self.records.lock().await.insert(record.id, record.clone());
        Ok(())
    }

    async fn load(&self, session_id: &Id) -> session_store::Result<Option<Record>> {
        let records = self.records.lock().await;
        Ok(records.get(session_id).filter(|r| is_live(r)).cloned())
    }

    async fn delete(&self, session_id: &Id) -> session_store::Result<()> {
        self.records.lock().await.remove(session_id);
        Ok(())
    }
}

#[async_trait]
impl ExpiredDeletion for MemoryStore {
    async fn delete_expired(&self) -> session_store::Result<()> {
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|_, record| is_live(record));
        let swept = before - records.len();
        if swept > 0 {
            tracing::debug!(swept, "Expired sessions dropped.");
        }
        Ok(())
    }
}
