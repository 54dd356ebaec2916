use anyhow::Context;

use crate::{
    data::{self, Storage},
    session::SessionUser,
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("username and password required")]
    MissingCredentials,

    #[error("username already exists")]
    UsernameTaken,

    // Same message for unknown user and wrong password.
    #[error("invalid credentials")]
    InvalidCredentials,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq)]
pub struct Me {
    pub user: SessionUser,
    pub used_today: u32,
}

#[must_use]
pub fn normalize_username(username: &str) -> String {
    username.trim().to_lowercase()
}

pub async fn hash_password(password: &str, cost: u32) -> anyhow::Result<String> {
    let password = password.to_string();
    tokio::task::spawn_blocking(move || bcrypt::hash(password, cost))
        .await?
        .context("Failed to hash password")
}

pub async fn verify_password(password: &str, hash: &str) -> anyhow::Result<bool> {
    let password = password.to_string();
    let hash = hash.to_string();
    tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash))
        .await?
        .context("Failed to verify password hash")
}

#[tracing::instrument(skip(storage, password))]
pub async fn signup(
    storage: &Storage,
    bcrypt_cost: u32,
    username: &str,
    password: &str,
) -> Result<data::User> {
    let username = normalize_username(username);
    if username.is_empty() || password.is_empty() {
        return Err(Error::MissingCredentials);
    }
    let password_hash = hash_password(password, bcrypt_cost).await?;
    match storage.user_insert(&username, &password_hash).await? {
        Some(user) => {
            tracing::info!(user_id = user.id, "Signed up.");
            Ok(user)
        }
        None => {
            tracing::debug!("Username taken.");
            Err(Error::UsernameTaken)
        }
    }
}

/// Checks the credentials. The caller binds the returned user to a session.
#[tracing::instrument(skip(storage, password))]
pub async fn login(
    storage: &Storage,
    username: &str,
    password: &str,
) -> Result<SessionUser> {
    let username = normalize_username(username);
    if username.is_empty() || password.is_empty() {
        return Err(Error::MissingCredentials);
    }
    let Some(user) = storage.user_by_username(&username).await? else {
        tracing::warn!("Login for unknown user.");
        return Err(Error::InvalidCredentials);
    };
    if !verify_password(password, &user.password_hash).await? {
        tracing::warn!(user_id = user.id, "Login with wrong password.");
        return Err(Error::InvalidCredentials);
    }
    tracing::info!(user_id = user.id, "Logged in.");
    Ok(SessionUser {
        user_id: user.id,
        username: user.username,
    })
}

/// `None` when there is no session user, or that user no longer exists.
pub async fn current_user(
    storage: &Storage,
    user: Option<SessionUser>,
) -> anyhow::Result<Option<Me>> {
    let Some(user) = user else {
        return Ok(None);
    };
    if storage.user_by_id(user.user_id).await?.is_none() {
        return Ok(None);
    }
    let used_today = storage.usage_count(user.user_id, data::today()).await?;
    Ok(Some(Me { user, used_today }))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::data::Storage;

    use super::*;

    const COST: u32 = 4;

    async fn storage(dir: &tempfile::TempDir) -> Storage {
        let url = format!("sqlite://{}", dir.path().join("test.db").display());
        Storage::connect(&url, Duration::from_secs(5)).await.unwrap()
    }

    #[test]
    fn normalize() {
        assert_eq!(normalize_username("  Alice \n"), "alice");
        assert_eq!(normalize_username("   "), "");
    }

    #[tokio::test]
    async fn password_hash_and_verify() {
        let hash = hash_password("hunter2", COST).await.unwrap();
        assert_ne!(hash, "hunter2");
        assert!(verify_password("hunter2", &hash).await.unwrap());
        assert!(!verify_password("hunter3", &hash).await.unwrap());
    }

    #[tokio::test]
    async fn signup_normalizes_and_rejects_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(&dir).await;
        let user = signup(&storage, COST, " Alice ", "pw").await.unwrap();
        assert_eq!(user.username, "alice");

        let result = signup(&storage, COST, "ALICE", "other").await;
        assert!(matches!(result, Err(Error::UsernameTaken)));
    }

    #[tokio::test]
    async fn signup_requires_both_fields() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(&dir).await;
        assert!(matches!(
            signup(&storage, COST, "  ", "pw").await,
            Err(Error::MissingCredentials)
        ));
        assert!(matches!(
            signup(&storage, COST, "bob", "").await,
            Err(Error::MissingCredentials)
        ));
        assert!(storage.user_by_username("bob").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn login_checks_credentials() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(&dir).await;
        let alice = signup(&storage, COST, "alice", "right").await.unwrap();

        assert!(matches!(
            login(&storage, "alice", "wrong").await,
            Err(Error::InvalidCredentials)
        ));
        assert!(matches!(
            login(&storage, "nobody", "right").await,
            Err(Error::InvalidCredentials)
        ));
        assert!(matches!(
            login(&storage, " ", "right").await,
            Err(Error::MissingCredentials)
        ));

        let user = login(&storage, "ALICE", "right").await.unwrap();
        assert_eq!(
            user,
            SessionUser {
                user_id: alice.id,
                username: "alice".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn current_user_counts_today() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(&dir).await;
        signup(&storage, COST, "alice", "pw").await.unwrap();
        let user = login(&storage, "alice", "pw").await.unwrap();

        assert!(current_user(&storage, None).await.unwrap().is_none());
        storage
            .usage_reserve(user.user_id, data::today(), 5)
            .await
            .unwrap()
            .unwrap();
        let me = current_user(&storage, Some(user.clone()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(me, Me { user, used_today: 1 });

        let ghost = SessionUser {
            user_id: 999,
            username: "ghost".to_string(),
        };
        assert!(current_user(&storage, Some(ghost)).await.unwrap().is_none());
    }
}
