use std::{fs, str::FromStr, time::Duration};

use anyhow::Context;
use chrono::NaiveDate;
use sqlx::Executor;

const MIGRATIONS: [&str; 1] = [include_str!("../migrations/0_data.sql")];

type Tx<'a> = sqlx::Transaction<'a, sqlx::Sqlite>;

#[derive(sqlx::FromRow, Debug, Clone, PartialEq)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub password_hash: String,
}

/// A provisional usage increment, taken before calling the generator and
/// given back with [`Storage::usage_release`] if the call fails.
#[derive(Debug, Clone, PartialEq)]
pub struct Reservation {
    pub user_id: i64,
    pub date: NaiveDate,

    /// Usage count for `date`, including this reservation.
    pub count: u32,
}

/// Server-local calendar date. Daily limits reset when it changes.
#[must_use]
pub fn today() -> NaiveDate {
    chrono::Local::now().date_naive()
}

fn date_key(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

#[derive(Clone, Debug)]
pub struct Storage {
    pool: sqlx::Pool<sqlx::Sqlite>,
}

impl Storage {
    #[cfg(test)]
    pub(crate) async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn connect(
        database_url: &str,
        busy_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let options = sqlx::sqlite::SqliteConnectOptions::from_str(database_url)
            .context(format!("Invalid database URL: {database_url:?}"))?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(busy_timeout);
        let file_path = options.get_filename();
        if let Some(parent) = file_path.parent() {
            let ctx = format!(
                "Failed to create parent directory \
                for database file: {file_path:?}"
            );
            fs::create_dir_all(parent).context(ctx)?;
        }
        let pool = sqlx::SqlitePool::connect_with(options).await?;
        let selph = Self { pool };
        for migration in MIGRATIONS {
            selph.pool.execute(migration).await?;
        }
        Ok(selph)
    }

    /// Returns `None` when the username is already taken.
    pub async fn user_insert(
        &self,
        username: &str,
        password_hash: &str,
    ) -> anyhow::Result<Option<User>> {
        let result = sqlx::query_as::<_, User>(
            "INSERT INTO users (username, password_hash)
                VALUES (?, ?)
                RETURNING id, username, password_hash",
        )
        .bind(username)
        .bind(password_hash)
        .fetch_one(&self.pool)
        .await;
        match result {
            Ok(user) => Ok(Some(user)),
            Err(sqlx::Error::Database(error)) if error.is_unique_violation() => {
                Ok(None)
            }
            Err(error) => Err(error).context("Failed to insert user"),
        }
    }

    pub async fn user_by_username(
        &self,
        username: &str,
    ) -> anyhow::Result<Option<User>> {
        let user = sqlx::query_as(
            "SELECT id, username, password_hash FROM users WHERE username = ?",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    pub async fn user_by_id(&self, id: i64) -> anyhow::Result<Option<User>> {
        let user = sqlx::query_as(
            "SELECT id, username, password_hash FROM users WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    pub async fn usage_count(
        &self,
        user_id: i64,
        date: NaiveDate,
    ) -> anyhow::Result<u32> {
        let count: Option<i64> = sqlx::query_scalar(
            "SELECT count FROM daily_usage WHERE user_id = ? AND date = ?",
        )
        .bind(user_id)
        .bind(date_key(date))
        .fetch_optional(&self.pool)
        .await?;
        Ok(u32::try_from(count.unwrap_or(0))?)
    }

    /// Increments the usage for `date` if it is below `limit`. `None` means
    /// the limit is already reached and nothing changed.
    pub async fn usage_reserve(
        &self,
        user_id: i64,
        date: NaiveDate,
        limit: u32,
    ) -> anyhow::Result<Option<Reservation>> {
        let tx = self.pool.begin().await?;
        let (tx, count) = usage_reserve(tx, user_id, date, limit).await?;
        tx.commit().await?;
        Ok(count.map(|count| Reservation {
            user_id,
            date,
            count,
        }))
    }

    pub async fn usage_release(
        &self,
        reservation: &Reservation,
    ) -> anyhow::Result<()> {
        let tx = self.pool.begin().await?;
        let tx = usage_release(tx, reservation).await?;
        tx.commit().await?;
        Ok(())
    }
}

async fn usage_reserve<'a>(
    mut tx: Tx<'a>,
    user_id: i64,
    date: NaiveDate,
    limit: u32,
) -> anyhow::Result<(Tx<'a>, Option<u32>)> {
    let date = date_key(date);
    sqlx::query(
        "INSERT INTO daily_usage (user_id, date, count)
            VALUES (?, ?, 0)
            ON CONFLICT(user_id, date) DO NOTHING",
    )
    .bind(user_id)
    .bind(&date)
    .execute(&mut *tx)
    .await?;
    // Check and increment in one statement, so concurrent requests cannot
    // both slip under the limit.
    let count: Option<i64> = sqlx::query_scalar(
        "UPDATE daily_usage SET
            count = count + 1
            WHERE user_id = ? AND date = ? AND count < ?
            RETURNING count",
    )
    .bind(user_id)
    .bind(&date)
    .bind(i64::from(limit))
    .fetch_optional(&mut *tx)
    .await?;
    let count = count.map(u32::try_from).transpose()?;
    Ok((tx, count))
}

async fn usage_release<'a>(
    mut tx: Tx<'a>,
    reservation: &Reservation,
) -> anyhow::Result<Tx<'a>> {
    sqlx::query(
        "UPDATE daily_usage SET
            count = count - 1
            WHERE user_id = ? AND date = ? AND count > 0",
    )
    .bind(reservation.user_id)
    .bind(date_key(reservation.date))
    .execute(&mut *tx)
    .await?;
    Ok(tx)
}
