use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use sqlx::{sqlite::SqliteRow, Row};
use tally_core::domain::answer::Answer;
use tally_core::domain::session::{Exchange, Session, SessionId, SessionKey};

use super::{RepositoryError, SessionRepository};
use crate::DbPool;

pub struct SqlSessionRepository {
    pool: DbPool,
}

impl SqlSessionRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn load_exchanges(&self, key: &SessionKey) -> Result<Vec<Exchange>, RepositoryError> {
        let rows = sqlx::query(
            r#"
            SELECT question, sql_text, answer_json, recorded_at
            FROM session_exchange
            WHERE app_name = ? AND user_id = ? AND session_id = ?
            ORDER BY sequence ASC
            "#,
        )
        .bind(&key.app_name)
        .bind(&key.user_id)
        .bind(key.session_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(exchange_from_row).collect()
    }
}

#[async_trait]
impl SessionRepository for SqlSessionRepository {
    async fn create(
        &self,
        key: SessionKey,
        state: Map<String, Value>,
    ) -> Result<Session, RepositoryError> {
        let session = Session::new(key, state);
        let state_json = encode_json("state_json", &session.state)?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO session (id, app_name, user_id, state_json, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(session.id.as_str())
        .bind(&session.app_name)
        .bind(&session.user_id)
        .bind(state_json)
        .bind(format_timestamp(&session.created_at))
        .bind(format_timestamp(&session.updated_at))
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => Ok(session),
            Err(sqlx::Error::Database(error)) if error.is_unique_violation() => {
                Err(RepositoryError::Conflict(session.id.0))
            }
            Err(error) => Err(error.into()),
        }
    }

    async fn get(&self, key: &SessionKey) -> Result<Option<Session>, RepositoryError> {
        let row = sqlx::query(
            r#"
            SELECT id, app_name, user_id, state_json, created_at, updated_at
            FROM session
            WHERE app_name = ? AND user_id = ? AND id = ?
            "#,
        )
        .bind(&key.app_name)
        .bind(&key.user_id)
        .bind(key.session_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut session = session_from_row(row)?;
        session.exchanges = self.load_exchanges(key).await?;
        Ok(Some(session))
    }

    async fn list(&self, app_name: &str, user_id: &str) -> Result<Vec<Session>, RepositoryError> {
        let rows = sqlx::query(
            r#"
            SELECT id, app_name, user_id, state_json, created_at, updated_at
            FROM session
            WHERE app_name = ? AND user_id = ?
            ORDER BY updated_at DESC, id ASC
            "#,
        )
        .bind(app_name)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(session_from_row).collect()
    }

    async fn delete(&self, key: &SessionKey) -> Result<bool, RepositoryError> {
        let result =
            sqlx::query("DELETE FROM session WHERE app_name = ? AND user_id = ? AND id = ?")
                .bind(&key.app_name)
                .bind(&key.user_id)
                .bind(key.session_id.as_str())
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn append_exchange(
        &self,
        key: &SessionKey,
        exchange: Exchange,
    ) -> Result<(), RepositoryError> {
        let answer_json = encode_json("answer_json", &exchange.answer)?;
        let recorded_at = format_timestamp(&exchange.recorded_at);
        let mut tx = self.pool.begin().await?;

        let touched = sqlx::query(
            "UPDATE session SET updated_at = ? WHERE app_name = ? AND user_id = ? AND id = ?",
        )
        .bind(&recorded_at)
        .bind(&key.app_name)
        .bind(&key.user_id)
        .bind(key.session_id.as_str())
        .execute(&mut *tx)
        .await?;
        if touched.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(key.session_id.0.clone()));
        }

        sqlx::query(
            r#"
            INSERT INTO session_exchange (
                app_name, user_id, session_id, sequence,
                question, sql_text, answer_json, recorded_at
            )
            SELECT ?, ?, ?, COALESCE(MAX(sequence), 0) + 1, ?, ?, ?, ?
            FROM session_exchange
            WHERE app_name = ? AND user_id = ? AND session_id = ?
            "#,
        )
        .bind(&key.app_name)
        .bind(&key.user_id)
        .bind(key.session_id.as_str())
        .bind(&exchange.question)
        .bind(&exchange.sql)
        .bind(answer_json)
        .bind(&recorded_at)
        .bind(&key.app_name)
        .bind(&key.user_id)
        .bind(key.session_id.as_str())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), RepositoryError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

fn session_from_row(row: SqliteRow) -> Result<Session, RepositoryError> {
    let state_json: String = row.try_get("state_json")?;
    let state: Map<String, Value> = serde_json::from_str(&state_json)
        .map_err(|error| RepositoryError::Decode(format!("invalid state_json: {error}")))?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;

    Ok(Session {
        id: SessionId(row.try_get("id")?),
        app_name: row.try_get("app_name")?,
        user_id: row.try_get("user_id")?,
        state,
        exchanges: Vec::new(),
        created_at: parse_timestamp("created_at", &created_at)?,
        updated_at: parse_timestamp("updated_at", &updated_at)?,
    })
}

fn exchange_from_row(row: SqliteRow) -> Result<Exchange, RepositoryError> {
    let answer_json: String = row.try_get("answer_json")?;
    let answer: Answer = serde_json::from_str(&answer_json)
        .map_err(|error| RepositoryError::Decode(format!("invalid answer_json: {error}")))?;
    let recorded_at: String = row.try_get("recorded_at")?;

    Ok(Exchange {
        question: row.try_get("question")?,
        sql: row.try_get("sql_text")?,
        answer,
        recorded_at: parse_timestamp("recorded_at", &recorded_at)?,
    })
}

fn encode_json<T: serde::Serialize>(column: &str, value: &T) -> Result<String, RepositoryError> {
    serde_json::to_string(value)
        .map_err(|error| RepositoryError::Decode(format!("cannot encode {column}: {error}")))
}

/// Fixed-width UTC so lexical order matches chronological order.
fn format_timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(column: &str, value: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(value)
        .map(|timestamp| timestamp.with_timezone(&Utc))
        .map_err(|error| RepositoryError::Decode(format!("invalid {column} `{value}`: {error}")))
}
