use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{Pool, Sqlite, sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteRow, SqliteSynchronous}, Row};
use uuid::Uuid;

use crate::catalog::{AgentCatalog, AgentDefinition, AgentType};
use crate::session::{AgentSession, ChatMessage, SessionStatus};

/// Durable session metadata. The transcript lives in [`ConversationStore`].
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, id: Uuid) -> anyhow::Result<Option<AgentSession>>;
    async fn get_by_user(&self, user_id: &str) -> anyhow::Result<Vec<AgentSession>>;
    /// Inserts the session, or refreshes status and last activity if it already exists.
    async fn save(&self, session: &AgentSession) -> anyhow::Result<()>;
    async fn update_status(&self, id: Uuid, status: SessionStatus) -> anyhow::Result<()>;
    async fn delete(&self, id: Uuid) -> anyhow::Result<()>;
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn append(&self, session_id: Uuid, message: &ChatMessage) -> anyhow::Result<()>;
    async fn get_all(&self, session_id: Uuid) -> anyhow::Result<Vec<ChatMessage>>;
    async fn delete_all(&self, session_id: Uuid) -> anyhow::Result<()>;
}

#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool<Sqlite>,
    catalog: Arc<AgentCatalog>,
}

impl SqliteStore {
    pub async fn initialize(database_url: Option<String>, catalog: Arc<AgentCatalog>) -> anyhow::Result<Self> {
        let url = match database_url {
            Some(u) => u,
            None => resolve_default_db_url()?,
        };
        let options = url.parse::<SqliteConnectOptions>()?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full);
        let pool = Pool::<Sqlite>::connect_with(options).await?;
        sqlx::query("PRAGMA busy_timeout = 5000;").execute(&pool).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        tracing::info!(url = %url, "session store ready");
        Ok(Self { pool, catalog })
    }

    #[cfg(test)]
    pub fn pool(&self) -> &Pool<Sqlite> { &self.pool }

    /// Rebuilds a session row, re-resolving its agent from the catalog and falling
    /// back to the stored name and prompt if the type is no longer there.
    fn session_from_row(&self, r: &SqliteRow, messages: Vec<ChatMessage>) -> anyhow::Result<AgentSession> {
        let id: String = r.get("id");
        let agent_type: AgentType = r.get::<String, _>("agent_type").parse()?;
        let agent = match self.catalog.get(agent_type) {
            Some(def) => def.clone(),
            None => {
                let name: String = r.get("agent_name");
                let prompt: String = r.get("system_prompt");
                AgentDefinition::new(&agent_type.as_str().to_lowercase(), &name, agent_type, &name, &prompt)
            }
        };
        Ok(AgentSession {
            id: Uuid::parse_str(&id)?,
            user_id: r.get("user_id"),
            agent_type,
            agent,
            status: r.get::<String, _>("status").parse()?,
            messages,
            created_at: parse_ts(&r.get::<String, _>("created_at"))?,
            last_activity_at: parse_ts(&r.get::<String, _>("last_activity_at"))?,
        })
    }
}

fn resolve_default_db_url() -> anyhow::Result<String> {
    let base = std::env::var("XDG_DATA_HOME").ok().map(PathBuf::from).unwrap_or_else(|| {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".into());
        PathBuf::from(home).join(".local").join("share")
    });
    let dir = base.join("ops_hub");
    std::fs::create_dir_all(&dir)?;
    let path = dir.join("ops_hub.db");
    Ok(format!("sqlite://{}", path.to_string_lossy()))
}

/// Fixed-width UTC timestamps, so text ordering in SQL matches time ordering.
fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> anyhow::Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)?.with_timezone(&Utc))
}

fn message_from_row(m: &SqliteRow) -> anyhow::Result<ChatMessage> {
    let id: String = m.get("id");
    Ok(ChatMessage {
        id: Uuid::parse_str(&id)?,
        role: m.get::<String, _>("role").parse()?,
        content: m.get("content"),
        created_at: parse_ts(&m.get::<String, _>("created_at"))?,
        tool_call_id: m.get("tool_call_id"),
        tool_name: m.get("tool_name"),
    })
}

const SESSION_COLUMNS: &str = "id, user_id, agent_type, agent_name, system_prompt, status, created_at, last_activity_at";

#[async_trait]
impl SessionStore for SqliteStore {
    async fn get(&self, id: Uuid) -> anyhow::Result<Option<AgentSession>> {
        let row = sqlx::query(&format!("SELECT {} FROM sessions WHERE id = ?1", SESSION_COLUMNS))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        let Some(r) = row else { return Ok(None) };
        let messages = self.get_all(id).await?;
        Ok(Some(self.session_from_row(&r, messages)?))
    }

    async fn get_by_user(&self, user_id: &str) -> anyhow::Result<Vec<AgentSession>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM sessions WHERE user_id = ?1 ORDER BY last_activity_at DESC",
            SESSION_COLUMNS
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        let mut sessions = Vec::with_capacity(rows.len());
        for r in rows {
            let id = Uuid::parse_str(&r.get::<String, _>("id"))?;
            let messages = self.get_all(id).await?;
            sessions.push(self.session_from_row(&r, messages)?);
        }
        Ok(sessions)
    }

    async fn save(&self, session: &AgentSession) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO sessions (id, user_id, agent_type, agent_name, system_prompt, status, created_at, last_activity_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET status = excluded.status, last_activity_at = excluded.last_activity_at",
        )
        .bind(session.id.to_string())
        .bind(&session.user_id)
        .bind(session.agent_type.as_str())
        .bind(&session.agent.name)
        .bind(&session.agent.system_prompt)
        .bind(session.status.as_str())
        .bind(format_ts(&session.created_at))
        .bind(format_ts(&session.last_activity_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_status(&self, id: Uuid, status: SessionStatus) -> anyhow::Result<()> {
        sqlx::query("UPDATE sessions SET status = ?1, last_activity_at = ?2 WHERE id = ?3")
            .bind(status.as_str())
            .bind(format_ts(&Utc::now()))
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM messages WHERE session_id = ?1")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM sessions WHERE id = ?1")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl ConversationStore for SqliteStore {
    async fn append(&self, session_id: Uuid, message: &ChatMessage) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO messages (id, session_id, seq, role, content, tool_call_id, tool_name, created_at)
             VALUES (?1, ?2, (SELECT COALESCE(MAX(seq), 0) + 1 FROM messages WHERE session_id = ?2), ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(message.id.to_string())
        .bind(session_id.to_string())
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(&message.tool_call_id)
        .bind(&message.tool_name)
        .bind(format_ts(&message.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_all(&self, session_id: Uuid) -> anyhow::Result<Vec<ChatMessage>> {
        let rows = sqlx::query(
            "SELECT id, role, content, tool_call_id, tool_name, created_at FROM messages WHERE session_id = ?1 ORDER BY seq ASC",
        )
        .bind(session_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(message_from_row).collect()
    }

    async fn delete_all(&self, session_id: Uuid) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM messages WHERE session_id = ?1")
            .bind(session_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
