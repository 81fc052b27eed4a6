//! SQLite-backed persistence hooks.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Row, SqlitePool,
};
use std::path::Path;
use tracing::warn;

use crate::{
    audit::AuditEntry,
    errors::ControlResult,
    ids::ChannelId,
    model::{BanRecord, ChannelInfo},
    store::{PersistedState, StoreHooks},
};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS channels (
    id         INTEGER PRIMARY KEY,
    name       TEXT NOT NULL,
    max_users  INTEGER
);
CREATE TABLE IF NOT EXISTS settings (
    key    TEXT PRIMARY KEY,
    value  TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS bans (
    username    TEXT PRIMARY KEY,
    ip          TEXT,
    reason      TEXT NOT NULL,
    banned_by   TEXT NOT NULL,
    expires_at  TEXT
);
CREATE TABLE IF NOT EXISTS audit_log (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    actor       TEXT NOT NULL,
    action      TEXT NOT NULL,
    target      TEXT NOT NULL,
    context     TEXT NOT NULL,
    created_at  TEXT NOT NULL
);
";

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn open(path: impl AsRef<Path>) -> ControlResult<Self> {
        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        // SQLite is single-writer; one pooled connection also keeps
        // `:memory:` databases coherent.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl StoreHooks for SqliteStore {
    async fn load(&self) -> ControlResult<PersistedState> {
        let server_name: Option<String> =
            sqlx::query("SELECT value FROM settings WHERE key = 'server_name'")
                .fetch_optional(&self.pool)
                .await?
                .map(|row| row.get::<String, _>("value"));

        let channels = sqlx::query("SELECT id, name, max_users FROM channels ORDER BY id")
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(|row| ChannelInfo {
                id: ChannelId(row.get::<i64, _>("id") as u64),
                name: row.get("name"),
                max_users: row.get::<Option<i64>, _>("max_users").map(|n| n as u32),
            })
            .collect();

        let bans = sqlx::query("SELECT username, ip, reason, banned_by, expires_at FROM bans")
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .filter_map(|row| {
                let ip = match row.get::<Option<String>, _>("ip") {
                    Some(raw) => match raw.parse() {
                        Ok(ip) => Some(ip),
                        Err(_) => {
                            warn!(ip = %raw, "skipping ban row with unparseable ip");
                            return None;
                        }
                    },
                    None => None,
                };
                Some(BanRecord {
                    username: row.get("username"),
                    ip,
                    reason: row.get("reason"),
                    banned_by: row.get("banned_by"),
                    expires_at: row
                        .get::<Option<String>, _>("expires_at")
                        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                        .map(|t| t.with_timezone(&Utc)),
                })
            })
            .collect();

        Ok(PersistedState {
            server_name,
            channels,
            bans,
        })
    }

    async fn create_channel(&self, ch: &ChannelInfo) -> ControlResult<()> {
        sqlx::query("INSERT OR REPLACE INTO channels (id, name, max_users) VALUES (?, ?, ?)")
            .bind(ch.id.0 as i64)
            .bind(&ch.name)
            .bind(ch.max_users.map(|n| n as i64))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn rename_channel(&self, id: ChannelId, name: &str) -> ControlResult<()> {
        sqlx::query("UPDATE channels SET name = ? WHERE id = ?")
            .bind(name)
            .bind(id.0 as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_channel(&self, id: ChannelId) -> ControlResult<()> {
        sqlx::query("DELETE FROM channels WHERE id = ?")
            .bind(id.0 as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn persist_server_name(&self, name: &str) -> ControlResult<()> {
        sqlx::query("INSERT OR REPLACE INTO settings (key, value) VALUES ('server_name', ?)")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_ban(&self, ban: &BanRecord) -> ControlResult<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO bans (username, ip, reason, banned_by, expires_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&ban.username)
        .bind(ban.ip.map(|ip| ip.to_string()))
        .bind(&ban.reason)
        .bind(&ban.banned_by)
        .bind(ban.expires_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove_ban(&self, username: &str) -> ControlResult<()> {
        sqlx::query("DELETE FROM bans WHERE username = ? COLLATE NOCASE")
            .bind(username)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_audit(&self, entry: &AuditEntry) -> ControlResult<()> {
        sqlx::query(
            "INSERT INTO audit_log (actor, action, target, context, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&entry.actor)
        .bind(&entry.action)
        .bind(&entry.target)
        .bind(entry.context.to_string())
        .bind(entry.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
