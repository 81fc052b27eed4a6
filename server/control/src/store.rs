//! Persistence hooks.
//!
//! In-memory room state is the source of truth; these hooks mirror the
//! durable subset (channels, server name, bans, audit log) out to storage.
//! Callers log hook failures and carry on.

use async_trait::async_trait;

use crate::{
    audit::AuditEntry,
    errors::ControlResult,
    ids::ChannelId,
    model::{BanRecord, ChannelInfo},
};

/// Durable state loaded at boot to seed the room.
#[derive(Clone, Debug, Default)]
pub struct PersistedState {
    pub server_name: Option<String>,
    pub channels: Vec<ChannelInfo>,
    pub bans: Vec<BanRecord>,
}

#[async_trait]
pub trait StoreHooks: Send + Sync {
    async fn load(&self) -> ControlResult<PersistedState>;

    async fn create_channel(&self, ch: &ChannelInfo) -> ControlResult<()>;
    async fn rename_channel(&self, id: ChannelId, name: &str) -> ControlResult<()>;
    async fn delete_channel(&self, id: ChannelId) -> ControlResult<()>;

    async fn persist_server_name(&self, name: &str) -> ControlResult<()>;

    async fn record_ban(&self, ban: &BanRecord) -> ControlResult<()>;
    async fn remove_ban(&self, username: &str) -> ControlResult<()>;

    async fn record_audit(&self, entry: &AuditEntry) -> ControlResult<()>;
}

/// No-op hooks for tests and ephemeral deployments.
pub struct NullStore;

#[async_trait]
impl StoreHooks for NullStore {
    async fn load(&self) -> ControlResult<PersistedState> {
        Ok(PersistedState::default())
    }

    async fn create_channel(&self, _ch: &ChannelInfo) -> ControlResult<()> {
        Ok(())
    }

    async fn rename_channel(&self, _id: ChannelId, _name: &str) -> ControlResult<()> {
        Ok(())
    }

    async fn delete_channel(&self, _id: ChannelId) -> ControlResult<()> {
        Ok(())
    }

    async fn persist_server_name(&self, _name: &str) -> ControlResult<()> {
        Ok(())
    }

    async fn record_ban(&self, _ban: &BanRecord) -> ControlResult<()> {
        Ok(())
    }

    async fn remove_ban(&self, _username: &str) -> ControlResult<()> {
        Ok(())
    }

    async fn record_audit(&self, _entry: &AuditEntry) -> ControlResult<()> {
        Ok(())
    }
}
