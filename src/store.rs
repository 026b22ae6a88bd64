//! Workspace Store (C9): durable index of Workspace Records keyed by
//! workspace id, plus secondary indexes by user, session, status, and
//! server. No secondary index may go stale across a crash — all of them
//! are rebuildable from the primary record set via `rebuild_indexes`.

use redis::AsyncCommands;

use crate::error::AnyError;
use crate::types::{WorkspaceId, WorkspaceRecord, WorkspaceStatus};

#[derive(Clone)]
pub struct WorkspaceStore {
    redis: redis::Client,
}

fn primary_key(id: &str) -> String {
    format!("ws:{id}")
}

fn status_tag(status: WorkspaceStatus) -> &'static str {
    match status {
        WorkspaceStatus::Creating => "CREATING",
        WorkspaceStatus::Running => "RUNNING",
        WorkspaceStatus::Stopped => "STOPPED",
        WorkspaceStatus::Error => "ERROR",
        WorkspaceStatus::Deleting => "DELETING",
    }
}

impl WorkspaceStore {
    pub fn new(redis: redis::Client) -> Self {
        WorkspaceStore { redis }
    }

    async fn conn(&self) -> Result<redis::aio::MultiplexedConnection, AnyError> {
        Ok(self.redis.get_multiplexed_async_connection().await?)
    }

    pub async fn get(&self, id: &WorkspaceId) -> Result<Option<WorkspaceRecord>, AnyError> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = conn.get(primary_key(id)).await?;
        Ok(match raw {
            Some(raw) => Some(serde_json::from_str(&raw)?),
            None => None,
        })
    }

    /// Idempotent upsert. Removes the record from any secondary index
    /// it used to belong to before it's a durable write is considered
    /// complete, so indexes never accumulate stale entries for a record
    /// that changed user/session/server/status.
    pub async fn save(&self, record: &WorkspaceRecord) -> Result<(), AnyError> {
        let mut conn = self.conn().await?;
        let previous = self.get(&record.id).await?;

        let mut pipe = redis::pipe();
        pipe.atomic();

        if let Some(prev) = &previous {
            pipe.srem(format!("ws_by_user:{}", prev.owner_user_id), &prev.id)
                .ignore();
            pipe.srem(format!("ws_by_session:{}", prev.owner_session_id), &prev.id)
                .ignore();
            if let Some(server_id) = &prev.assigned.server_id {
                pipe.srem(format!("ws_by_server:{}", server_id), &prev.id).ignore();
            }
            pipe.srem(format!("ws_by_status:{}", status_tag(prev.status)), &prev.id)
                .ignore();
        }

        let raw = serde_json::to_string(record)?;
        pipe.set(primary_key(&record.id), raw).ignore();
        pipe.sadd(format!("ws_by_user:{}", record.owner_user_id), &record.id)
            .ignore();
        pipe.sadd(format!("ws_by_session:{}", record.owner_session_id), &record.id)
            .ignore();
        if let Some(server_id) = &record.assigned.server_id {
            pipe.sadd(format!("ws_by_server:{}", server_id), &record.id).ignore();
        }
        pipe.sadd(format!("ws_by_status:{}", status_tag(record.status)), &record.id)
            .ignore();

        pipe.query_async(&mut conn).await?;
        Ok(())
    }

    pub async fn delete(&self, id: &WorkspaceId) -> Result<(), AnyError> {
        let mut conn = self.conn().await?;
        if let Some(prev) = self.get(id).await? {
            let mut pipe = redis::pipe();
            pipe.atomic();
            pipe.del(primary_key(id)).ignore();
            pipe.srem(format!("ws_by_user:{}", prev.owner_user_id), id).ignore();
            pipe.srem(format!("ws_by_session:{}", prev.owner_session_id), id).ignore();
            if let Some(server_id) = &prev.assigned.server_id {
                pipe.srem(format!("ws_by_server:{}", server_id), id).ignore();
            }
            pipe.srem(format!("ws_by_status:{}", status_tag(prev.status)), id)
                .ignore();
            pipe.query_async(&mut conn).await?;
        }
        Ok(())
    }

    pub async fn list_all(&self) -> Result<Vec<WorkspaceRecord>, AnyError> {
        let mut conn = self.conn().await?;
        let keys: Vec<String> = conn.keys("ws:*").await?;
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            let raw: Option<String> = conn.get(&key).await?;
            if let Some(raw) = raw {
                match serde_json::from_str(&raw) {
                    Ok(record) => out.push(record),
                    Err(err) => tracing::warn!(key = %key, error = %err, "corrupt workspace record"),
                }
            }
        }
        Ok(out)
    }

    pub async fn list_running(&self) -> Result<Vec<WorkspaceRecord>, AnyError> {
        self.list_by_index("ws_by_status:RUNNING").await
    }

    pub async fn list_by_user(&self, user_id: &str) -> Result<Vec<WorkspaceRecord>, AnyError> {
        self.list_by_index(&format!("ws_by_user:{user_id}")).await
    }

    pub async fn list_by_session(&self, session_id: &str) -> Result<Vec<WorkspaceRecord>, AnyError> {
        self.list_by_index(&format!("ws_by_session:{session_id}")).await
    }

    pub async fn list_by_server(&self, server_id: &str) -> Result<Vec<WorkspaceRecord>, AnyError> {
        self.list_by_index(&format!("ws_by_server:{server_id}")).await
    }

    async fn list_by_index(&self, index_key: &str) -> Result<Vec<WorkspaceRecord>, AnyError> {
        let mut conn = self.conn().await?;
        let ids: Vec<String> = conn.smembers(index_key).await?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = self.get(&id).await? {
                out.push(record);
            }
        }
        Ok(out)
    }

    /// Rebuild every secondary index from the primary record set. The
    /// recovery path for the "no stale index survives a crash"
    /// invariant: safe to run at any time, including concurrently with
    /// normal traffic, since it only ever adds index membership that
    /// `list_all` also agrees with.
    pub async fn rebuild_indexes(&self) -> Result<(), AnyError> {
        let mut conn = self.conn().await?;
        let index_keys: Vec<String> = conn
            .keys("ws_by_user:*")
            .await?
            .into_iter()
            .chain(conn.keys("ws_by_session:*").await?)
            .chain(conn.keys("ws_by_server:*").await?)
            .chain(conn.keys("ws_by_status:*").await?)
            .collect();
        if !index_keys.is_empty() {
            let _: () = conn.del(index_keys).await?;
        }

        let records = self.list_all().await?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        for record in &records {
            pipe.sadd(format!("ws_by_user:{}", record.owner_user_id), &record.id);
            pipe.sadd(format!("ws_by_session:{}", record.owner_session_id), &record.id);
            if let Some(server_id) = &record.assigned.server_id {
                pipe.sadd(format!("ws_by_server:{}", server_id), &record.id);
            }
            pipe.sadd(format!("ws_by_status:{}", status_tag(record.status)), &record.id);
        }
        pipe.query_async(&mut conn).await?;
        tracing::info!(count = records.len(), "workspace store indexes rebuilt");
        Ok(())
    }
}
