//! Redis transport
//!
//! - Program queue (BLPOP) and task specs stored as JSON strings
//! - Result storage with expiry, published for live subscribers
//! - Stop requests as plain keys, checked after every stored result
//! - Worker slots held through an expiring lease

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, ExistenceCheck, SetExpiry, SetOptions};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{ProgramJob, Transport};
use crate::core::result::TaskResult;
use crate::core::spec::TaskSpec;
use crate::engine::task::Flow;

pub mod keys {
    /// `{SLOT_PREFIX}{n}` is held by the worker running as slot `n`
    pub const SLOT_PREFIX: &str = "autotester:worker:slot:";

    /// Programs waiting to be graded
    pub const PROGRAM_QUEUE: &str = "autotester:queue";

    pub const TASK_PREFIX: &str = "autotester:task:";

    /// Latest result of a program, for polling
    pub const RESULT_PREFIX: &str = "autotester:result:";

    /// Every stored result is also published here
    pub const RESULT_CHANNEL: &str = "autotester:results";

    /// Presence of `{STOP_PREFIX}{program_id}` asks the worker to give up
    pub const STOP_PREFIX: &str = "autotester:stop:";

    pub const REJECTED_CHANNEL: &str = "autotester:rejected";
}

const WORKER_SLOTS: u32 = 10;
const SLOT_LEASE_SECS: u64 = 120;
const RESULT_EXPIRY_SECS: u64 = 3600;
const RECONNECT_DELAY: Duration = Duration::from_secs(3);
const SLOT_RETRY_DELAY: Duration = Duration::from_secs(1);

fn key(prefix: &str, id: impl std::fmt::Display) -> String {
    format!("{}{}", prefix, id)
}

pub struct RedisTransport {
    slot: u32,
    client: redis::Client,
    conn: ConnectionManager,
    lease: JoinHandle<()>,
}

impl RedisTransport {
    async fn with_url(redis_url: &str) -> Result<Self> {
        let client =
            redis::Client::open(redis_url).with_context(|| format!("Invalid Redis URL {}", redis_url))?;

        let conn = queue_connection(&client).await;
        info!("Queue connected at {}", redis_url);

        let slot = claim_worker_slot(&client).await?;
        info!("Running as worker slot {} (lease {}s)", slot, SLOT_LEASE_SECS);

        let lease = keep_slot_leased(client.clone(), slot);

        Ok(Self {
            slot,
            client,
            conn,
            lease,
        })
    }

    /// Connects using `REDIS_URL`, defaulting to "redis://localhost:6379"
    pub async fn from_env() -> Result<Self> {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".into());
        Self::with_url(&url).await
    }

    pub fn worker_id(&self) -> u32 {
        self.slot
    }

    async fn reconnect(&mut self) {
        self.conn = queue_connection(&self.client).await;
    }
}

#[async_trait]
impl Transport for RedisTransport {
    async fn next_program(&mut self) -> Result<ProgramJob> {
        loop {
            let popped: Option<(String, String)> =
                match self.conn.blpop(keys::PROGRAM_QUEUE, 0.0).await {
                    Ok(popped) => popped,
                    Err(e) => {
                        warn!("Lost the program queue: {}", e);
                        self.reconnect().await;
                        continue;
                    }
                };

            if let Some((_, data)) = popped {
                match serde_json::from_str::<ProgramJob>(&data) {
                    Ok(job) => return Ok(job),
                    Err(e) => warn!("Dropping malformed program job ({}): {}", e, data),
                }
            }
        }
    }

    async fn get_task(&mut self, task_id: &str) -> Result<TaskSpec> {
        let task_key = key(keys::TASK_PREFIX, task_id);
        let data: Option<String> = self
            .conn
            .get(&task_key)
            .await
            .with_context(|| format!("Failed to read {}", task_key))?;
        let data = data.with_context(|| format!("Task {} not found", task_id))?;
        TaskSpec::from_json(&data).with_context(|| format!("Invalid task {}", task_id))
    }

    async fn set_result(&mut self, program_id: &str, result: &TaskResult) -> Result<Flow> {
        let json = serde_json::to_string(result)?;
        let result_key = key(keys::RESULT_PREFIX, program_id);

        if let Err(e) = self
            .conn
            .set_ex::<_, _, ()>(&result_key, &json, RESULT_EXPIRY_SECS)
            .await
        {
            warn!("Result of program {} not stored ({}), retrying once", program_id, e);
            self.reconnect().await;
            self.conn
                .set_ex::<_, _, ()>(&result_key, &json, RESULT_EXPIRY_SECS)
                .await
                .with_context(|| format!("Failed to store result of program {}", program_id))?;
        }

        // no subscribers is fine
        let _ = self
            .conn
            .publish::<_, _, ()>(keys::RESULT_CHANNEL, &json)
            .await;

        let stop: bool = self
            .conn
            .exists(key(keys::STOP_PREFIX, program_id))
            .await
            .unwrap_or(false);
        if stop {
            info!("Stop requested for program {}", program_id);
        }
        Ok(if stop { Flow::Stop } else { Flow::Continue })
    }

    async fn reject_task(&mut self, task_id: &str, reason: &str) -> Result<()> {
        let message = serde_json::json!({
            "task_id": task_id,
            "worker_id": self.slot,
            "reason": reason,
        });
        self.conn
            .publish::<_, _, ()>(keys::REJECTED_CHANNEL, message.to_string())
            .await
            .context("Failed to publish task rejection")
    }
}

impl Drop for RedisTransport {
    fn drop(&mut self) {
        self.lease.abort();
    }
}

/// Waits until Redis accepts a connection
async fn queue_connection(client: &redis::Client) -> ConnectionManager {
    loop {
        match client.get_connection_manager().await {
            Ok(conn) => return conn,
            Err(e) => {
                warn!(
                    "Redis unavailable ({}), next attempt in {}s",
                    e,
                    RECONNECT_DELAY.as_secs()
                );
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

fn lease_options() -> SetOptions {
    SetOptions::default()
        .conditional_set(ExistenceCheck::NX)
        .with_expiration(SetExpiry::EX(SLOT_LEASE_SECS))
}

/// Takes the lowest slot whose lease is free (SET NX EX)
async fn claim_worker_slot(client: &redis::Client) -> Result<u32> {
    let holder = format!("pid {}", std::process::id());

    loop {
        let mut conn = queue_connection(client).await;
        for slot in 0..WORKER_SLOTS {
            let taken: Option<String> = conn
                .set_options(key(keys::SLOT_PREFIX, slot), &holder, lease_options())
                .await
                .with_context(|| format!("Failed to claim worker slot {}", slot))?;
            if taken.is_some() {
                return Ok(slot);
            }
        }

        warn!(
            "All {} worker slots are leased, waiting for one to expire",
            WORKER_SLOTS
        );
        tokio::time::sleep(SLOT_RETRY_DELAY).await;
    }
}

/// Renews the slot lease at half its lifetime until aborted
fn keep_slot_leased(client: redis::Client, slot: u32) -> JoinHandle<()> {
    tokio::spawn(async move {
        let slot_key = key(keys::SLOT_PREFIX, slot);
        let mut renewal = tokio::time::interval(Duration::from_secs(SLOT_LEASE_SECS / 2));
        // the claim itself counts as the first renewal
        renewal.tick().await;

        loop {
            renewal.tick().await;
            let mut conn = queue_connection(&client).await;
            match conn.expire::<_, bool>(&slot_key, SLOT_LEASE_SECS as i64).await {
                Ok(true) => debug!("Renewed lease of worker slot {}", slot),
                Ok(false) => warn!("Lease of worker slot {} had already expired", slot),
                Err(e) => warn!("Could not renew lease of worker slot {}: {}", slot, e),
            }
        }
    })
}
