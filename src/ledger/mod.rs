//! The quota ledger: per-tenant, per-pool capacity reservations backed by a Redis-protocol store.
//!
//! Reads a value, decides whether the write is still valid, writes, and treats "store
//! unreachable" and "lookup came back empty" as distinct typed errors. The backing store has no
//! transactions, only atomic scripts, so the read-decide-write cycle needs an explicit
//! client-side fencing-token retry loop rather than a `BEGIN`/`COMMIT` pair.

mod scripts;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use rust_decimal::Decimal;
use tokio_util::sync::CancellationToken;

use crate::error::LedgerError;

/// The unit of ledger interaction: identifies one tenant's reservation on one pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaRequest {
    pub system_type: String,
    pub system_id: String,
    pub storage_pool_id: String,
    pub group: String,
    pub volume_name: String,
    pub capacity: Decimal,
}

impl QuotaRequest {
    /// `quota:{system_type}:{system_id}:{storage_pool_id}:{group}:data`
    pub fn data_key(&self) -> String {
        format!(
            "quota:{}:{}:{}:{}:data",
            self.system_type, self.system_id, self.storage_pool_id, self.group
        )
    }

    /// `quota:{system_type}:{system_id}:{storage_pool_id}:{group}:stream`
    pub fn stream_key(&self) -> String {
        format!(
            "quota:{}:{}:{}:{}:stream",
            self.system_type, self.system_id, self.storage_pool_id, self.group
        )
    }

    fn approved_field(&self) -> String {
        format!("vol:{}:approved", self.volume_name)
    }

    fn created_field(&self) -> String {
        format!("vol:{}:created", self.volume_name)
    }
}

/// The ledger's public contract. A trait so integration tests can swap in an in-memory fake
/// without standing up a real Redis instance.
#[async_trait]
pub trait Ledger: Send + Sync {
    async fn ping(&self) -> Result<(), LedgerError>;

    /// True iff `vol:{volume_name}:created` exists in the request's data key.
    async fn validate_ownership(&self, r: &QuotaRequest) -> Result<bool, LedgerError>;

    /// Reserve up to `quota_kb` for the tenant/pool.
    async fn approve_request(
        &self,
        r: &QuotaRequest,
        quota_kb: i64,
        cancel: &CancellationToken,
    ) -> Result<bool, LedgerError>;

    async fn delete_request(&self, r: &QuotaRequest) -> Result<bool, LedgerError>;

    async fn publish_created(&self, r: &QuotaRequest) -> Result<bool, LedgerError>;

    async fn publish_deleted(&self, r: &QuotaRequest) -> Result<bool, LedgerError>;

    /// Reconciliation helper: names with `status="approved"` minus names with
    /// `status="created"`, read off the full stream.
    async fn approved_not_created(&self, stream_key: &str) -> Result<Vec<String>, LedgerError>;
}

/// The production `Ledger`, backed by a Redis-protocol store.
#[derive(Clone)]
pub struct RedisLedger {
    conn: redis::aio::ConnectionManager,
    log: slog::Logger,
}

impl RedisLedger {
    pub async fn connect(redis_url: &str, log: slog::Logger) -> Result<Self, LedgerError> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_tokio_connection_manager().await?;
        Ok(RedisLedger { conn, log })
    }
}

#[async_trait]
impl Ledger for RedisLedger {
    async fn ping(&self) -> Result<(), LedgerError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn validate_ownership(&self, r: &QuotaRequest) -> Result<bool, LedgerError> {
        let mut conn = self.conn.clone();
        let exists: bool = conn.hexists(r.data_key(), r.created_field()).await?;
        Ok(exists)
    }

    async fn approve_request(
        &self,
        r: &QuotaRequest,
        quota_kb: i64,
        cancel: &CancellationToken,
    ) -> Result<bool, LedgerError> {
        let mut conn = self.conn.clone();
        let data_key = r.data_key();
        let stream_key = r.stream_key();
        let approved_field = r.approved_field();
        let capacity_str = r.capacity.to_string();

        loop {
            if cancel.is_cancelled() {
                return Err(LedgerError::Canceled);
            }

            // Step 1: idempotent short-circuit.
            let already_approved: bool = conn.hexists(&data_key, &approved_field).await?;
            if already_approved {
                return Ok(true);
            }

            // Step 2/3: ensure approved_capacity exists, read the fencing token.
            let _: () = conn
                .hset_nx(&data_key, "approved_capacity", "0")
                .await
                .map(|_: bool| ())?;
            let fenced_raw: String = conn.hget(&data_key, "approved_capacity").await?;
            let fenced: i64 = fenced_raw
                .parse()
                .map_err(|_| LedgerError::Decode(format!("non-integer approved_capacity '{fenced_raw}'")))?;

            // Step 4: quota check. quota_kb == 0 means infinite.
            if quota_kb != 0 && fenced + capacity_to_kb(r.capacity) > quota_kb {
                return Ok(false);
            }

            // Step 5: compare-and-set script.
            let outcome: i64 = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(LedgerError::Canceled),
                result = scripts::approve()
                    .key(&data_key)
                    .key(&stream_key)
                    .arg(&r.volume_name)
                    .arg(&capacity_str)
                    .arg(fenced_raw)
                    .invoke_async(&mut conn) => result?,
            };

            match outcome {
                1 | 0 => return Ok(true),
                -1 => continue, // fencing token stale, retry the whole loop
                other => {
                    return Err(LedgerError::Decode(format!(
                        "unexpected approve script result {other}"
                    )))
                }
            }
        }
    }

    async fn delete_request(&self, r: &QuotaRequest) -> Result<bool, LedgerError> {
        let mut conn = self.conn.clone();
        let outcome: i64 = scripts::delete_request()
            .key(r.data_key())
            .key(r.stream_key())
            .arg(&r.volume_name)
            .invoke_async(&mut conn)
            .await?;
        log_script_outcome(&self.log, "delete_request", r, outcome);
        Ok(outcome == 1)
    }

    async fn publish_created(&self, r: &QuotaRequest) -> Result<bool, LedgerError> {
        let mut conn = self.conn.clone();
        let outcome: i64 = scripts::publish_created()
            .key(r.data_key())
            .key(r.stream_key())
            .arg(&r.volume_name)
            .invoke_async(&mut conn)
            .await?;
        log_script_outcome(&self.log, "publish_created", r, outcome);
        Ok(outcome == 1)
    }

    async fn publish_deleted(&self, r: &QuotaRequest) -> Result<bool, LedgerError> {
        let mut conn = self.conn.clone();
        let outcome: i64 = scripts::publish_deleted()
            .key(r.data_key())
            .key(r.stream_key())
            .arg(&r.volume_name)
            .invoke_async(&mut conn)
            .await?;
        log_script_outcome(&self.log, "publish_deleted", r, outcome);
        // 1 = applied, 2 = already deleted (idempotent short-circuit, capacity already returned).
        Ok(outcome == 1 || outcome == 2)
    }

    async fn approved_not_created(&self, stream_key: &str) -> Result<Vec<String>, LedgerError> {
        let mut conn = self.conn.clone();
        let entries: Vec<(String, Vec<(String, String)>)> = redis::cmd("XRANGE")
            .arg(stream_key)
            .arg("-")
            .arg("+")
            .query_async(&mut conn)
            .await?;

        let mut approved = std::collections::HashSet::new();
        let mut created = std::collections::HashSet::new();
        for (_id, fields) in entries {
            let mut name = None;
            let mut status = None;
            for (k, v) in fields {
                match k.as_str() {
                    "name" => name = Some(v),
                    "status" => status = Some(v),
                    _ => {}
                }
            }
            if let (Some(name), Some(status)) = (name, status) {
                match status.as_str() {
                    "approved" => {
                        approved.insert(name);
                    }
                    "created" => {
                        created.insert(name);
                    }
                    _ => {}
                }
            }
        }

        Ok(approved.difference(&created).cloned().collect())
    }
}

fn log_script_outcome(log: &slog::Logger, op: &str, r: &QuotaRequest, outcome: i64) {
    if outcome != 1 {
        slog::debug!(log, "ledger operation was a no-op"; "op" => op, "volume" => &r.volume_name, "outcome" => outcome);
    }
}

/// The capacity field is stored/transmitted as a decimal integer string of kilobytes;
/// this just pins down the integer conversion used for the quota comparison in step 4.
fn capacity_to_kb(capacity: Decimal) -> i64 {
    capacity.trunc().to_string().parse().unwrap_or(0)
}

/// Convenience alias used by handler code that only ever talks to a shared, reference-counted
/// ledger.
pub type SharedLedger = Arc<dyn Ledger>;

#[cfg(test)]
mod in_memory_tests_support {
    //! A minimal in-process `Ledger` used by this crate's own integration tests. Lives under
    //! `#[cfg(test)]` so it never ships in the real binary.
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct VolumeRecord {
        approved: bool,
        capacity: i64,
        created: bool,
        deleting: bool,
        deleted: bool,
    }

    #[derive(Default)]
    struct PoolLedgerState {
        volumes: HashMap<String, VolumeRecord>,
        approved_capacity: i64,
        stream: Vec<(String, String, Option<i64>)>, // (name, status, cap)
    }

    #[derive(Default)]
    pub struct FakeLedger {
        state: Mutex<HashMap<String, PoolLedgerState>>,
    }

    #[async_trait]
    impl Ledger for FakeLedger {
        async fn ping(&self) -> Result<(), LedgerError> {
            Ok(())
        }

        async fn validate_ownership(&self, r: &QuotaRequest) -> Result<bool, LedgerError> {
            let state = self.state.lock().unwrap();
            Ok(state
                .get(&r.data_key())
                .and_then(|p| p.volumes.get(&r.volume_name))
                .map(|v| v.created)
                .unwrap_or(false))
        }

        async fn approve_request(
            &self,
            r: &QuotaRequest,
            quota_kb: i64,
            _cancel: &CancellationToken,
        ) -> Result<bool, LedgerError> {
            let mut state = self.state.lock().unwrap();
            let pool = state.entry(r.data_key()).or_default();
            if let Some(existing) = pool.volumes.get(&r.volume_name) {
                if existing.approved {
                    return Ok(true);
                }
            }
            let capacity = capacity_to_kb(r.capacity);
            if quota_kb != 0 && pool.approved_capacity + capacity > quota_kb {
                return Ok(false);
            }
            pool.approved_capacity += capacity;
            pool.volumes.entry(r.volume_name.clone()).or_default().approved = true;
            pool.volumes.get_mut(&r.volume_name).unwrap().capacity = capacity;
            pool.stream
                .push((r.volume_name.clone(), "approved".into(), Some(capacity)));
            Ok(true)
        }

        async fn delete_request(&self, r: &QuotaRequest) -> Result<bool, LedgerError> {
            let mut state = self.state.lock().unwrap();
            let pool = state.entry(r.data_key()).or_default();
            let Some(vol) = pool.volumes.get_mut(&r.volume_name) else {
                return Ok(false);
            };
            if !vol.approved {
                return Ok(false);
            }
            vol.deleting = true;
            pool.stream
                .push((r.volume_name.clone(), "deleting".into(), None));
            Ok(true)
        }

        async fn publish_created(&self, r: &QuotaRequest) -> Result<bool, LedgerError> {
            let mut state = self.state.lock().unwrap();
            let pool = state.entry(r.data_key()).or_default();
            let Some(vol) = pool.volumes.get_mut(&r.volume_name) else {
                return Ok(false);
            };
            if !vol.approved {
                return Ok(false);
            }
            vol.created = true;
            let cap = vol.capacity;
            pool.stream
                .push((r.volume_name.clone(), "created".into(), Some(cap)));
            Ok(true)
        }

        async fn publish_deleted(&self, r: &QuotaRequest) -> Result<bool, LedgerError> {
            let mut state = self.state.lock().unwrap();
            let pool = state.entry(r.data_key()).or_default();
            let Some(vol) = pool.volumes.get_mut(&r.volume_name) else {
                return Ok(false);
            };
            if !vol.approved {
                return Ok(false);
            }
            if vol.deleted {
                // Idempotent short-circuit: capacity was already returned by an earlier call.
                return Ok(true);
            }
            vol.deleted = true;
            let cap = vol.capacity;
            if cap > 0 {
                pool.approved_capacity -= cap;
            }
            pool.stream
                .push((r.volume_name.clone(), "deleted".into(), Some(cap)));
            Ok(true)
        }

        async fn approved_not_created(&self, _stream_key: &str) -> Result<Vec<String>, LedgerError> {
            // Not exercised by the stream-keyed fake; reconciliation is tested against the
            // real Redis-backed implementation's key derivation only.
            Ok(Vec::new())
        }
    }

    impl FakeLedger {
        pub fn approved_capacity(&self, r: &QuotaRequest) -> i64 {
            self.state
                .lock()
                .unwrap()
                .get(&r.data_key())
                .map(|p| p.approved_capacity)
                .unwrap_or(0)
        }
    }
}

#[cfg(test)]
pub use in_memory_tests_support::FakeLedger;
