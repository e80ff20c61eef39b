//! System-wide admission control.
//!
//! At most `max_concurrent` attempts hold a slot at any instant, across every
//! worker sharing the store. A slot is keyed by a holder token unique to one
//! acquisition, so releasing twice is harmless and a slot whose holder died
//! expires after `slot_ttl` unless renewed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::{AsyncCommands, Script};
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::{AdmissionConfig, StoreConfig};
use crate::error::{QueueError, QueueResult};

/// Shared counting gate over in-flight attempts.
#[async_trait]
pub trait AdmissionGate: Send + Sync {
    /// Take a slot for `holder` if one is free. Never waits.
    async fn try_acquire(&self, holder: &str) -> QueueResult<bool>;

    /// Give the slot back. Unknown holders are ignored.
    async fn release(&self, holder: &str) -> QueueResult<()>;

    /// Push the slot expiry forward. Returns false when the slot already expired.
    async fn renew(&self, holder: &str) -> QueueResult<bool>;

    /// Slots currently held.
    async fn active_count(&self) -> QueueResult<usize>;

    fn max_concurrent(&self) -> usize;
}

/// A held admission slot.
///
/// Call [`AdmissionSlot::release`] when the attempt ends. A slot dropped
/// without release is handed back on a spawned task.
pub struct AdmissionSlot {
    gate: Arc<dyn AdmissionGate>,
    holder: String,
    released: bool,
}

impl AdmissionSlot {
    /// Try to take a slot on behalf of `worker_id`.
    pub async fn try_acquire(
        gate: Arc<dyn AdmissionGate>,
        worker_id: &str,
    ) -> QueueResult<Option<Self>> {
        let holder = format!("{}:{}", worker_id, Uuid::new_v4());
        if !gate.try_acquire(&holder).await? {
            return Ok(None);
        }
        debug!(holder = %holder, "Admission slot acquired");
        Ok(Some(Self {
            gate,
            holder,
            released: false,
        }))
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub async fn renew(&self) -> QueueResult<bool> {
        self.gate.renew(&self.holder).await
    }

    /// Return the slot to the gate.
    pub async fn release(mut self) {
        self.released = true;
        if let Err(e) = self.gate.release(&self.holder).await {
            // The slot expires on its own once renewals stop.
            warn!(holder = %self.holder, "Failed to release admission slot: {}", e);
        } else {
            debug!(holder = %self.holder, "Admission slot released");
        }
    }
}

impl Drop for AdmissionSlot {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        warn!(holder = %self.holder, "AdmissionSlot dropped without release()");

        let gate = Arc::clone(&self.gate);
        let holder = std::mem::take(&mut self.holder);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = gate.release(&holder).await {
                        warn!(holder = %holder, "Deferred slot release failed: {}", e);
                    }
                });
            }
            Err(_) => warn!("No runtime to release admission slot; it will expire"),
        }
    }
}

const ACQUIRE_SCRIPT: &str = r#"
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
if redis.call('ZSCORE', KEYS[1], ARGV[4]) then return 1 end
if redis.call('ZCARD', KEYS[1]) < tonumber(ARGV[3]) then
  redis.call('ZADD', KEYS[1], ARGV[2], ARGV[4])
  return 1
end
return 0
"#;

const RENEW_SCRIPT: &str = r#"
local expiry = redis.call('ZSCORE', KEYS[1], ARGV[3])
if expiry and tonumber(expiry) > tonumber(ARGV[1]) then
  redis.call('ZADD', KEYS[1], ARGV[2], ARGV[3])
  return 1
end
return 0
"#;

const COUNT_SCRIPT: &str = r#"
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
return redis.call('ZCARD', KEYS[1])
"#;

/// Gate shared by every worker through Redis.
///
/// Slots live in a sorted set `{prefix}:admission:slots` scored by expiry.
pub struct RedisAdmissionGate {
    client: redis::Client,
    key: String,
    config: AdmissionConfig,
    acquire_script: Script,
    renew_script: Script,
    count_script: Script,
}

impl RedisAdmissionGate {
    pub fn new(store: &StoreConfig, config: AdmissionConfig) -> QueueResult<Self> {
        let client = redis::Client::open(store.redis_url.as_str())?;
        Ok(Self {
            client,
            key: format!("{}:admission:slots", store.key_prefix),
            config,
            acquire_script: Script::new(ACQUIRE_SCRIPT),
            renew_script: Script::new(RENEW_SCRIPT),
            count_script: Script::new(COUNT_SCRIPT),
        })
    }

    async fn connection(&self) -> QueueResult<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| QueueError::connection_failed(e.to_string()))
    }

    fn expiry_ms(&self, now_ms: i64) -> i64 {
        now_ms + self.config.slot_ttl.as_millis() as i64
    }
}

#[async_trait]
impl AdmissionGate for RedisAdmissionGate {
    async fn try_acquire(&self, holder: &str) -> QueueResult<bool> {
        let now = Utc::now().timestamp_millis();
        let mut conn = self.connection().await?;
        let granted: i64 = self
            .acquire_script
            .key(&self.key)
            .arg(now)
            .arg(self.expiry_ms(now))
            .arg(self.config.max_concurrent)
            .arg(holder)
            .invoke_async(&mut conn)
            .await?;
        Ok(granted == 1)
    }

    async fn release(&self, holder: &str) -> QueueResult<()> {
        let mut conn = self.connection().await?;
        conn.zrem::<_, _, ()>(&self.key, holder).await?;
        Ok(())
    }

    async fn renew(&self, holder: &str) -> QueueResult<bool> {
        let now = Utc::now().timestamp_millis();
        let mut conn = self.connection().await?;
        let renewed: i64 = self
            .renew_script
            .key(&self.key)
            .arg(now)
            .arg(self.expiry_ms(now))
            .arg(holder)
            .invoke_async(&mut conn)
            .await?;
        Ok(renewed == 1)
    }

    async fn active_count(&self) -> QueueResult<usize> {
        let mut conn = self.connection().await?;
        let count: usize = self
            .count_script
            .key(&self.key)
            .arg(Utc::now().timestamp_millis())
            .invoke_async(&mut conn)
            .await?;
        Ok(count)
    }

    fn max_concurrent(&self) -> usize {
        self.config.max_concurrent
    }
}

/// Gate local to one process.
#[derive(Debug)]
pub struct MemoryAdmissionGate {
    max_concurrent: usize,
    slot_ttl: Duration,
    slots: Mutex<HashMap<String, Instant>>,
}

impl MemoryAdmissionGate {
    pub fn new(config: AdmissionConfig) -> Self {
        Self {
            max_concurrent: config.max_concurrent,
            slot_ttl: config.slot_ttl,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Instant>> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        slots.retain(|_, expires_at| *expires_at > now);
        slots
    }
}

#[async_trait]
impl AdmissionGate for MemoryAdmissionGate {
    async fn try_acquire(&self, holder: &str) -> QueueResult<bool> {
        let mut slots = self.lock();
        if slots.contains_key(holder) {
            return Ok(true);
        }
        if slots.len() >= self.max_concurrent {
            return Ok(false);
        }
        slots.insert(holder.to_string(), Instant::now() + self.slot_ttl);
        Ok(true)
    }

    async fn release(&self, holder: &str) -> QueueResult<()> {
        self.lock().remove(holder);
        Ok(())
    }

    async fn renew(&self, holder: &str) -> QueueResult<bool> {
        let mut slots = self.lock();
        match slots.get_mut(holder) {
            Some(expires_at) => {
                *expires_at = Instant::now() + self.slot_ttl;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn active_count(&self) -> QueueResult<usize> {
        Ok(self.lock().len())
    }

    fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate(max: usize) -> Arc<dyn AdmissionGate> {
        Arc::new(MemoryAdmissionGate::new(AdmissionConfig {
            max_concurrent: max,
            slot_ttl: Duration::from_secs(30),
        }))
    }

    #[tokio::test]
    async fn test_gate_denies_beyond_capacity() {
        let gate = gate(2);
        let a = AdmissionSlot::try_acquire(gate.clone(), "w1").await.unwrap();
        let b = AdmissionSlot::try_acquire(gate.clone(), "w2").await.unwrap();
        let c = AdmissionSlot::try_acquire(gate.clone(), "w3").await.unwrap();

        assert!(a.is_some() && b.is_some());
        assert!(c.is_none());
        assert_eq!(gate.active_count().await.unwrap(), 2);

        a.unwrap().release().await;
        assert_eq!(gate.active_count().await.unwrap(), 1);
        assert!(AdmissionSlot::try_acquire(gate.clone(), "w3")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_release_is_idempotent_per_holder() {
        let gate = gate(1);
        let slot = AdmissionSlot::try_acquire(gate.clone(), "w1")
            .await
            .unwrap()
            .unwrap();
        let holder = slot.holder().to_string();
        slot.release().await;

        let other = AdmissionSlot::try_acquire(gate.clone(), "w2")
            .await
            .unwrap()
            .unwrap();
        // A stale second release must not free the new holder's slot.
        gate.release(&holder).await.unwrap();
        assert_eq!(gate.active_count().await.unwrap(), 1);
        other.release().await;
    }

    #[tokio::test]
    async fn test_dropped_slot_is_released() {
        let gate = gate(1);
        {
            let _slot = AdmissionSlot::try_acquire(gate.clone(), "w1")
                .await
                .unwrap()
                .unwrap();
        }
        for _ in 0..3 {
            tokio::task::yield_now().await;
        }
        assert_eq!(gate.active_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unrenewed_slot_expires() {
        tokio::time::pause();
        let gate = gate(1);
        let slot = AdmissionSlot::try_acquire(gate.clone(), "crashed")
            .await
            .unwrap()
            .unwrap();

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(!slot.renew().await.unwrap());
        assert_eq!(gate.active_count().await.unwrap(), 0);
        slot.release().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_holders_never_exceed_capacity() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use tokio_test::assert_ok;

        const MAX: usize = 3;
        let gate = gate(MAX);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let high_water = Arc::new(AtomicUsize::new(0));
        let admitted = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for worker in 0..16 {
            let gate = gate.clone();
            let in_flight = in_flight.clone();
            let high_water = high_water.clone();
            let admitted = admitted.clone();
            tasks.push(tokio::spawn(async move {
                for round in 0..50 {
                    let holder = format!("w{worker}:{round}");
                    if !assert_ok!(gate.try_acquire(&holder).await) {
                        tokio::task::yield_now().await;
                        continue;
                    }
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    high_water.fetch_max(now, Ordering::SeqCst);
                    admitted.fetch_add(1, Ordering::SeqCst);

                    let count = assert_ok!(gate.active_count().await);
                    assert!(count <= MAX, "gate reported {count} holders");
                    tokio::time::sleep(Duration::from_micros(200)).await;

                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    assert_ok!(gate.release(&holder).await);
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert!(admitted.load(Ordering::SeqCst) > 0);
        assert!(high_water.load(Ordering::SeqCst) <= MAX);
        assert_eq!(in_flight.load(Ordering::SeqCst), 0);
        assert_eq!(gate.active_count().await.unwrap(), 0);
    }
}
