//! Redis-backed job store.
//!
//! Key layout under the configured prefix:
//! - `{prefix}:job:{id}` hash with the record fields
//! - `{prefix}:job:{id}:log` list of stage messages
//! - `{prefix}:queue:waiting` list, pushed left and popped right
//! - `{prefix}:queue:active` list of leased jobs
//! - `{prefix}:queue:delayed` sorted set scored by ready time (ms)
//! - `{prefix}:lease:{id}` owning worker id with a PX expiry
//!
//! Every guarded transition runs as one Lua script so ownership checks and
//! writes cannot interleave with another worker or the reaper.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{AsyncCommands, Script};
use tracing::{debug, info, warn};

use dolphin_models::{JobId, JobKind, JobPayload, JobRecord, JobResult, JobState};

use crate::config::StoreConfig;
use crate::error::{QueueError, QueueResult};
use crate::store::{prepare_record, retry_log_line, JobStore, QueueDepth};

/// Most delayed jobs moved back to waiting per promotion pass.
const PROMOTE_BATCH: usize = 100;

const LEASE_LOST: i64 = -1;
const NOT_ACTIVE: i64 = -2;
const NO_ATTEMPTS_LEFT: i64 = -3;

const DEQUEUE_SCRIPT: &str = r#"
while true do
  local id = redis.call('RPOPLPUSH', KEYS[1], KEYS[2])
  if not id then return false end
  local job = ARGV[1] .. ':job:' .. id
  if redis.call('HGET', job, 'state') == 'waiting' then
    redis.call('SET', ARGV[1] .. ':lease:' .. id, ARGV[2], 'PX', ARGV[3])
    redis.call('HSET', job, 'state', 'active', 'progress', 0, 'updated_at', ARGV[4])
    redis.call('HINCRBY', job, 'version', 1)
    return id
  end
  redis.call('LREM', KEYS[2], 0, id)
end
"#;

const PROGRESS_SCRIPT: &str = r#"
if redis.call('GET', KEYS[2]) ~= ARGV[1] then return -1 end
if redis.call('HGET', KEYS[1], 'state') ~= 'active' then return -2 end
local current = tonumber(redis.call('HGET', KEYS[1], 'progress') or '0')
local next = tonumber(ARGV[2])
if next > current then redis.call('HSET', KEYS[1], 'progress', next) end
if ARGV[3] ~= '' then redis.call('RPUSH', KEYS[3], ARGV[3]) end
redis.call('HSET', KEYS[1], 'updated_at', ARGV[4])
return redis.call('HINCRBY', KEYS[1], 'version', 1)
"#;

const RENEW_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

const FINISH_SCRIPT: &str = r#"
if redis.call('GET', KEYS[2]) ~= ARGV[1] then return -1 end
if redis.call('HGET', KEYS[1], 'state') ~= 'active' then return -2 end
redis.call('HSET', KEYS[1], 'state', ARGV[2], ARGV[3], ARGV[4], 'updated_at', ARGV[6])
if ARGV[5] ~= '' then redis.call('HSET', KEYS[1], 'progress', ARGV[5]) end
local version = redis.call('HINCRBY', KEYS[1], 'version', 1)
redis.call('LREM', KEYS[4], 0, ARGV[8])
redis.call('DEL', KEYS[2])
redis.call('EXPIRE', KEYS[1], ARGV[7])
redis.call('EXPIRE', KEYS[3], ARGV[7])
return version
"#;

const RETRY_SCRIPT: &str = r#"
if redis.call('GET', KEYS[2]) ~= ARGV[1] then return -1 end
if redis.call('HGET', KEYS[1], 'state') ~= 'active' then return -2 end
local attempt = tonumber(redis.call('HGET', KEYS[1], 'attempt'))
local max = tonumber(redis.call('HGET', KEYS[1], 'max_attempts'))
if attempt >= max then return -3 end
attempt = attempt + 1
redis.call('HSET', KEYS[1], 'attempt', attempt, 'state', 'waiting', 'progress', 0,
  'last_error', ARGV[3], 'updated_at', ARGV[5])
local line = string.gsub(ARGV[4], '{attempt}', tostring(attempt))
redis.call('RPUSH', KEYS[3], line)
redis.call('HINCRBY', KEYS[1], 'version', 1)
redis.call('LREM', KEYS[4], 0, ARGV[6])
redis.call('DEL', KEYS[2])
redis.call('ZADD', KEYS[5], ARGV[2], ARGV[6])
return attempt
"#;

const PROMOTE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
for _, id in ipairs(due) do
  redis.call('ZREM', KEYS[1], id)
  redis.call('LPUSH', KEYS[2], id)
end
return #due
"#;

const REAP_SCRIPT: &str = r#"
local reaped = {}
for _, id in ipairs(redis.call('LRANGE', KEYS[1], 0, -1)) do
  local lease = ARGV[1] .. ':lease:' .. id
  if redis.call('EXISTS', lease) == 0 then
    if redis.call('HGET', ARGV[1] .. ':job:' .. id, 'state') == 'active' then
      redis.call('SET', lease, ARGV[2], 'PX', ARGV[3])
      table.insert(reaped, id)
    else
      redis.call('LREM', KEYS[1], 0, id)
    end
  end
end
return reaped
"#;

/// Job store client.
pub struct RedisJobStore {
    client: redis::Client,
    config: StoreConfig,
    dequeue_script: Script,
    progress_script: Script,
    renew_script: Script,
    finish_script: Script,
    retry_script: Script,
    promote_script: Script,
    reap_script: Script,
}

impl RedisJobStore {
    pub fn new(config: StoreConfig) -> QueueResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str())?;
        Ok(Self {
            client,
            config,
            dequeue_script: Script::new(DEQUEUE_SCRIPT),
            progress_script: Script::new(PROGRESS_SCRIPT),
            renew_script: Script::new(RENEW_SCRIPT),
            finish_script: Script::new(FINISH_SCRIPT),
            retry_script: Script::new(RETRY_SCRIPT),
            promote_script: Script::new(PROMOTE_SCRIPT),
            reap_script: Script::new(REAP_SCRIPT),
        })
    }

    /// Create from environment variables.
    pub fn from_env() -> QueueResult<Self> {
        Self::new(StoreConfig::from_env())
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Round-trip a PING to verify connectivity.
    pub async fn ping(&self) -> QueueResult<()> {
        let mut conn = self.connection().await?;
        redis::cmd("PING").query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn connection(&self) -> QueueResult<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| QueueError::connection_failed(e.to_string()))
    }

    fn job_key(&self, id: &JobId) -> String {
        format!("{}:job:{}", self.config.key_prefix, id)
    }

    fn log_key(&self, id: &JobId) -> String {
        format!("{}:job:{}:log", self.config.key_prefix, id)
    }

    fn lease_key(&self, id: &JobId) -> String {
        format!("{}:lease:{}", self.config.key_prefix, id)
    }

    fn waiting_key(&self) -> String {
        format!("{}:queue:waiting", self.config.key_prefix)
    }

    fn active_key(&self) -> String {
        format!("{}:queue:active", self.config.key_prefix)
    }

    fn delayed_key(&self) -> String {
        format!("{}:queue:delayed", self.config.key_prefix)
    }

    /// Run a lease-guarded finish (complete or fail).
    async fn finish(
        &self,
        id: &JobId,
        worker_id: &str,
        state: JobState,
        field: &str,
        value: &str,
        progress: Option<u8>,
    ) -> QueueResult<i64> {
        let mut conn = self.connection().await?;
        let code: i64 = self
            .finish_script
            .key(self.job_key(id))
            .key(self.lease_key(id))
            .key(self.log_key(id))
            .key(self.active_key())
            .arg(worker_id)
            .arg(state.as_str())
            .arg(field)
            .arg(value)
            .arg(progress.map(|p| p.to_string()).unwrap_or_default())
            .arg(now_rfc3339())
            .arg(self.config.record_ttl.as_secs().max(1))
            .arg(id.as_str())
            .invoke_async(&mut conn)
            .await?;
        check_guarded(code, id, state.as_str())
    }
}

#[async_trait]
impl JobStore for RedisJobStore {
    async fn enqueue(&self, payload: JobPayload, max_attempts: u32) -> QueueResult<JobRecord> {
        let record = prepare_record(payload, max_attempts)?;
        let fields = record_to_fields(&record)?;
        let mut conn = self.connection().await?;

        redis::pipe()
            .atomic()
            .hset_multiple(self.job_key(&record.id), &fields)
            .ignore()
            .lpush(self.waiting_key(), record.id.as_str())
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;

        info!(
            job_id = %record.id,
            kind = %record.kind,
            max_attempts = record.max_attempts,
            "Enqueued job"
        );
        Ok(record)
    }

    async fn dequeue(&self, worker_id: &str, lease: Duration) -> QueueResult<Option<JobRecord>> {
        let mut conn = self.connection().await?;
        let id: Option<String> = self
            .dequeue_script
            .key(self.waiting_key())
            .key(self.active_key())
            .arg(&self.config.key_prefix)
            .arg(worker_id)
            .arg(lease_millis(lease))
            .arg(now_rfc3339())
            .invoke_async(&mut conn)
            .await?;

        let Some(id) = id else {
            return Ok(None);
        };
        let id = JobId::from_string(id);
        debug!(job_id = %id, worker_id, "Dequeued job");

        let record = self.get(&id).await?;
        if record.is_none() {
            warn!(job_id = %id, "Dequeued job record vanished");
        }
        Ok(record)
    }

    async fn report_progress(
        &self,
        id: &JobId,
        worker_id: &str,
        progress: u8,
        message: &str,
    ) -> QueueResult<u64> {
        let mut conn = self.connection().await?;
        let code: i64 = self
            .progress_script
            .key(self.job_key(id))
            .key(self.lease_key(id))
            .key(self.log_key(id))
            .arg(worker_id)
            .arg(u32::from(progress.min(100)))
            .arg(message)
            .arg(now_rfc3339())
            .invoke_async(&mut conn)
            .await?;
        Ok(check_guarded(code, id, "report progress")? as u64)
    }

    async fn renew_lease(&self, id: &JobId, worker_id: &str, lease: Duration) -> QueueResult<bool> {
        let mut conn = self.connection().await?;
        let renewed: i64 = self
            .renew_script
            .key(self.lease_key(id))
            .arg(worker_id)
            .arg(lease_millis(lease))
            .invoke_async(&mut conn)
            .await?;
        Ok(renewed == 1)
    }

    async fn complete(&self, id: &JobId, worker_id: &str, result: &JobResult) -> QueueResult<()> {
        let result_json = serde_json::to_string(result)?;
        self.finish(id, worker_id, JobState::Completed, "result", &result_json, Some(100))
            .await?;
        info!(job_id = %id, file = %result.file_name, "Job completed");
        Ok(())
    }

    async fn schedule_retry(
        &self,
        id: &JobId,
        worker_id: &str,
        delay: Duration,
        reason: &str,
    ) -> QueueResult<u32> {
        let ready_at = Utc::now().timestamp_millis() + lease_millis(delay) as i64;
        let mut conn = self.connection().await?;
        let code: i64 = self
            .retry_script
            .key(self.job_key(id))
            .key(self.lease_key(id))
            .key(self.log_key(id))
            .key(self.active_key())
            .key(self.delayed_key())
            .arg(worker_id)
            .arg(ready_at)
            .arg(reason)
            .arg(retry_log_line("{attempt}", delay))
            .arg(now_rfc3339())
            .arg(id.as_str())
            .invoke_async(&mut conn)
            .await?;

        let attempt = check_guarded(code, id, "retry")? as u32;
        info!(
            job_id = %id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Scheduled retry"
        );
        Ok(attempt)
    }

    async fn fail(&self, id: &JobId, worker_id: &str, reason: &str) -> QueueResult<()> {
        self.finish(id, worker_id, JobState::Failed, "failure_reason", reason, None)
            .await?;
        warn!(job_id = %id, reason, "Job failed");
        Ok(())
    }

    async fn promote_due(&self) -> QueueResult<usize> {
        let mut conn = self.connection().await?;
        let promoted: usize = self
            .promote_script
            .key(self.delayed_key())
            .key(self.waiting_key())
            .arg(Utc::now().timestamp_millis())
            .arg(PROMOTE_BATCH)
            .invoke_async(&mut conn)
            .await?;
        if promoted > 0 {
            debug!(promoted, "Promoted delayed jobs");
        }
        Ok(promoted)
    }

    async fn reap_expired(&self, worker_id: &str, lease: Duration) -> QueueResult<Vec<JobRecord>> {
        let mut conn = self.connection().await?;
        let ids: Vec<String> = self
            .reap_script
            .key(self.active_key())
            .arg(&self.config.key_prefix)
            .arg(worker_id)
            .arg(lease_millis(lease))
            .invoke_async(&mut conn)
            .await?;

        let mut reaped = Vec::with_capacity(ids.len());
        for id in ids {
            let id = JobId::from_string(id);
            if let Some(record) = self.get(&id).await? {
                info!(job_id = %id, worker_id, "Reclaimed job with expired lease");
                reaped.push(record);
            }
        }
        Ok(reaped)
    }

    async fn get(&self, id: &JobId) -> QueueResult<Option<JobRecord>> {
        let mut conn = self.connection().await?;
        let (fields, log): (HashMap<String, String>, Vec<String>) = redis::pipe()
            .hgetall(self.job_key(id))
            .lrange(self.log_key(id), 0, -1)
            .query_async(&mut conn)
            .await?;

        if fields.is_empty() {
            return Ok(None);
        }
        record_from_fields(&fields, log).map(Some)
    }

    async fn depth(&self) -> QueueResult<QueueDepth> {
        let mut conn = self.connection().await?;
        let waiting: u64 = conn.llen(self.waiting_key()).await?;
        let delayed: u64 = conn.zcard(self.delayed_key()).await?;
        let active: u64 = conn.llen(self.active_key()).await?;
        Ok(QueueDepth {
            waiting,
            delayed,
            active,
        })
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

fn lease_millis(d: Duration) -> u64 {
    (d.as_millis() as u64).max(1)
}

/// Translate the sentinel codes returned by guarded scripts.
fn check_guarded(code: i64, id: &JobId, action: &'static str) -> QueueResult<i64> {
    match code {
        LEASE_LOST => Err(QueueError::LeaseLost(id.clone())),
        NOT_ACTIVE | NO_ATTEMPTS_LEFT => Err(QueueError::invalid_transition(id, action)),
        other => Ok(other),
    }
}

fn record_to_fields(record: &JobRecord) -> QueueResult<Vec<(&'static str, String)>> {
    let mut fields = vec![
        ("id", record.id.to_string()),
        ("kind", record.kind.as_str().to_string()),
        ("payload", serde_json::to_string(&record.payload)?),
        ("state", record.state.as_str().to_string()),
        ("progress", record.progress.to_string()),
        ("attempt", record.attempt.to_string()),
        ("max_attempts", record.max_attempts.to_string()),
        ("version", record.version.to_string()),
        ("created_at", record.created_at.to_rfc3339()),
        ("updated_at", record.updated_at.to_rfc3339()),
    ];
    if let Some(result) = &record.result {
        fields.push(("result", serde_json::to_string(result)?));
    }
    if let Some(reason) = &record.failure_reason {
        fields.push(("failure_reason", reason.clone()));
    }
    if let Some(error) = &record.last_error {
        fields.push(("last_error", error.clone()));
    }
    Ok(fields)
}

fn record_from_fields(fields: &HashMap<String, String>, stage_log: Vec<String>) -> QueueResult<JobRecord> {
    fn field<'a>(fields: &'a HashMap<String, String>, name: &str) -> QueueResult<&'a str> {
        fields
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| QueueError::serialization(format!("missing field '{}'", name)))
    }

    fn number<T: std::str::FromStr>(fields: &HashMap<String, String>, name: &str) -> QueueResult<T> {
        field(fields, name)?
            .parse()
            .map_err(|_| QueueError::serialization(format!("invalid number in '{}'", name)))
    }

    fn timestamp(fields: &HashMap<String, String>, name: &str) -> QueueResult<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(field(fields, name)?)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| QueueError::serialization(format!("invalid timestamp in '{}': {}", name, e)))
    }

    let kind: JobKind = field(fields, "kind")?
        .parse()
        .map_err(|e: dolphin_models::PayloadError| QueueError::serialization(e.to_string()))?;
    let state: JobState = field(fields, "state")?
        .parse()
        .map_err(|e: dolphin_models::PayloadError| QueueError::serialization(e.to_string()))?;
    let result = match fields.get("result") {
        Some(json) => Some(serde_json::from_str::<JobResult>(json)?),
        None => None,
    };

    Ok(JobRecord {
        id: JobId::from_string(field(fields, "id")?),
        kind,
        payload: serde_json::from_str(field(fields, "payload")?)?,
        state,
        progress: number(fields, "progress")?,
        attempt: number(fields, "attempt")?,
        max_attempts: number(fields, "max_attempts")?,
        stage_log,
        result,
        failure_reason: fields.get("failure_reason").cloned(),
        last_error: fields.get("last_error").cloned(),
        version: number(fields, "version")?,
        created_at: timestamp(fields, "created_at")?,
        updated_at: timestamp(fields, "updated_at")?,
    })
}
