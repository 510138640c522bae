//! Redis-backed work queue (lists + hash).
//!
//! ## Keys
//!
//! - `{prefix}:ready` list; producers `LPUSH`, consumers pop from the right.
//! - `{prefix}:processing` list of in-flight entries.
//! - `{prefix}:claimed_at` hash, task id → claim time in epoch millis.
//!
//! `dequeue_ready` uses `BLMOVE ready processing RIGHT LEFT`, so a popped
//! entry is already in `processing` when it reaches the consumer. A crash
//! between the move and the timestamp write leaves an unstamped entry; the
//! reaper stamps it on first sight (see [`STAMP_UNCLAIMED_SCRIPT`]) and
//! reclaims it once that stamp is stale.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{instrument, warn};

use docflow_core::{QueueEntry, TaskId};

use super::{QueueError, QueueLengths, WorkQueue};

const DEFAULT_PREFIX: &str = "docflow:queue";

/// `BLMOVE` treats a zero timeout as "block forever".
const MIN_BLOCK: Duration = Duration::from_millis(10);

/// KEYS: processing list, claimed_at hash. ARGV: payload, task id, millis.
/// Writes the stamp only while the payload is still in `processing` and the
/// task has none yet.
const STAMP_UNCLAIMED_SCRIPT: &str = r#"
if redis.call('HEXISTS', KEYS[2], ARGV[2]) == 1 then
  return 0
end
if not redis.call('LPOS', KEYS[1], ARGV[1]) then
  return 0
end
redis.call('HSET', KEYS[2], ARGV[2], ARGV[3])
return 1
"#;

#[derive(Debug, Clone)]
pub struct RedisWorkQueue {
    client: Arc<redis::Client>,
    ready_key: String,
    processing_key: String,
    claimed_at_key: String,
}

impl RedisWorkQueue {
    /// `prefix` defaults to `docflow:queue`.
    pub fn new(redis_url: impl AsRef<str>, prefix: Option<&str>) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;
        let prefix = prefix.unwrap_or(DEFAULT_PREFIX);

        Ok(Self {
            client: Arc::new(client),
            ready_key: format!("{prefix}:ready"),
            processing_key: format!("{prefix}:processing"),
            claimed_at_key: format!("{prefix}:claimed_at"),
        })
    }

    fn connection(&self) -> Result<redis::Connection, QueueError> {
        self.client
            .get_connection()
            .map_err(|e| QueueError::Unavailable(e.to_string()))
    }
}

fn encode(entry: &QueueEntry) -> Result<String, QueueError> {
    serde_json::to_string(entry).map_err(|e| QueueError::Codec(e.to_string()))
}

fn decode(payload: &str) -> Result<QueueEntry, QueueError> {
    serde_json::from_str(payload).map_err(|e| QueueError::Codec(e.to_string()))
}

fn command_error(command: &'static str) -> impl Fn(redis::RedisError) -> QueueError {
    move |e| QueueError::Unavailable(format!("{command} failed: {e}"))
}

impl WorkQueue for RedisWorkQueue {
    fn enqueue_ready(&self, entry: &QueueEntry) -> Result<(), QueueError> {
        let payload = encode(entry)?;
        let mut conn = self.connection()?;
        let _: u64 = redis::cmd("LPUSH")
            .arg(&self.ready_key)
            .arg(&payload)
            .query(&mut conn)
            .map_err(command_error("LPUSH"))?;
        Ok(())
    }

    #[instrument(skip(self), fields(ready_key = %self.ready_key), err)]
    fn dequeue_ready(&self, timeout: Duration) -> Result<Option<QueueEntry>, QueueError> {
        let mut conn = self.connection()?;
        let payload: Option<String> = redis::cmd("BLMOVE")
            .arg(&self.ready_key)
            .arg(&self.processing_key)
            .arg("RIGHT")
            .arg("LEFT")
            .arg(timeout.max(MIN_BLOCK).as_secs_f64())
            .query(&mut conn)
            .map_err(command_error("BLMOVE"))?;

        let Some(payload) = payload else {
            return Ok(None);
        };

        match decode(&payload) {
            Ok(entry) => Ok(Some(entry)),
            Err(e) => {
                // Unreadable entries can never be claimed; drop them here.
                warn!(payload = %payload, error = %e, "Discarding malformed queue entry");
                let _: u64 = redis::cmd("LREM")
                    .arg(&self.processing_key)
                    .arg(1)
                    .arg(&payload)
                    .query(&mut conn)
                    .map_err(command_error("LREM"))?;
                Ok(None)
            }
        }
    }

    fn move_to_processing(
        &self,
        entry: &QueueEntry,
        claimed_at: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        let mut conn = self.connection()?;
        let _: u64 = redis::cmd("HSET")
            .arg(&self.claimed_at_key)
            .arg(entry.task_id.get())
            .arg(claimed_at.timestamp_millis())
            .query(&mut conn)
            .map_err(command_error("HSET"))?;
        Ok(())
    }

    fn acknowledge(&self, entry: &QueueEntry) -> Result<(), QueueError> {
        let payload = encode(entry)?;
        let mut conn = self.connection()?;
        let _: () = redis::pipe()
            .atomic()
            .cmd("LREM")
            .arg(&self.processing_key)
            .arg(1)
            .arg(&payload)
            .ignore()
            .cmd("HDEL")
            .arg(&self.claimed_at_key)
            .arg(entry.task_id.get())
            .ignore()
            .query(&mut conn)
            .map_err(command_error("LREM/HDEL"))?;
        Ok(())
    }

    fn list_processing(&self) -> Result<Vec<QueueEntry>, QueueError> {
        let mut conn = self.connection()?;
        let payloads: Vec<String> = redis::cmd("LRANGE")
            .arg(&self.processing_key)
            .arg(0)
            .arg(-1)
            .query(&mut conn)
            .map_err(command_error("LRANGE"))?;

        Ok(payloads
            .iter()
            .filter_map(|payload| match decode(payload) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!(payload = %payload, error = %e, "Skipping malformed processing entry");
                    None
                }
            })
            .collect())
    }

    fn claim_timestamp(&self, task_id: TaskId) -> Result<Option<DateTime<Utc>>, QueueError> {
        let mut conn = self.connection()?;
        let millis: Option<i64> = redis::cmd("HGET")
            .arg(&self.claimed_at_key)
            .arg(task_id.get())
            .query(&mut conn)
            .map_err(command_error("HGET"))?;

        match millis {
            None => Ok(None),
            Some(ms) => DateTime::from_timestamp_millis(ms).map(Some).ok_or_else(|| {
                QueueError::Codec(format!("claim timestamp out of range for task {task_id}: {ms}"))
            }),
        }
    }

    fn stamp_unclaimed(
        &self,
        entry: &QueueEntry,
        seen_at: DateTime<Utc>,
    ) -> Result<bool, QueueError> {
        let payload = encode(entry)?;
        let mut conn = self.connection()?;
        let written: i64 = redis::Script::new(STAMP_UNCLAIMED_SCRIPT)
            .key(&self.processing_key)
            .key(&self.claimed_at_key)
            .arg(&payload)
            .arg(entry.task_id.get())
            .arg(seen_at.timestamp_millis())
            .invoke(&mut conn)
            .map_err(command_error("EVALSHA stamp_unclaimed"))?;
        Ok(written == 1)
    }

    fn lengths(&self) -> Result<QueueLengths, QueueError> {
        let mut conn = self.connection()?;
        let (ready, processing): (usize, usize) = redis::pipe()
            .cmd("LLEN")
            .arg(&self.ready_key)
            .cmd("LLEN")
            .arg(&self.processing_key)
            .query(&mut conn)
            .map_err(command_error("LLEN"))?;
        Ok(QueueLengths { ready, processing })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_use_prefix() {
        let queue = RedisWorkQueue::new("redis://127.0.0.1:6379", Some("test:q")).unwrap();
        assert_eq!(queue.ready_key, "test:q:ready");
        assert_eq!(queue.processing_key, "test:q:processing");
        assert_eq!(queue.claimed_at_key, "test:q:claimed_at");
    }

    #[test]
    fn entry_payload_matches_wire_format() {
        let entry = QueueEntry::new(TaskId::new(3), "contract");
        let payload = encode(&entry).unwrap();
        assert_eq!(payload, r#"{"task_id":3,"task_name":"contract"}"#);
        assert_eq!(decode(&payload).unwrap(), entry);
        assert!(matches!(decode("not json"), Err(QueueError::Codec(_))));
    }

    #[test]
    fn zero_dequeue_timeout_never_blocks_forever() {
        assert!(Duration::ZERO.max(MIN_BLOCK).as_secs_f64() > 0.0);
    }
}
