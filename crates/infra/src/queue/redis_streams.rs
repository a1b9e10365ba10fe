//! Redis Streams-backed queue (durable, at-least-once delivery).
//!
//! - **Publish**: `XADD <stream> * payload <json>`
//! - **Consumer group**: created idempotently with `MKSTREAM`
//! - **Receive**: re-claim one entry idle longer than the visibility timeout
//!   (`XPENDING ... IDLE` + `XCLAIM`), otherwise `XREADGROUP ... BLOCK` for a new one
//! - **Ack**: `XACK`; **nack**: leave pending until the visibility timeout
//! - **Dead-letter**: undecodable entries and entries past `max_deliveries`
//!   are copied to `<stream>:dlq` and acknowledged
//!
//! Publishing and acks share one multiplexed connection. Each consumer gets
//! its own connection for blocking reads so one `BLOCK` never stalls the rest.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{RedisError, Value};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, instrument, warn};

use demandflow_messaging::{Delivery, DeliveryTag, MessageQueue, QueueError};

use super::QueueSettings;

pub struct RedisStreamsQueue<M> {
    client: redis::Client,
    conn: MultiplexedConnection,
    readers: Mutex<HashMap<String, MultiplexedConnection>>,
    stream: String,
    dlq: String,
    group: String,
    visibility_timeout: Duration,
    max_deliveries: u32,
    _message: PhantomData<fn() -> M>,
}

/// One raw stream entry.
struct StreamEntry {
    id: String,
    fields: HashMap<String, String>,
}

impl<M> RedisStreamsQueue<M>
where
    M: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Connect to Redis. Does not create the consumer group; see [`Self::ensure_group`].
    pub async fn connect(
        redis_url: &str,
        stream: impl Into<String>,
        group: impl Into<String>,
    ) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(map_redis_error)?;
        let conn = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(map_redis_error)?;
        let stream = stream.into();
        let defaults = QueueSettings::default();

        Ok(Self {
            client,
            conn,
            readers: Mutex::new(HashMap::new()),
            dlq: QueueSettings::dead_letter_stream(&stream),
            stream,
            group: group.into(),
            visibility_timeout: defaults.visibility_timeout,
            max_deliveries: defaults.max_deliveries,
            _message: PhantomData,
        })
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    pub fn with_max_deliveries(mut self, max: u32) -> Self {
        self.max_deliveries = max.max(1);
        self
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Create the consumer group (and the stream) if missing.
    pub async fn ensure_group(&self) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let created: Result<String, RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream)
            .arg(&self.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match created {
            Ok(_) => {
                debug!(stream = %self.stream, group = %self.group, "consumer group created");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(map_redis_error(e)),
        }
    }

    async fn reader(&self, consumer: &str) -> Result<MultiplexedConnection, QueueError> {
        let mut readers = self.readers.lock().await;
        if let Some(conn) = readers.get(consumer) {
            return Ok(conn.clone());
        }
        let conn = self
            .client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(map_redis_error)?;
        readers.insert(consumer.to_string(), conn.clone());
        Ok(conn)
    }

    /// Take over one entry another consumer left unacked for too long.
    async fn reclaim(&self, consumer: &str) -> Result<Option<Delivery<M>>, QueueError> {
        let mut conn = self.conn.clone();
        let idle_ms = self.visibility_timeout.as_millis().to_string();

        let pending: Vec<(String, String, u64, u64)> = redis::cmd("XPENDING")
            .arg(&self.stream)
            .arg(&self.group)
            .arg("IDLE")
            .arg(&idle_ms)
            .arg("-")
            .arg("+")
            .arg(1)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        let Some((id, previous_owner, _, delivered)) = pending.into_iter().next() else {
            return Ok(None);
        };

        let claimed: Value = redis::cmd("XCLAIM")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(consumer)
            .arg(&idle_ms)
            .arg(&id)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        // Another consumer claimed it first, or the entry was trimmed.
        let Some(entry) = parse_entries(claimed).into_iter().next() else {
            return Ok(None);
        };

        let delivery_count = u32::try_from(delivered).unwrap_or(u32::MAX).saturating_add(1);
        warn!(
            stream = %self.stream,
            entry_id = %entry.id,
            %previous_owner,
            delivery_count,
            "re-claimed idle delivery"
        );

        if delivery_count > self.max_deliveries {
            self.dead_letter(&entry, "max deliveries exceeded").await?;
            return Ok(None);
        }
        self.decode(entry, delivery_count).await
    }

    async fn read_new(
        &self,
        consumer: &str,
        wait: Duration,
    ) -> Result<Option<Delivery<M>>, QueueError> {
        let mut conn = self.reader(consumer).await?;
        // BLOCK 0 would wait forever.
        let block_ms = wait.as_millis().max(1).to_string();

        let reply: Value = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.group)
            .arg(consumer)
            .arg("COUNT")
            .arg(1)
            .arg("BLOCK")
            .arg(&block_ms)
            .arg("STREAMS")
            .arg(&self.stream)
            .arg(">")
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        match parse_read_reply(reply).into_iter().next() {
            Some(entry) => self.decode(entry, 1).await,
            None => Ok(None),
        }
    }

    async fn decode(
        &self,
        entry: StreamEntry,
        delivery_count: u32,
    ) -> Result<Option<Delivery<M>>, QueueError> {
        let decoded = entry
            .fields
            .get("payload")
            .ok_or_else(|| "missing payload field".to_string())
            .and_then(|p| serde_json::from_str::<M>(p).map_err(|e| e.to_string()));

        match decoded {
            Ok(message) => Ok(Some(Delivery {
                tag: DeliveryTag::new(entry.id),
                message,
                delivery_count,
            })),
            Err(reason) => {
                self.dead_letter(&entry, &reason).await?;
                Ok(None)
            }
        }
    }

    /// Copy `entry` to the dead-letter stream, then acknowledge it.
    async fn dead_letter(&self, entry: &StreamEntry, reason: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let payload = entry.fields.get("payload").map(String::as_str).unwrap_or("");

        let _: String = redis::cmd("XADD")
            .arg(&self.dlq)
            .arg("*")
            .arg("original_id")
            .arg(&entry.id)
            .arg("reason")
            .arg(reason)
            .arg("failed_at")
            .arg(chrono::Utc::now().to_rfc3339())
            .arg("payload")
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        error!(stream = %self.stream, entry_id = %entry.id, reason, "entry moved to dead-letter stream");
        self.ack(&DeliveryTag::new(entry.id.clone())).await
    }
}

#[async_trait]
impl<M> MessageQueue<M> for RedisStreamsQueue<M>
where
    M: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    #[instrument(skip(self, message), fields(stream = %self.stream), err)]
    async fn publish(&self, message: &M) -> Result<(), QueueError> {
        let payload =
            serde_json::to_string(message).map_err(|e| QueueError::Serialization(e.to_string()))?;
        let mut conn = self.conn.clone();

        let _: String = redis::cmd("XADD")
            .arg(&self.stream)
            .arg("*")
            .arg("payload")
            .arg(&payload)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(())
    }

    async fn receive(
        &self,
        consumer: &str,
        wait: Duration,
    ) -> Result<Option<Delivery<M>>, QueueError> {
        if let Some(delivery) = self.reclaim(consumer).await? {
            return Ok(Some(delivery));
        }
        self.read_new(consumer, wait).await
    }

    #[instrument(skip(self), fields(stream = %self.stream), err)]
    async fn ack(&self, tag: &DeliveryTag) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let acked: u64 = redis::cmd("XACK")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(tag.as_str())
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        if acked == 0 {
            return Err(QueueError::UnknownDelivery(tag.to_string()));
        }
        Ok(())
    }

    async fn nack(&self, tag: &DeliveryTag) -> Result<(), QueueError> {
        // Stays in the pending list; re-claimed once idle past the visibility timeout.
        debug!(stream = %self.stream, entry_id = %tag, "delivery left pending");
        Ok(())
    }
}

fn map_redis_error(e: RedisError) -> QueueError {
    if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
        QueueError::Connection(e.to_string())
    } else {
        QueueError::Command(e.to_string())
    }
}

fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Data(data) => Some(String::from_utf8_lossy(data).into_owned()),
        Value::Status(s) => Some(s.clone()),
        _ => None,
    }
}

/// `XREADGROUP` reply: `[[stream, [entry, ...]], ...]`, or nil on timeout.
fn parse_read_reply(reply: Value) -> Vec<StreamEntry> {
    let Value::Bulk(streams) = reply else {
        return Vec::new();
    };
    streams
        .into_iter()
        .filter_map(|stream| match stream {
            Value::Bulk(mut parts) if parts.len() == 2 => parts.pop(),
            _ => None,
        })
        .flat_map(parse_entries)
        .collect()
}

/// A list of `[id, [field, value, ...]]` entries. Nil entries (deleted) are skipped.
fn parse_entries(value: Value) -> Vec<StreamEntry> {
    let Value::Bulk(entries) = value else {
        return Vec::new();
    };
    entries.into_iter().filter_map(parse_entry).collect()
}

fn parse_entry(value: Value) -> Option<StreamEntry> {
    let Value::Bulk(parts) = value else {
        return None;
    };
    let id = value_to_string(parts.first()?)?;
    let Some(Value::Bulk(raw)) = parts.get(1) else {
        return None;
    };

    let fields = raw
        .chunks(2)
        .filter_map(|pair| match pair {
            [k, v] => Some((value_to_string(k)?, value_to_string(v)?)),
            _ => None,
        })
        .collect();
    Some(StreamEntry { id, fields })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(s: &str) -> Value {
        Value::Data(s.as_bytes().to_vec())
    }

    fn entry(id: &str, payload: &str) -> Value {
        Value::Bulk(vec![
            data(id),
            Value::Bulk(vec![data("payload"), data(payload)]),
        ])
    }

    #[test]
    fn parses_xreadgroup_reply() {
        let reply = Value::Bulk(vec![Value::Bulk(vec![
            data("demandflow:tasks"),
            Value::Bulk(vec![entry("1-0", r#"{"a":1}"#), entry("2-0", "{}")]),
        ])]);

        let entries = parse_read_reply(reply);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id, "1-0");
        assert_eq!(entries[0].fields["payload"], r#"{"a":1}"#);
    }

    #[test]
    fn blocking_timeout_reply_is_empty() {
        assert!(parse_read_reply(Value::Nil).is_empty());
    }

    #[test]
    fn xclaim_reply_skips_deleted_entries() {
        let reply = Value::Bulk(vec![Value::Nil, entry("3-0", "{}")]);
        let entries = parse_entries(reply);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, "3-0");
    }

    #[test]
    fn odd_field_lists_drop_the_dangling_key() {
        let reply = Value::Bulk(vec![
            data("4-0"),
            Value::Bulk(vec![data("payload"), data("{}"), data("orphan")]),
        ]);
        let entry = parse_entry(reply).unwrap();
        assert_eq!(entry.fields.len(), 1);
    }
}
