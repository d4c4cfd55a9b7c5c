//! Redis Streams transport
//!
//! Each queue is a stream consumed through a consumer group. A read moves an
//! entry into the group's pending list; `XACK` settles it. Redis has no
//! native requeue, so a requeue appends a copy of the entry (with its
//! delivery count bumped) and acknowledges the original in one transaction.
//! Rejection without requeue moves the entry to `<stream>:dead`.
//!
//! On subscribe the consumer first replays its own pending entries (left
//! over from a previous run that stopped before settling them), then claims
//! entries that sat unsettled in any consumer's pending list for longer than
//! `claim_idle` (`XAUTOCLAIM`, Redis 6.2+), then reads new entries. The claim
//! pass repeats every `claim_idle`, so entries abandoned by a crashed or
//! replaced worker are eventually redelivered.

use super::{Acknowledger, Delivery, QueueClient, Subscription};
use async_trait::async_trait;
use bytes::Bytes;
use postguard_core::{Error, PublishError, Result};
use redis::aio::ConnectionManager;
use redis::streams::{StreamId, StreamReadReply};
use std::collections::VecDeque;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Payload field of a stream entry
const PAYLOAD_FIELD: &str = "payload";
/// Redelivery counter field of a stream entry
const DELIVERY_COUNT_FIELD: &str = "delivery_count";

/// Delay before retrying a failed read
const READ_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct RedisSettings {
    pub url: String,
    /// Consumer group shared by all worker instances
    pub group: String,
    /// Name of this consumer within the group
    pub consumer: String,
    /// How long one read waits for new entries
    pub block_timeout: Duration,
    /// Entries fetched per read
    pub batch_size: usize,
    /// Pending entries idle this long are claimed from other consumers
    pub claim_idle: Duration,
}

pub struct RedisStreamsClient {
    client: redis::Client,
    writer: ConnectionManager,
    settings: RedisSettings,
    shutdown: CancellationToken,
}

impl RedisStreamsClient {
    pub async fn connect(settings: RedisSettings) -> Result<Self> {
        let client = redis::Client::open(settings.url.as_str())
            .map_err(|e| Error::queue(format!("Failed to create Redis client: {}", e)))?;
        let writer = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| Error::queue(format!("Failed to connect to Redis: {}", e)))?;

        tracing::info!(
            url = %settings.url,
            group = %settings.group,
            consumer = %settings.consumer,
            "Connected to Redis"
        );

        Ok(Self {
            client,
            writer,
            settings,
            shutdown: CancellationToken::new(),
        })
    }

    /// End every subscription opened by this client
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    /// Create the consumer group (and the stream) unless it already exists
    async fn ensure_group(&self, stream: &str) -> Result<()> {
        let mut conn = self.writer.clone();
        let created: redis::RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(&self.settings.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match created {
            Ok(()) => {
                tracing::info!(stream, group = %self.settings.group, "Created consumer group");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(Error::queue(format!(
                "Failed to create consumer group on '{}': {}",
                stream, e
            ))),
        }
    }
}

fn dead_letter_stream(stream: &str) -> String {
    format!("{}:dead", stream)
}

/// Payload and delivery count of an entry. Replayed and claimed entries were
/// delivered once already, so their count is bumped.
fn entry_parts(entry: &StreamId, replayed: bool) -> (Bytes, u32) {
    let payload = entry
        .get::<Vec<u8>>(PAYLOAD_FIELD)
        .map(Bytes::from)
        .unwrap_or_default();
    let count = entry.get::<u32>(DELIVERY_COUNT_FIELD).unwrap_or(0);
    (payload, if replayed { count + 1 } else { count })
}

/// Where the next read starts
#[derive(Debug, Clone, PartialEq, Eq)]
enum ReadPhase {
    /// Re-read this consumer's own pending entries after the given id
    OwnPending(String),
    /// Claim idle pending entries from the given `XAUTOCLAIM` cursor
    Claim(String),
    /// Read entries never delivered to the group
    New,
}

const CLAIM_START: &str = "0-0";

/// Read phase sequencing: own pending, then claim, then new entries, with a
/// claim pass again every `claim_every`
#[derive(Debug)]
struct ReadCursor {
    phase: ReadPhase,
    claim_every: Duration,
    next_claim: Instant,
}

impl ReadCursor {
    fn new(claim_every: Duration, now: Instant) -> Self {
        Self {
            phase: ReadPhase::OwnPending("0".to_string()),
            claim_every,
            next_claim: now,
        }
    }

    /// Phase of the next read
    fn phase(&mut self, now: Instant) -> &ReadPhase {
        if self.phase == ReadPhase::New && now >= self.next_claim {
            self.phase = ReadPhase::Claim(CLAIM_START.to_string());
        }
        &self.phase
    }

    /// A replay read returned entries up to `last_id`, or nothing
    fn replayed(&mut self, last_id: Option<&str>) {
        self.phase = match last_id {
            Some(id) => ReadPhase::OwnPending(id.to_string()),
            None => ReadPhase::Claim(CLAIM_START.to_string()),
        };
    }

    /// A claim page finished with `next_cursor`
    fn claimed(&mut self, next_cursor: &str, now: Instant) {
        if next_cursor == CLAIM_START {
            self.phase = ReadPhase::New;
            self.next_claim = now + self.claim_every;
        } else {
            self.phase = ReadPhase::Claim(next_cursor.to_string());
        }
    }

    /// Whether deliveries from the current phase were delivered before
    fn redelivers(&self) -> bool {
        !matches!(self.phase, ReadPhase::New)
    }
}

fn unexpected_reply(what: &'static str) -> redis::RedisError {
    redis::RedisError::from((redis::ErrorKind::TypeError, what))
}

/// Parse an `XAUTOCLAIM` reply into the next cursor and the claimed entries.
/// Entries deleted while pending come back as nil (Redis 6.2) or only in the
/// trailing deleted-id list (Redis 7) and are skipped.
fn parse_autoclaim(reply: &redis::Value) -> redis::RedisResult<(String, Vec<StreamId>)> {
    let redis::Value::Bulk(parts) = reply else {
        return Err(unexpected_reply("XAUTOCLAIM reply is not an array"));
    };
    let cursor: String = match parts.first() {
        Some(value) => redis::from_redis_value(value)?,
        None => return Err(unexpected_reply("XAUTOCLAIM reply has no cursor")),
    };
    let entries = match parts.get(1) {
        Some(redis::Value::Bulk(entries)) => entries,
        Some(redis::Value::Nil) | None => return Ok((cursor, Vec::new())),
        Some(_) => return Err(unexpected_reply("XAUTOCLAIM entries are not an array")),
    };

    let mut claimed = Vec::with_capacity(entries.len());
    for entry in entries {
        let redis::Value::Bulk(pair) = entry else {
            continue;
        };
        let (Some(id), Some(redis::Value::Bulk(fields))) = (pair.first(), pair.get(1)) else {
            continue;
        };
        let mut map = HashMap::with_capacity(fields.len() / 2);
        for field in fields.chunks_exact(2) {
            let key: String = redis::from_redis_value(&field[0])?;
            map.insert(key, field[1].clone());
        }
        claimed.push(StreamId {
            id: redis::from_redis_value(id)?,
            map,
        });
    }

    Ok((cursor, claimed))
}

struct ReadState {
    conn: ConnectionManager,
    stream: String,
    settings: RedisSettings,
    cursor: ReadCursor,
    buffer: VecDeque<Delivery>,
    acker: Arc<dyn Acknowledger>,
    shutdown: CancellationToken,
}

impl ReadState {
    async fn read_batch(&mut self) -> redis::RedisResult<Vec<Delivery>> {
        let phase = self.cursor.phase(Instant::now()).clone();
        let redelivered = self.cursor.redelivers();

        let entries = match phase {
            ReadPhase::OwnPending(after) => {
                let entries = self.read_group(&after, false).await?;
                if entries.is_empty() {
                    tracing::debug!(stream = %self.stream, "Pending entries replayed");
                }
                self.cursor.replayed(entries.last().map(|e| e.id.as_str()));
                entries
            }
            ReadPhase::Claim(from) => {
                let (next, entries) = self.claim_idle(&from).await?;
                if !entries.is_empty() {
                    tracing::info!(
                        stream = %self.stream,
                        claimed = entries.len(),
                        "Claimed idle pending entries"
                    );
                }
                self.cursor.claimed(&next, Instant::now());
                entries
            }
            ReadPhase::New => self.read_group(">", true).await?,
        };

        Ok(entries
            .iter()
            .map(|entry| {
                let (payload, count) = entry_parts(entry, redelivered);
                Delivery::new(entry.id.clone(), payload, count, Arc::clone(&self.acker))
            })
            .collect())
    }

    async fn read_group(&mut self, id: &str, block: bool) -> redis::RedisResult<Vec<StreamId>> {
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(&self.settings.group)
            .arg(&self.settings.consumer)
            .arg("COUNT")
            .arg(self.settings.batch_size);
        if block {
            cmd.arg("BLOCK")
                .arg(self.settings.block_timeout.as_millis() as u64);
        }
        cmd.arg("STREAMS").arg(&self.stream).arg(id);

        let reply: Option<StreamReadReply> = cmd.query_async(&mut self.conn).await?;
        Ok(reply
            .map(|r| r.keys.into_iter().flat_map(|k| k.ids).collect())
            .unwrap_or_default())
    }

    async fn claim_idle(&mut self, from: &str) -> redis::RedisResult<(String, Vec<StreamId>)> {
        let reply: redis::Value = redis::cmd("XAUTOCLAIM")
            .arg(&self.stream)
            .arg(&self.settings.group)
            .arg(&self.settings.consumer)
            .arg(self.settings.claim_idle.as_millis() as u64)
            .arg(from)
            .arg("COUNT")
            .arg(self.settings.batch_size)
            .query_async(&mut self.conn)
            .await?;
        parse_autoclaim(&reply)
    }

    async fn next(mut self) -> Option<(Delivery, Self)> {
        loop {
            if let Some(delivery) = self.buffer.pop_front() {
                return Some((delivery, self));
            }

            let shutdown = self.shutdown.clone();
            let read = tokio::select! {
                _ = shutdown.cancelled() => return None,
                read = self.read_batch() => read,
            };

            match read {
                Ok(deliveries) => self.buffer.extend(deliveries),
                Err(e) => {
                    tracing::warn!(stream = %self.stream, error = %e, "Stream read failed, retrying");
                    tokio::select! {
                        _ = shutdown.cancelled() => return None,
                        _ = tokio::time::sleep(READ_RETRY_DELAY) => {}
                    }
                }
            }
        }
    }
}

struct StreamAcker {
    conn: ConnectionManager,
    stream: String,
    group: String,
}

impl StreamAcker {
    /// Append a copy of `delivery` to `target` and settle the original
    async fn move_to(&self, delivery: &Delivery, target: &str, delivery_count: u32) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .cmd("XADD")
            .arg(target)
            .arg("*")
            .arg(PAYLOAD_FIELD)
            .arg(delivery.payload().as_ref())
            .arg(DELIVERY_COUNT_FIELD)
            .arg(delivery_count)
            .ignore()
            .cmd("XACK")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(delivery.tag())
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| Error::queue(format!("Failed to move entry {}: {}", delivery.tag(), e)))
    }
}

#[async_trait]
impl Acknowledger for StreamAcker {
    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("XACK")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(delivery.tag())
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::queue(format!("Failed to ack entry {}: {}", delivery.tag(), e)))?;
        Ok(())
    }

    async fn reject(&self, delivery: &Delivery, requeue: bool) -> Result<()> {
        if requeue {
            self.move_to(delivery, &self.stream, delivery.delivery_count() + 1)
                .await
        } else {
            self.move_to(
                delivery,
                &dead_letter_stream(&self.stream),
                delivery.delivery_count(),
            )
            .await
        }
    }
}

#[async_trait]
impl QueueClient for RedisStreamsClient {
    async fn consume(&self, queue: &str) -> Result<Subscription> {
        self.ensure_group(queue).await?;

        // Blocking reads get their own connection so acks and publishes on
        // the shared one are never queued behind them.
        let conn = ConnectionManager::new(self.client.clone())
            .await
            .map_err(|e| Error::queue(format!("Failed to connect to Redis: {}", e)))?;

        let state = ReadState {
            conn,
            stream: queue.to_string(),
            settings: self.settings.clone(),
            cursor: ReadCursor::new(self.settings.claim_idle, Instant::now()),
            buffer: VecDeque::new(),
            acker: Arc::new(StreamAcker {
                conn: self.writer.clone(),
                stream: queue.to_string(),
                group: self.settings.group.clone(),
            }),
            shutdown: self.shutdown.child_token(),
        };

        tracing::info!(stream = queue, "Subscribed to stream");
        Ok(Box::pin(futures::stream::unfold(state, ReadState::next)))
    }

    async fn publish(&self, queue: &str, payload: Bytes) -> std::result::Result<(), PublishError> {
        let mut conn = self.writer.clone();
        let _: String = redis::cmd("XADD")
            .arg(queue)
            .arg("*")
            .arg(PAYLOAD_FIELD)
            .arg(payload.as_ref())
            .query_async(&mut conn)
            .await
            .map_err(|e| PublishError::unavailable(format!("XADD to '{}' failed: {}", queue, e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redis::Value;

    fn entry(fields: &[(&str, &[u8])]) -> StreamId {
        StreamId {
            id: "1-0".to_string(),
            map: fields
                .iter()
                .map(|(k, v)| (k.to_string(), Value::Data(v.to_vec())))
                .collect::<HashMap<_, _>>(),
        }
    }

    #[test]
    fn test_entry_parts() {
        let e = entry(&[("payload", b"{\"post_id\":\"p1\"}"), ("delivery_count", b"2")]);
        assert_eq!(
            entry_parts(&e, false),
            (Bytes::from_static(b"{\"post_id\":\"p1\"}"), 2)
        );
        assert_eq!(entry_parts(&e, true).1, 3);
    }

    #[test]
    fn test_entry_without_fields() {
        let e = entry(&[]);
        assert_eq!(entry_parts(&e, false), (Bytes::new(), 0));
    }

    fn data(s: &str) -> Value {
        Value::Data(s.as_bytes().to_vec())
    }

    #[test]
    fn test_cursor_replays_then_claims_then_reads_new() {
        let start = Instant::now();
        let mut cursor = ReadCursor::new(Duration::from_secs(60), start);
        assert_eq!(cursor.phase(start), &ReadPhase::OwnPending("0".to_string()));
        assert!(cursor.redelivers());

        cursor.replayed(Some("5-0"));
        assert_eq!(cursor.phase(start), &ReadPhase::OwnPending("5-0".to_string()));

        cursor.replayed(None);
        assert_eq!(cursor.phase(start), &ReadPhase::Claim("0-0".to_string()));
        assert!(cursor.redelivers());

        cursor.claimed("7-0", start);
        assert_eq!(cursor.phase(start), &ReadPhase::Claim("7-0".to_string()));

        cursor.claimed("0-0", start);
        assert_eq!(cursor.phase(start), &ReadPhase::New);
        assert!(!cursor.redelivers());
    }

    #[test]
    fn test_cursor_claims_again_after_interval() {
        let start = Instant::now();
        let mut cursor = ReadCursor::new(Duration::from_secs(60), start);
        cursor.replayed(None);
        cursor.claimed("0-0", start);

        assert_eq!(cursor.phase(start + Duration::from_secs(59)), &ReadPhase::New);
        assert_eq!(
            cursor.phase(start + Duration::from_secs(60)),
            &ReadPhase::Claim("0-0".to_string())
        );

        let later = start + Duration::from_secs(61);
        cursor.claimed("0-0", later);
        assert_eq!(cursor.phase(later + Duration::from_secs(30)), &ReadPhase::New);
    }

    #[test]
    fn test_parse_autoclaim_reply() {
        let reply = Value::Bulk(vec![
            data("0-0"),
            Value::Bulk(vec![
                Value::Bulk(vec![
                    data("3-0"),
                    Value::Bulk(vec![data("payload"), data("{}"), data("delivery_count"), data("1")]),
                ]),
                Value::Nil,
            ]),
            Value::Bulk(vec![data("4-0")]),
        ]);

        let (cursor, entries) = parse_autoclaim(&reply).unwrap();
        assert_eq!(cursor, "0-0");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, "3-0");
        assert_eq!(entry_parts(&entries[0], true), (Bytes::from_static(b"{}"), 2));
    }

    #[test]
    fn test_parse_autoclaim_empty_and_invalid() {
        let (cursor, entries) =
            parse_autoclaim(&Value::Bulk(vec![data("0-0"), Value::Bulk(vec![])])).unwrap();
        assert_eq!(cursor, "0-0");
        assert!(entries.is_empty());

        assert!(parse_autoclaim(&Value::Nil).is_err());
        assert!(parse_autoclaim(&Value::Bulk(vec![])).is_err());
    }

    #[test]
    fn test_dead_letter_stream() {
        assert_eq!(dead_letter_stream("post-create"), "post-create:dead");
    }
}
