//! Redis Streams implementation of [`BrokerGateway`].
//!
//! | Operation      | Redis                                                        |
//! |----------------|--------------------------------------------------------------|
//! | `ensure_topic` | `XGROUP CREATE T_stream T_consumer 0 MKSTREAM`               |
//! | `publish`      | `XADD T_stream MINID ~ <now - retention> * envelope <json>`  |
//! | `pull`         | `XPENDING ... IDLE` + `XCLAIM` for due redeliveries, else     |
//! |                | `XREADGROUP GROUP T_consumer <member> ... BLOCK ... >`       |
//! | `ack`          | `XACK`                                                       |
//! | `nak`          | `XCLAIM ... IDLE 0 JUSTID` (restarts the backoff clock)      |
//! | `unsubscribe`  | `XGROUP DELCONSUMER` once this member has nothing pending    |
//!
//! Unacknowledged entries stay in the group's pending list across crashes
//! and are reclaimed by whichever member pulls once their backoff elapsed.

use crate::topic::{consumer_group_name, stream_name, validate_topic};
use crate::{BrokerGateway, CourierError, CourierResult, Delivery, Envelope, RedeliveryPolicy};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::streams::{
    StreamClaimReply, StreamId, StreamPendingCountReply, StreamPendingId, StreamReadReply,
};
use redis::{Client, Cmd, RedisResult};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Stream entry field holding the serialized envelope.
pub const ENVELOPE_FIELD: &str = "envelope";

/// How many pending entries are inspected per reclaim pass, per requested
/// message.
const PENDING_SCAN_FACTOR: usize = 4;

/// Configuration for [`RedisStreamsGateway`].
#[derive(Debug, Clone)]
pub struct RedisGatewayConfig {
    pub redis_url: String,
    /// Member name inside each consumer group. Unique per process.
    pub consumer_name: String,
    /// Entries older than this are trimmed on publish.
    pub retention: Duration,
    pub redelivery: RedeliveryPolicy,
}

impl RedisGatewayConfig {
    pub fn new(redis_url: impl Into<String>) -> Self {
        Self {
            redis_url: redis_url.into(),
            consumer_name: format!("{}-{}", std::process::id(), uuid::Uuid::new_v4().simple()),
            retention: Duration::from_secs(24 * 3_600),
            redelivery: RedeliveryPolicy::default(),
        }
    }
}

/// Redis Streams broker gateway.
pub struct RedisStreamsGateway {
    client: Client,
    conn: RwLock<Option<MultiplexedConnection>>,
    config: RedisGatewayConfig,
    ensured_topics: Mutex<HashSet<String>>,
}

impl RedisStreamsGateway {
    /// Connect to Redis.
    pub async fn connect(config: RedisGatewayConfig) -> CourierResult<Self> {
        let client = Client::open(config.redis_url.as_str())?;
        let conn = client.get_multiplexed_async_connection().await?;

        info!(
            redis_url = %config.redis_url,
            consumer = %config.consumer_name,
            "Connected to Redis"
        );

        Ok(Self {
            client,
            conn: RwLock::new(Some(conn)),
            config,
            ensured_topics: Mutex::new(HashSet::new()),
        })
    }

    pub fn config(&self) -> &RedisGatewayConfig {
        &self.config
    }

    /// Replace the connection after a transport failure.
    pub async fn reconnect(&self) -> CourierResult<()> {
        info!("Reconnecting to Redis...");
        let conn = self.client.get_multiplexed_async_connection().await?;
        *self.conn.write().await = Some(conn);
        self.ensured_topics.lock().await.clear();
        Ok(())
    }

    async fn connection(&self) -> CourierResult<MultiplexedConnection> {
        self.conn
            .read()
            .await
            .clone()
            .ok_or_else(|| CourierError::BrokerUnavailable("gateway closed".to_string()))
    }

    /// Claim pending entries whose backoff has elapsed.
    async fn reclaim_due(
        &self,
        conn: &mut MultiplexedConnection,
        topic: &str,
        max_messages: usize,
    ) -> CourierResult<Vec<Delivery>> {
        let stream = stream_name(topic);
        let group = consumer_group_name(topic);
        let min_idle_ms = duration_ms(self.config.redelivery.backoff_base);

        // XPENDING key group IDLE min-idle-time start end count
        let pending: StreamPendingCountReply = redis::cmd("XPENDING")
            .arg(&stream)
            .arg(&group)
            .arg("IDLE")
            .arg(min_idle_ms)
            .arg("-")
            .arg("+")
            .arg(max_messages * PENDING_SCAN_FACTOR)
            .query_async(&mut *conn)
            .await?;

        let due: HashMap<String, u32> =
            due_for_redelivery(&pending.ids, &self.config.redelivery, max_messages)
                .into_iter()
                .collect();
        if due.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<String> = due.keys().cloned().collect();
        // Re-checking min idle makes a concurrent claim by another member a no-op.
        let claimed: StreamClaimReply = redis::cmd("XCLAIM")
            .arg(&stream)
            .arg(&group)
            .arg(&self.config.consumer_name)
            .arg(min_idle_ms)
            .arg(&ids)
            .query_async(&mut *conn)
            .await?;

        let mut deliveries: Vec<Delivery> = claimed
            .ids
            .into_iter()
            .map(|entry| {
                let delivery_count = due.get(&entry.id).copied().unwrap_or(1);
                to_delivery(topic, entry, delivery_count)
            })
            .collect();
        deliveries.sort_by(|a, b| compare_stream_ids(&a.broker_id, &b.broker_id));

        if !deliveries.is_empty() {
            debug!(
                topic = %topic,
                count = deliveries.len(),
                "Reclaimed pending entries for redelivery"
            );
        }
        Ok(deliveries)
    }

    /// Read entries never delivered to the group.
    async fn read_new(
        &self,
        conn: &mut MultiplexedConnection,
        topic: &str,
        max_messages: usize,
        wait: Duration,
    ) -> CourierResult<Vec<Delivery>> {
        let stream = stream_name(topic);
        let group = consumer_group_name(topic);
        // BLOCK 0 would wait forever
        let block_ms = duration_ms(wait).max(1);

        // XREADGROUP GROUP group consumer COUNT n BLOCK ms STREAMS key >
        let reply: Option<StreamReadReply> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&group)
            .arg(&self.config.consumer_name)
            .arg("COUNT")
            .arg(max_messages)
            .arg("BLOCK")
            .arg(block_ms)
            .arg("STREAMS")
            .arg(&stream)
            .arg(">")
            .query_async(&mut *conn)
            .await?;

        // Nil reply: block timeout expired with no messages
        let Some(reply) = reply else {
            return Ok(Vec::new());
        };

        Ok(reply
            .keys
            .into_iter()
            .flat_map(|key| key.ids)
            .map(|entry| to_delivery(topic, entry, 1))
            .collect())
    }
}

#[async_trait]
impl BrokerGateway for RedisStreamsGateway {
    async fn ensure_topic(&self, topic: &str) -> CourierResult<()> {
        validate_topic(topic)?;
        if self.ensured_topics.lock().await.contains(topic) {
            return Ok(());
        }

        let stream = stream_name(topic);
        let group = consumer_group_name(topic);
        let mut conn = self.connection().await?;

        // Start at 0 so entries published before the first subscriber are kept.
        let result: RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&stream)
            .arg(&group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(()) => {
                info!(stream = %stream, group = %group, "Created consumer group");
            }
            Err(e) => {
                // BUSYGROUP means the group already exists, which is fine
                if e.to_string().contains("BUSYGROUP") {
                    debug!(stream = %stream, group = %group, "Consumer group already exists");
                } else {
                    return Err(e.into());
                }
            }
        }

        self.ensured_topics.lock().await.insert(topic.to_string());
        Ok(())
    }

    async fn publish(&self, topic: &str, envelope: &Envelope) -> CourierResult<String> {
        self.ensure_topic(topic).await?;
        let data = envelope.to_bytes()?;
        let stream = stream_name(topic);
        let mut conn = self.connection().await?;

        let now_ms = u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0);
        let min_id = format!(
            "{}-0",
            now_ms.saturating_sub(duration_ms(self.config.retention))
        );

        let id: String = redis::cmd("XADD")
            .arg(&stream)
            .arg("MINID")
            .arg("~")
            .arg(&min_id)
            .arg("*")
            .arg(ENVELOPE_FIELD)
            .arg(data)
            .query_async(&mut conn)
            .await
            .map_err(|e| match CourierError::from(e) {
                CourierError::Redis(e) => CourierError::Publish(e.to_string()),
                other => other,
            })?;

        debug!(
            stream = %stream,
            message_id = %id,
            message_type = %envelope.message_type,
            "Published envelope"
        );
        Ok(id)
    }

    async fn pull(
        &self,
        topic: &str,
        max_messages: usize,
        wait: Duration,
    ) -> CourierResult<Vec<Delivery>> {
        let max_messages = max_messages.max(1);
        let mut conn = self.connection().await?;

        let reclaimed = self.reclaim_due(&mut conn, topic, max_messages).await?;
        if !reclaimed.is_empty() {
            return Ok(reclaimed);
        }

        self.read_new(&mut conn, topic, max_messages, wait).await
    }

    async fn ack(&self, delivery: &Delivery) -> CourierResult<()> {
        let stream = stream_name(&delivery.topic);
        let group = consumer_group_name(&delivery.topic);
        let mut conn = self.connection().await?;

        let result: i64 = redis::cmd("XACK")
            .arg(&stream)
            .arg(&group)
            .arg(&delivery.broker_id)
            .query_async(&mut conn)
            .await?;

        if result == 1 {
            debug!(message_id = %delivery.broker_id, stream = %stream, "Acknowledged message");
        } else {
            warn!(
                message_id = %delivery.broker_id,
                stream = %stream,
                "XACK returned {}, message may already be acknowledged",
                result
            );
        }
        Ok(())
    }

    async fn nak(&self, delivery: &Delivery) -> CourierResult<()> {
        let stream = stream_name(&delivery.topic);
        let group = consumer_group_name(&delivery.topic);
        let mut conn = self.connection().await?;

        // Reset idle time so the backoff is measured from the rejection.
        let _: redis::Value = redis::cmd("XCLAIM")
            .arg(&stream)
            .arg(&group)
            .arg(&self.config.consumer_name)
            .arg(0)
            .arg(&delivery.broker_id)
            .arg("IDLE")
            .arg(0)
            .arg("JUSTID")
            .query_async(&mut conn)
            .await?;

        debug!(
            message_id = %delivery.broker_id,
            stream = %stream,
            delivery_count = delivery.delivery_count,
            retry_in_ms = duration_ms(self.config.redelivery.delay_for(delivery.delivery_count)),
            "Negatively acknowledged message"
        );
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> CourierResult<()> {
        // The group and its pending list must survive so a restart resumes.
        // Only this member is removed, and only while it owns no entries.
        let stream = stream_name(topic);
        let group = consumer_group_name(topic);
        let consumer = &self.config.consumer_name;
        let mut conn = self.connection().await?;

        let own: StreamPendingCountReply = own_pending_cmd(&stream, &group, consumer)
            .query_async(&mut conn)
            .await?;
        if !own.ids.is_empty() {
            info!(
                topic = %topic,
                consumer = %consumer,
                "Unsubscribed, keeping member with pending entries"
            );
            return Ok(());
        }

        let _: i64 = delete_consumer_cmd(&stream, &group, consumer)
            .query_async(&mut conn)
            .await?;
        info!(topic = %topic, consumer = %consumer, "Unsubscribed, member removed");
        Ok(())
    }

    async fn close(&self) -> CourierResult<()> {
        if self.conn.write().await.take().is_some() {
            info!("Redis connection closed");
        }
        Ok(())
    }
}

/// Pending entries whose backoff has elapsed, with the delivery count each
/// will carry when reclaimed. At most `max` are returned, in scan order.
///
/// An entry delivered `n` times is due once it has been idle for
/// [`RedeliveryPolicy::delay_for`]`(n)`.
fn due_for_redelivery(
    pending: &[StreamPendingId],
    policy: &RedeliveryPolicy,
    max: usize,
) -> Vec<(String, u32)> {
    pending
        .iter()
        .filter_map(|entry| {
            let deliveries = u32::try_from(entry.times_delivered).unwrap_or(u32::MAX);
            let idle_ms = u64::try_from(entry.last_delivered_ms).unwrap_or(u64::MAX);
            (idle_ms >= duration_ms(policy.delay_for(deliveries)))
                .then(|| (entry.id.clone(), deliveries.saturating_add(1)))
        })
        .take(max)
        .collect()
}

/// `XPENDING <stream> <group> - + 1 <consumer>`: does the member own anything?
fn own_pending_cmd(stream: &str, group: &str, consumer: &str) -> Cmd {
    let mut cmd = redis::cmd("XPENDING");
    cmd.arg(stream).arg(group).arg("-").arg("+").arg(1).arg(consumer);
    cmd
}

fn delete_consumer_cmd(stream: &str, group: &str, consumer: &str) -> Cmd {
    let mut cmd = redis::cmd("XGROUP");
    cmd.arg("DELCONSUMER").arg(stream).arg(group).arg(consumer);
    cmd
}

fn to_delivery(topic: &str, entry: StreamId, delivery_count: u32) -> Delivery {
    let data = entry.get::<Vec<u8>>(ENVELOPE_FIELD).unwrap_or_default();
    Delivery {
        topic: topic.to_string(),
        broker_id: entry.id,
        data,
        delivery_count,
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Order stream IDs (`<ms>-<seq>`) numerically.
fn compare_stream_ids(a: &str, b: &str) -> std::cmp::Ordering {
    fn parts(id: &str) -> (u64, u64) {
        let mut split = id.splitn(2, '-');
        let ms = split.next().and_then(|s| s.parse().ok()).unwrap_or(0);
        let seq = split.next().and_then(|s| s.parse().ok()).unwrap_or(0);
        (ms, seq)
    }
    parts(a).cmp(&parts(b))
}
