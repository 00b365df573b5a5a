use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::pooled_connection::bb8::Pool;
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use rdkafka::producer::{FutureProducer, FutureRecord};
use serde::Serialize;
use tokio::time;
use tracing::info;
use uuid::Uuid;

pub type DbPool = Pool<AsyncPgConnection>;

pub const BATCH_SIZE: i64 = 10;
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

diesel::table! {
    outbox (id) {
        id -> Uuid,
        routing_key -> Varchar,
        payload -> Jsonb,
        processed -> Bool,
        created_at -> Timestamptz,
    }
}

#[derive(Debug, Clone, Queryable)]
pub struct OutboxEntry {
    pub id: Uuid,
    pub routing_key: String,
    pub payload: serde_json::Value,
    pub processed: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = outbox)]
pub struct NewOutboxEntry {
    pub id: Uuid,
    pub routing_key: String,
    pub payload: serde_json::Value,
}

/// Stages an event for publication. Must run inside the same transaction as
/// the business mutation the event announces, so either both commit or
/// neither does.
pub async fn stage<T: Serialize>(
    conn: &mut AsyncPgConnection,
    routing_key: &str,
    event: &T,
) -> Result<Uuid> {
    let entry = NewOutboxEntry {
        id: Uuid::new_v4(),
        routing_key: routing_key.to_string(),
        payload: serde_json::to_value(event)?,
    };
    let id = entry.id;

    diesel::insert_into(outbox::table)
        .values(&entry)
        .execute(conn)
        .await?;

    Ok(id)
}

/// Drains a service's outbox table into the broker. Multiple relay instances
/// can run against the same table: batch selection uses SKIP LOCKED, so a row
/// is only ever claimed by one of them.
pub struct OutboxRelay {
    pool: DbPool,
    producer: FutureProducer,
}

impl OutboxRelay {
    pub fn new(pool: DbPool, producer: FutureProducer) -> Self {
        Self { pool, producer }
    }

    /// Polls on a fixed interval until a store or publish error surfaces, at
    /// which point the supervisor rebuilds the broker session and restarts us.
    pub async fn run(self) -> Result<()> {
        let mut interval = time::interval(POLL_INTERVAL);
        loop {
            interval.tick().await;
            self.drain_batch().await?;
        }
    }

    /// One batch, one transaction: claim unprocessed rows with SKIP LOCKED,
    /// publish them, mark them processed. A failed publish rolls the whole
    /// batch back, leaving the rows unprocessed for the next poll.
    async fn drain_batch(&self) -> Result<()> {
        let mut conn = self.pool.get().await?;

        conn.transaction::<_, anyhow::Error, _>(|conn| {
            async move {
                let batch: Vec<OutboxEntry> = outbox::table
                    .filter(outbox::processed.eq(false))
                    .order(outbox::created_at.asc())
                    .limit(BATCH_SIZE)
                    .for_update()
                    .skip_locked()
                    .load(conn)
                    .await?;

                if batch.is_empty() {
                    return Ok(());
                }

                for entry in &batch {
                    self.publish(entry).await?;
                }

                let ids: Vec<Uuid> = batch.iter().map(|entry| entry.id).collect();
                diesel::update(outbox::table.filter(outbox::id.eq_any(&ids)))
                    .set(outbox::processed.eq(true))
                    .execute(conn)
                    .await?;

                info!(count = batch.len(), "published outbox batch");
                Ok(())
            }
            .scope_boxed()
        })
        .await
    }

    async fn publish(&self, entry: &OutboxEntry) -> Result<()> {
        let payload = serde_json::to_string(&entry.payload)?;
        // The row id doubles as the message key, giving redeliveries after a
        // crash-before-commit a stable identity on the consumer side.
        let key = entry.id.to_string();
        let record = FutureRecord::to(&entry.routing_key)
            .payload(&payload)
            .key(&key);

        self.producer
            .send(record, Duration::from_secs(5))
            .await
            .map_err(|(e, _)| anyhow!("failed to publish outbox entry {}: {}", entry.id, e))?;

        Ok(())
    }
}
