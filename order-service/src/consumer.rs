use std::sync::Arc;

use anyhow::{Context, Result};
use diesel::prelude::*;
use diesel_async::RunQueryDsl;
use futures::StreamExt;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::Message;
use tracing::info;

use crate::hub::NotificationHub;
use crate::schema::orders;
use shared::events::{OrderStatus, PaymentProcessed};
use shared::outbox::DbPool;

/// Consumes `payment.processed` events: records the settlement on the order
/// row and pushes the raw payload to the user's live connections.
pub struct StatusConsumer {
    pool: DbPool,
    hub: Arc<NotificationHub>,
}

impl StatusConsumer {
    pub fn new(pool: DbPool, hub: Arc<NotificationHub>) -> Self {
        Self { pool, hub }
    }

    pub async fn run(self, consumer: StreamConsumer) -> Result<()> {
        let mut stream = consumer.stream();

        while let Some(message) = stream.next().await {
            let message = message?;
            let payload = message
                .payload()
                .context("payment.processed message without payload")?;

            // Offset commits are cumulative per partition, so skipping past a
            // failed message would mark it consumed as soon as a later one
            // commits. A failed apply therefore ends the session; the
            // supervisor reconnects at the last committed offset and the NEW
            // guard absorbs the replayed prefix.
            self.apply(payload).await?;
            consumer.commit_message(&message, CommitMode::Async)?;
        }

        Ok(())
    }

    async fn apply(&self, payload: &[u8]) -> Result<()> {
        let event: PaymentProcessed =
            serde_json::from_slice(payload).context("malformed payment.processed payload")?;

        let mut conn = self.pool.get().await?;

        // Guarding on NEW makes the transition exactly-once: replays and
        // out-of-order redeliveries affect zero rows.
        let updated = diesel::update(
            orders::table.filter(
                orders::id
                    .eq(event.order_id)
                    .and(orders::status.eq(OrderStatus::New.as_str())),
            ),
        )
        .set(orders::status.eq(event.status.as_str()))
        .execute(&mut conn)
        .await?;

        if updated > 0 {
            info!(order_id = %event.order_id, status = %event.status, "order settled");
        }

        self.hub
            .send_to_user(event.user_id, &String::from_utf8_lossy(payload));

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use diesel_async::pooled_connection::bb8::Pool;
    use diesel_async::pooled_connection::AsyncDieselConnectionManager;
    use diesel_async::AsyncPgConnection;
    use uuid::Uuid;

    fn unreachable_consumer() -> StatusConsumer {
        let config = AsyncDieselConnectionManager::<AsyncPgConnection>::new(
            "postgres://postgres@127.0.0.1:1/orders",
        );
        let pool = Pool::builder()
            .connection_timeout(Duration::from_millis(250))
            .build_unchecked(config);
        StatusConsumer::new(pool, Arc::new(NotificationHub::default()))
    }

    #[tokio::test]
    async fn malformed_payload_surfaces_an_error() {
        assert!(unreachable_consumer().apply(b"not json").await.is_err());
    }

    #[tokio::test]
    async fn store_failure_surfaces_an_error() {
        let payload = serde_json::to_vec(&PaymentProcessed {
            order_id: Uuid::new_v4(),
            status: OrderStatus::Finished,
            user_id: Uuid::new_v4(),
        })
        .unwrap();

        // The error must reach the run loop and end the session so the
        // message is redelivered, not be swallowed with the status left NEW.
        assert!(unreachable_consumer().apply(&payload).await.is_err());
    }
}
