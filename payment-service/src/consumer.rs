use anyhow::{Context, Result};
use diesel::prelude::*;
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, RunQueryDsl};
use futures::StreamExt;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::Message;
use tracing::info;

use crate::models::NewInboxEntry;
use crate::schema::{accounts, inbox};
use shared::broker;
use shared::events::{OrderCreated, OrderStatus, PaymentProcessed, PAYMENT_PROCESSED};
use shared::outbox::{self, DbPool};

enum Debit {
    Applied(OrderStatus),
    Duplicate,
}

/// Consumes `order.created` events and settles each one exactly once: inbox
/// dedup absorbs redeliveries, and the debit itself is a single conditional
/// UPDATE whose affected-row count arbitrates concurrent spending.
pub struct DebitConsumer {
    pool: DbPool,
}

impl DebitConsumer {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn run(self, consumer: StreamConsumer) -> Result<()> {
        let mut stream = consumer.stream();

        while let Some(message) = stream.next().await {
            let message = message?;
            let payload = message
                .payload()
                .context("order.created message without payload")?;
            let identity = broker::message_identity(message.key(), payload);

            // Offset commits are cumulative per partition, so skipping past a
            // failed message would mark it consumed as soon as a later one
            // commits. A failed settle therefore ends the session; the
            // supervisor reconnects at the last committed offset and the
            // inbox absorbs the replayed prefix.
            match self.settle(&identity, payload).await? {
                Debit::Applied(status) => {
                    info!(identity = %identity, status = %status, "debit settled");
                }
                Debit::Duplicate => {
                    info!(identity = %identity, "duplicate delivery, skipping");
                }
            }
            consumer.commit_message(&message, CommitMode::Async)?;
        }

        Ok(())
    }

    /// Inbox check, conditional debit, inbox marker and result event all
    /// commit in one transaction; the offset is only committed afterwards, so
    /// a crash anywhere in here leads to a safe redelivery.
    async fn settle(&self, identity: &str, payload: &[u8]) -> Result<Debit> {
        let event: OrderCreated =
            serde_json::from_slice(payload).context("malformed order.created payload")?;

        let mut conn = self.pool.get().await?;
        conn.transaction::<_, anyhow::Error, _>(|conn| {
            async move {
                let seen = inbox::table
                    .find(identity)
                    .select(inbox::message_id)
                    .first::<String>(conn)
                    .await
                    .optional()?;
                if seen.is_some() {
                    return Ok(Debit::Duplicate);
                }

                // Balance check and decrement in one statement. A missing
                // account affects zero rows, same as an underfunded one.
                let debited = diesel::update(
                    accounts::table.filter(
                        accounts::user_id
                            .eq(event.user_id)
                            .and(accounts::balance.ge(event.amount.clone())),
                    ),
                )
                .set(accounts::balance.eq(accounts::balance - event.amount.clone()))
                .execute(conn)
                .await?;

                let status = if debited > 0 {
                    OrderStatus::Finished
                } else {
                    OrderStatus::Cancelled
                };

                diesel::insert_into(inbox::table)
                    .values(&NewInboxEntry {
                        message_id: identity.to_string(),
                    })
                    .execute(conn)
                    .await?;

                let result = PaymentProcessed {
                    order_id: event.order_id,
                    status,
                    user_id: event.user_id,
                };
                outbox::stage(conn, PAYMENT_PROCESSED, &result).await?;

                Ok(Debit::Applied(status))
            }
            .scope_boxed()
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use bigdecimal::BigDecimal;
    use diesel_async::pooled_connection::bb8::Pool;
    use diesel_async::pooled_connection::AsyncDieselConnectionManager;
    use diesel_async::AsyncPgConnection;
    use uuid::Uuid;

    fn unreachable_pool() -> DbPool {
        let config = AsyncDieselConnectionManager::<AsyncPgConnection>::new(
            "postgres://postgres@127.0.0.1:1/payments",
        );
        Pool::builder()
            .connection_timeout(Duration::from_millis(250))
            .build_unchecked(config)
    }

    #[tokio::test]
    async fn malformed_payload_surfaces_an_error() {
        let consumer = DebitConsumer::new(unreachable_pool());

        assert!(consumer.settle("message-1", b"not json").await.is_err());
    }

    #[tokio::test]
    async fn store_failure_surfaces_an_error() {
        let consumer = DebitConsumer::new(unreachable_pool());
        let payload = serde_json::to_vec(&OrderCreated {
            order_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            amount: BigDecimal::from(10),
        })
        .unwrap();

        // The error must reach the run loop and end the session so the
        // message is redelivered, not settle as CANCELLED or be swallowed.
        assert!(consumer.settle("message-2", &payload).await.is_err());
    }
}
