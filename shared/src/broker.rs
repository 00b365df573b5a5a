use std::time::Duration;

use anyhow::Result;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::producer::{FutureProducer, Producer};
use uuid::Uuid;

const METADATA_TIMEOUT: Duration = Duration::from_secs(5);

/// Builds a producer and probes the cluster so the caller only starts
/// publishing once the broker actually answers.
pub async fn connect_producer(brokers: String) -> Result<FutureProducer> {
    let producer: FutureProducer = ClientConfig::new()
        .set("bootstrap.servers", &brokers)
        .set("message.timeout.ms", "5000")
        .create()?;

    let probe = producer.clone();
    tokio::task::spawn_blocking(move || probe.client().fetch_metadata(None, METADATA_TIMEOUT))
        .await??;

    Ok(producer)
}

/// Builds a consumer, probes the cluster, and subscribes to the given topics.
/// Offsets are committed manually, after the local transaction for a message
/// has committed.
pub async fn connect_consumer(
    brokers: String,
    group: String,
    topics: Vec<String>,
) -> Result<StreamConsumer> {
    let consumer: StreamConsumer = ClientConfig::new()
        .set("group.id", &group)
        .set("bootstrap.servers", &brokers)
        .set("enable.partition.eof", "false")
        .set("session.timeout.ms", "6000")
        .set("enable.auto.commit", "false")
        .create()?;

    let consumer = tokio::task::spawn_blocking(move || -> Result<StreamConsumer> {
        consumer.fetch_metadata(None, METADATA_TIMEOUT)?;
        Ok(consumer)
    })
    .await??;

    let topics: Vec<&str> = topics.iter().map(String::as_str).collect();
    consumer.subscribe(&topics)?;
    Ok(consumer)
}

/// Stable dedup identity for a delivered message: the producer-assigned key
/// when present (the relay sets it to the outbox row id), otherwise a
/// content-derived UUID so redeliveries of the same payload collapse to one
/// identity regardless of which process computes it.
pub fn message_identity(key: Option<&[u8]>, payload: &[u8]) -> String {
    match key
        .and_then(|k| std::str::from_utf8(k).ok())
        .filter(|k| !k.is_empty())
    {
        Some(key) => key.to_string(),
        None => Uuid::new_v5(&Uuid::NAMESPACE_OID, payload).to_string(),
    }
}
