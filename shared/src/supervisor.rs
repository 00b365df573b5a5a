use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use tokio::time;
use tracing::{error, info, warn};

pub const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Reconnect state machine shared by every broker-using role (the two relays
/// and the two consumers). While disconnected, the connect step is retried on
/// a fixed delay; once connected, the role runs until its session dies, then
/// the loop starts over. Infrastructure failures never escape this loop.
pub struct Reconnect {
    role: &'static str,
    retry: Duration,
}

impl Reconnect {
    pub fn new(role: &'static str) -> Self {
        Self::with_retry(role, RETRY_DELAY)
    }

    pub fn with_retry(role: &'static str, retry: Duration) -> Self {
        Self { role, retry }
    }

    pub async fn run<T, C, CF, S, SF>(self, mut connect: C, mut serve: S)
    where
        C: FnMut() -> CF,
        CF: Future<Output = Result<T>>,
        S: FnMut(T) -> SF,
        SF: Future<Output = Result<()>>,
    {
        loop {
            let session = match connect().await {
                Ok(session) => session,
                Err(e) => {
                    warn!(role = self.role, error = %e, "broker not ready, retrying");
                    time::sleep(self.retry).await;
                    continue;
                }
            };

            info!(role = self.role, "connected");
            if let Err(e) = serve(session).await {
                error!(role = self.role, error = %e, "session ended");
            }
            time::sleep(self.retry).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn retries_connect_until_the_broker_appears() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let (connected_tx, connected_rx) = tokio::sync::oneshot::channel();

        let counter = attempts.clone();
        let mut connected_tx = Some(connected_tx);
        let supervisor = tokio::spawn(async move {
            Reconnect::with_retry("test-role", Duration::from_millis(10))
                .run(
                    move || {
                        let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
                        async move {
                            if attempt < 3 {
                                Err(anyhow::anyhow!("connection refused"))
                            } else {
                                Ok(())
                            }
                        }
                    },
                    move |_session| {
                        let connected_tx = connected_tx.take();
                        async move {
                            if let Some(tx) = connected_tx {
                                let _ = tx.send(());
                            }
                            std::future::pending::<()>().await;
                            Ok(())
                        }
                    },
                )
                .await;
        });

        connected_rx.await.unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        supervisor.abort();
    }
}
