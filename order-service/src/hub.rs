use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

struct Connection {
    id: u64,
    sender: UnboundedSender<String>,
}

/// Registry of live push connections grouped by user id. Senders are the
/// write halves of per-socket channels; delivery is best-effort, so a closed
/// channel is skipped without affecting the rest of the user's connections.
#[derive(Default)]
pub struct NotificationHub {
    connections: Mutex<HashMap<Uuid, Vec<Connection>>>,
    next_id: AtomicU64,
}

impl NotificationHub {
    // A task that panics while holding the lock must not wedge the hub for
    // every later connect and delivery; the registry stays usable.
    fn registry(&self) -> MutexGuard<'_, HashMap<Uuid, Vec<Connection>>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn connect(&self, user_id: Uuid, sender: UnboundedSender<String>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry()
            .entry(user_id)
            .or_default()
            .push(Connection { id, sender });
        id
    }

    pub fn disconnect(&self, user_id: Uuid, connection_id: u64) {
        let mut connections = self.registry();
        if let Some(entries) = connections.get_mut(&user_id) {
            entries.retain(|connection| connection.id != connection_id);
            if entries.is_empty() {
                connections.remove(&user_id);
            }
        }
    }

    pub fn send_to_user(&self, user_id: Uuid, message: &str) {
        let connections = self.registry();
        if let Some(entries) = connections.get(&user_id) {
            for connection in entries {
                let _ = connection.sender.send(message.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::unbounded_channel;

    #[tokio::test]
    async fn delivers_only_to_the_target_user() {
        let hub = NotificationHub::default();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let (alice_tx, mut alice_rx) = unbounded_channel();
        let (bob_tx, mut bob_rx) = unbounded_channel();
        hub.connect(alice, alice_tx);
        hub.connect(bob, bob_tx);

        hub.send_to_user(alice, "finished");

        assert_eq!(alice_rx.recv().await.as_deref(), Some("finished"));
        assert!(bob_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn disconnect_removes_the_connection() {
        let hub = NotificationHub::default();
        let user = Uuid::new_v4();
        let (tx, mut rx) = unbounded_channel();
        let connection_id = hub.connect(user, tx);

        hub.disconnect(user, connection_id);
        hub.send_to_user(user, "finished");

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn dead_connection_does_not_block_the_rest() {
        let hub = NotificationHub::default();
        let user = Uuid::new_v4();
        let (dead_tx, dead_rx) = unbounded_channel();
        let (live_tx, mut live_rx) = unbounded_channel();
        hub.connect(user, dead_tx);
        hub.connect(user, live_tx);
        drop(dead_rx);

        hub.send_to_user(user, "finished");

        assert_eq!(live_rx.recv().await.as_deref(), Some("finished"));
    }

    #[tokio::test]
    async fn survives_a_poisoned_registry_lock() {
        let hub = std::sync::Arc::new(NotificationHub::default());
        let user = Uuid::new_v4();
        let (tx, mut rx) = unbounded_channel();
        hub.connect(user, tx);

        let poisoner = hub.clone();
        std::thread::spawn(move || {
            let _guard = poisoner.connections.lock().unwrap();
            panic!("registry holder died");
        })
        .join()
        .unwrap_err();

        hub.send_to_user(user, "finished");

        assert_eq!(rx.recv().await.as_deref(), Some("finished"));
    }
}
