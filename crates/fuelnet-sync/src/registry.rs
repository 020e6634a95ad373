//! Connected children of a hub node, keyed by the id they sent in `ID:`.
//!
//! A second handshake with the same id replaces the first entry. The stale
//! connection's own teardown then finds a different link under its id and
//! leaves the replacement alone.

use std::collections::HashMap;
use std::sync::RwLock;

use tracing::{debug, info};

use crate::protocol::WireMessage;
use crate::transport::OutboundHandle;

/// Lock-guarded map from child id to its outbound link.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    children: RwLock<HashMap<String, OutboundHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `link` under `child_id`, returning the entry it replaced.
    pub fn register(&self, child_id: &str, link: OutboundHandle) -> Option<OutboundHandle> {
        let previous = self
            .children
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(child_id.to_string(), link);

        match &previous {
            Some(old) => info!(%child_id, old_peer = %old.peer(), "Child re-registered, replacing old link"),
            None => debug!(%child_id, "Child registered"),
        }
        previous
    }

    /// Removes `child_id` only if it still maps to `link`.
    pub fn deregister(&self, child_id: &str, link: &OutboundHandle) -> bool {
        let mut children = self.children.write().unwrap_or_else(|e| e.into_inner());
        match children.get(child_id) {
            Some(current) if current.same_connection(link) => {
                children.remove(child_id);
                debug!(%child_id, "Child deregistered");
                true
            }
            Some(_) => {
                debug!(%child_id, "Stale link closed; newer registration kept");
                false
            }
            None => false,
        }
    }

    /// Sends `message` to every child. Returns how many accepted it.
    pub fn broadcast(&self, message: &WireMessage) -> usize {
        let children = self.children.read().unwrap_or_else(|e| e.into_inner());
        children
            .values()
            .filter(|link| link.send(message.clone()))
            .count()
    }

    /// Sends `message` to one child. False if unknown or gone.
    pub fn send_to(&self, child_id: &str, message: WireMessage) -> bool {
        self.get(child_id).is_some_and(|link| link.send(message))
    }

    pub fn get(&self, child_id: &str) -> Option<OutboundHandle> {
        self.children
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(child_id)
            .cloned()
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .children
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.children.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LineConnection;
    use std::time::Duration;
    use tokio::net::TcpListener;

    /// A server-side link plus the client reader that receives its lines.
    async fn link() -> (OutboundHandle, LineConnection) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (client, accepted) = tokio::join!(
            LineConnection::connect(&addr, Duration::from_secs(5)),
            listener.accept()
        );
        let server = LineConnection::from_stream(accepted.unwrap().0).unwrap();
        (server.link, client.unwrap())
    }

    #[tokio::test]
    async fn test_replacement_survives_stale_deregister() {
        let registry = ConnectionRegistry::new();
        let (first, _c1) = link().await;
        let (second, _c2) = link().await;

        assert!(registry.register("1", first.clone()).is_none());
        let replaced = registry.register("1", second.clone()).unwrap();
        assert!(replaced.same_connection(&first));

        assert!(!registry.deregister("1", &first));
        assert_eq!(registry.len(), 1);
        assert!(registry.get("1").unwrap().same_connection(&second));

        assert!(registry.deregister("1", &second));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_child() {
        let registry = ConnectionRegistry::new();
        let (a, mut ca) = link().await;
        let (b, mut cb) = link().await;
        registry.register("a", a);
        registry.register("b", b);

        assert_eq!(registry.broadcast(&WireMessage::Ack), 2);
        assert_eq!(ca.reader.next_message().await.unwrap().unwrap().unwrap(), WireMessage::Ack);
        assert_eq!(cb.reader.next_message().await.unwrap().unwrap().unwrap(), WireMessage::Ack);
        assert_eq!(registry.ids(), vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_send_to_unknown_child() {
        let registry = ConnectionRegistry::new();
        assert!(!registry.send_to("ghost", WireMessage::StatusRequest));
    }
}
