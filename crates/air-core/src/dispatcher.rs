//! The dispatcher: single serialized fan-out path of the relay.
//!
//! Producers (sessions and the publish API) submit [`DispatchRequest`]s into
//! one bounded FIFO queue. A single task drains it and, for each request,
//! writes the payload to every recipient before moving on to the next one.
//!
//! Writes are synchronous per request: a slow recipient delays the remaining
//! recipients of the same request and every request queued behind it. This
//! keeps global ordering strict and is the main throughput ceiling of the
//! relay. A failed write only affects that recipient.
//!
//! When the queue is full, [`DispatchHandle::submit`] waits for a free slot;
//! an accepted request is never dropped.

use air_protocol::{codec, Envelope};
use air_transport::ConnectionId;
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace};

use crate::registry::{ConnectionHandle, Registry};

/// Default number of pending requests the queue holds.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Dispatcher errors.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The dispatch loop is gone.
    #[error("Dispatcher is not running")]
    Closed,
}

/// Message class of a request, for logging and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatchClass {
    /// Room-wide payload, sender excluded.
    Broadcast,
    /// Payload for a single connection.
    Direct,
    /// Typing indicator, sender excluded.
    Typing,
    /// Membership snapshot for the whole room.
    UserList,
}

impl DispatchClass {
    /// Label used in logs and metrics.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchClass::Broadcast => "broadcast",
            DispatchClass::Direct => "direct",
            DispatchClass::Typing => "typing",
            DispatchClass::UserList => "userlist",
        }
    }
}

/// One unit of routing work.
#[derive(Debug, Clone)]
pub enum DispatchRequest {
    /// Deliver to every connection in the room except `sender`.
    ///
    /// `sender` is `None` for server-originated payloads and leave notices.
    Broadcast {
        /// Target room.
        room: String,
        /// Encoded frame.
        payload: Bytes,
        /// Connection to skip.
        sender: Option<ConnectionId>,
    },
    /// Deliver to `target` only, if it is still registered in `room`.
    Direct {
        /// Room both connections belong to.
        room: String,
        /// Encoded frame.
        payload: Bytes,
        /// Originating connection.
        sender: ConnectionId,
        /// Receiving connection.
        target: ConnectionId,
    },
    /// Deliver to every connection in the room except `sender`.
    Typing {
        /// Target room.
        room: String,
        /// Encoded frame.
        payload: Bytes,
        /// Connection to skip.
        sender: ConnectionId,
    },
    /// Send the room's membership, computed at dispatch time, to everyone in it.
    UserList {
        /// Target room.
        room: String,
    },
}

impl DispatchRequest {
    /// The room this request is routed within.
    #[must_use]
    pub fn room(&self) -> &str {
        match self {
            DispatchRequest::Broadcast { room, .. }
            | DispatchRequest::Direct { room, .. }
            | DispatchRequest::Typing { room, .. }
            | DispatchRequest::UserList { room } => room,
        }
    }

    /// The request's class.
    #[must_use]
    pub fn class(&self) -> DispatchClass {
        match self {
            DispatchRequest::Broadcast { .. } => DispatchClass::Broadcast,
            DispatchRequest::Direct { .. } => DispatchClass::Direct,
            DispatchRequest::Typing { .. } => DispatchClass::Typing,
            DispatchRequest::UserList { .. } => DispatchClass::UserList,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    requests: AtomicU64,
    deliveries: AtomicU64,
    failures: AtomicU64,
    dropped: AtomicU64,
}

/// Dispatcher statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct DispatchStats {
    /// Requests processed.
    pub requests: u64,
    /// Frames written successfully.
    pub deliveries: u64,
    /// Frames whose write failed.
    pub failures: u64,
    /// Frames not written because the recipient had already disconnected.
    pub dropped: u64,
    /// Requests waiting in the queue.
    pub pending: usize,
}

/// Producer side of the dispatch queue. Cheap to clone.
#[derive(Clone)]
pub struct DispatchHandle {
    tx: mpsc::Sender<DispatchRequest>,
    counters: Arc<Counters>,
}

impl DispatchHandle {
    /// Enqueue a request, waiting while the queue is full.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Closed`] if the dispatch loop has stopped.
    pub async fn submit(&self, request: DispatchRequest) -> Result<(), DispatchError> {
        trace!(room = %request.room(), class = request.class().as_str(), "Submitting request");
        self.tx.send(request).await.map_err(|_| DispatchError::Closed)
    }

    /// Requests currently waiting in the queue.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Get dispatcher statistics.
    #[must_use]
    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            requests: self.counters.requests.load(Ordering::Relaxed),
            deliveries: self.counters.deliveries.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            pending: self.pending(),
        }
    }
}

/// Consumer side of the dispatch queue.
pub struct Dispatcher {
    rx: mpsc::Receiver<DispatchRequest>,
    registry: Arc<Registry>,
    counters: Arc<Counters>,
    capacity: usize,
}

impl Dispatcher {
    /// Create a dispatcher and its producer handle.
    ///
    /// A `capacity` of zero is raised to one.
    #[must_use]
    pub fn new(registry: Arc<Registry>, capacity: usize) -> (Self, DispatchHandle) {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let counters = Arc::new(Counters::default());
        (
            Self {
                rx,
                registry,
                counters: Arc::clone(&counters),
                capacity,
            },
            DispatchHandle { tx, counters },
        )
    }

    /// Create a dispatcher and run it on its own task.
    #[must_use]
    pub fn spawn(registry: Arc<Registry>, capacity: usize) -> (DispatchHandle, JoinHandle<()>) {
        let (dispatcher, handle) = Self::new(registry, capacity);
        (handle, tokio::spawn(dispatcher.run()))
    }

    /// Drain the queue until every [`DispatchHandle`] is dropped.
    pub async fn run(mut self) {
        info!(capacity = self.capacity, "Dispatcher started");
        while let Some(request) = self.rx.recv().await {
            self.dispatch(request).await;
        }
        info!("Dispatcher stopped");
    }

    async fn dispatch(&self, request: DispatchRequest) {
        self.counters.requests.fetch_add(1, Ordering::Relaxed);
        let class = request.class();

        let (room, payload, recipients) = match request {
            DispatchRequest::Broadcast {
                room,
                payload,
                sender,
            } => {
                let recipients = self.others(&room, sender.as_ref());
                (room, payload, recipients)
            }
            DispatchRequest::Typing {
                room,
                payload,
                sender,
            } => {
                let recipients = self.others(&room, Some(&sender));
                (room, payload, recipients)
            }
            DispatchRequest::Direct {
                room,
                payload,
                target,
                ..
            } => match self.registry.get(&room, &target) {
                Some(handle) => (room, payload, vec![handle]),
                None => {
                    self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    trace!(room = %room, target = %target, "Direct target gone, dropping");
                    return;
                }
            },
            DispatchRequest::UserList { room } => {
                let members = self.registry.members(&room);
                let users = members.iter().map(|h| h.user_info()).collect();
                match codec::encode(&Envelope::userlist(users)) {
                    Ok(payload) => (room, payload, members),
                    Err(e) => {
                        error!(room = %room, error = %e, "Failed to encode user list");
                        return;
                    }
                }
            }
        };

        let delivered = self.deliver(&recipients, &payload).await;
        trace!(
            room = %room,
            class = class.as_str(),
            recipients = recipients.len(),
            delivered,
            "Dispatched"
        );
    }

    fn others(&self, room: &str, sender: Option<&ConnectionId>) -> Vec<Arc<ConnectionHandle>> {
        let mut members = self.registry.members(room);
        if let Some(sender) = sender {
            members.retain(|h| h.id() != sender);
        }
        members
    }

    async fn deliver(&self, recipients: &[Arc<ConnectionHandle>], payload: &Bytes) -> usize {
        let mut delivered = 0;
        for recipient in recipients {
            if !recipient.is_open() {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                trace!(connection = %recipient.id(), "Recipient closed, skipping");
                continue;
            }
            match recipient.send(payload.clone()).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    self.counters.failures.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        room = %recipient.room(),
                        connection = %recipient.id(),
                        error = %e,
                        "Delivery failed"
                    );
                }
            }
        }
        self.counters
            .deliveries
            .fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Identity;
    use air_transport::memory::{self, MemoryPeer, Outbound};
    use std::time::Duration;
    use tokio::time::timeout;

    fn connect(registry: &Registry, room: &str, user: &str) -> (Arc<ConnectionHandle>, MemoryPeer) {
        let (sink, _source, peer) = memory::pair();
        let handle = Arc::new(ConnectionHandle::new(
            room,
            Identity::new(user, user.to_uppercase()),
            Arc::new(sink),
        ));
        registry.register(handle.clone()).unwrap();
        (handle, peer)
    }

    async fn next_text(peer: &mut MemoryPeer) -> String {
        match timeout(Duration::from_secs(1), peer.recv()).await {
            Ok(Some(Outbound::Text(data))) => String::from_utf8(data.to_vec()).unwrap(),
            other => panic!("expected text frame, got {:?}", other),
        }
    }

    fn broadcast(room: &str, payload: &'static str, sender: Option<&ConnectionId>) -> DispatchRequest {
        DispatchRequest::Broadcast {
            room: room.into(),
            payload: Bytes::from_static(payload.as_bytes()),
            sender: sender.cloned(),
        }
    }

    #[tokio::test]
    async fn test_broadcast_excludes_sender_and_other_rooms() {
        let registry = Arc::new(Registry::new());
        let (a, mut pa) = connect(&registry, "lobby", "u1");
        let (_b, mut pb) = connect(&registry, "lobby", "u2");
        let (_c, mut pc) = connect(&registry, "other", "u3");
        let (handle, _task) = Dispatcher::spawn(registry.clone(), DEFAULT_QUEUE_CAPACITY);

        handle.submit(broadcast("lobby", "one", Some(a.id()))).await.unwrap();
        handle.submit(broadcast("lobby", "two", None)).await.unwrap();

        assert_eq!(next_text(&mut pb).await, "one");
        assert_eq!(next_text(&mut pb).await, "two");
        // The sender's first frame is the second broadcast, not its own.
        assert_eq!(next_text(&mut pa).await, "two");
        assert!(pc.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_typing_excludes_sender() {
        let registry = Arc::new(Registry::new());
        let (a, mut pa) = connect(&registry, "lobby", "u1");
        let (_b, mut pb) = connect(&registry, "lobby", "u2");
        let (handle, _task) = Dispatcher::spawn(registry.clone(), DEFAULT_QUEUE_CAPACITY);

        handle
            .submit(DispatchRequest::Typing {
                room: "lobby".into(),
                payload: Bytes::from_static(b"typing"),
                sender: a.id().clone(),
            })
            .await
            .unwrap();
        handle.submit(broadcast("lobby", "marker", None)).await.unwrap();

        assert_eq!(next_text(&mut pb).await, "typing");
        assert_eq!(next_text(&mut pa).await, "marker");
    }

    #[tokio::test]
    async fn test_direct_reaches_only_target() {
        let registry = Arc::new(Registry::new());
        let (a, mut pa) = connect(&registry, "lobby", "u1");
        let (b, mut pb) = connect(&registry, "lobby", "u2");
        let (_c, mut pc) = connect(&registry, "lobby", "u3");
        let (handle, _task) = Dispatcher::spawn(registry.clone(), DEFAULT_QUEUE_CAPACITY);

        handle
            .submit(DispatchRequest::Direct {
                room: "lobby".into(),
                payload: Bytes::from_static(b"psst"),
                sender: a.id().clone(),
                target: b.id().clone(),
            })
            .await
            .unwrap();
        handle.submit(broadcast("lobby", "marker", None)).await.unwrap();

        assert_eq!(next_text(&mut pb).await, "psst");
        assert_eq!(next_text(&mut pa).await, "marker");
        assert_eq!(next_text(&mut pc).await, "marker");
    }

    #[tokio::test]
    async fn test_direct_to_departed_target_is_dropped() {
        let registry = Arc::new(Registry::new());
        let (a, mut pa) = connect(&registry, "lobby", "u1");
        let (b, _pb) = connect(&registry, "lobby", "u2");
        registry.unregister(&b);
        let (handle, _task) = Dispatcher::spawn(registry.clone(), DEFAULT_QUEUE_CAPACITY);

        handle
            .submit(DispatchRequest::Direct {
                room: "lobby".into(),
                payload: Bytes::from_static(b"psst"),
                sender: a.id().clone(),
                target: b.id().clone(),
            })
            .await
            .unwrap();
        handle.submit(broadcast("lobby", "marker", None)).await.unwrap();

        assert_eq!(next_text(&mut pa).await, "marker");
        assert_eq!(handle.stats().dropped, 1);
    }

    #[tokio::test]
    async fn test_userlist_reflects_membership_at_dispatch_time() {
        let registry = Arc::new(Registry::new());
        let (_a, mut pa) = connect(&registry, "lobby", "u1");
        let (dispatcher, handle) = Dispatcher::new(registry.clone(), DEFAULT_QUEUE_CAPACITY);

        // Queued while only u1 is present, dispatched after u2 joins.
        handle
            .submit(DispatchRequest::UserList {
                room: "lobby".into(),
            })
            .await
            .unwrap();
        let (_b, mut pb) = connect(&registry, "lobby", "u2");
        tokio::spawn(dispatcher.run());

        for peer in [&mut pa, &mut pb] {
            let value: serde_json::Value = serde_json::from_str(&next_text(peer).await).unwrap();
            assert_eq!(value["type"], "userlist");
            let mut ids: Vec<_> = value["users"]
                .as_array()
                .unwrap()
                .iter()
                .map(|u| u["id"].as_str().unwrap().to_string())
                .collect();
            ids.sort();
            assert_eq!(ids, vec!["u1", "u2"]);
        }
    }

    #[tokio::test]
    async fn test_closed_recipients_do_not_stop_fan_out() {
        let registry = Arc::new(Registry::new());
        let (_dead, dead_peer) = connect(&registry, "lobby", "u0");
        let (closed, _closed_peer) = connect(&registry, "lobby", "u1");
        let (_b, mut pb) = connect(&registry, "lobby", "u2");
        drop(dead_peer);
        closed.close().await.unwrap();
        let (handle, _task) = Dispatcher::spawn(registry.clone(), DEFAULT_QUEUE_CAPACITY);

        handle.submit(broadcast("lobby", "one", None)).await.unwrap();
        handle.submit(broadcast("lobby", "two", None)).await.unwrap();

        assert_eq!(next_text(&mut pb).await, "one");
        assert_eq!(next_text(&mut pb).await, "two");
        let stats = handle.stats();
        assert_eq!(stats.deliveries, 2);
        assert_eq!(stats.dropped, 4);
        assert_eq!(stats.failures, 0);
    }

    #[tokio::test]
    async fn test_global_fifo_across_rooms() {
        let registry = Arc::new(Registry::new());
        let (_a, mut pa) = connect(&registry, "lobby", "u1");
        let (handle, _task) = Dispatcher::spawn(registry.clone(), DEFAULT_QUEUE_CAPACITY);

        let payloads = ["m0", "m1", "m2", "m3", "m4", "m5", "m6", "m7"];
        for (i, payload) in payloads.into_iter().enumerate() {
            let room = if i % 2 == 0 { "lobby" } else { "other" };
            handle.submit(broadcast(room, payload, None)).await.unwrap();
        }

        for payload in ["m0", "m2", "m4", "m6"] {
            assert_eq!(next_text(&mut pa).await, payload);
        }
    }

    #[tokio::test]
    async fn test_full_queue_blocks_producer() {
        let registry = Arc::new(Registry::new());
        let (_a, mut pa) = connect(&registry, "lobby", "u1");
        let (dispatcher, handle) = Dispatcher::new(registry.clone(), 1);

        handle.submit(broadcast("lobby", "first", None)).await.unwrap();
        assert_eq!(handle.pending(), 1);

        let blocked = timeout(
            Duration::from_millis(50),
            handle.submit(broadcast("lobby", "second", None)),
        )
        .await;
        assert!(blocked.is_err(), "submit should wait for a free slot");

        tokio::spawn(dispatcher.run());
        handle.submit(broadcast("lobby", "second", None)).await.unwrap();

        assert_eq!(next_text(&mut pa).await, "first");
        assert_eq!(next_text(&mut pa).await, "second");
    }

    #[tokio::test]
    async fn test_submit_after_stop_fails() {
        let registry = Arc::new(Registry::new());
        let (dispatcher, handle) = Dispatcher::new(registry, DEFAULT_QUEUE_CAPACITY);
        drop(dispatcher);

        assert!(matches!(
            handle.submit(DispatchRequest::UserList { room: "lobby".into() }).await,
            Err(DispatchError::Closed)
        ));
    }
}
