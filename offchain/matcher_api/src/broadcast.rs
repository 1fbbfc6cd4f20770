//! Topic-addressed pub/sub hub. Producers (market workers, API handlers)
//! hand messages off and never block: every client has a bounded queue and
//! a client that falls behind is disconnected, not waited on.

use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// Bounded per-client send queue; overflow disconnects the client with
/// reason `slow_consumer`.
pub const CLIENT_QUEUE: usize = 1_024;

/// Book topics are coalesced to at most 10 Hz; trades and liquidations are
/// never throttled.
const BOOK_FLUSH: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Serialize)]
pub struct OutboundMsg {
    #[serde(rename = "type")]
    pub kind: String,
    pub channel: String,
    pub seq: u64,
    pub data: Value,
}

struct Client {
    tx: mpsc::Sender<OutboundMsg>,
    topics: Mutex<HashSet<String>>,
}

#[derive(Default)]
struct HubInner {
    clients: RwLock<HashMap<u64, Arc<Client>>>,
    next_client: AtomicU64,
    /// Monotonic sequence per topic; a gap on the client side means resync.
    seqs: Mutex<HashMap<String, u64>>,
    /// Latest pending payload per coalesced topic.
    pending: Mutex<HashMap<String, (String, Value)>>,
}

#[derive(Clone, Default)]
pub struct BroadcastHub {
    inner: Arc<HubInner>,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Periodically flush coalesced topics. Run once at startup.
    pub fn spawn_flusher(&self) {
        let hub = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(BOOK_FLUSH);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                let pending: Vec<(String, String, Value)> = {
                    let mut p = hub.inner.pending.lock().unwrap_or_else(|e| e.into_inner());
                    p.drain().map(|(topic, (kind, data))| (topic, kind, data)).collect()
                };
                for (topic, kind, data) in pending {
                    hub.publish(&topic, &kind, data);
                }
            }
        });
    }

    pub fn register(&self) -> (u64, mpsc::Receiver<OutboundMsg>) {
        let (tx, rx) = mpsc::channel(CLIENT_QUEUE);
        let id = self.inner.next_client.fetch_add(1, Ordering::Relaxed) + 1;
        self.inner
            .clients
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, Arc::new(Client { tx, topics: Mutex::new(HashSet::new()) }));
        (id, rx)
    }

    pub fn unregister(&self, client_id: u64) {
        self.inner.clients.write().unwrap_or_else(|e| e.into_inner()).remove(&client_id);
    }

    /// Idempotent. Returns the topic's current sequence number so the
    /// caller can stamp the snapshot it sends next: deltas the client must
    /// apply all carry a higher seq.
    pub fn subscribe(&self, client_id: u64, topic: &str) -> u64 {
        if let Some(client) =
            self.inner.clients.read().unwrap_or_else(|e| e.into_inner()).get(&client_id)
        {
            client
                .topics
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(topic.to_string());
        }
        self.current_seq(topic)
    }

    pub fn unsubscribe(&self, client_id: u64, topic: &str) {
        if let Some(client) =
            self.inner.clients.read().unwrap_or_else(|e| e.into_inner()).get(&client_id)
        {
            client.topics.lock().unwrap_or_else(|e| e.into_inner()).remove(topic);
        }
    }

    pub fn current_seq(&self, topic: &str) -> u64 {
        *self
            .inner
            .seqs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(topic)
            .unwrap_or(&0)
    }

    fn next_seq(&self, topic: &str) -> u64 {
        let mut seqs = self.inner.seqs.lock().unwrap_or_else(|e| e.into_inner());
        let seq = seqs.entry(topic.to_string()).or_insert(0);
        *seq += 1;
        *seq
    }

    /// Deliver directly to one client's queue (snapshots).
    pub fn send_to(&self, client_id: u64, msg: OutboundMsg) {
        let client = self
            .inner
            .clients
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&client_id)
            .cloned();
        if let Some(client) = client {
            if client.tx.try_send(msg).is_err() {
                self.unregister(client_id);
            }
        }
    }

    /// Fan a delta out to every subscriber. A full queue drops only that
    /// client; everyone else keeps receiving in order.
    pub fn publish(&self, topic: &str, kind: &str, data: Value) {
        let seq = self.next_seq(topic);
        let msg = OutboundMsg {
            kind: kind.to_string(),
            channel: topic.to_string(),
            seq,
            data,
        };
        let subscribers: Vec<(u64, Arc<Client>)> = self
            .inner
            .clients
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(_, c)| {
                c.topics.lock().unwrap_or_else(|e| e.into_inner()).contains(topic)
            })
            .map(|(id, c)| (*id, c.clone()))
            .collect();
        let mut slow: Vec<u64> = Vec::new();
        for (id, client) in subscribers {
            match client.tx.try_send(msg.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => slow.push(id),
                Err(mpsc::error::TrySendError::Closed(_)) => slow.push(id),
            }
        }
        for id in slow {
            debug!(target: "hub", client = id, topic, "dropping slow consumer");
            self.unregister(id);
        }
    }

    /// Coalesce bursty topics (order book depth): only the newest payload
    /// survives until the next flusher pass.
    pub fn publish_coalesced(&self, topic: &str, kind: &str, data: Value) {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(topic.to_string(), (kind.to_string(), data));
    }

    pub fn client_count(&self) -> usize {
        self.inner.clients.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_seq_monotone_per_topic() {
        let hub = BroadcastHub::new();
        let (id, mut rx) = hub.register();
        hub.subscribe(id, "market:0xmeme:trades");
        hub.publish("market:0xmeme:trades", "trade", json!({"n": 1}));
        hub.publish("market:0xmeme:trades", "trade", json!({"n": 2}));
        hub.publish("market:0xmeme:book", "orderbook", json!({}));
        let a = rx.try_recv().unwrap();
        let b = rx.try_recv().unwrap();
        assert_eq!((a.seq, b.seq), (1, 2));
        // unrelated topic was not delivered
        assert!(rx.try_recv().is_err());
        // other topics keep their own counters
        assert_eq!(hub.current_seq("market:0xmeme:book"), 1);
    }

    #[test]
    fn test_unsubscribe_is_idempotent() {
        let hub = BroadcastHub::new();
        let (id, mut rx) = hub.register();
        hub.subscribe(id, "t");
        hub.subscribe(id, "t");
        hub.unsubscribe(id, "t");
        hub.unsubscribe(id, "t");
        hub.publish("t", "x", json!({}));
        assert!(rx.try_recv().is_err());
        // resubscribe sees the advanced seq base
        assert_eq!(hub.subscribe(id, "t"), 1);
    }

    #[test]
    fn test_slow_consumer_dropped_others_unaffected() {
        let hub = BroadcastHub::new();
        let (slow, slow_rx) = hub.register();
        let (fast, mut fast_rx) = hub.register();
        hub.subscribe(slow, "t");
        hub.subscribe(fast, "t");
        // never read `slow_rx`; fill its queue past the bound
        for i in 0..(CLIENT_QUEUE + 1) {
            hub.publish("t", "x", json!({ "i": i }));
            // drain the fast client so it never overflows
            while fast_rx.try_recv().is_ok() {}
        }
        assert_eq!(hub.client_count(), 1);
        hub.publish("t", "x", json!({"after": true}));
        let last = fast_rx.try_recv().unwrap();
        assert_eq!(last.seq, CLIENT_QUEUE as u64 + 2);
        drop(slow_rx);
    }

    #[test]
    fn test_coalesced_pending_keeps_latest() {
        let hub = BroadcastHub::new();
        hub.publish_coalesced("market:m:book", "orderbook", json!({"v": 1}));
        hub.publish_coalesced("market:m:book", "orderbook", json!({"v": 2}));
        let pending = hub.inner.pending.lock().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending["market:m:book"].1, json!({"v": 2}));
    }
}
