//! Allow/block event stream
//!
//! Events go into a bounded broadcast ring. Publishing never blocks; slow
//! subscribers lose the oldest events.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

/// Terminal decision type of an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// Request forwarded or tunnelled
    Allowed,
    /// Request refused by policy
    Blocked,
}

/// One allow/block decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyEvent {
    /// Decision
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Target host
    pub domain: String,
    /// Block reason text
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// HTTP method (`CONNECT` for tunnels)
    pub method: String,
    /// Time from accept to decision
    pub duration_ms: u64,
}

/// Cumulative counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TelemetryCounters {
    /// Allowed events recorded
    pub allowed: u64,
    /// Blocked events recorded
    pub blocked: u64,
}

/// Fire-and-forget event sink
pub struct TelemetrySink {
    tx: broadcast::Sender<ProxyEvent>,
    allowed: AtomicU64,
    blocked: AtomicU64,
}

impl TelemetrySink {
    /// Create a sink whose ring holds `capacity` events
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            allowed: AtomicU64::new(0),
            blocked: AtomicU64::new(0),
        }
    }

    /// Record an event; never blocks or fails
    pub fn record_event(&self, event: ProxyEvent) {
        match event.kind {
            EventKind::Allowed => self.allowed.fetch_add(1, Ordering::Relaxed),
            EventKind::Blocked => self.blocked.fetch_add(1, Ordering::Relaxed),
        };
        // No receivers is not an error for a fire-and-forget sink
        let _ = self.tx.send(event);
    }

    /// Subscribe to future events
    pub fn subscribe(&self) -> broadcast::Receiver<ProxyEvent> {
        self.tx.subscribe()
    }

    /// Snapshot of the counters
    pub fn counters(&self) -> TelemetryCounters {
        TelemetryCounters {
            allowed: self.allowed.load(Ordering::Relaxed),
            blocked: self.blocked.load(Ordering::Relaxed),
        }
    }
}

impl Default for TelemetrySink {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: EventKind, domain: &str) -> ProxyEvent {
        ProxyEvent {
            kind,
            domain: domain.to_string(),
            reason: None,
            method: "GET".to_string(),
            duration_ms: 1,
        }
    }

    #[test]
    fn test_record_without_subscribers() {
        let sink = TelemetrySink::new(4);
        sink.record_event(event(EventKind::Allowed, "a.test"));
        sink.record_event(event(EventKind::Blocked, "b.test"));

        assert_eq!(
            sink.counters(),
            TelemetryCounters {
                allowed: 1,
                blocked: 1
            }
        );
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_oldest() {
        let sink = TelemetrySink::new(2);
        let mut rx = sink.subscribe();

        for i in 0..5 {
            sink.record_event(event(EventKind::Allowed, &format!("{i}.test")));
        }

        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(3))
        ));
        assert_eq!(rx.recv().await.unwrap().domain, "3.test");
        assert_eq!(rx.recv().await.unwrap().domain, "4.test");
    }

    #[test]
    fn test_event_json_shape() {
        let mut e = event(EventKind::Blocked, "bad.test");
        e.reason = Some("Blocked Domain".to_string());
        let json = serde_json::to_string(&e).unwrap();
        assert!(json.contains("\"type\":\"blocked\""));
        assert!(json.contains("\"durationMs\":1"));
    }
}
