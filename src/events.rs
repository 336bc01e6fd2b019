use serde::Serialize;
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum IntegrityFailureKind {
    /// A file on disk does not match its manifest entry.
    Integrity,
    /// A file could not be fetched.
    Http,
    /// The active snapshot failed its startup check.
    CoreIntegrity,
}

/// Diagnostic notifications. Nothing waits on them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum DeployEvent {
    #[serde(rename_all = "camelCase")]
    IntegrityCheckFailed {
        #[serde(rename = "type")]
        kind: IntegrityFailureKind,
        #[serde(skip_serializing_if = "Option::is_none")]
        file: Option<String>,
    },
    CoreFileIntegrityCheckFailed {},
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<DeployEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeployEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: DeployEvent) {
        tracing::debug!("deploy event: {:?}", event);
        let _ = self.sender.send(event);
    }

    pub fn integrity_failed(&self, kind: IntegrityFailureKind, file: Option<&str>) {
        self.emit(DeployEvent::IntegrityCheckFailed {
            kind,
            file: file.map(str::to_string),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integrity_event_serializes_with_type_field() {
        let event = DeployEvent::IntegrityCheckFailed {
            kind: IntegrityFailureKind::CoreIntegrity,
            file: None,
        };
        let value = serde_json::to_value(&event).expect("serialize event");
        assert_eq!(value["event"], "integrityCheckFailed");
        assert_eq!(value["type"], "coreIntegrity");
        assert!(value.get("file").is_none());
    }

    #[tokio::test]
    async fn subscribers_receive_emitted_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.integrity_failed(IntegrityFailureKind::Integrity, Some("index.html"));
        let event = rx.recv().await.expect("event delivered");
        assert_eq!(
            event,
            DeployEvent::IntegrityCheckFailed {
                kind: IntegrityFailureKind::Integrity,
                file: Some("index.html".to_string()),
            }
        );
    }
}
