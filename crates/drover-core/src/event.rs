use crate::types::OrchestrationEvent;

/// Outbound event sink using a tokio broadcast channel.
/// All subscribers receive all events; publishing never blocks.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<OrchestrationEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: OrchestrationEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<OrchestrationEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::JobId;

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let bus = EventBus::new(4);
        bus.publish(OrchestrationEvent::JobStarted { job_id: JobId::new() });
    }

    #[tokio::test]
    async fn test_subscriber_receives_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let job_id = JobId::new();
        bus.publish(OrchestrationEvent::Progress {
            job_id: job_id.clone(),
            percent: 50,
        });
        match rx.recv().await.unwrap() {
            OrchestrationEvent::Progress { job_id: got, percent } => {
                assert_eq!(got, job_id);
                assert_eq!(percent, 50);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
