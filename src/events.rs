//! Docker event stream consumer.

use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::docker::ContainerApi;
use crate::metrics::{self, ReconnectReason, RegistryEventKind};
use crate::registry::HostRegistry;

const INITIAL_BACKOFF_SECS: u64 = 1;
const MAX_BACKOFF_SECS: u64 = 30;

/// Applies container lifecycle events to the registry.
pub struct EventConsumer {
    api: Arc<dyn ContainerApi>,
    registry: HostRegistry,
}

impl EventConsumer {
    /// Create a consumer feeding `registry`.
    pub fn new(api: Arc<dyn ContainerApi>, registry: HostRegistry) -> Self {
        Self { api, registry }
    }

    /// Consume events until `shutdown` is cancelled.
    ///
    /// The stream is re-subscribed with exponential backoff whenever it ends
    /// or fails. The registry is resynchronized after every successful
    /// subscription, the first one included, so containers that changed
    /// before the stream was open are not missed.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut backoff_secs = INITIAL_BACKOFF_SECS;
        let mut first_connect = true;

        loop {
            if shutdown.is_cancelled() {
                info!("event consumer shutting down");
                return;
            }

            debug!("subscribing to container events");
            let mut stream = match self.api.events().await {
                Ok(stream) => {
                    backoff_secs = INITIAL_BACKOFF_SECS;
                    if first_connect {
                        metrics::record_event_stream_reconnect(ReconnectReason::InitialConnect);
                        first_connect = false;
                    }
                    self.resync().await;
                    stream
                }
                Err(e) => {
                    error!(error = %e, "failed to subscribe to container events");
                    metrics::record_event_stream_reconnect(ReconnectReason::Error);
                    if !self.backoff(&shutdown, &mut backoff_secs).await {
                        return;
                    }
                    continue;
                }
            };

            loop {
                tokio::select! {
                    biased;

                    _ = shutdown.cancelled() => {
                        info!("event consumer received shutdown signal");
                        return;
                    }

                    next = stream.next() => {
                        match next {
                            Some(Ok(event)) => self.handle(event).await,
                            Some(Err(e)) => {
                                warn!(error = %e, "container event stream error");
                                metrics::record_event_stream_reconnect(ReconnectReason::Error);
                                break;
                            }
                            None => {
                                info!("container event stream ended");
                                metrics::record_event_stream_reconnect(ReconnectReason::StreamEnded);
                                break;
                            }
                        }
                    }
                }
            }

            if !self.backoff(&shutdown, &mut backoff_secs).await {
                return;
            }
        }
    }

    async fn handle(&self, event: crate::docker::ContainerEvent) {
        if let Err(e) = self.registry.apply_event(self.api.as_ref(), event).await {
            warn!(error = %e, "failed to apply container event");
            metrics::record_registry_event(RegistryEventKind::Error);
        }
    }

    async fn resync(&self) {
        if let Err(e) = self.registry.resync(self.api.as_ref()).await {
            error!(error = %e, "registry resync failed");
        }
    }

    /// Sleep for the current backoff. Returns false if shutdown fired first.
    async fn backoff(&self, shutdown: &CancellationToken, backoff_secs: &mut u64) -> bool {
        let delay = Duration::from_secs(*backoff_secs);
        *backoff_secs = (*backoff_secs * 2).min(MAX_BACKOFF_SECS);
        tokio::select! {
            _ = shutdown.cancelled() => false,
            _ = sleep(delay) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::fake::{details, FakeApi};
    use crate::docker::ContainerEvent;
    use std::net::IpAddr;

    async fn eventually<F: Fn() -> bool>(check: F) {
        // Outlasts the longest backoff.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(MAX_BACKOFF_SECS + 1);
        while tokio::time::Instant::now() < deadline {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_applies_events_until_shutdown() {
        let api = Arc::new(FakeApi::new());
        let events = api.event_sender();
        let registry = HostRegistry::new("docker");
        let shutdown = CancellationToken::new();

        let consumer = EventConsumer::new(api.clone(), registry.clone());
        let task = tokio::spawn(consumer.run(shutdown.clone()));

        api.add("c1", "web", "nginx", details(&[("10.0.0.5", &[])]));
        events
            .send(ContainerEvent::Start {
                id: "c1".to_string(),
                name: Some("web".to_string()),
                image: "nginx".to_string(),
            })
            .unwrap();
        let ip: IpAddr = "10.0.0.5".parse().unwrap();
        eventually(|| registry.resolve("web") == vec![ip]).await;

        // A start for a container that is already gone is logged and skipped.
        events
            .send(ContainerEvent::Start {
                id: "gone".to_string(),
                name: None,
                image: "busybox".to_string(),
            })
            .unwrap();
        events
            .send(ContainerEvent::Stop {
                id: "c1".to_string(),
            })
            .unwrap();
        eventually(|| registry.container_count() == 0).await;

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_resyncs_registry() {
        let api = Arc::new(FakeApi::new());
        let events = api.event_sender();
        let registry = HostRegistry::new("docker");
        let shutdown = CancellationToken::new();

        let task = tokio::spawn(EventConsumer::new(api.clone(), registry.clone()).run(shutdown.clone()));
        eventually(|| api.subscriptions() == 1).await;
        assert_eq!(registry.container_count(), 0);

        // Change the world, then close the stream without announcing it.
        api.add("c1", "web", "nginx", details(&[("10.0.0.5", &[])]));
        drop(events);
        tokio::time::advance(Duration::from_secs(INITIAL_BACKOFF_SECS + 1)).await;

        eventually(|| registry.container_count() == 1).await;
        assert_eq!(api.subscriptions(), 2);
        assert!(!registry.resolve("web").is_empty());

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_subscription_resyncs_registry() {
        let api = Arc::new(FakeApi::new());
        let _events = api.event_sender();
        let registry = HostRegistry::new("docker");
        let shutdown = CancellationToken::new();

        // Started after the registry was loaded but before the stream opened.
        api.add("c1", "web", "nginx", details(&[("10.0.0.5", &[])]));

        let task = tokio::spawn(EventConsumer::new(api.clone(), registry.clone()).run(shutdown.clone()));
        eventually(|| registry.container_count() == 1).await;
        assert_eq!(api.subscriptions(), 1);

        shutdown.cancel();
        task.await.unwrap();
    }
}
