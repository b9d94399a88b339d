use crate::upstream::connection::{ListKind, UpstreamConnection};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{Duration, Instant};

const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

/// One outbound notification kind, as forwarded to the downstream client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Tools,
    Resources,
    Prompts,
}

impl ChangeKind {
    pub fn method(self) -> &'static str {
        match self {
            ChangeKind::Tools => "notifications/tools/list_changed",
            ChangeKind::Resources => "notifications/resources/list_changed",
            ChangeKind::Prompts => "notifications/prompts/list_changed",
        }
    }

    fn from_list_kind(kind: ListKind) -> Option<Self> {
        match kind {
            ListKind::Tools => Some(ChangeKind::Tools),
            ListKind::Resources => Some(ChangeKind::Resources),
            // Resource templates invalidate alongside resources (cache
            // coherence) but do not get a separate outbound notification
            // kind of their own on the wire.
            ListKind::ResourceTemplates => None,
            ListKind::Prompts => Some(ChangeKind::Prompts),
        }
    }
}

/// Per-session debounced fan-in of upstream `list_changed` events. Each
/// attached connector registers one callback; rapid changes across
/// multiple upstreams of the same kind collapse into a single outbound
/// event per kind per debounce window.
pub struct NotificationCoordinator {
    debounce: Duration,
    timers: Mutex<HashMap<ChangeKind, Instant>>,
    attached: Mutex<Vec<String>>,
    outbound: mpsc::UnboundedSender<ChangeKind>,
}

impl NotificationCoordinator {
    /// Returns the coordinator plus the receiver the session should drain
    /// into the downstream MCP transport as outbound notifications.
    pub fn new(debounce: Duration) -> (Arc<Self>, mpsc::UnboundedReceiver<ChangeKind>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                debounce,
                timers: Mutex::new(HashMap::new()),
                attached: Mutex::new(Vec::new()),
                outbound: tx,
            }),
            rx,
        )
    }

    pub fn default_debounce() -> (Arc<Self>, mpsc::UnboundedReceiver<ChangeKind>) {
        Self::new(DEFAULT_DEBOUNCE)
    }

    /// Registers this coordinator's three listeners on `connector`. The
    /// connector already invalidates its own caches on receipt; the
    /// coordinator's job is solely to debounce the forwarded event.
    pub async fn attach(self: &Arc<Self>, namespace: &str, connector: &Arc<UpstreamConnection>) {
        self.attached.lock().await.push(namespace.to_string());

        let coordinator = self.clone();
        connector
            .set_change_listener(Arc::new(move |kind| {
                let coordinator = coordinator.clone();
                tokio::spawn(async move {
                    coordinator.on_event(kind).await;
                });
            }))
            .await;
    }

    async fn on_event(&self, kind: ListKind) {
        let Some(change_kind) = ChangeKind::from_list_kind(kind) else {
            return;
        };

        let fire_at = Instant::now() + self.debounce;
        self.timers.lock().await.insert(change_kind, fire_at);

        let debounce = self.debounce;
        let timers = self.timers_handle();
        let outbound = self.outbound.clone();

        tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            let mut timers = timers.lock().await;
            if let Some(&scheduled) = timers.get(&change_kind) {
                if scheduled <= Instant::now() {
                    timers.remove(&change_kind);
                    drop(timers);
                    let _ = outbound.send(change_kind);
                }
            }
        });
    }

    fn timers_handle(&self) -> &Mutex<HashMap<ChangeKind, Instant>> {
        &self.timers
    }

    /// Removes every registered listener and cancels pending timers.
    /// Guarantees each listener is removed exactly once.
    pub async fn detach_all(&self, connectors: &HashMap<String, Arc<UpstreamConnection>>) {
        let mut attached = self.attached.lock().await;
        for namespace in attached.drain(..) {
            if let Some(connector) = connectors.get(&namespace) {
                connector.clear_change_listener().await;
            }
        }
        self.timers.lock().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AuthMaterial, AuthStrategy, UpstreamSpec};
    use uuid::Uuid;

    fn spec(ns: &str) -> UpstreamSpec {
        UpstreamSpec {
            mcp_id: crate::model::McpId(Uuid::new_v4()),
            namespace: ns.into(),
            url: "https://example.com/mcp".into(),
            stateless: false,
            auth_strategy: AuthStrategy::None,
            auth: AuthMaterial::None,
            permissions: Default::default(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn collapses_rapid_events_into_one_notification() {
        let (coordinator, mut rx) = NotificationCoordinator::new(Duration::from_millis(500));
        let connector = Arc::new(UpstreamConnection::new(spec("github")));
        coordinator.attach("github", &connector).await;

        coordinator.on_event(ListKind::Tools).await;
        tokio::time::advance(Duration::from_millis(100)).await;
        coordinator.on_event(ListKind::Tools).await;
        tokio::time::advance(Duration::from_millis(100)).await;
        coordinator.on_event(ListKind::Tools).await;

        tokio::time::advance(Duration::from_millis(600)).await;
        tokio::task::yield_now().await;

        let first = rx.recv().await.unwrap();
        assert_eq!(first, ChangeKind::Tools);
        assert!(rx.try_recv().is_err());
    }
}
