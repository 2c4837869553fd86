//! Host side of the bridge.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use huddle_core::{Reply, Request, ServerEvent};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, Mutex};
use uuid::Uuid;

use super::embedded::LoopbackRuntime;
use super::{action, callback, BridgeCall, BridgeCompletion, BridgeOutcome, HostCallback};
use crate::adapter::{ChannelEvent, EventReceiver, TransportAdapter};
use crate::{ClientConfig, ClientError};

/// The embedded runtime as the host sees it: a sink for named actions.
#[async_trait]
pub trait EmbeddedRuntime: Send + Sync {
    async fn call_action(
        &self,
        action: &str,
        payload: String,
        instance_id: &str,
    ) -> Result<(), ClientError>;
}

struct RoutedInstance {
    pending: HashMap<u64, oneshot::Sender<BridgeOutcome>>,
    events: Option<mpsc::Sender<ChannelEvent>>,
    connected: Arc<AtomicBool>,
}

/// Delivers embedded-side callbacks to the transport they belong to.
#[derive(Default)]
pub struct BridgeRouter {
    instances: Mutex<HashMap<String, RoutedInstance>>,
}

impl BridgeRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn instance_count(&self) -> usize {
        self.instances.lock().await.len()
    }

    async fn register(&self, instance_id: &str, connected: Arc<AtomicBool>) {
        self.instances.lock().await.insert(
            instance_id.to_string(),
            RoutedInstance {
                pending: HashMap::new(),
                events: None,
                connected,
            },
        );
    }

    async fn unregister(&self, instance_id: &str) {
        self.instances.lock().await.remove(instance_id);
    }

    async fn expect(&self, instance_id: &str, call_id: u64) -> Option<oneshot::Receiver<BridgeOutcome>> {
        let mut instances = self.instances.lock().await;
        let instance = instances.get_mut(instance_id)?;
        let (tx, rx) = oneshot::channel();
        instance.pending.insert(call_id, tx);
        Some(rx)
    }

    async fn forget(&self, instance_id: &str, call_id: u64) {
        if let Some(instance) = self.instances.lock().await.get_mut(instance_id) {
            instance.pending.remove(&call_id);
        }
    }

    async fn set_events(&self, instance_id: &str, events: mpsc::Sender<ChannelEvent>) {
        if let Some(instance) = self.instances.lock().await.get_mut(instance_id) {
            instance.events = Some(events);
        }
    }

    async fn complete(&self, instance_id: &str, payload: &str) -> Result<(), ClientError> {
        let completion: BridgeCompletion = serde_json::from_str(payload)?;
        let waiter = self
            .instances
            .lock()
            .await
            .get_mut(instance_id)
            .and_then(|instance| instance.pending.remove(&completion.call_id));
        match waiter {
            Some(waiter) => {
                let _ = waiter.send(completion.outcome);
            }
            None => log::debug!(
                "Completion for call {} on {instance_id} has no waiter",
                completion.call_id
            ),
        }
        Ok(())
    }

    async fn forward(&self, instance_id: &str, event: ChannelEvent) {
        let events = {
            let instances = self.instances.lock().await;
            let Some(instance) = instances.get(instance_id) else {
                return;
            };
            if matches!(event, ChannelEvent::Disconnected(_)) {
                instance.connected.store(false, Ordering::Release);
            }
            instance.events.clone()
        };
        if let Some(events) = events {
            let _ = events.send(event).await;
        }
    }
}

#[async_trait]
impl HostCallback for BridgeRouter {
    async fn callback(&self, name: &str, payload: String, instance_id: &str) {
        let result = match name {
            callback::COMPLETE => self.complete(instance_id, &payload).await,
            callback::EVENT => match serde_json::from_str::<ServerEvent>(&payload) {
                Ok(event) => {
                    self.forward(instance_id, ChannelEvent::Server(event)).await;
                    Ok(())
                }
                Err(e) => Err(e.into()),
            },
            callback::DISCONNECTED => {
                self.forward(instance_id, ChannelEvent::Disconnected(payload)).await;
                Ok(())
            }
            other => {
                log::warn!("Unknown bridge callback {other} for {instance_id}");
                Ok(())
            }
        };
        if let Err(e) = result {
            log::warn!("Dropped {name} callback for {instance_id}: {e}");
        }
    }
}

/// Transport whose channel lives on the embedded side of a bridge.
pub struct BridgeTransport {
    runtime: Arc<dyn EmbeddedRuntime>,
    router: Arc<BridgeRouter>,
    instance_id: String,
    config: ClientConfig,
    next_call: AtomicU64,
    connected: Arc<AtomicBool>,
}

impl BridgeTransport {
    /// Register a new instance with the router and create its embedded twin.
    pub async fn create(
        runtime: Arc<dyn EmbeddedRuntime>,
        router: Arc<BridgeRouter>,
        config: ClientConfig,
    ) -> Result<Self, ClientError> {
        config.validate()?;
        let payload = serde_json::to_string(&config)?;
        let instance_id = Uuid::new_v4().to_string();
        let connected = Arc::new(AtomicBool::new(false));
        router.register(&instance_id, connected.clone()).await;

        if let Err(e) = runtime.call_action(action::CREATE, payload, &instance_id).await {
            router.unregister(&instance_id).await;
            return Err(e);
        }

        Ok(Self {
            runtime,
            router,
            instance_id,
            config,
            next_call: AtomicU64::new(1),
            connected,
        })
    }

    /// Bridge wired to an in-process embedded adapter.
    pub async fn loopback(config: ClientConfig) -> Result<Self, ClientError> {
        let router = Arc::new(BridgeRouter::new());
        let runtime = Arc::new(LoopbackRuntime::new(router.clone()));
        Self::create(runtime, router, config).await
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    async fn install_events(&self) -> EventReceiver {
        let (tx, rx) = mpsc::channel(self.config.event_buffer);
        self.router.set_events(&self.instance_id, tx).await;
        rx
    }

    async fn call<T: Serialize + Send>(&self, action: &str, body: T) -> Result<BridgeOutcome, ClientError> {
        let call_id = self.next_call.fetch_add(1, Ordering::Relaxed);
        let waiter = self
            .router
            .expect(&self.instance_id, call_id)
            .await
            .ok_or(ClientError::NotConnected)?;

        let payload = serde_json::to_string(&BridgeCall { call_id, body })?;
        if let Err(e) = self.runtime.call_action(action, payload, &self.instance_id).await {
            self.router.forget(&self.instance_id, call_id).await;
            return Err(e);
        }
        waiter.await.map_err(|_| ClientError::ChannelClosed)
    }
}

#[async_trait]
impl TransportAdapter for BridgeTransport {
    async fn open(&self) -> Result<Option<EventReceiver>, ClientError> {
        // The embedded side starts pumping events before it completes the
        // open, so a channel that may come up fresh needs its sink in place.
        let staged = if self.is_connected() {
            None
        } else {
            Some(self.install_events().await)
        };
        match self.call(action::OPEN, ()).await? {
            BridgeOutcome::Opened { fresh } => {
                let events = match staged {
                    Some(rx) => Some(rx),
                    None if fresh => Some(self.install_events().await),
                    None => None,
                };
                self.connected.store(true, Ordering::Release);
                Ok(events)
            }
            BridgeOutcome::Failed(reason) => Err(ClientError::Bridge(reason)),
            BridgeOutcome::Reply(_) => Err(ClientError::Bridge("open answered with a reply".into())),
        }
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::Release);
        if let Err(e) = self
            .runtime
            .call_action(action::CLOSE, String::new(), &self.instance_id)
            .await
        {
            log::warn!("Close of {} failed: {e}", self.instance_id);
        }
    }

    async fn request(&self, request: Request) -> Result<Reply, ClientError> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }
        match self.call(action::REQUEST, request).await? {
            BridgeOutcome::Reply(reply) => Ok(reply),
            BridgeOutcome::Failed(reason) => Err(ClientError::Bridge(reason)),
            BridgeOutcome::Opened { .. } => {
                Err(ClientError::Bridge("request answered with open".into()))
            }
        }
    }

    async fn emit(&self, request: Request) -> Result<(), ClientError> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }
        let payload = serde_json::to_string(&request)?;
        self.runtime
            .call_action(action::EMIT, payload, &self.instance_id)
            .await
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    async fn release(&self) {
        self.connected.store(false, Ordering::Release);
        if let Err(e) = self
            .runtime
            .call_action(action::RELEASE, String::new(), &self.instance_id)
            .await
        {
            log::warn!("Release of {} failed: {e}", self.instance_id);
        }
        self.router.unregister(&self.instance_id).await;
    }
}
