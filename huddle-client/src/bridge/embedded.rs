//! Embedded side of the bridge.
//!
//! [`EmbeddedAdapter`] owns one [`NativeTransport`] per `instanceId`. Each
//! instance has a worker task that applies its actions strictly in arrival
//! order, so an `Emit(leave)` followed by `Close` reaches the server in that
//! order. Replies are awaited off the worker so a slow call never blocks the
//! instance's later actions.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use huddle_core::{Request, ServerEvent};
use tokio::sync::{mpsc, oneshot, Mutex};

use super::host::EmbeddedRuntime;
use super::{action, callback, BridgeCall, BridgeCompletion, BridgeOutcome, HostCallback};
use crate::adapter::{ChannelEvent, EventReceiver, TransportAdapter};
use crate::native::NativeTransport;
use crate::{ClientConfig, ClientError};

enum Command {
    Open { call_id: u64 },
    Request { call_id: u64, request: Request },
    Emit(Request),
    Close,
    Release,
}

pub struct EmbeddedAdapter {
    host: Arc<dyn HostCallback>,
    instances: Mutex<HashMap<String, mpsc::Sender<Command>>>,
}

impl EmbeddedAdapter {
    pub fn new(host: Arc<dyn HostCallback>) -> Self {
        Self {
            host,
            instances: Mutex::new(HashMap::new()),
        }
    }

    pub async fn instance_count(&self) -> usize {
        self.instances.lock().await.len()
    }

    /// Entry point for every host action.
    pub async fn handle_action(
        &self,
        name: &str,
        payload: &str,
        instance_id: &str,
    ) -> Result<(), ClientError> {
        if name == action::CREATE {
            return self.create(payload, instance_id).await;
        }

        let command = match name {
            action::OPEN => {
                let call: BridgeCall<()> = serde_json::from_str(payload)?;
                Command::Open { call_id: call.call_id }
            }
            action::REQUEST => {
                let call: BridgeCall<Request> = serde_json::from_str(payload)?;
                Command::Request {
                    call_id: call.call_id,
                    request: call.body,
                }
            }
            action::EMIT => Command::Emit(serde_json::from_str(payload)?),
            action::CLOSE => Command::Close,
            action::RELEASE => Command::Release,
            other => return Err(ClientError::Bridge(format!("unknown action {other}"))),
        };

        let worker = {
            let mut instances = self.instances.lock().await;
            let worker = instances.get(instance_id).cloned().ok_or_else(|| {
                ClientError::Bridge(format!("instance {instance_id} was never created"))
            })?;
            if matches!(command, Command::Release) {
                instances.remove(instance_id);
            }
            worker
        };
        worker
            .send(command)
            .await
            .map_err(|_| ClientError::Bridge(format!("instance {instance_id} has shut down")))
    }

    async fn create(&self, payload: &str, instance_id: &str) -> Result<(), ClientError> {
        let config: ClientConfig = serde_json::from_str(payload)?;
        let transport = NativeTransport::new(config)?;

        let mut instances = self.instances.lock().await;
        if instances.contains_key(instance_id) {
            return Err(ClientError::Bridge(format!("instance {instance_id} already exists")));
        }
        let (tx, rx) = mpsc::channel(64);
        let worker = InstanceWorker {
            instance_id: instance_id.to_string(),
            transport: Arc::new(transport),
            host: self.host.clone(),
        };
        tokio::spawn(worker.run(rx));
        instances.insert(instance_id.to_string(), tx);
        log::debug!("Bridge instance {instance_id} created");
        Ok(())
    }
}

struct InstanceWorker {
    instance_id: String,
    transport: Arc<NativeTransport>,
    host: Arc<dyn HostCallback>,
}

impl InstanceWorker {
    async fn run(self, mut commands: mpsc::Receiver<Command>) {
        while let Some(command) = commands.recv().await {
            match command {
                Command::Open { call_id } => {
                    let outcome = match self.transport.open().await {
                        Ok(Some(events)) => {
                            self.pump_events(events);
                            BridgeOutcome::Opened { fresh: true }
                        }
                        Ok(None) => BridgeOutcome::Opened { fresh: false },
                        Err(e) => BridgeOutcome::Failed(e.to_string()),
                    };
                    complete(&*self.host, &self.instance_id, call_id, outcome).await;
                }
                Command::Request { call_id, request } => {
                    match self.transport.begin_request(request).await {
                        Ok(waiter) => self.await_reply(call_id, waiter),
                        Err(e) => {
                            let outcome = BridgeOutcome::Failed(e.to_string());
                            complete(&*self.host, &self.instance_id, call_id, outcome).await;
                        }
                    }
                }
                Command::Emit(request) => {
                    if let Err(e) = self.transport.emit(request).await {
                        log::warn!("Emit on {} failed: {e}", self.instance_id);
                    }
                }
                Command::Close => self.transport.close().await,
                Command::Release => {
                    self.transport.release().await;
                    break;
                }
            }
        }
        log::debug!("Bridge instance {} released", self.instance_id);
    }

    fn await_reply(&self, call_id: u64, waiter: oneshot::Receiver<huddle_core::Reply>) {
        let host = self.host.clone();
        let instance_id = self.instance_id.clone();
        tokio::spawn(async move {
            let outcome = match waiter.await {
                Ok(reply) => BridgeOutcome::Reply(reply),
                Err(_) => BridgeOutcome::Failed(ClientError::ChannelClosed.to_string()),
            };
            complete(&*host, &instance_id, call_id, outcome).await;
        });
    }

    fn pump_events(&self, mut events: EventReceiver) {
        let host = self.host.clone();
        let instance_id = self.instance_id.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    ChannelEvent::Server(event) => match serde_json::to_string::<ServerEvent>(&event) {
                        Ok(payload) => host.callback(callback::EVENT, payload, &instance_id).await,
                        Err(e) => log::error!("Failed to encode {} for the host: {e}", event.event_name()),
                    },
                    ChannelEvent::Disconnected(reason) => {
                        host.callback(callback::DISCONNECTED, reason, &instance_id).await;
                    }
                }
            }
        });
    }
}

async fn complete(host: &dyn HostCallback, instance_id: &str, call_id: u64, outcome: BridgeOutcome) {
    match serde_json::to_string(&BridgeCompletion { call_id, outcome }) {
        Ok(payload) => host.callback(callback::COMPLETE, payload, instance_id).await,
        Err(e) => log::error!("Failed to encode completion {call_id} for {instance_id}: {e}"),
    }
}

/// Embedded runtime living in the same process, for tests and native hosts.
pub struct LoopbackRuntime {
    adapter: EmbeddedAdapter,
}

impl LoopbackRuntime {
    pub fn new(host: Arc<dyn HostCallback>) -> Self {
        Self {
            adapter: EmbeddedAdapter::new(host),
        }
    }

    pub fn adapter(&self) -> &EmbeddedAdapter {
        &self.adapter
    }
}

#[async_trait]
impl EmbeddedRuntime for LoopbackRuntime {
    async fn call_action(
        &self,
        action: &str,
        payload: String,
        instance_id: &str,
    ) -> Result<(), ClientError> {
        self.adapter.handle_action(action, &payload, instance_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingHost {
        calls: Mutex<Vec<(String, String, String)>>,
    }

    #[async_trait]
    impl HostCallback for RecordingHost {
        async fn callback(&self, name: &str, payload: String, instance_id: &str) {
            self.calls
                .lock()
                .await
                .push((name.to_string(), payload, instance_id.to_string()));
        }
    }

    fn config_json() -> String {
        serde_json::to_string(&ClientConfig::new("ws://127.0.0.1:1")).unwrap()
    }

    #[tokio::test]
    async fn test_actions_need_a_created_instance() {
        let adapter = EmbeddedAdapter::new(Arc::new(RecordingHost::default()));
        let result = adapter.handle_action(action::CLOSE, "", "missing").await;
        assert!(matches!(result, Err(ClientError::Bridge(_))));
    }

    #[tokio::test]
    async fn test_create_twice_is_refused() {
        let adapter = EmbeddedAdapter::new(Arc::new(RecordingHost::default()));
        adapter.handle_action(action::CREATE, &config_json(), "i1").await.unwrap();
        assert!(adapter.handle_action(action::CREATE, &config_json(), "i1").await.is_err());
        assert_eq!(adapter.instance_count().await, 1);
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_config() {
        let adapter = EmbeddedAdapter::new(Arc::new(RecordingHost::default()));
        let bad = serde_json::to_string(&ClientConfig::new("")).unwrap();
        assert!(adapter.handle_action(action::CREATE, &bad, "i1").await.is_err());
        assert_eq!(adapter.instance_count().await, 0);
    }

    #[tokio::test]
    async fn test_request_before_open_completes_with_failure() {
        let host = Arc::new(RecordingHost::default());
        let adapter = EmbeddedAdapter::new(host.clone());
        adapter.handle_action(action::CREATE, &config_json(), "i1").await.unwrap();

        let call = serde_json::to_string(&BridgeCall { call_id: 5, body: Request::ListGroups }).unwrap();
        adapter.handle_action(action::REQUEST, &call, "i1").await.unwrap();

        let completion = tokio::time::timeout(std::time::Duration::from_secs(1), async {
            loop {
                if let Some((_, payload, _)) = host.calls.lock().await.first().cloned() {
                    return payload;
                }
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        let completion: BridgeCompletion = serde_json::from_str(&completion).unwrap();
        assert_eq!(completion.call_id, 5);
        assert!(matches!(completion.outcome, BridgeOutcome::Failed(_)));
    }

    #[tokio::test]
    async fn test_release_removes_instance() {
        let adapter = EmbeddedAdapter::new(Arc::new(RecordingHost::default()));
        adapter.handle_action(action::CREATE, &config_json(), "i1").await.unwrap();
        adapter.handle_action(action::RELEASE, "", "i1").await.unwrap();
        assert_eq!(adapter.instance_count().await, 0);
        assert!(adapter.handle_action(action::CLOSE, "", "i1").await.is_err());
    }
}
