//! Bridge service: owns one transport, the dispatcher and the status publisher,
//! and runs the event loop between `start` and `stop`.
//!
//! Lifecycle events go straight to the status publisher. Each inbound message is
//! handled on its own task; with per-sender serialization, messages from one
//! sender go through a queue drained by a single worker, so they are handled in
//! delivery order while different senders proceed concurrently.

use anyhow::Result;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::audit::AuditLog;
use crate::channels::{InboundMessage, SidecarChannel, Transport, TransportError, TransportEvent, TwilioChannel};
use crate::config::{self, Config, TransportKind};
use crate::dispatch::{DispatchOutcome, Dispatcher};
use crate::responder::{ProcessResponder, Responder};
use crate::status::{LifecycleStatus, StatusPublisher};

const EVENT_QUEUE: usize = 256;

type SenderQueues = Mutex<HashMap<String, mpsc::UnboundedSender<InboundMessage>>>;

pub struct Bridge {
    transport: Arc<dyn Transport>,
    dispatcher: Arc<Dispatcher>,
    status: Arc<StatusPublisher>,
    serialize_per_sender: bool,
    running: AtomicBool,
    events_tx: mpsc::Sender<TransportEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
    shutdown: watch::Sender<bool>,
    queues: SenderQueues,
    transport_task: Mutex<Option<JoinHandle<()>>>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
    /// In-flight message handlers and sender workers.
    handlers: Mutex<Vec<JoinHandle<()>>>,
}

/// Lock a std mutex, recovering the data if a holder panicked.
fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Build the transport selected by `transport.kind`.
pub fn build_transport(config: &Config) -> Arc<dyn Transport> {
    match config.transport.kind {
        TransportKind::Twilio => {
            Arc::new(TwilioChannel::new(config::resolve_twilio_credentials(config)))
        }
        TransportKind::Sidecar => Arc::new(SidecarChannel::new(
            config.transport.sidecar.send_url.clone(),
            config.transport.sidecar.secret.clone(),
        )),
    }
}

impl Bridge {
    pub fn new(
        transport: Arc<dyn Transport>,
        dispatcher: Arc<Dispatcher>,
        status: Arc<StatusPublisher>,
        serialize_per_sender: bool,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        let (shutdown, _) = watch::channel(false);
        Self {
            transport,
            dispatcher,
            status,
            serialize_per_sender,
            running: AtomicBool::new(false),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            shutdown,
            queues: Mutex::new(HashMap::new()),
            transport_task: Mutex::new(None),
            event_loop: Mutex::new(None),
            handlers: Mutex::new(Vec::new()),
        }
    }

    /// Wire a bridge from config: state files, audit log and process responder resolved against `config_path`.
    pub fn from_config(config: &Config, config_path: &Path, transport: Arc<dyn Transport>) -> Self {
        let paths = config::resolve_state_paths(config, config_path);
        let responder: Arc<dyn Responder> = Arc::new(ProcessResponder::from_config(
            &config.responder,
            config::resolve_responder_dir(config, config_path),
        ));
        let dispatcher = Dispatcher::new(
            Arc::new(AuditLog::new(paths.audit_log)),
            responder,
            config.replies.clone().into(),
            config.responder.timeout(),
        );
        Self::new(
            transport,
            Arc::new(dispatcher),
            Arc::new(StatusPublisher::new(paths.status, paths.pairing)),
            config.dispatch.serialize_per_sender,
        )
    }

    pub fn transport_id(&self) -> &str {
        self.transport.id()
    }

    pub fn status(&self) -> &Arc<StatusPublisher> {
        &self.status
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start the transport and the event loop. A bridge can be started once.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let Some(mut events_rx) = lock(&self.events_rx).take() else {
            anyhow::bail!("bridge already started");
        };
        self.running.store(true, Ordering::SeqCst);
        log::info!("bridge: starting {} transport", self.transport.id());

        let transport_task = self.transport.clone().start(self.events_tx.clone());
        let mut shutdown_rx = self.shutdown.subscribe();
        let bridge = self.clone();
        let event_loop = tokio::spawn(async move {
            loop {
                tokio::select! {
                    ev = events_rx.recv() => match ev {
                        Some(ev) => bridge.on_event(ev).await,
                        None => break,
                    },
                    _ = shutdown_rx.changed() => {
                        // Events already accepted by `ingest` are still handled.
                        events_rx.close();
                        let mut drained = 0usize;
                        while let Some(ev) = events_rx.recv().await {
                            bridge.on_event(ev).await;
                            drained += 1;
                        }
                        if drained > 0 {
                            log::debug!("bridge: handled {} queued events during shutdown", drained);
                        }
                        break;
                    }
                }
            }
            log::debug!("bridge: event loop stopped");
        });
        *lock(&self.transport_task) = Some(transport_task);
        *lock(&self.event_loop) = Some(event_loop);
        Ok(())
    }

    /// Refuse new events, finish every accepted message, stop the transport, and
    /// publish `disconnected`.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        log::info!("bridge: stopping");
        let _ = self.shutdown.send(true);

        let event_loop = lock(&self.event_loop).take();
        if let Some(t) = event_loop {
            let _ = t.await;
        }
        // Nothing spawns new handlers once the event loop is gone.
        let handlers = std::mem::take(&mut *lock(&self.handlers));
        futures_util::future::join_all(handlers).await;

        // Replies above still need the transport.
        self.transport.stop();
        let transport_task = lock(&self.transport_task).take();
        if let Some(t) = transport_task {
            let _ = t.await;
        }

        if let Err(e) = self.status.publish(LifecycleStatus::Disconnected).await {
            log::warn!("bridge: publishing disconnected status failed: {}", e);
        }
        log::info!("bridge: stopped");
    }

    /// Feed an event from an HTTP ingress (webhook) into the event loop.
    pub async fn ingest(&self, event: TransportEvent) -> Result<(), TransportError> {
        if !self.is_running() {
            return Err(TransportError::Stopped);
        }
        self.events_tx
            .send(event)
            .await
            .map_err(|_| TransportError::Stopped)
    }

    /// Proactive outreach, independent of the inbound pipeline. Failures are logged.
    pub async fn send_message(&self, recipient_id: &str, text: &str) -> bool {
        match self.transport.send_message(recipient_id, text).await {
            Ok(()) => true,
            Err(e) => {
                log::error!("bridge: sending message to {} failed: {}", recipient_id, e);
                false
            }
        }
    }

    async fn on_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::PairingCode(payload) => {
                log::info!("bridge: pairing code received");
                if let Err(e) = self.status.publish_pairing_code(&payload).await {
                    log::warn!("bridge: writing pairing code failed: {}", e);
                }
                self.publish(LifecycleStatus::PairingPending).await;
            }
            TransportEvent::Ready => {
                log::info!("bridge: {} transport is ready", self.transport.id());
                self.publish(LifecycleStatus::Ready).await;
            }
            TransportEvent::Disconnected(reason) => {
                log::info!("bridge: transport disconnected: {}", reason);
                self.publish(LifecycleStatus::Disconnected).await;
            }
            TransportEvent::Message(msg) => self.enqueue(msg),
        }
    }

    async fn publish(&self, status: LifecycleStatus) {
        if let Err(e) = self.status.publish(status).await {
            log::warn!("bridge: publishing status {} failed: {}", status, e);
        }
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut handlers = lock(&self.handlers);
        handlers.retain(|h| !h.is_finished());
        handlers.push(handle);
    }

    fn enqueue(self: &Arc<Self>, msg: InboundMessage) {
        if !self.serialize_per_sender {
            let bridge = self.clone();
            self.track(tokio::spawn(async move { bridge.dispatch_one(msg).await }));
            return;
        }

        let sender = msg.sender_id.clone();
        let msg = {
            let queues = lock(&self.queues);
            match queues.get(&sender) {
                Some(tx) => match tx.send(msg) {
                    Ok(()) => return,
                    Err(mpsc::error::SendError(msg)) => msg,
                },
                None => msg,
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        // Cannot fail: rx is alive.
        let _ = tx.send(msg);
        lock(&self.queues).insert(sender.clone(), tx);
        let bridge = self.clone();
        self.track(tokio::spawn(async move { bridge.drain_sender(sender, rx).await }));
    }

    /// Handle one sender's queued messages in order; exits once the queue is empty.
    async fn drain_sender(
        self: Arc<Self>,
        sender: String,
        mut rx: mpsc::UnboundedReceiver<InboundMessage>,
    ) {
        loop {
            let next = match rx.try_recv() {
                Ok(m) => Some(m),
                Err(_) => {
                    // Re-check under the map lock so a concurrent enqueue is never stranded.
                    let mut queues = lock(&self.queues);
                    match rx.try_recv() {
                        Ok(m) => Some(m),
                        Err(_) => {
                            queues.remove(&sender);
                            None
                        }
                    }
                }
            };
            let Some(msg) = next else { break };
            self.dispatch_one(msg).await;
        }
    }

    async fn dispatch_one(&self, msg: InboundMessage) {
        let sender = msg.sender_id.clone();
        match self.dispatcher.handle(msg, self.transport.as_ref()).await {
            DispatchOutcome::Replied {
                delivered: false, ..
            } => log::warn!("bridge: reply to {} was not delivered", sender),
            outcome => log::debug!("bridge: {} -> {:?}", sender, outcome),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::responder::{FallbackReplies, GatewayRequest, GatewayResult};
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::Mutex as AsyncMutex;

    /// Echoes the text back after a delay taken from the text ("slow" waits longer).
    struct EchoResponder;

    #[async_trait]
    impl Responder for EchoResponder {
        async fn invoke(&self, req: &GatewayRequest, _timeout: Option<Duration>) -> GatewayResult {
            let delay = if req.text.starts_with("slow") { 150 } else { 5 };
            tokio::time::sleep(Duration::from_millis(delay)).await;
            GatewayResult::Reply(format!("echo {}", req.text))
        }
    }

    #[derive(Default)]
    struct RecordingTransport {
        sent: AsyncMutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        fn id(&self) -> &str {
            "recording"
        }

        fn start(self: Arc<Self>, events: mpsc::Sender<TransportEvent>) -> JoinHandle<()> {
            tokio::spawn(async move {
                let _ = events.send(TransportEvent::Ready).await;
            })
        }

        fn stop(&self) {}

        async fn send_message(&self, recipient_id: &str, text: &str) -> Result<(), TransportError> {
            self.sent
                .lock()
                .await
                .push((recipient_id.to_string(), text.to_string()));
            Ok(())
        }
    }

    fn bridge(serialize: bool) -> (Arc<Bridge>, Arc<RecordingTransport>) {
        let dir = std::env::temp_dir().join(format!("wabridge-bridge-{}", uuid::Uuid::new_v4()));
        let transport = Arc::new(RecordingTransport::default());
        let dispatcher = Dispatcher::new(
            Arc::new(AuditLog::new(dir.join("message_logs.json"))),
            Arc::new(EchoResponder),
            FallbackReplies::default(),
            None,
        );
        let bridge = Arc::new(Bridge::new(
            transport.clone(),
            Arc::new(dispatcher),
            Arc::new(StatusPublisher::new(
                dir.join("bot_status.txt"),
                dir.join("qr_code.txt"),
            )),
            serialize,
        ));
        (bridge, transport)
    }

    async fn wait_for_status(bridge: &Bridge, want: LifecycleStatus) {
        for _ in 0..100 {
            if bridge.status().current().await.ok().flatten() == Some(want) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("status never became {}", want);
    }

    #[tokio::test]
    async fn lifecycle_events_update_status_files() {
        let (bridge, _) = bridge(true);
        bridge.start().unwrap();
        wait_for_status(&bridge, LifecycleStatus::Ready).await;

        bridge
            .ingest(TransportEvent::PairingCode("2@qr".to_string()))
            .await
            .unwrap();
        wait_for_status(&bridge, LifecycleStatus::PairingPending).await;
        assert_eq!(
            std::fs::read_to_string(bridge.status().pairing_path()).unwrap(),
            "2@qr"
        );

        bridge
            .ingest(TransportEvent::Disconnected("LOGOUT".to_string()))
            .await
            .unwrap();
        wait_for_status(&bridge, LifecycleStatus::Disconnected).await;
        bridge.stop().await;
    }

    #[tokio::test]
    async fn start_twice_fails_and_ingest_after_stop_is_rejected() {
        let (bridge, _) = bridge(false);
        bridge.start().unwrap();
        assert!(bridge.start().is_err());
        bridge.stop().await;
        assert!(!bridge.is_running());
        assert!(matches!(
            bridge.ingest(TransportEvent::Ready).await,
            Err(TransportError::Stopped)
        ));
        assert_eq!(
            bridge.status().current().await.unwrap(),
            Some(LifecycleStatus::Disconnected)
        );
    }

    #[tokio::test]
    async fn per_sender_order_is_preserved() {
        let (bridge, transport) = bridge(true);
        bridge.start().unwrap();
        bridge
            .ingest(TransportEvent::Message(InboundMessage::direct("628123", "slow first")))
            .await
            .unwrap();
        bridge
            .ingest(TransportEvent::Message(InboundMessage::direct("628123", "second")))
            .await
            .unwrap();
        bridge
            .ingest(TransportEvent::Message(InboundMessage::direct("628999", "other")))
            .await
            .unwrap();
        bridge.stop().await;

        let sent = transport.sent.lock().await;
        let to_first: Vec<&str> = sent
            .iter()
            .filter(|(to, _)| to == "628123")
            .map(|(_, text)| text.as_str())
            .collect();
        assert_eq!(to_first, vec!["echo slow first", "echo second"]);
        // The other sender is not held up behind the slow message.
        assert_eq!(sent[0].0, "628999");
    }

    #[tokio::test]
    async fn stop_answers_every_accepted_message() {
        for round in 0..40 {
            let (bridge, transport) = bridge(round % 2 == 0);
            bridge.start().unwrap();
            bridge
                .ingest(TransportEvent::Message(InboundMessage::direct("628123", "halo")))
                .await
                .unwrap();
            bridge.stop().await;

            let sent = transport.sent.lock().await;
            assert_eq!(
                sent.as_slice(),
                &[("628123".to_string(), "echo halo".to_string())],
                "round {}",
                round
            );
            assert_eq!(bridge.dispatcher.audit().read_all().await.unwrap().len(), 2);
        }
    }

    #[tokio::test]
    async fn send_message_reports_success() {
        let (bridge, transport) = bridge(false);
        bridge.start().unwrap();
        assert!(bridge.send_message("628123", "Promo hari ini").await);
        assert_eq!(transport.sent.lock().await.len(), 1);
        bridge.stop().await;
    }
}
