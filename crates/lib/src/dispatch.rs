//! Message dispatcher: filter an inbound message, log it, ask the responder, log
//! and send the reply.
//!
//! Per message the sequence is strictly: inbound log -> responder -> outbound log
//! -> send. Audit and send failures are logged and never stop the sequence.

use std::sync::Arc;
use std::time::Duration;

use crate::audit::{AuditLog, LogRecord};
use crate::channels::{InboundMessage, OriginKind, Transport};
use crate::responder::{FallbackReplies, GatewayRequest, GatewayResult, Responder};

/// Why a message was dropped without a log record or reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    Group,
    BroadcastStatus,
    SelfOrigin,
}

/// Drop group chats, the status feed, and the bot's own messages.
pub fn ignore_reason(msg: &InboundMessage) -> Option<IgnoreReason> {
    match msg.origin {
        OriginKind::Group => Some(IgnoreReason::Group),
        OriginKind::BroadcastStatus => Some(IgnoreReason::BroadcastStatus),
        OriginKind::Direct if msg.is_self_origin => Some(IgnoreReason::SelfOrigin),
        OriginKind::Direct => None,
    }
}

/// Terminal state of one handled message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    FilteredOut(IgnoreReason),
    /// The responder succeeded with empty output.
    NoReply,
    Replied {
        text: String,
        /// False when the transport rejected the send.
        delivered: bool,
    },
}

pub struct Dispatcher {
    audit: Arc<AuditLog>,
    responder: Arc<dyn Responder>,
    fallbacks: FallbackReplies,
    timeout: Option<Duration>,
}

impl Dispatcher {
    pub fn new(
        audit: Arc<AuditLog>,
        responder: Arc<dyn Responder>,
        fallbacks: FallbackReplies,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            audit,
            responder,
            fallbacks,
            timeout,
        }
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    /// Run the responder for one request and map failures to the user-facing fallback.
    pub async fn reply_for(&self, req: &GatewayRequest) -> (GatewayResult, Option<String>) {
        let result = self.responder.invoke(req, self.timeout).await;
        if let GatewayResult::Failure(ref f) = result {
            log::warn!("dispatch: responder failed for {}: {}", req.sender_id, f);
        }
        let reply = result.effective_reply(&self.fallbacks);
        (result, reply)
    }

    /// Handle one inbound message end to end, replying through `transport`.
    pub async fn handle(&self, msg: InboundMessage, transport: &dyn Transport) -> DispatchOutcome {
        if let Some(reason) = ignore_reason(&msg) {
            log::debug!("dispatch: ignoring message from {} ({:?})", msg.sender_id, reason);
            return DispatchOutcome::FilteredOut(reason);
        }
        log::info!("received message from {}: {}", msg.sender_id, msg.text);

        if let Err(e) = self
            .audit
            .append(LogRecord::received(&msg.sender_id, &msg.text))
            .await
        {
            log::error!("dispatch: audit log append (inbound) failed: {}", e);
        }

        let req = GatewayRequest::new(msg.text, msg.sender_id.clone());
        let (_, reply) = self.reply_for(&req).await;
        let Some(reply) = reply else {
            log::debug!("dispatch: no reply for {}", msg.sender_id);
            return DispatchOutcome::NoReply;
        };

        if let Err(e) = self
            .audit
            .append(LogRecord::replied(&msg.sender_id, &reply))
            .await
        {
            log::error!("dispatch: audit log append (outbound) failed: {}", e);
        }

        let delivered = match transport.send_message(&msg.sender_id, &reply).await {
            Ok(()) => true,
            Err(e) => {
                log::warn!("dispatch: reply to {} via {} failed: {}", msg.sender_id, transport.id(), e);
                false
            }
        };
        DispatchOutcome::Replied {
            text: reply,
            delivered,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::{TransportError, TransportEvent};
    use crate::responder::ResponderFailure;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::{mpsc, Mutex};
    use tokio::task::JoinHandle;

    struct StubResponder {
        result: GatewayResult,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Responder for StubResponder {
        async fn invoke(&self, _req: &GatewayRequest, _timeout: Option<Duration>) -> GatewayResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.result.clone()
        }
    }

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<(String, String)>>,
        fail: bool,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        fn id(&self) -> &str {
            "recording"
        }

        fn start(self: Arc<Self>, _events: mpsc::Sender<TransportEvent>) -> JoinHandle<()> {
            tokio::spawn(async {})
        }

        fn stop(&self) {}

        async fn send_message(&self, recipient_id: &str, text: &str) -> Result<(), TransportError> {
            if self.fail {
                return Err(TransportError::Api("rejected".to_string()));
            }
            self.sent
                .lock()
                .await
                .push((recipient_id.to_string(), text.to_string()));
            Ok(())
        }
    }

    fn temp_audit() -> Arc<AuditLog> {
        let dir = std::env::temp_dir().join(format!("wabridge-dispatch-{}", uuid::Uuid::new_v4()));
        Arc::new(AuditLog::new(dir.join("message_logs.json")))
    }

    fn dispatcher(result: GatewayResult) -> (Dispatcher, Arc<StubResponder>) {
        let responder = Arc::new(StubResponder {
            result,
            calls: AtomicUsize::new(0),
        });
        let d = Dispatcher::new(
            temp_audit(),
            responder.clone(),
            FallbackReplies::default(),
            Some(Duration::from_secs(5)),
        );
        (d, responder)
    }

    #[test]
    fn filter_predicate() {
        let mut m = InboundMessage::direct("628123", "halo");
        assert_eq!(ignore_reason(&m), None);
        m.is_self_origin = true;
        assert_eq!(ignore_reason(&m), Some(IgnoreReason::SelfOrigin));
        m.origin = OriginKind::Group;
        assert_eq!(ignore_reason(&m), Some(IgnoreReason::Group));
        m.is_self_origin = false;
        m.origin = OriginKind::BroadcastStatus;
        assert_eq!(ignore_reason(&m), Some(IgnoreReason::BroadcastStatus));
    }

    #[tokio::test]
    async fn filtered_messages_leave_no_trace() {
        let (d, responder) = dispatcher(GatewayResult::Reply("Hai".to_string()));
        let transport = RecordingTransport::default();
        let mut group = InboundMessage::direct("1203@g.us", "halo");
        group.origin = OriginKind::Group;
        let mut own = InboundMessage::direct("628123", "halo");
        own.is_self_origin = true;
        for m in [group, own] {
            assert!(matches!(
                d.handle(m, &transport).await,
                DispatchOutcome::FilteredOut(_)
            ));
        }
        assert_eq!(responder.calls.load(Ordering::SeqCst), 0);
        assert!(transport.sent.lock().await.is_empty());
        assert!(d.audit().read_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reply_is_logged_then_sent() {
        let (d, _) = dispatcher(GatewayResult::Reply("Hai! Ada yang bisa dibantu?".to_string()));
        let transport = RecordingTransport::default();
        let outcome = d
            .handle(InboundMessage::direct("628123", "halo"), &transport)
            .await;
        assert_eq!(
            outcome,
            DispatchOutcome::Replied {
                text: "Hai! Ada yang bisa dibantu?".to_string(),
                delivered: true
            }
        );
        let records = d.audit().read_all().await.unwrap();
        assert_eq!(records.len(), 2);
        assert!(matches!(&records[0], LogRecord::Received { from, message, .. } if from == "628123" && message == "halo"));
        assert!(matches!(&records[1], LogRecord::Replied { to, response, .. } if to == "628123" && response == "Hai! Ada yang bisa dibantu?"));
    }

    #[tokio::test]
    async fn empty_reply_sends_nothing() {
        let (d, _) = dispatcher(GatewayResult::Reply(String::new()));
        let transport = RecordingTransport::default();
        let outcome = d
            .handle(InboundMessage::direct("628123", "ok"), &transport)
            .await;
        assert_eq!(outcome, DispatchOutcome::NoReply);
        assert!(transport.sent.lock().await.is_empty());
        assert_eq!(d.audit().read_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failure_sends_fallback_not_diagnostic() {
        let (d, _) = dispatcher(GatewayResult::Failure(ResponderFailure::Exit {
            code: Some(1),
            stderr: "Traceback: KeyError".to_string(),
        }));
        let transport = RecordingTransport::default();
        d.handle(InboundMessage::direct("628123", "halo"), &transport)
            .await;
        let sent = transport.sent.lock().await;
        assert_eq!(
            sent.as_slice(),
            &[(
                "628123".to_string(),
                "Maaf, terjadi kesalahan sistem. Silakan coba lagi.".to_string()
            )]
        );
    }

    #[tokio::test]
    async fn send_failure_is_reported_not_fatal() {
        let (d, _) = dispatcher(GatewayResult::Reply("Hai".to_string()));
        let transport = RecordingTransport {
            fail: true,
            ..Default::default()
        };
        let outcome = d
            .handle(InboundMessage::direct("628123", "halo"), &transport)
            .await;
        assert_eq!(
            outcome,
            DispatchOutcome::Replied {
                text: "Hai".to_string(),
                delivered: false
            }
        );
        assert_eq!(d.audit().read_all().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn audit_failure_still_replies() {
        let dir = std::env::temp_dir().join(format!("wabridge-dispatch-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let blocker = dir.join("not-a-dir");
        std::fs::write(&blocker, "x").unwrap();
        let d = Dispatcher::new(
            Arc::new(AuditLog::new(blocker.join("message_logs.json"))),
            Arc::new(StubResponder {
                result: GatewayResult::Reply("Hai".to_string()),
                calls: AtomicUsize::new(0),
            }),
            FallbackReplies::default(),
            None,
        );
        let transport = RecordingTransport::default();
        let outcome = d
            .handle(InboundMessage::direct("628123", "halo"), &transport)
            .await;
        assert!(matches!(outcome, DispatchOutcome::Replied { delivered: true, .. }));
        assert_eq!(transport.sent.lock().await.len(), 1);
    }
}
