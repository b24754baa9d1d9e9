//! MQTT session management atop a network link
//!
//! [`BrokerSession`] owns the [`SessionState`] and the subscription registry.
//! It never retries on its own: failures are surfaced through [`BrokerSession::open`]
//! so the supervisor can apply its backoff policy before the next handshake.
//!
//! The protocol client sits behind [`MqttTransport`], whose methods must all
//! return without waiting on the network. [`RumqttTransport`] is the production
//! implementation.

pub mod rumqtt;
pub mod subscriptions;

use crate::config::ConnectionConfig;
use crate::link::LinkState;
use crate::observability::metrics::metrics;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub use rumqtt::RumqttTransport;
pub use subscriptions::{topic_matches, Handler, SubscriptionRegistry};

/// Upper bound on transport events handled per poll so one cycle stays short
const MAX_EVENTS_PER_POLL: usize = 64;

/// Protocol-layer failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("Network link is down")]
    LinkDown,
    #[error("Broker rejected credentials")]
    AuthRejected,
    #[error("MQTT handshake timed out")]
    HandshakeTimeout,
    #[error("Session is not connected")]
    NotConnected,
    #[error("Broker closed the session")]
    BrokerDisconnected,
    #[error("No traffic from broker within keepalive window")]
    KeepaliveExpired,
    #[error("Subscription failed: {0}")]
    SubscribeFailed(String),
    #[error("Publish failed: {0}")]
    PublishFailed(String),
    #[error("Invalid topic filter: {0}")]
    InvalidTopicFilter(String),
    #[error("Transport error: {0}")]
    Transport(String),
}

/// MQTT delivery guarantee
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum QoS {
    AtMostOnce,
    AtLeastOnce,
}

impl TryFrom<u8> for QoS {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            other => Err(format!("unsupported QoS level {other}, expected 0 or 1")),
        }
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
        }
    }
}

/// Session health as last observed
#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Failed(SessionError),
}

impl SessionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, SessionState::Connected)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Disconnected => write!(f, "disconnected"),
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Connected => write!(f, "connected"),
            SessionState::Failed(reason) => write!(f, "failed ({reason})"),
        }
    }
}

/// Why the broker refused a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefusalReason {
    BadCredentials,
    NotAuthorized,
    Other(String),
}

/// Message delivered on a subscribed topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

/// Events a transport reports back to the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// ConnAck accepted
    Connected,
    Refused(RefusalReason),
    Message(IncomingMessage),
    SubscribeRejected(String),
    /// Broker acknowledged a QoS 1 publish
    PubAck,
    /// Any other inbound packet (PingResp, SubAck)
    Activity,
    /// Broker sent DISCONNECT
    Disconnected,
    Error(String),
}

/// Non-blocking MQTT client seam
pub trait MqttTransport {
    /// Begin a new connection and handshake, dropping any previous one
    fn start(&mut self, config: &ConnectionConfig) -> Result<(), SessionError>;

    /// Next pending event, if any
    fn poll_event(&mut self) -> Option<TransportEvent>;

    fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), SessionError>;

    fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<(), SessionError>;

    /// Send DISCONNECT if possible and release the connection
    fn disconnect(&mut self);
}

/// Progress of a resumable [`BrokerSession::open`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenStatus {
    /// Handshake sent, awaiting ConnAck
    InProgress,
    /// ConnAck received and all subscriptions re-applied
    Established,
}

/// MQTT session state machine over an [`MqttTransport`]
pub struct BrokerSession<T: MqttTransport> {
    transport: T,
    config: Arc<ConnectionConfig>,
    state: SessionState,
    subscriptions: SubscriptionRegistry,
    handshake_deadline: Option<Instant>,
    last_inbound: Option<Instant>,
    failure_unreported: bool,
    /// Bumped on every handshake so callers can tell connections apart
    epoch: u64,
    acknowledged: usize,
}

impl<T: MqttTransport> BrokerSession<T> {
    pub fn new(transport: T, config: Arc<ConnectionConfig>) -> Self {
        Self {
            transport,
            config,
            state: SessionState::Disconnected,
            subscriptions: SubscriptionRegistry::new(),
            handshake_deadline: None,
            last_inbound: None,
            failure_unreported: false,
            epoch: 0,
            acknowledged: 0,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn subscriptions(&self) -> &SubscriptionRegistry {
        &self.subscriptions
    }

    /// Identifies the connection started by the latest handshake
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// PubAcks received on the current connection since the last call
    ///
    /// MQTT 3.1.1 brokers acknowledge QoS 1 publishes in the order they were
    /// received, so each count releases the oldest unacknowledged publish.
    pub fn take_acknowledged(&mut self) -> usize {
        std::mem::take(&mut self.acknowledged)
    }

    /// Register a handler for a topic filter
    ///
    /// The filter is subscribed on every successful handshake. If the session
    /// is already connected it is subscribed immediately as well, and the
    /// handler is only registered once the transport accepted the request.
    pub fn subscribe(
        &mut self,
        filter: &str,
        qos: QoS,
        handler: Handler,
    ) -> Result<(), SessionError> {
        subscriptions::validate_filter(filter)?;
        if self.state.is_connected() {
            self.transport.subscribe(filter, qos)?;
        }
        self.subscriptions.register(filter, qos, handler)
    }

    /// Open or continue opening the session
    ///
    /// Requires a connected link. The first call starts the handshake; later
    /// calls drive it to completion. A failure detected by [`poll`](Self::poll)
    /// is returned by the next `open` instead of starting a new handshake, so
    /// the caller sees every failure exactly once and can back off first.
    pub fn open(&mut self, link: &LinkState, now: Instant) -> Result<OpenStatus, SessionError> {
        if !link.is_connected() {
            self.invalidate("link down");
            return Err(SessionError::LinkDown);
        }

        match &self.state {
            SessionState::Connected => return Ok(OpenStatus::Established),
            SessionState::Connecting => {}
            SessionState::Failed(reason) if self.failure_unreported => {
                self.failure_unreported = false;
                return Err(reason.clone());
            }
            SessionState::Disconnected | SessionState::Failed(_) => self.begin_handshake(now)?,
        }

        self.drain_events(now);
        self.check_timers(now);

        match &self.state {
            SessionState::Connected => Ok(OpenStatus::Established),
            SessionState::Connecting => Ok(OpenStatus::InProgress),
            SessionState::Failed(reason) => {
                self.failure_unreported = false;
                Err(reason.clone())
            }
            SessionState::Disconnected => Err(SessionError::NotConnected),
        }
    }

    fn begin_handshake(&mut self, now: Instant) -> Result<(), SessionError> {
        let _span = crate::session_span!(client_id = %self.config.client_id).entered();
        info!(
            broker = %self.config.broker_address,
            port = self.config.broker_port,
            client_id = %self.config.client_id,
            "Opening MQTT session"
        );
        metrics().session_open_attempted();
        self.last_inbound = None;
        self.epoch = self.epoch.wrapping_add(1);
        self.acknowledged = 0;

        if let Err(e) = self.transport.start(&self.config) {
            self.fail(e.clone());
            self.failure_unreported = false;
            return Err(e);
        }

        self.state = SessionState::Connecting;
        self.handshake_deadline = Some(now + self.config.handshake_timeout);
        Ok(())
    }

    /// Service the session without blocking
    ///
    /// Cascades link loss into `Disconnected`, drains transport events,
    /// dispatches incoming messages to handlers, and enforces the handshake
    /// deadline and keepalive window.
    pub fn poll(&mut self, link: &LinkState, now: Instant) -> SessionState {
        if !link.is_connected() {
            self.invalidate("link down");
            return self.state.clone();
        }

        self.drain_events(now);
        self.check_timers(now);
        self.state.clone()
    }

    /// Publish on the current session; never waits for a reconnect
    pub fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<(), SessionError> {
        if !self.state.is_connected() {
            return Err(SessionError::NotConnected);
        }

        match self.transport.publish(topic, payload, qos, retain) {
            Ok(()) => {
                debug!(topic, bytes = payload.len(), "Published message");
                Ok(())
            }
            Err(e) => {
                metrics().publish_failed();
                warn!(topic, error = %e, "Publish failed");
                Err(e)
            }
        }
    }

    /// Graceful disconnect
    pub fn close(&mut self) {
        if matches!(
            self.state,
            SessionState::Connected | SessionState::Connecting
        ) {
            self.transport.disconnect();
            metrics().set_session_up(false);
            info!("MQTT session closed");
        }
        self.state = SessionState::Disconnected;
        self.handshake_deadline = None;
        self.failure_unreported = false;
    }

    fn invalidate(&mut self, reason: &str) {
        match self.state {
            SessionState::Disconnected => return,
            SessionState::Connected => {
                warn!(reason, "MQTT session invalidated");
                metrics().session_dropped();
            }
            _ => debug!(reason, state = %self.state, "Resetting MQTT session"),
        }
        self.transport.disconnect();
        self.state = SessionState::Disconnected;
        self.handshake_deadline = None;
        self.failure_unreported = false;
    }

    fn fail(&mut self, reason: SessionError) {
        if self.state.is_connected() {
            metrics().session_dropped();
        }
        error!(error = %reason, "MQTT session failed");
        metrics().session_failed();
        self.state = SessionState::Failed(reason);
        self.handshake_deadline = None;
        self.failure_unreported = true;
    }

    fn drain_events(&mut self, now: Instant) {
        for _ in 0..MAX_EVENTS_PER_POLL {
            let Some(event) = self.transport.poll_event() else {
                break;
            };
            self.handle_event(event, now);
        }
    }

    fn handle_event(&mut self, event: TransportEvent, now: Instant) {
        let live = matches!(
            self.state,
            SessionState::Connected | SessionState::Connecting
        );

        match event {
            TransportEvent::Connected => {
                if !matches!(self.state, SessionState::Connecting) {
                    debug!(state = %self.state, "Ignoring stale ConnAck");
                    return;
                }
                self.last_inbound = Some(now);
                self.on_connack();
            }
            TransportEvent::Refused(reason) if live => {
                let error = match reason {
                    RefusalReason::BadCredentials | RefusalReason::NotAuthorized => {
                        SessionError::AuthRejected
                    }
                    RefusalReason::Other(code) => {
                        SessionError::Transport(format!("connection refused: {code}"))
                    }
                };
                self.transport.disconnect();
                self.fail(error);
            }
            TransportEvent::Message(message) => {
                self.last_inbound = Some(now);
                if !self.state.is_connected() {
                    debug!(topic = %message.topic, "Dropping message received outside a session");
                    return;
                }
                metrics().message_received();
                let matched = self
                    .subscriptions
                    .dispatch(&message.topic, &message.payload);
                if matched == 0 {
                    debug!(topic = %message.topic, "No handler for incoming message");
                }
            }
            TransportEvent::SubscribeRejected(detail) if live => {
                self.transport.disconnect();
                self.fail(SessionError::SubscribeFailed(detail));
            }
            TransportEvent::PubAck => {
                self.last_inbound = Some(now);
                if self.state.is_connected() {
                    self.acknowledged += 1;
                } else {
                    debug!(state = %self.state, "Ignoring PubAck outside a session");
                }
            }
            TransportEvent::Activity => {
                self.last_inbound = Some(now);
            }
            TransportEvent::Disconnected if live => {
                self.transport.disconnect();
                self.fail(SessionError::BrokerDisconnected);
            }
            TransportEvent::Error(detail) if live => {
                self.transport.disconnect();
                self.fail(SessionError::Transport(detail));
            }
            other => debug!(event = ?other, state = %self.state, "Ignoring transport event"),
        }
    }

    fn on_connack(&mut self) {
        for (filter, qos) in self.subscriptions.filters() {
            if let Err(e) = self.transport.subscribe(&filter, qos) {
                self.transport.disconnect();
                self.fail(SessionError::SubscribeFailed(format!("{filter}: {e}")));
                return;
            }
            debug!(filter = %filter, "Subscribed");
        }

        info!(
            subscriptions = self.subscriptions.len(),
            "MQTT session established"
        );
        self.state = SessionState::Connected;
        self.handshake_deadline = None;
        metrics().session_established();
    }

    fn check_timers(&mut self, now: Instant) {
        match self.state {
            SessionState::Connecting => {
                if self.handshake_deadline.is_some_and(|deadline| now >= deadline) {
                    self.transport.disconnect();
                    self.fail(SessionError::HandshakeTimeout);
                }
            }
            SessionState::Connected => {
                let window = keepalive_window(self.config.keep_alive);
                let silent = self
                    .last_inbound
                    .is_some_and(|last| now.saturating_duration_since(last) > window);
                if silent {
                    self.transport.disconnect();
                    self.fail(SessionError::KeepaliveExpired);
                }
            }
            _ => {}
        }
    }
}

/// Broker silence tolerated before the session is declared dead
pub fn keepalive_window(keep_alive: Duration) -> Duration {
    keep_alive + keep_alive / 2
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoopConfig;
    use crate::link::LinkError;
    use crate::testing::mocks::MockTransport;
    use std::sync::Mutex;

    fn session() -> (BrokerSession<MockTransport>, crate::testing::mocks::MockBrokerHandle) {
        let transport = MockTransport::new();
        let handle = transport.handle();
        let config = Arc::new(CoopConfig::test_config().connection_config().unwrap());
        (BrokerSession::new(transport, config), handle)
    }

    #[test]
    fn test_qos_conversions() {
        assert_eq!(QoS::try_from(0u8), Ok(QoS::AtMostOnce));
        assert_eq!(QoS::try_from(1u8), Ok(QoS::AtLeastOnce));
        assert!(QoS::try_from(2u8).is_err());
        assert_eq!(u8::from(QoS::AtLeastOnce), 1);
    }

    #[test]
    fn test_open_requires_link() {
        let (mut session, handle) = session();
        let result = session.open(&LinkState::Disconnected, Instant::now());
        assert_eq!(result, Err(SessionError::LinkDown));
        assert_eq!(handle.start_calls(), 0);
    }

    #[test]
    fn test_open_completes_after_connack() {
        let (mut session, handle) = session();
        handle.set_auto_accept(false);
        let now = Instant::now();

        assert_eq!(
            session.open(&LinkState::Connected, now),
            Ok(OpenStatus::InProgress)
        );
        assert_eq!(session.state(), &SessionState::Connecting);

        handle.accept_connection();
        assert_eq!(
            session.open(&LinkState::Connected, now),
            Ok(OpenStatus::Established)
        );
        assert_eq!(handle.start_calls(), 1);
    }

    #[test]
    fn test_subscriptions_reapplied_on_every_handshake() {
        let (mut session, handle) = session();
        session
            .subscribe("coop/cmd/#", QoS::AtLeastOnce, Box::new(|_, _| {}))
            .unwrap();
        let now = Instant::now();

        session.open(&LinkState::Connected, now).unwrap();
        assert!(session.state().is_connected());

        handle.drop_connection();
        session.poll(&LinkState::Connected, now);
        assert_eq!(
            session.open(&LinkState::Connected, now),
            Err(SessionError::BrokerDisconnected)
        );
        session.open(&LinkState::Connected, now).unwrap();

        assert_eq!(
            handle.subscribe_calls(),
            vec![
                ("coop/cmd/#".to_string(), QoS::AtLeastOnce),
                ("coop/cmd/#".to_string(), QoS::AtLeastOnce)
            ]
        );
    }

    #[test]
    fn test_auth_rejected() {
        let (mut session, handle) = session();
        handle.set_refuse_auth(true);

        let result = session.open(&LinkState::Connected, Instant::now());
        assert_eq!(result, Err(SessionError::AuthRejected));
        assert_eq!(
            session.state(),
            &SessionState::Failed(SessionError::AuthRejected)
        );
    }

    #[test]
    fn test_handshake_timeout() {
        let (mut session, handle) = session();
        handle.set_auto_accept(false);
        let start = Instant::now();

        assert_eq!(
            session.open(&LinkState::Connected, start),
            Ok(OpenStatus::InProgress)
        );
        let late = start + Duration::from_secs(11);
        assert_eq!(
            session.open(&LinkState::Connected, late),
            Err(SessionError::HandshakeTimeout)
        );
        assert!(handle.disconnect_calls() >= 1);
    }

    #[test]
    fn test_publish_requires_connected_session() {
        let (mut session, handle) = session();
        let result = session.publish("coop/t", b"1", QoS::AtMostOnce, false);
        assert_eq!(result, Err(SessionError::NotConnected));
        assert!(handle.published().is_empty());
    }

    #[test]
    fn test_link_drop_cascades_to_disconnected() {
        let (mut session, handle) = session();
        let now = Instant::now();
        session.open(&LinkState::Connected, now).unwrap();

        let state = session.poll(&LinkState::Failed(LinkError::NoCarrier), now);
        assert_eq!(state, SessionState::Disconnected);
        assert!(handle.disconnect_calls() >= 1);
        assert_eq!(
            session.publish("coop/t", b"1", QoS::AtMostOnce, false),
            Err(SessionError::NotConnected)
        );
    }

    #[test]
    fn test_incoming_message_dispatch() {
        let (mut session, handle) = session();
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        session
            .subscribe(
                "coop/+/cmd",
                QoS::AtMostOnce,
                Box::new(move |topic, payload| {
                    sink.lock()
                        .unwrap()
                        .push((topic.to_string(), payload.to_vec()));
                }),
            )
            .unwrap();
        let now = Instant::now();
        session.open(&LinkState::Connected, now).unwrap();

        handle.push_message("coop/door/cmd", b"close");
        handle.push_message("coop/door/status", b"ignored");
        session.poll(&LinkState::Connected, now);

        assert_eq!(
            *received.lock().unwrap(),
            vec![("coop/door/cmd".to_string(), b"close".to_vec())]
        );
    }

    #[test]
    fn test_keepalive_expiry() {
        let (mut session, handle) = session();
        let start = Instant::now();
        session.open(&LinkState::Connected, start).unwrap();

        // 15s keepalive tolerates 22.5s of silence
        let state = session.poll(&LinkState::Connected, start + Duration::from_secs(20));
        assert_eq!(state, SessionState::Connected);

        handle.push_activity();
        let refreshed = start + Duration::from_secs(20);
        session.poll(&LinkState::Connected, refreshed);
        let state = session.poll(&LinkState::Connected, refreshed + Duration::from_secs(23));
        assert_eq!(state, SessionState::Failed(SessionError::KeepaliveExpired));
    }

    #[test]
    fn test_transport_start_failure_is_reported_once() {
        let (mut session, handle) = session();
        let refused = SessionError::Transport("connection refused".to_string());
        handle.set_start_error(Some(refused.clone()));
        let now = Instant::now();

        assert_eq!(
            session.open(&LinkState::Connected, now),
            Err(refused.clone())
        );
        assert_eq!(session.state(), &SessionState::Failed(refused));

        handle.set_start_error(None);
        assert_eq!(
            session.open(&LinkState::Connected, now),
            Ok(OpenStatus::Established)
        );
        assert_eq!(handle.start_calls(), 2);
    }

    #[test]
    fn test_subscribe_failure_during_connack_fails_session() {
        let (mut session, handle) = session();
        session
            .subscribe("coop/cmd/#", QoS::AtLeastOnce, Box::new(|_, _| {}))
            .unwrap();
        handle.set_fail_subscribe(true);

        let result = session.open(&LinkState::Connected, Instant::now());
        assert!(matches!(result, Err(SessionError::SubscribeFailed(_))));
        assert!(!session.state().is_connected());
        assert!(handle.disconnect_calls() >= 1);
    }

    #[test]
    fn test_suback_rejection_fails_session() {
        let (mut session, handle) = session();
        let now = Instant::now();
        session.open(&LinkState::Connected, now).unwrap();

        handle.push_event(TransportEvent::SubscribeRejected(
            "broker refused subscription 1".to_string(),
        ));
        let state = session.poll(&LinkState::Connected, now);
        assert_eq!(
            state,
            SessionState::Failed(SessionError::SubscribeFailed(
                "broker refused subscription 1".to_string()
            ))
        );
        assert!(matches!(
            session.open(&LinkState::Connected, now),
            Err(SessionError::SubscribeFailed(_))
        ));
    }

    #[test]
    fn test_failed_live_subscribe_registers_no_handler() {
        let (mut session, handle) = session();
        session.open(&LinkState::Connected, Instant::now()).unwrap();
        handle.set_fail_subscribe(true);

        let result = session.subscribe("coop/cmd/#", QoS::AtLeastOnce, Box::new(|_, _| {}));
        assert!(matches!(result, Err(SessionError::SubscribeFailed(_))));
        assert!(session.subscriptions().is_empty());

        handle.set_fail_subscribe(false);
        session
            .subscribe("coop/cmd/#", QoS::AtLeastOnce, Box::new(|_, _| {}))
            .unwrap();
        assert_eq!(session.subscriptions().len(), 1);
    }

    #[test]
    fn test_invalid_filter_rejected_before_transport() {
        let (mut session, handle) = session();
        session.open(&LinkState::Connected, Instant::now()).unwrap();

        let result = session.subscribe("coop/#/cmd", QoS::AtMostOnce, Box::new(|_, _| {}));
        assert!(matches!(result, Err(SessionError::InvalidTopicFilter(_))));
        assert!(handle.subscribe_calls().is_empty());
    }

    #[test]
    fn test_pubacks_counted_per_connection() {
        let (mut session, handle) = session();
        let now = Instant::now();
        session.open(&LinkState::Connected, now).unwrap();
        let first_epoch = session.epoch();

        session
            .publish("coop/t", b"1", QoS::AtLeastOnce, false)
            .unwrap();
        session
            .publish("coop/t", b"2", QoS::AtMostOnce, false)
            .unwrap();
        session.poll(&LinkState::Connected, now);
        assert_eq!(session.take_acknowledged(), 1);
        assert_eq!(session.take_acknowledged(), 0);

        handle.drop_connection();
        session.poll(&LinkState::Connected, now);
        assert!(session.open(&LinkState::Connected, now).is_err());
        session.open(&LinkState::Connected, now).unwrap();
        assert_ne!(session.epoch(), first_epoch);
    }

    #[test]
    fn test_close_resets_state() {
        let (mut session, handle) = session();
        session
            .open(&LinkState::Connected, Instant::now())
            .unwrap();
        session.close();
        assert_eq!(session.state(), &SessionState::Disconnected);
        assert_eq!(handle.disconnect_calls(), 1);
    }

    #[test]
    fn test_keepalive_window() {
        assert_eq!(
            keepalive_window(Duration::from_secs(10)),
            Duration::from_secs(15)
        );
    }
}
