//! MQTT 3.1.1 transport backed by rumqttc
//!
//! rumqttc is async, so each connection gets a driver task on the current
//! tokio runtime that polls the event loop and forwards routed events over a
//! channel. The session drains that channel with `try_recv`, and every client
//! call uses the `try_*` variants, so nothing here waits on the network.
//!
//! The driver stops on the first connection error instead of letting rumqttc
//! reconnect by itself. Retry timing belongs to the supervisor.

use super::{IncomingMessage, MqttTransport, QoS, RefusalReason, SessionError, TransportEvent};
use crate::config::ConnectionConfig;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet, SubscribeReasonCode, Transport,
};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Requests rumqttc may queue before `try_*` calls start failing
const REQUEST_CAPACITY: usize = 32;
const EVENT_CAPACITY: usize = 256;

impl From<QoS> for rumqttc::QoS {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
            QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        }
    }
}

/// Production [`MqttTransport`]
#[derive(Default)]
pub struct RumqttTransport {
    client: Option<AsyncClient>,
    events: Option<mpsc::Receiver<TransportEvent>>,
    driver: Option<JoinHandle<()>>,
}

impl RumqttTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the driver task to flush DISCONNECT and exit, aborting it after `grace`
    pub async fn wait_closed(&mut self, grace: Duration) {
        let Some(handle) = self.driver.take() else {
            return;
        };

        let abort = handle.abort_handle();
        match tokio::time::timeout(grace, handle).await {
            Ok(Ok(())) => info!("MQTT driver shut down gracefully"),
            Ok(Err(e)) if !e.is_cancelled() => warn!("MQTT driver ended with error: {}", e),
            Err(_) => {
                warn!("MQTT driver didn't shut down gracefully, forcing abort");
                abort.abort();
            }
            _ => {}
        }
    }

    fn stop_driver(&mut self) {
        if let Some(handle) = self.driver.take() {
            if !handle.is_finished() {
                debug!("Aborting previous MQTT driver");
                handle.abort();
            }
        }
    }
}

/// Build rumqttc options from the connection record
pub fn configure_mqtt_options(config: &ConnectionConfig) -> MqttOptions {
    let mut options = MqttOptions::new(
        config.client_id.clone(),
        config.broker_address.clone(),
        config.broker_port,
    );
    options.set_keep_alive(config.keep_alive);
    options.set_clean_session(true);

    if let Some(username) = &config.username {
        options.set_credentials(username.clone(), config.auth_token.clone().unwrap_or_default());
    }

    if config.tls {
        options.set_transport(Transport::tls_with_default_config());
    }

    options
}

/// Map a rumqttc event to a session event; outgoing traffic is not reported
pub fn route_event(event: &Event) -> Option<TransportEvent> {
    let Event::Incoming(packet) = event else {
        return None;
    };

    let routed = match packet {
        Packet::ConnAck(ack) => match ack.code {
            ConnectReturnCode::Success => TransportEvent::Connected,
            code => TransportEvent::Refused(refusal_reason(code)),
        },
        Packet::Publish(publish) => TransportEvent::Message(IncomingMessage {
            topic: publish.topic.clone(),
            payload: publish.payload.to_vec(),
            retain: publish.retain,
        }),
        Packet::SubAck(ack)
            if ack
                .return_codes
                .iter()
                .any(|code| matches!(code, SubscribeReasonCode::Failure)) =>
        {
            TransportEvent::SubscribeRejected(format!("broker refused subscription {}", ack.pkid))
        }
        Packet::PubAck(_) => TransportEvent::PubAck,
        Packet::Disconnect => TransportEvent::Disconnected,
        _ => TransportEvent::Activity,
    };
    Some(routed)
}

/// Map an event loop error to a session event
pub fn route_error(error: &ConnectionError) -> TransportEvent {
    match error {
        ConnectionError::ConnectionRefused(code) => TransportEvent::Refused(refusal_reason(*code)),
        other => TransportEvent::Error(other.to_string()),
    }
}

fn refusal_reason(code: ConnectReturnCode) -> RefusalReason {
    match code {
        ConnectReturnCode::BadUserNamePassword => RefusalReason::BadCredentials,
        ConnectReturnCode::NotAuthorized => RefusalReason::NotAuthorized,
        other => RefusalReason::Other(format!("{other:?}")),
    }
}

async fn drive(mut event_loop: EventLoop, events: mpsc::Sender<TransportEvent>) {
    loop {
        match event_loop.poll().await {
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("DISCONNECT sent, stopping MQTT driver");
                break;
            }
            Ok(event) => {
                let Some(routed) = route_event(&event) else {
                    continue;
                };
                let last = routed == TransportEvent::Disconnected;
                if events.send(routed).await.is_err() || last {
                    break;
                }
            }
            Err(e) => {
                debug!(error = %e, "MQTT event loop stopped");
                let _ = events.send(route_error(&e)).await;
                break;
            }
        }
    }
}

impl MqttTransport for RumqttTransport {
    fn start(&mut self, config: &ConnectionConfig) -> Result<(), SessionError> {
        self.disconnect();
        self.stop_driver();

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| SessionError::Transport(format!("no async runtime: {e}")))?;

        let options = configure_mqtt_options(config);
        let (client, event_loop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let (tx, rx) = mpsc::channel(EVENT_CAPACITY);
        self.driver = Some(runtime.spawn(drive(event_loop, tx)));
        self.client = Some(client);
        self.events = Some(rx);
        Ok(())
    }

    fn poll_event(&mut self) -> Option<TransportEvent> {
        self.events.as_mut()?.try_recv().ok()
    }

    fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), SessionError> {
        let client = self.client.as_ref().ok_or(SessionError::NotConnected)?;
        client
            .try_subscribe(topic, qos.into())
            .map_err(|e| SessionError::SubscribeFailed(format!("{topic}: {e}")))
    }

    fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<(), SessionError> {
        let client = self.client.as_ref().ok_or(SessionError::NotConnected)?;
        client
            .try_publish(topic, qos.into(), retain, payload.to_vec())
            .map_err(|e| SessionError::PublishFailed(e.to_string()))
    }

    fn disconnect(&mut self) {
        if let Some(client) = self.client.take() {
            if let Err(e) = client.try_disconnect() {
                debug!(error = %e, "DISCONNECT could not be queued");
            }
        }
        self.events = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LinkCredentials, LinkType, MacAddress};
    use rumqttc::{ConnAck, PubAck, Publish, SubAck};

    fn connection(port: u16) -> ConnectionConfig {
        ConnectionConfig {
            link_type: LinkType::Wired,
            credentials: LinkCredentials::Wired {
                mac: MacAddress([0x90, 0xA2, 0xDA, 0x0D, 0x51, 0xC8]),
            },
            dhcp_attempts: 3,
            fallback_static_address: None,
            broker_address: "127.0.0.1".to_string(),
            broker_port: port,
            tls: false,
            client_id: "coop-test".to_string(),
            username: Some("farmer".to_string()),
            auth_token: Some("aio_key".to_string()),
            keep_alive: Duration::from_secs(15),
            handshake_timeout: Duration::from_secs(10),
        }
    }

    #[test]
    fn test_configure_mqtt_options() {
        let options = configure_mqtt_options(&connection(1883));
        assert_eq!(options.client_id(), "coop-test");
        assert_eq!(options.broker_address(), ("127.0.0.1".to_string(), 1883));
        assert_eq!(options.keep_alive(), Duration::from_secs(15));
        assert_eq!(
            options.credentials(),
            Some(("farmer".to_string(), "aio_key".to_string()))
        );
    }

    #[test]
    fn test_route_connack() {
        let accepted = Event::Incoming(Packet::ConnAck(ConnAck::new(
            ConnectReturnCode::Success,
            false,
        )));
        assert_eq!(route_event(&accepted), Some(TransportEvent::Connected));

        let refused = Event::Incoming(Packet::ConnAck(ConnAck::new(
            ConnectReturnCode::NotAuthorized,
            false,
        )));
        assert_eq!(
            route_event(&refused),
            Some(TransportEvent::Refused(RefusalReason::NotAuthorized))
        );
    }

    #[test]
    fn test_route_publish_and_suback() {
        let publish = Event::Incoming(Packet::Publish(Publish::new(
            "coop/cmd/door",
            rumqttc::QoS::AtMostOnce,
            "open",
        )));
        assert_eq!(
            route_event(&publish),
            Some(TransportEvent::Message(IncomingMessage {
                topic: "coop/cmd/door".to_string(),
                payload: b"open".to_vec(),
                retain: false,
            }))
        );

        let rejected = Event::Incoming(Packet::SubAck(SubAck::new(
            7,
            vec![SubscribeReasonCode::Failure],
        )));
        assert!(matches!(
            route_event(&rejected),
            Some(TransportEvent::SubscribeRejected(_))
        ));

        assert_eq!(
            route_event(&Event::Incoming(Packet::PubAck(PubAck::new(3)))),
            Some(TransportEvent::PubAck)
        );
        assert_eq!(
            route_event(&Event::Incoming(Packet::PingResp)),
            Some(TransportEvent::Activity)
        );
        assert_eq!(route_event(&Event::Outgoing(Outgoing::PingReq)), None);
    }

    #[test]
    fn test_route_refused_connection_error() {
        let error = ConnectionError::ConnectionRefused(ConnectReturnCode::BadUserNamePassword);
        assert_eq!(
            route_error(&error),
            TransportEvent::Refused(RefusalReason::BadCredentials)
        );
    }

    #[test]
    fn test_start_requires_runtime() {
        let mut transport = RumqttTransport::new();
        assert!(matches!(
            transport.start(&connection(1883)),
            Err(SessionError::Transport(_))
        ));
    }

    #[test]
    fn test_publish_before_start_fails() {
        let mut transport = RumqttTransport::new();
        assert_eq!(
            transport.publish("coop/t", b"1", QoS::AtMostOnce, false),
            Err(SessionError::NotConnected)
        );
    }

    #[tokio::test]
    async fn test_unreachable_broker_reports_error() {
        // Nothing listens on port 1
        let mut transport = RumqttTransport::new();
        transport.start(&connection(1)).unwrap();

        let mut event = None;
        for _ in 0..100 {
            event = transport.poll_event();
            if event.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(matches!(event, Some(TransportEvent::Error(_))));
    }
}
