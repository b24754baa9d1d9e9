//! Mock implementations for testing
//!
//! Provides a scriptable link driver, MQTT transport, and sensor so the
//! supervisor can be exercised without hardware or a broker. Each mock hands
//! out a cloneable handle that shares its state, so tests can keep steering a
//! mock after moving it into the component under test.

use crate::config::{ConnectionConfig, LinkCredentials, StaticAddress};
use crate::link::{LinkDriver, LinkError};
use crate::session::{
    IncomingMessage, MqttTransport, QoS, RefusalReason, SessionError, TransportEvent,
};
use crate::telemetry::{SensorSource, TelemetrySample};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
struct LinkControl {
    carrier: bool,
    dhcp_available: bool,
    static_available: bool,
    dhcp_ip: Ipv4Addr,
    bring_up_calls: usize,
    dhcp_requests: usize,
    static_applications: usize,
    shut_down_calls: usize,
}

impl Default for LinkControl {
    fn default() -> Self {
        Self {
            carrier: true,
            dhcp_available: true,
            static_available: true,
            dhcp_ip: Ipv4Addr::new(192, 168, 1, 50),
            bring_up_calls: 0,
            dhcp_requests: 0,
            static_applications: 0,
            shut_down_calls: 0,
        }
    }
}

/// Mock link driver; carrier and DHCP are up by default
#[derive(Debug, Default)]
pub struct MockLinkDriver {
    control: Arc<Mutex<LinkControl>>,
}

/// Shared control for a [`MockLinkDriver`]
#[derive(Debug, Clone)]
pub struct MockLinkHandle {
    control: Arc<Mutex<LinkControl>>,
}

impl MockLinkDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self) -> MockLinkHandle {
        MockLinkHandle {
            control: self.control.clone(),
        }
    }
}

impl MockLinkHandle {
    pub fn set_carrier(&self, carrier: bool) {
        lock(&self.control).carrier = carrier;
    }

    pub fn set_dhcp_available(&self, available: bool) {
        lock(&self.control).dhcp_available = available;
    }

    pub fn set_static_available(&self, available: bool) {
        lock(&self.control).static_available = available;
    }

    pub fn bring_up_calls(&self) -> usize {
        lock(&self.control).bring_up_calls
    }

    pub fn dhcp_requests(&self) -> usize {
        lock(&self.control).dhcp_requests
    }

    pub fn static_applications(&self) -> usize {
        lock(&self.control).static_applications
    }

    pub fn shut_down_calls(&self) -> usize {
        lock(&self.control).shut_down_calls
    }
}

impl LinkDriver for MockLinkDriver {
    fn bring_up(&mut self, _credentials: &LinkCredentials) -> Result<(), LinkError> {
        let mut control = lock(&self.control);
        control.bring_up_calls += 1;
        if control.carrier {
            Ok(())
        } else {
            Err(LinkError::NoCarrier)
        }
    }

    fn acquire_dynamic_address(&mut self) -> Result<Ipv4Addr, LinkError> {
        let mut control = lock(&self.control);
        control.dhcp_requests += 1;
        if !control.carrier {
            return Err(LinkError::NoCarrier);
        }
        if control.dhcp_available {
            Ok(control.dhcp_ip)
        } else {
            Err(LinkError::AddressAcquisitionFailed)
        }
    }

    fn apply_static_address(&mut self, _address: &StaticAddress) -> Result<(), LinkError> {
        let mut control = lock(&self.control);
        control.static_applications += 1;
        if control.static_available {
            Ok(())
        } else {
            Err(LinkError::AddressAcquisitionFailed)
        }
    }

    fn has_carrier(&mut self) -> bool {
        lock(&self.control).carrier
    }

    fn shut_down(&mut self) {
        lock(&self.control).shut_down_calls += 1;
    }
}

/// A message the mock broker accepted
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

#[derive(Debug)]
struct BrokerScript {
    auto_accept: bool,
    auto_ack: bool,
    refuse_auth: bool,
    start_error: Option<SessionError>,
    fail_subscribe: bool,
    publish_budget: Option<usize>,
    connected: bool,
    events: VecDeque<TransportEvent>,
    published: Vec<PublishedMessage>,
    subscribes: Vec<(String, QoS)>,
    start_calls: usize,
    disconnect_calls: usize,
}

impl Default for BrokerScript {
    fn default() -> Self {
        Self {
            auto_accept: true,
            auto_ack: true,
            refuse_auth: false,
            start_error: None,
            fail_subscribe: false,
            publish_budget: None,
            connected: false,
            events: VecDeque::new(),
            published: Vec::new(),
            subscribes: Vec::new(),
            start_calls: 0,
            disconnect_calls: 0,
        }
    }
}

/// Mock MQTT transport; accepts connections and acknowledges QoS 1 publishes
/// immediately by default
#[derive(Debug, Default)]
pub struct MockTransport {
    script: Arc<Mutex<BrokerScript>>,
}

/// Shared control for a [`MockTransport`]
#[derive(Debug, Clone)]
pub struct MockBrokerHandle {
    script: Arc<Mutex<BrokerScript>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self) -> MockBrokerHandle {
        MockBrokerHandle {
            script: self.script.clone(),
        }
    }
}

impl MockBrokerHandle {
    /// Queue ConnAck on every `start` instead of waiting for
    /// [`accept_connection`](Self::accept_connection)
    pub fn set_auto_accept(&self, auto_accept: bool) {
        lock(&self.script).auto_accept = auto_accept;
    }

    /// Queue a PubAck for every QoS 1 publish; when off, use
    /// [`acknowledge`](Self::acknowledge)
    pub fn set_auto_ack(&self, auto_ack: bool) {
        lock(&self.script).auto_ack = auto_ack;
    }

    /// Acknowledge the `count` oldest outstanding QoS 1 publishes
    pub fn acknowledge(&self, count: usize) {
        let mut script = lock(&self.script);
        for _ in 0..count {
            script.events.push_back(TransportEvent::PubAck);
        }
    }

    /// Refuse every handshake with bad credentials
    pub fn set_refuse_auth(&self, refuse: bool) {
        lock(&self.script).refuse_auth = refuse;
    }

    pub fn set_start_error(&self, error: Option<SessionError>) {
        lock(&self.script).start_error = error;
    }

    pub fn set_fail_subscribe(&self, fail: bool) {
        lock(&self.script).fail_subscribe = fail;
    }

    /// Accept `count` more publishes, then fail until [`allow_publishes`](Self::allow_publishes)
    pub fn fail_publishes_after(&self, count: usize) {
        lock(&self.script).publish_budget = Some(count);
    }

    pub fn allow_publishes(&self) {
        lock(&self.script).publish_budget = None;
    }

    pub fn accept_connection(&self) {
        lock(&self.script).events.push_back(TransportEvent::Connected);
    }

    pub fn push_message(&self, topic: &str, payload: &[u8]) {
        lock(&self.script)
            .events
            .push_back(TransportEvent::Message(IncomingMessage {
                topic: topic.to_string(),
                payload: payload.to_vec(),
                retain: false,
            }));
    }

    pub fn push_activity(&self) {
        lock(&self.script).events.push_back(TransportEvent::Activity);
    }

    pub fn push_event(&self, event: TransportEvent) {
        lock(&self.script).events.push_back(event);
    }

    /// Broker closes the connection
    pub fn drop_connection(&self) {
        let mut script = lock(&self.script);
        script.connected = false;
        script.events.push_back(TransportEvent::Disconnected);
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        lock(&self.script).published.clone()
    }

    pub fn clear_published(&self) {
        lock(&self.script).published.clear();
    }

    pub fn subscribe_calls(&self) -> Vec<(String, QoS)> {
        lock(&self.script).subscribes.clone()
    }

    pub fn start_calls(&self) -> usize {
        lock(&self.script).start_calls
    }

    pub fn disconnect_calls(&self) -> usize {
        lock(&self.script).disconnect_calls
    }
}

impl MqttTransport for MockTransport {
    fn start(&mut self, _config: &ConnectionConfig) -> Result<(), SessionError> {
        let mut script = lock(&self.script);
        script.start_calls += 1;
        if let Some(error) = script.start_error.clone() {
            return Err(error);
        }

        script.events.clear();
        script.connected = true;
        if script.refuse_auth {
            script
                .events
                .push_back(TransportEvent::Refused(RefusalReason::BadCredentials));
        } else if script.auto_accept {
            script.events.push_back(TransportEvent::Connected);
        }
        Ok(())
    }

    fn poll_event(&mut self) -> Option<TransportEvent> {
        lock(&self.script).events.pop_front()
    }

    fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), SessionError> {
        let mut script = lock(&self.script);
        if !script.connected {
            return Err(SessionError::NotConnected);
        }
        if script.fail_subscribe {
            return Err(SessionError::SubscribeFailed(topic.to_string()));
        }
        script.subscribes.push((topic.to_string(), qos));
        Ok(())
    }

    fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> Result<(), SessionError> {
        let mut script = lock(&self.script);
        if !script.connected {
            return Err(SessionError::NotConnected);
        }
        match script.publish_budget {
            Some(0) => {
                return Err(SessionError::PublishFailed(
                    "mock broker rejected publish".to_string(),
                ))
            }
            Some(remaining) => script.publish_budget = Some(remaining - 1),
            None => {}
        }

        script.published.push(PublishedMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            qos,
            retain,
        });
        if qos == QoS::AtLeastOnce && script.auto_ack {
            script.events.push_back(TransportEvent::PubAck);
        }
        Ok(())
    }

    fn disconnect(&mut self) {
        let mut script = lock(&self.script);
        script.disconnect_calls += 1;
        script.connected = false;
    }
}

/// Sensor that yields one sample per read with a steadily increasing value
#[derive(Debug, Clone)]
pub struct ScriptedSensor {
    sensor_id: String,
    next_value: f64,
    step: f64,
    reads: usize,
}

impl ScriptedSensor {
    /// Values `start`, `start + 1`, `start + 2`, ...
    pub fn counting(sensor_id: impl Into<String>, start: f64) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            next_value: start,
            step: 1.0,
            reads: 0,
        }
    }

    pub fn reads(&self) -> usize {
        self.reads
    }
}

impl SensorSource for ScriptedSensor {
    fn read(&mut self, now: DateTime<Utc>) -> Vec<TelemetrySample> {
        self.reads += 1;
        let sample = TelemetrySample::new(self.sensor_id.clone(), self.next_value, now);
        self.next_value += self.step;
        vec![sample]
    }
}
