//! Sensor sampling and buffered publishing
//!
//! Samples are queued in a bounded FIFO and flushed oldest-first whenever the
//! session is up. When the buffer is full the oldest sample is evicted, so an
//! outage loses the stalest readings first.
//!
//! QoS 1 samples stay owned by the publisher after they are handed to the
//! session. They are released when the broker acknowledges them and moved
//! back to the head of the queue if the connection is lost first.

pub mod background;
pub mod w1;

use crate::config::CoopConfig;
use crate::observability::metrics::metrics;
use crate::session::{BrokerSession, MqttTransport, QoS, SessionError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, error, warn};

pub use background::BackgroundSensor;
pub use w1::W1ThermSource;

/// One sensor reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "sensor")]
    pub sensor_id: String,
    pub value: f64,
}

impl TelemetrySample {
    pub fn new(sensor_id: impl Into<String>, value: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            sensor_id: sensor_id.into(),
            value,
        }
    }
}

/// Something that produces samples when asked
pub trait SensorSource {
    /// Take one reading from every sensor; unreadable sensors are skipped
    ///
    /// Sources that read in the background may return nothing here and hand
    /// the samples over through [`collect`](Self::collect) instead.
    fn read(&mut self, now: DateTime<Utc>) -> Vec<TelemetrySample>;

    /// Samples from a reading that finished since the last call
    fn collect(&mut self) -> Vec<TelemetrySample> {
        Vec::new()
    }
}

/// Result of one [`TelemetryPublisher::flush`]
#[derive(Debug, Clone, PartialEq)]
pub struct FlushReport {
    /// Samples handed to the session, acknowledged or not
    pub published: usize,
    /// Set when a publish failed; the failed sample and everything after it stay queued
    pub stopped_by: Option<SessionError>,
}

/// Bounded sample buffer that publishes through a [`BrokerSession`]
#[derive(Debug)]
pub struct TelemetryPublisher {
    buffer: VecDeque<TelemetrySample>,
    /// QoS 1 samples sent on session `in_flight_epoch` and not yet acknowledged
    in_flight: VecDeque<TelemetrySample>,
    in_flight_epoch: u64,
    capacity: usize,
    topic_prefix: String,
    qos: QoS,
    retain: bool,
    dropped: u64,
}

impl TelemetryPublisher {
    pub fn new(capacity: usize, topic_prefix: impl Into<String>, qos: QoS, retain: bool) -> Self {
        let capacity = capacity.max(1);
        Self {
            buffer: VecDeque::with_capacity(capacity),
            in_flight: VecDeque::new(),
            in_flight_epoch: 0,
            capacity,
            topic_prefix: topic_prefix.into(),
            qos,
            retain,
            dropped: 0,
        }
    }

    pub fn from_config(config: &CoopConfig) -> Self {
        Self::new(
            config.telemetry.buffer_capacity,
            config.topic_prefix(),
            config.telemetry.qos,
            config.telemetry.retain,
        )
    }

    /// Queue a sample, returning the evicted oldest sample if the buffer was full
    pub fn enqueue(&mut self, sample: TelemetrySample) -> Option<TelemetrySample> {
        let evicted = if self.buffer.len() >= self.capacity {
            self.evict_oldest()
        } else {
            None
        };

        self.buffer.push_back(sample);
        metrics().sample_enqueued(self.buffer.len());
        evicted
    }

    fn evict_oldest(&mut self) -> Option<TelemetrySample> {
        let oldest = self.buffer.pop_front()?;
        self.dropped += 1;
        metrics().sample_dropped();
        warn!(
            sensor = %oldest.sensor_id,
            timestamp = %oldest.timestamp,
            dropped_total = self.dropped,
            "Telemetry buffer full, dropping oldest sample"
        );
        Some(oldest)
    }

    /// Publish queued samples oldest-first
    ///
    /// Stops at the first failure and leaves that sample at the head of the
    /// queue for the next flush. Never waits for the session to come back.
    /// QoS 1 samples move to the in-flight list until [`settle`](Self::settle)
    /// sees their PubAck.
    pub fn flush<T: MqttTransport>(&mut self, session: &mut BrokerSession<T>) -> FlushReport {
        let _span = crate::telemetry_span!(queued = self.buffer.len()).entered();
        self.settle(session);
        let mut published = 0;
        let mut stopped_by = None;

        while let Some(sample) = self.buffer.front() {
            let topic = self.topic_for(sample);
            let payload = match serde_json::to_vec(sample) {
                Ok(payload) => payload,
                Err(e) => {
                    error!(
                        sensor = %sample.sensor_id,
                        error = %e,
                        "Discarding unserializable sample"
                    );
                    self.buffer.pop_front();
                    continue;
                }
            };

            match session.publish(&topic, &payload, self.qos, self.retain) {
                Ok(()) => {
                    if let Some(sent) = self.buffer.pop_front() {
                        if self.qos == QoS::AtLeastOnce {
                            self.in_flight_epoch = session.epoch();
                            self.in_flight.push_back(sent);
                        }
                    }
                    published += 1;
                }
                Err(e) => {
                    debug!(
                        queued = self.buffer.len(),
                        error = %e,
                        "Flush stopped, keeping samples queued"
                    );
                    stopped_by = Some(e);
                    break;
                }
            }
        }

        metrics().samples_flushed(published, self.buffer.len());
        FlushReport {
            published,
            stopped_by,
        }
    }

    /// Apply acknowledgements and recover from a lost connection
    ///
    /// Releases one in-flight sample per PubAck, oldest first. If the session
    /// is no longer the connection those samples were sent on, the rest go
    /// back to the head of the queue in their original order; anything that
    /// then exceeds capacity is evicted oldest-first. Returns the number of
    /// samples released.
    pub fn settle<T: MqttTransport>(&mut self, session: &mut BrokerSession<T>) -> usize {
        let acknowledged = session.take_acknowledged();
        let released = acknowledged.min(self.in_flight.len());
        self.in_flight.drain(..released);
        if released > 0 {
            debug!(released, in_flight = self.in_flight.len(), "Samples acknowledged");
        }

        let same_connection =
            session.state().is_connected() && session.epoch() == self.in_flight_epoch;
        if !self.in_flight.is_empty() && !same_connection {
            let requeued = self.in_flight.len();
            while let Some(sample) = self.in_flight.pop_back() {
                self.buffer.push_front(sample);
            }
            while self.buffer.len() > self.capacity {
                self.evict_oldest();
            }
            warn!(
                requeued,
                queued = self.buffer.len(),
                "Session lost with unacknowledged samples, requeued them"
            );
            metrics().samples_flushed(0, self.buffer.len());
        }
        released
    }

    /// Topic a sample is published on
    pub fn topic_for(&self, sample: &TelemetrySample) -> String {
        if self.topic_prefix.is_empty() {
            sample.sensor_id.clone()
        } else {
            format!("{}/{}", self.topic_prefix, sample.sensor_id)
        }
    }

    /// Samples still owned: queued plus awaiting acknowledgement
    pub fn len(&self) -> usize {
        self.buffer.len() + self.in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn queued(&self) -> usize {
        self.buffer.len()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Samples evicted since startup
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Owned samples, oldest first: in flight, then queued
    pub fn pending(&self) -> impl Iterator<Item = &TelemetrySample> {
        self.in_flight.iter().chain(self.buffer.iter())
    }
}
