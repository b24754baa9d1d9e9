//! coopwatch - connectivity and telemetry supervisor for a coop monitor
//!
//! Keeps a small always-on device connected to an MQTT broker and publishing
//! sensor readings without operator intervention. Three layers are supervised
//! by one cooperative loop:
//!
//! - [`link::NetworkLink`] brings up wired or wireless connectivity, with
//!   DHCP and a static-address fallback
//! - [`session::BrokerSession`] runs the MQTT session on top of the link and
//!   re-applies subscriptions after every reconnect
//! - [`telemetry::TelemetryPublisher`] buffers samples in a bounded queue and
//!   flushes them whenever the session is up, holding QoS 1 samples until
//!   the broker acknowledges them
//!
//! [`supervisor::SupervisorLoop`] sequences them, with each reconnect gated by
//! its own [`backoff::BackoffPolicy`]. No operation blocks: time is passed in
//! explicitly, so the whole state machine can be driven deterministically.
//!
//! # Quick Start
//!
//! ```rust
//! use coopwatch::session::QoS;
//! use coopwatch::telemetry::{TelemetryPublisher, TelemetrySample};
//!
//! let mut publisher = TelemetryPublisher::new(2, "coop/henhouse", QoS::AtLeastOnce, false);
//! for value in [18.5, 18.75, 19.0] {
//!     publisher.enqueue(TelemetrySample::new("coop-temp", value, chrono::Utc::now()));
//! }
//!
//! // Oldest sample was evicted
//! let values: Vec<f64> = publisher.pending().map(|s| s.value).collect();
//! assert_eq!(values, vec![18.75, 19.0]);
//! ```

pub mod backoff;
pub mod config;
pub mod error;
pub mod link;
pub mod observability;
pub mod session;
pub mod supervisor;
pub mod telemetry;
pub mod testing;

pub use backoff::{BackoffPolicy, RetryDecision};
pub use config::{ConfigError, ConnectionConfig, CoopConfig};
pub use error::{CoopError, CoopResult};
pub use link::{LinkDriver, LinkError, LinkState, NetworkLink};
pub use session::{BrokerSession, MqttTransport, QoS, SessionError, SessionState};
pub use supervisor::{CycleAction, CycleReport, SupervisorLoop};
pub use telemetry::{SensorSource, TelemetryPublisher, TelemetrySample};
