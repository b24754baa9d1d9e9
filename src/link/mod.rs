//! Link-layer connectivity (wired Ethernet or WiFi)
//!
//! [`NetworkLink`] owns the [`LinkState`] and the link retry policy. The
//! hardware itself sits behind the [`LinkDriver`] trait so the same state
//! machine runs over a real PHY/radio, the host network stack, or a test mock.

pub mod host;

use crate::backoff::{BackoffPolicy, RetryDecision};
use crate::config::{ConnectionConfig, LinkCredentials, StaticAddress};
use crate::observability::metrics::metrics;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub use host::HostLinkDriver;

/// Transport-layer failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("No carrier")]
    NoCarrier,
    #[error("Address acquisition failed")]
    AddressAcquisitionFailed,
    #[error("Link operation timed out")]
    Timeout,
    #[error("Link driver error: {0}")]
    Driver(String),
}

/// Link health as last observed
#[derive(Debug, Clone, PartialEq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Failed(LinkError),
}

impl LinkState {
    pub fn is_connected(&self) -> bool {
        matches!(self, LinkState::Connected)
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Disconnected => write!(f, "disconnected"),
            LinkState::Connecting => write!(f, "connecting"),
            LinkState::Connected => write!(f, "connected"),
            LinkState::Failed(reason) => write!(f, "failed ({reason})"),
        }
    }
}

/// How the current address was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressSource {
    Dynamic,
    Static,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkAddress {
    pub ip: Ipv4Addr,
    pub source: AddressSource,
}

/// Result of a gated reconnect
#[derive(Debug, Clone, PartialEq)]
pub enum ReconnectOutcome {
    /// Backoff gate still closed; nothing was attempted
    Deferred { remaining: Duration },
    /// Link is up
    Connected,
}

/// Hardware seam for the physical link
///
/// Every method must return promptly; a driver that needs time to associate
/// reports `Timeout` and is retried on a later cycle.
pub trait LinkDriver {
    /// Power up the PHY/radio and join the medium
    fn bring_up(&mut self, credentials: &LinkCredentials) -> Result<(), LinkError>;

    /// One dynamic address request (DHCP)
    fn acquire_dynamic_address(&mut self) -> Result<Ipv4Addr, LinkError>;

    /// Apply a fixed address after DHCP gave up
    fn apply_static_address(&mut self, address: &StaticAddress) -> Result<(), LinkError>;

    /// Non-blocking check that the medium is still usable
    fn has_carrier(&mut self) -> bool;

    fn shut_down(&mut self);
}

/// Link state machine over a [`LinkDriver`]
pub struct NetworkLink<D: LinkDriver> {
    driver: D,
    config: Arc<ConnectionConfig>,
    state: LinkState,
    backoff: BackoffPolicy,
    address: Option<LinkAddress>,
}

impl<D: LinkDriver> NetworkLink<D> {
    pub fn new(driver: D, config: Arc<ConnectionConfig>, backoff: BackoffPolicy) -> Self {
        Self {
            driver,
            config,
            state: LinkState::Disconnected,
            backoff,
            address: None,
        }
    }

    pub fn state(&self) -> &LinkState {
        &self.state
    }

    pub fn address(&self) -> Option<LinkAddress> {
        self.address
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Attempt a link-layer connection immediately, ignoring the backoff gate
    ///
    /// Dynamic addressing is tried `dhcp_attempts` times; after that the
    /// configured static fallback is applied if there is one.
    pub fn connect(&mut self, now: Instant) -> Result<(), LinkError> {
        let link_type = self.config.link_type;
        let _span = crate::link_span!(link_type = %link_type).entered();
        info!("Bringing up network link");
        self.state = LinkState::Connecting;
        self.address = None;
        metrics().link_connect_attempted();

        match self.establish() {
            Ok(address) => {
                info!(
                    ip = %address.ip,
                    source = ?address.source,
                    "Network link connected"
                );
                self.state = LinkState::Connected;
                self.address = Some(address);
                self.backoff.reset();
                metrics().link_connected();
                Ok(())
            }
            Err(e) => {
                let delay = self.backoff.record_failure(now);
                error!(
                    error = %e,
                    attempt = self.backoff.attempt_count(),
                    retry_in_ms = delay.as_millis() as u64,
                    "Network link connection failed"
                );
                self.state = LinkState::Failed(e.clone());
                metrics().link_connect_failed();
                Err(e)
            }
        }
    }

    fn establish(&mut self) -> Result<LinkAddress, LinkError> {
        self.driver.bring_up(&self.config.credentials)?;

        let attempts = self.config.dhcp_attempts.max(1);
        let mut last_error = LinkError::AddressAcquisitionFailed;
        for attempt in 1..=attempts {
            match self.driver.acquire_dynamic_address() {
                Ok(ip) => {
                    return Ok(LinkAddress {
                        ip,
                        source: AddressSource::Dynamic,
                    })
                }
                Err(e) => {
                    debug!(attempt, attempts, error = %e, "Dynamic address request failed");
                    last_error = e;
                }
            }
        }

        match self.config.fallback_static_address {
            Some(fallback) => {
                warn!(
                    ip = %fallback.address,
                    "DHCP failed after {} attempts, applying static fallback address",
                    attempts
                );
                self.driver.apply_static_address(&fallback)?;
                Ok(LinkAddress {
                    ip: fallback.address,
                    source: AddressSource::Static,
                })
            }
            None => {
                debug!(last_error = %last_error, "No static fallback configured");
                Err(LinkError::AddressAcquisitionFailed)
            }
        }
    }

    /// Non-blocking health check; detects silent carrier loss
    pub fn poll(&mut self) -> LinkState {
        if self.state.is_connected() && !self.driver.has_carrier() {
            warn!("Network link lost carrier");
            self.state = LinkState::Failed(LinkError::NoCarrier);
            self.address = None;
            metrics().link_dropped();
        }
        self.state.clone()
    }

    /// Retry the connection once the backoff gate opens
    pub fn reconnect(&mut self, now: Instant) -> Result<ReconnectOutcome, LinkError> {
        if self.state.is_connected() {
            return Ok(ReconnectOutcome::Connected);
        }

        match self.backoff.check(now) {
            RetryDecision::Wait { remaining } => {
                debug!(
                    remaining_ms = remaining.as_millis() as u64,
                    "Link reconnect deferred by backoff"
                );
                Ok(ReconnectOutcome::Deferred { remaining })
            }
            RetryDecision::Proceed { attempt } => {
                info!(attempt, "Reconnecting network link");
                self.driver.shut_down();
                self.connect(now).map(|_| ReconnectOutcome::Connected)
            }
        }
    }

    /// Take the link down deliberately
    pub fn shut_down(&mut self) {
        self.driver.shut_down();
        self.state = LinkState::Disconnected;
        self.address = None;
        info!("Network link shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoopConfig;
    use crate::testing::mocks::MockLinkDriver;

    fn config_with_fallback(fallback: Option<StaticAddress>) -> Arc<ConnectionConfig> {
        let mut config = CoopConfig::test_config().connection_config().unwrap();
        config.fallback_static_address = fallback;
        Arc::new(config)
    }

    fn fallback() -> StaticAddress {
        StaticAddress {
            address: Ipv4Addr::new(192, 168, 1, 177),
            subnet: Ipv4Addr::new(255, 255, 255, 0),
            gateway: Ipv4Addr::new(192, 168, 1, 1),
            dns: None,
        }
    }

    fn backoff() -> BackoffPolicy {
        BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(30), 2.0)
    }

    #[test]
    fn test_connect_with_dynamic_address() {
        let driver = MockLinkDriver::new();
        let mut link = NetworkLink::new(driver, config_with_fallback(None), backoff());

        assert_eq!(link.state(), &LinkState::Disconnected);
        link.connect(Instant::now()).unwrap();

        assert_eq!(link.state(), &LinkState::Connected);
        assert_eq!(link.address().unwrap().source, AddressSource::Dynamic);
    }

    #[test]
    fn test_static_fallback_after_dhcp_attempts() {
        let driver = MockLinkDriver::new();
        let handle = driver.handle();
        handle.set_dhcp_available(false);
        let mut link = NetworkLink::new(driver, config_with_fallback(Some(fallback())), backoff());

        link.connect(Instant::now()).unwrap();

        let address = link.address().unwrap();
        assert_eq!(address.source, AddressSource::Static);
        assert_eq!(address.ip, Ipv4Addr::new(192, 168, 1, 177));
        assert_eq!(handle.dhcp_requests(), 3);
        assert_eq!(handle.static_applications(), 1);
    }

    #[test]
    fn test_rejected_static_fallback_fails_the_attempt() {
        let driver = MockLinkDriver::new();
        let handle = driver.handle();
        handle.set_dhcp_available(false);
        handle.set_static_available(false);
        let mut link = NetworkLink::new(driver, config_with_fallback(Some(fallback())), backoff());

        let result = link.connect(Instant::now());
        assert_eq!(result, Err(LinkError::AddressAcquisitionFailed));
        assert_eq!(
            link.state(),
            &LinkState::Failed(LinkError::AddressAcquisitionFailed)
        );
        assert!(link.address().is_none());
        assert_eq!(handle.dhcp_requests(), 3);
        assert_eq!(handle.static_applications(), 1);
        assert_eq!(link.backoff().attempt_count(), 1);
    }

    #[test]
    fn test_dhcp_failure_without_fallback() {
        let driver = MockLinkDriver::new();
        driver.handle().set_dhcp_available(false);
        let mut link = NetworkLink::new(driver, config_with_fallback(None), backoff());

        let result = link.connect(Instant::now());
        assert_eq!(result, Err(LinkError::AddressAcquisitionFailed));
        assert_eq!(
            link.state(),
            &LinkState::Failed(LinkError::AddressAcquisitionFailed)
        );
    }

    #[test]
    fn test_no_carrier_on_bring_up() {
        let driver = MockLinkDriver::new();
        driver.handle().set_carrier(false);
        let mut link = NetworkLink::new(driver, config_with_fallback(None), backoff());

        assert_eq!(link.connect(Instant::now()), Err(LinkError::NoCarrier));
    }

    #[test]
    fn test_poll_detects_silent_drop() {
        let driver = MockLinkDriver::new();
        let handle = driver.handle();
        let mut link = NetworkLink::new(driver, config_with_fallback(None), backoff());
        link.connect(Instant::now()).unwrap();
        assert_eq!(link.poll(), LinkState::Connected);

        handle.set_carrier(false);
        assert_eq!(link.poll(), LinkState::Failed(LinkError::NoCarrier));
        assert!(link.address().is_none());
    }

    #[test]
    fn test_reconnect_respects_backoff_gate() {
        let driver = MockLinkDriver::new();
        let handle = driver.handle();
        handle.set_carrier(false);
        let mut link = NetworkLink::new(driver, config_with_fallback(None), backoff());

        let start = Instant::now();
        assert!(link.connect(start).is_err());

        let outcome = link.reconnect(start + Duration::from_millis(400)).unwrap();
        assert_eq!(
            outcome,
            ReconnectOutcome::Deferred {
                remaining: Duration::from_millis(600)
            }
        );
        assert_eq!(handle.bring_up_calls(), 1);

        handle.set_carrier(true);
        let outcome = link.reconnect(start + Duration::from_secs(1)).unwrap();
        assert_eq!(outcome, ReconnectOutcome::Connected);
        assert_eq!(handle.bring_up_calls(), 2);
        assert_eq!(link.backoff().attempt_count(), 0);
        assert_eq!(link.backoff().current_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_consecutive_failures_grow_delay() {
        let driver = MockLinkDriver::new();
        driver.handle().set_carrier(false);
        let mut link = NetworkLink::new(driver, config_with_fallback(None), backoff());

        let mut now = Instant::now();
        assert!(link.connect(now).is_err());
        let mut delays = vec![link.backoff().current_delay().as_secs()];
        for _ in 0..4 {
            now += link.backoff().current_delay();
            assert!(link.reconnect(now).is_err());
            delays.push(link.backoff().current_delay().as_secs());
        }
        assert_eq!(delays, vec![1, 2, 4, 8, 16]);
    }
}
