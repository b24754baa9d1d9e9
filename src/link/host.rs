//! Link driver for hosts whose network stack is managed by the operating system
//!
//! The OS owns association and DHCP, so this driver observes rather than
//! configures: "carrier" means the kernel has a route to the broker, and the
//! dynamic address is the source address the kernel would pick for it. Probing
//! uses a connected UDP socket, which consults the routing table without
//! sending a packet.
//!
//! Broker hostnames are resolved on the tokio runtime. `bring_up` reports
//! `Timeout` while a lookup is outstanding, and the resolved address is kept
//! across reconnects.

use super::{LinkDriver, LinkError};
use crate::config::{LinkCredentials, StaticAddress};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use tokio::sync::oneshot::{self, error::TryRecvError};
use tracing::{debug, info, warn};

type Lookup = oneshot::Receiver<io::Result<Vec<SocketAddr>>>;

pub struct HostLinkDriver {
    broker_host: String,
    broker_port: u16,
    broker_addr: Option<SocketAddr>,
    lookup: Option<Lookup>,
    static_ip: Option<Ipv4Addr>,
}

impl HostLinkDriver {
    pub fn new(broker_host: impl Into<String>, broker_port: u16) -> Self {
        let broker_host = broker_host.into();
        let broker_addr = broker_host
            .parse::<Ipv4Addr>()
            .ok()
            .map(|ip| SocketAddr::new(IpAddr::V4(ip), broker_port));
        Self {
            broker_host,
            broker_port,
            broker_addr,
            lookup: None,
            static_ip: None,
        }
    }

    /// Broker address once resolved
    pub fn broker_addr(&self) -> Option<SocketAddr> {
        self.broker_addr
    }

    fn resolve_broker(&mut self) -> Result<SocketAddr, LinkError> {
        if let Some(addr) = self.broker_addr {
            return Ok(addr);
        }

        if self.lookup.is_none() {
            self.start_lookup()?;
            return Err(LinkError::Timeout);
        }
        let Some(lookup) = self.lookup.as_mut() else {
            return Err(LinkError::Timeout);
        };
        let result = match lookup.try_recv() {
            Ok(result) => result,
            Err(TryRecvError::Empty) => {
                debug!(host = %self.broker_host, "Broker lookup still pending");
                return Err(LinkError::Timeout);
            }
            Err(TryRecvError::Closed) => Err(io::Error::other("lookup task ended")),
        };
        self.lookup = None;

        let addrs = result.map_err(|e| {
            LinkError::Driver(format!("cannot resolve {}: {e}", self.broker_host))
        })?;
        let addr = addrs
            .into_iter()
            .find(SocketAddr::is_ipv4)
            .ok_or(LinkError::AddressAcquisitionFailed)?;
        info!(host = %self.broker_host, addr = %addr, "Resolved broker address");
        self.broker_addr = Some(addr);
        Ok(addr)
    }

    fn start_lookup(&mut self) -> Result<(), LinkError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| LinkError::Driver(format!("no async runtime for DNS lookup: {e}")))?;
        let (tx, rx) = oneshot::channel();
        let target = (self.broker_host.clone(), self.broker_port);
        runtime.spawn(async move {
            let result = tokio::net::lookup_host(target)
                .await
                .map(|addrs| addrs.collect::<Vec<SocketAddr>>());
            let _ = tx.send(result);
        });
        debug!(host = %self.broker_host, "Started broker lookup");
        self.lookup = Some(rx);
        Ok(())
    }

    /// Source address the kernel would use to reach the broker
    fn probe_route(&self, bind_ip: Ipv4Addr) -> Option<Ipv4Addr> {
        let target = self.broker_addr?;
        let socket = UdpSocket::bind((bind_ip, 0)).ok()?;
        socket.connect(target).ok()?;
        match socket.local_addr().ok()?.ip() {
            IpAddr::V4(ip) if !ip.is_unspecified() => Some(ip),
            _ => None,
        }
    }
}

impl LinkDriver for HostLinkDriver {
    fn bring_up(&mut self, credentials: &LinkCredentials) -> Result<(), LinkError> {
        match credentials {
            LinkCredentials::Wired { mac } => {
                debug!(mac = %mac, "Wired interface is managed by the host");
            }
            LinkCredentials::Wireless { ssid, .. } => {
                info!(ssid = %ssid, "WiFi association is managed by the host");
            }
        }

        self.resolve_broker()?;
        if self.probe_route(Ipv4Addr::UNSPECIFIED).is_none() && self.static_ip.is_none() {
            return Err(LinkError::NoCarrier);
        }
        Ok(())
    }

    fn acquire_dynamic_address(&mut self) -> Result<Ipv4Addr, LinkError> {
        let ip = self
            .probe_route(Ipv4Addr::UNSPECIFIED)
            .ok_or(LinkError::AddressAcquisitionFailed)?;
        self.static_ip = None;
        Ok(ip)
    }

    fn apply_static_address(&mut self, address: &StaticAddress) -> Result<(), LinkError> {
        // The host cannot be reconfigured from here; the fallback is usable
        // only if the address is already assigned to a local interface.
        match self.probe_route(address.address) {
            Some(_) => {
                self.static_ip = Some(address.address);
                Ok(())
            }
            None => {
                warn!(
                    ip = %address.address,
                    "Static fallback address is not assigned on this host"
                );
                Err(LinkError::AddressAcquisitionFailed)
            }
        }
    }

    fn has_carrier(&mut self) -> bool {
        let bind_ip = self.static_ip.unwrap_or(Ipv4Addr::UNSPECIFIED);
        self.probe_route(bind_ip).is_some()
    }

    fn shut_down(&mut self) {
        self.static_ip = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MacAddress;

    fn wired() -> LinkCredentials {
        LinkCredentials::Wired {
            mac: MacAddress([0x90, 0xA2, 0xDA, 0x0D, 0x51, 0xC8]),
        }
    }

    #[test]
    fn test_loopback_broker_is_reachable() {
        let mut driver = HostLinkDriver::new("127.0.0.1", 1883);
        driver.bring_up(&wired()).unwrap();
        assert_eq!(
            driver.acquire_dynamic_address().unwrap(),
            Ipv4Addr::LOCALHOST
        );
        assert!(driver.has_carrier());
    }

    #[test]
    fn test_loopback_static_fallback() {
        let mut driver = HostLinkDriver::new("127.0.0.1", 1883);
        driver.bring_up(&wired()).unwrap();
        let fallback = StaticAddress {
            address: Ipv4Addr::LOCALHOST,
            subnet: Ipv4Addr::new(255, 0, 0, 0),
            gateway: Ipv4Addr::LOCALHOST,
            dns: None,
        };
        driver.apply_static_address(&fallback).unwrap();
        assert!(driver.has_carrier());
    }

    #[test]
    fn test_unassigned_static_address_is_rejected() {
        let mut driver = HostLinkDriver::new("127.0.0.1", 1883);
        driver.bring_up(&wired()).unwrap();
        let fallback = StaticAddress {
            address: Ipv4Addr::new(203, 0, 113, 77),
            subnet: Ipv4Addr::new(255, 255, 255, 0),
            gateway: Ipv4Addr::new(203, 0, 113, 1),
            dns: None,
        };
        assert_eq!(
            driver.apply_static_address(&fallback),
            Err(LinkError::AddressAcquisitionFailed)
        );
    }

    #[test]
    fn test_ip_literal_needs_no_lookup() {
        let driver = HostLinkDriver::new("127.0.0.1", 1883);
        assert_eq!(
            driver.broker_addr(),
            Some(SocketAddr::from((Ipv4Addr::LOCALHOST, 1883)))
        );
    }

    #[test]
    fn test_hostname_without_runtime_is_a_driver_error() {
        let mut driver = HostLinkDriver::new("localhost", 1883);
        assert!(matches!(driver.bring_up(&wired()), Err(LinkError::Driver(_))));
    }

    #[tokio::test]
    async fn test_hostname_resolved_in_background() {
        let mut driver = HostLinkDriver::new("localhost", 1883);
        assert_eq!(driver.bring_up(&wired()), Err(LinkError::Timeout));

        let mut result = Err(LinkError::Timeout);
        for _ in 0..200 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            result = driver.bring_up(&wired());
            if result != Err(LinkError::Timeout) {
                break;
            }
        }
        assert_eq!(result, Ok(()));
        assert_eq!(driver.broker_addr().map(|a| a.port()), Some(1883));

        // Cached across shut_down
        driver.shut_down();
        assert_eq!(driver.bring_up(&wired()), Ok(()));
    }
}
