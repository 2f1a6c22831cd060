//! Local network scan for WLED matrix controllers
//!
//! Every host of the local /24 is probed concurrently with a short HTTP GET on
//! `/json`. In first-match mode the fastest responder wins: as soon as one
//! device answers, outstanding probes are cancelled and awaited. Which device
//! is "first" when several exist is deliberately unspecified.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn, Span};

use crate::error::DiscoveryError;
use crate::streamer::info::{authority, lan_client, WledState};

pub const DEFAULT_CONCURRENCY: usize = 100;
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(200);
pub const WLED_JSON_ENDPOINT: &str = "/json";

/// A WLED controller that answered with a matrix configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    pub ip: String,
    pub width: u32,
    pub height: u32,
}

/// Checks a single host. Failures of any kind count as "no match".
#[async_trait]
pub trait HostProbe: Send + Sync + 'static {
    async fn probe(&self, ip: Ipv4Addr) -> Option<DiscoveredDevice>;
}

/// Probes `GET http://<ip>/json` and looks for `info.leds.matrix`
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
    timeout: Duration,
    http_port: u16,
}

impl HttpProbe {
    pub fn new(timeout: Duration, http_port: u16) -> Self {
        Self {
            client: lan_client(),
            timeout,
            http_port,
        }
    }
}

impl Default for HttpProbe {
    fn default() -> Self {
        Self::new(DEFAULT_PROBE_TIMEOUT, 80)
    }
}

#[async_trait]
impl HostProbe for HttpProbe {
    async fn probe(&self, ip: Ipv4Addr) -> Option<DiscoveredDevice> {
        let url = format!(
            "http://{}{}",
            authority(&ip.to_string(), self.http_port),
            WLED_JSON_ENDPOINT
        );
        let response = self.client.get(url).timeout(self.timeout).send().await.ok()?;
        if !response.status().is_success() {
            return None;
        }
        let state = response.json::<WledState>().await.ok()?;
        let matrix = state.info.leds.matrix?;

        let ip = state
            .info
            .ip
            .filter(|reported| !reported.is_empty())
            .unwrap_or_else(|| ip.to_string());
        Some(DiscoveredDevice {
            ip,
            width: matrix.w,
            height: matrix.h,
        })
    }
}

pub struct DeviceScanner<P = HttpProbe> {
    probe: Arc<P>,
    concurrency: usize,
    span: Span,
}

impl<P: HostProbe> DeviceScanner<P> {
    pub fn new(probe: P, concurrency: usize, span: Span) -> Self {
        Self {
            probe: Arc::new(probe),
            concurrency: concurrency.max(1),
            span,
        }
    }

    /// Scans the /24 around `anchor` (or this host's address) and returns the
    /// first device found, or an empty list. Past `deadline` the scan is torn
    /// down and `DiscoveryError::Timeout` is returned.
    pub async fn scan_subnet(
        &self,
        anchor: Option<Ipv4Addr>,
        deadline: Option<Duration>,
    ) -> Result<Vec<DiscoveredDevice>, DiscoveryError> {
        let anchor = match anchor {
            Some(ip) => ip,
            None => local_ipv4().await?,
        };
        debug!(parent: &self.span, "Scanning subnet of {}", anchor);
        self.scan(subnet_hosts(anchor), true, deadline).await
    }

    /// Fast-exit scan: at most one device
    pub async fn scan_first(&self, hosts: Vec<Ipv4Addr>) -> Vec<DiscoveredDevice> {
        // Without a deadline the scan cannot time out
        self.scan(hosts, true, None).await.unwrap_or_default()
    }

    /// Exhaustive scan of every host
    pub async fn scan_all(&self, hosts: Vec<Ipv4Addr>) -> Vec<DiscoveredDevice> {
        self.scan(hosts, false, None).await.unwrap_or_default()
    }

    #[instrument(level = "debug", parent = &self.span, skip(self, hosts), fields(hosts = hosts.len()))]
    async fn scan(
        &self,
        hosts: Vec<Ipv4Addr>,
        first_only: bool,
        deadline: Option<Duration>,
    ) -> Result<Vec<DiscoveredDevice>, DiscoveryError> {
        let total = hosts.len();
        let cancel = CancellationToken::new();
        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut probes = JoinSet::new();

        for ip in hosts {
            let probe = self.probe.clone();
            let permits = permits.clone();
            let cancel = cancel.clone();
            probes.spawn(async move {
                let _permit = tokio::select! {
                    _ = cancel.cancelled() => return None,
                    permit = permits.acquire_owned() => permit.ok()?,
                };
                tokio::select! {
                    _ = cancel.cancelled() => None,
                    found = probe.probe(ip) => found,
                }
            });
        }

        let expiry = async {
            match deadline {
                Some(deadline) => tokio::time::sleep(deadline).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(expiry);

        let mut found = Vec::new();
        let mut timed_out = false;
        loop {
            tokio::select! {
                _ = &mut expiry => {
                    timed_out = true;
                    break;
                }
                joined = probes.join_next() => match joined {
                    Some(Ok(Some(device))) => {
                        info!(parent: &self.span, "Found WLED device: {:?}", device);
                        found.push(device);
                        if first_only {
                            break;
                        }
                    }
                    Some(Ok(None)) => {}
                    Some(Err(e)) => warn!(parent: &self.span, "Probe task failed: {}", e),
                    None => break,
                },
            }
        }

        // Stop whatever is still in flight and wait for it to finish
        cancel.cancel();
        probes.shutdown().await;

        debug!(parent: &self.span, hosts = total, found = found.len(), timed_out, "Scan completed");
        if timed_out {
            return Err(DiscoveryError::Timeout);
        }
        Ok(found)
    }
}

/// First device on the local subnet, bounded by `deadline`
pub async fn discover<P: HostProbe>(
    scanner: &DeviceScanner<P>,
    anchor: Option<Ipv4Addr>,
    deadline: Option<Duration>,
) -> Result<DiscoveredDevice, DiscoveryError> {
    let found = scanner.scan_subnet(anchor, deadline).await?;
    found.into_iter().next().ok_or(DiscoveryError::Empty)
}

/// Every usable host address of the /24 containing `ip` (.1 to .254)
pub fn subnet_hosts(ip: Ipv4Addr) -> Vec<Ipv4Addr> {
    let [a, b, c, _] = ip.octets();
    (1..=254).map(|d| Ipv4Addr::new(a, b, c, d)).collect()
}

/// This host's outbound IPv4 address. No packet is sent: connecting a UDP
/// socket only selects the route.
pub async fn local_ipv4() -> Result<Ipv4Addr, DiscoveryError> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .await
        .map_err(|e| DiscoveryError::NoLocalAddress(e.to_string()))?;
    socket
        .connect((Ipv4Addr::new(192, 0, 2, 1), 9))
        .await
        .map_err(|e| DiscoveryError::NoLocalAddress(e.to_string()))?;
    match socket.local_addr() {
        Ok(addr) => match addr.ip() {
            IpAddr::V4(ip) if !ip.is_unspecified() => Ok(ip),
            other => Err(DiscoveryError::NoLocalAddress(format!(
                "unusable local address {}",
                other
            ))),
        },
        Err(e) => Err(DiscoveryError::NoLocalAddress(e.to_string())),
    }
}
