//! Static cluster configuration and timing tunables.
//!
//! The peer set is fixed at start-up (spec §6: "a list of peer
//! descriptors"); there is no membership-change protocol. Both the
//! peer list and the timing tunables are loaded from one TOML file
//! shared by every process in the cluster.

use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::utils::RelayError;
use crate::logged_err;

/// A peer's rank: an opaque, totally-ordered priority. Higher wins in
/// the election rule; ties are impossible between distinct peers
/// because `server_id` breaks them, but `rank` itself carries no
/// further meaning (spec §9: "rank as an opaque comparable constant").
pub type Rank = u32;

/// Static identity and addresses of one cluster peer (spec §3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerDescriptor {
    pub server_id: String,
    pub host: String,
    pub tcp_port: u16,
    pub udp_port: u16,
    pub rank: Rank,
}

impl PeerDescriptor {
    pub fn tcp_addr(&self) -> Result<SocketAddr, RelayError> {
        self.resolve(self.tcp_port)
    }

    pub fn udp_addr(&self) -> Result<SocketAddr, RelayError> {
        self.resolve(self.udp_port)
    }

    fn resolve(&self, port: u16) -> Result<SocketAddr, RelayError> {
        if let Ok(ip) = self.host.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, port));
        }
        // Accept bare hostnames (e.g. Docker service names) by letting
        // the OS resolver handle them; this is only exercised at
        // connect/bind time by callers that need a concrete SocketAddr.
        use std::net::ToSocketAddrs;
        (self.host.as_str(), port)
            .to_socket_addrs()
            .map_err(|e| {
                RelayError::new(format!(
                    "cannot resolve {}:{}: {}",
                    self.host, port, e
                ))
            })?
            .next()
            .ok_or_else(|| {
                RelayError::new(format!(
                    "no address resolved for {}:{}",
                    self.host, port
                ))
            })
    }
}

/// The full static peer list, identical on every process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub peers: Vec<PeerDescriptor>,
    #[serde(default)]
    pub timing: TimingConfig,
}

impl ClusterConfig {
    pub fn from_toml_file(path: &Path) -> Result<Self, RelayError> {
        let text = fs::read_to_string(path).map_err(|e| {
            RelayError::new(format!(
                "cannot read cluster config {}: {}",
                path.display(),
                e
            ))
        })?;
        let cfg: ClusterConfig = toml::from_str(&text)?;
        cfg.timing.validate()?;
        if cfg.peers.is_empty() {
            return logged_err!("cluster config lists no peers");
        }
        Ok(cfg)
    }

    pub fn peer(&self, server_id: &str) -> Option<&PeerDescriptor> {
        self.peers.iter().find(|p| p.server_id == server_id)
    }

    pub fn others<'a>(
        &'a self,
        server_id: &'a str,
    ) -> impl Iterator<Item = &'a PeerDescriptor> {
        self.peers.iter().filter(move |p| p.server_id != server_id)
    }
}

/// Timeouts tunable per spec §5. Defaults match the reference's own
/// testing defaults (spec §4.1, `original_source/common/config/
/// constants.py`'s `TIMEOUTS`).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub heartbeat_interval: DurationSecs,
    pub death_timeout: DurationSecs,
    pub election_period: DurationSecs,
    pub session_recv_timeout: DurationSecs,
    pub client_ping_interval: DurationSecs,
    pub client_pong_timeout: DurationSecs,
}

impl Default for TimingConfig {
    fn default() -> Self {
        TimingConfig {
            heartbeat_interval: DurationSecs(2.0),
            death_timeout: DurationSecs(6.0),
            election_period: DurationSecs(6.0),
            session_recv_timeout: DurationSecs(1.0),
            client_ping_interval: DurationSecs(2.5),
            client_pong_timeout: DurationSecs(10.0),
        }
    }
}

impl TimingConfig {
    /// Rejects configurations that violate the monotone constraints
    /// spec §4.1/§4.2/§5 require for correctness. A test suite "must
    /// reject configurations that violate them" — this is that check,
    /// called from every config-loading path.
    pub fn validate(&self) -> Result<(), RelayError> {
        let hb = self.heartbeat_interval.as_duration();
        let dt = self.death_timeout.as_duration();
        let ep = self.election_period.as_duration();

        if dt < hb * 2 {
            return logged_err!(
                "death_timeout ({:?}) must be >= 2 * heartbeat_interval ({:?})",
                dt,
                hb
            );
        }
        if ep < dt {
            return logged_err!(
                "election_period ({:?}) must be >= death_timeout ({:?})",
                ep,
                dt
            );
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval.as_duration()
    }
    pub fn death_timeout(&self) -> Duration {
        self.death_timeout.as_duration()
    }
    pub fn election_period(&self) -> Duration {
        self.election_period.as_duration()
    }
    pub fn session_recv_timeout(&self) -> Duration {
        self.session_recv_timeout.as_duration()
    }
    pub fn client_ping_interval(&self) -> Duration {
        self.client_ping_interval.as_duration()
    }
    pub fn client_pong_timeout(&self) -> Duration {
        self.client_pong_timeout.as_duration()
    }
}

/// Newtype so TOML can express timeouts as plain seconds (`2.0`)
/// without every config field needing a custom (de)serializer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DurationSecs(pub f64);

impl DurationSecs {
    pub fn as_duration(self) -> Duration {
        Duration::from_secs_f64(self.0.max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_too_short_death_timeout() {
        let timing = TimingConfig {
            heartbeat_interval: DurationSecs(2.0),
            death_timeout: DurationSecs(2.0),
            ..TimingConfig::default()
        };
        assert!(timing.validate().is_err());
    }

    #[test]
    fn rejects_election_period_shorter_than_death_timeout() {
        let timing = TimingConfig {
            death_timeout: DurationSecs(6.0),
            election_period: DurationSecs(3.0),
            ..TimingConfig::default()
        };
        assert!(timing.validate().is_err());
    }

    #[test]
    fn accepts_defaults() {
        assert!(TimingConfig::default().validate().is_ok());
    }

    #[test]
    fn parses_cluster_toml() {
        let text = r#"
            [[peers]]
            server_id = "A"
            host = "127.0.0.1"
            tcp_port = 9001
            udp_port = 9101
            rank = 10

            [[peers]]
            server_id = "B"
            host = "127.0.0.1"
            tcp_port = 9002
            udp_port = 9102
            rank = 20
        "#;
        let cfg: ClusterConfig = toml::from_str(text).unwrap();
        assert_eq!(cfg.peers.len(), 2);
        assert_eq!(cfg.peer("B").unwrap().rank, 20);
        assert_eq!(cfg.others("A").count(), 1);
        assert!(cfg.timing.validate().is_ok());
    }
}
