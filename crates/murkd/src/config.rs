//! Configuration for the daemon: a TOML file plus defaults.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use serde::Deserialize;

use murk_cell::{PeerDescriptor, PeerFlags};
use murk_community::CommunityConfig;
use murk_proto::handshake::peer_id_for_key;
use murk_proxy::ProxyConfig;
use murk_rend::RendConfig;

/// Everything murkd reads from its configuration file.
///
/// Every key is optional; an empty file (or no file at all) yields the
/// defaults, though the defaults alone will not validate without a
/// `bootstrap` list or a `state_dir` to recover candidates from.
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub(crate) struct MurkConfig {
    /// Default hop count for data circuits.
    #[serde(default = "defaults::hops")]
    pub(crate) hops: u8,

    /// Minimum live (ready or building) data circuits per hop count.
    #[serde(default = "defaults::min_circuits")]
    pub(crate) min_circuits: usize,

    /// Maximum data circuits per hop count.
    #[serde(default = "defaults::max_circuits")]
    pub(crate) max_circuits: usize,

    /// Whether to advertise the BitTorrent exit capability.
    #[serde(default)]
    pub(crate) exit_enabled: bool,

    /// Whether to relay circuit traffic for other peers.
    #[serde(default = "defaults::yes")]
    pub(crate) relay_enabled: bool,

    /// SOCKS listen ports; the i-th entry (1-based) serves circuits of
    /// i hops.  A port of 0 asks the OS for a free one.
    #[serde(default = "defaults::socks_listen_ports")]
    pub(crate) socks_listen_ports: Vec<u16>,

    /// How long one circuit-building step may take before the circuit
    /// is abandoned.
    #[serde(default = "defaults::extend_timeout", with = "humantime_serde")]
    pub(crate) extend_timeout: Duration,

    /// Retire circuits once they reach this age.
    #[serde(default = "defaults::max_circuit_age", with = "humantime_serde")]
    pub(crate) max_circuit_age: Duration,

    /// Peers that seed the candidate set.
    #[serde(default)]
    pub(crate) bootstrap: Vec<BootstrapPeer>,

    /// Address to bind the overlay UDP socket on.
    #[serde(default = "defaults::listen_addr")]
    pub(crate) listen_addr: SocketAddr,

    /// Directory for the identity key and the exit descriptor cache;
    /// absent means nothing is persisted.
    #[serde(default)]
    pub(crate) state_dir: Option<PathBuf>,

    /// Tracing filter directives, overridable with `--log-filter`.
    #[serde(default = "defaults::log_filter")]
    pub(crate) log_filter: String,
}

/// One peer in the `bootstrap` list.
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub(crate) struct BootstrapPeer {
    /// The peer's overlay UDP address.
    pub(crate) addr: SocketAddr,
    /// The peer's public tunnel key, hex encoded.
    pub(crate) tunnel_key: String,
    /// Whether the peer relays circuit traffic.
    #[serde(default = "defaults::yes")]
    pub(crate) relay: bool,
    /// Whether the peer exits BitTorrent traffic.
    #[serde(default)]
    pub(crate) exit: bool,
}

/// Default values for the configuration keys.
mod defaults {
    use std::net::SocketAddr;
    use std::time::Duration;

    /// Default data circuit hop count.
    pub(super) fn hops() -> u8 {
        2
    }
    /// Default pool floor per hop count.
    pub(super) fn min_circuits() -> usize {
        2
    }
    /// Default pool ceiling per hop count.
    pub(super) fn max_circuits() -> usize {
        6
    }
    /// For booleans that default on.
    pub(super) fn yes() -> bool {
        true
    }
    /// Default SOCKS port list: one instance.
    pub(super) fn socks_listen_ports() -> Vec<u16> {
        vec![1080]
    }
    /// Default circuit-building step timeout.
    pub(super) fn extend_timeout() -> Duration {
        Duration::from_secs(10)
    }
    /// Default circuit retirement age.
    pub(super) fn max_circuit_age() -> Duration {
        Duration::from_secs(30 * 60)
    }
    /// Default overlay bind address: any interface, OS-assigned port.
    pub(super) fn listen_addr() -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], 0))
    }
    /// Default tracing filter.
    pub(super) fn log_filter() -> String {
        "info".to_string()
    }
}

impl Default for MurkConfig {
    fn default() -> Self {
        MurkConfig {
            hops: defaults::hops(),
            min_circuits: defaults::min_circuits(),
            max_circuits: defaults::max_circuits(),
            exit_enabled: false,
            relay_enabled: defaults::yes(),
            socks_listen_ports: defaults::socks_listen_ports(),
            extend_timeout: defaults::extend_timeout(),
            max_circuit_age: defaults::max_circuit_age(),
            bootstrap: Vec::new(),
            listen_addr: defaults::listen_addr(),
            state_dir: None,
            log_filter: defaults::log_filter(),
        }
    }
}

impl MurkConfig {
    /// Refuse configurations that cannot be served.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.hops == 0 {
            bail!("hops must be at least 1");
        }
        if self.socks_listen_ports.is_empty() {
            bail!("socks_listen_ports must name at least one port");
        }
        if self.socks_listen_ports.len() > usize::from(u8::MAX) {
            bail!("socks_listen_ports supports at most 255 instances");
        }
        let mut seen = HashSet::new();
        for port in &self.socks_listen_ports {
            if *port != 0 && !seen.insert(*port) {
                bail!("socks_listen_ports repeats port {port}");
            }
        }
        if self.min_circuits > self.max_circuits {
            bail!(
                "min_circuits ({}) exceeds max_circuits ({})",
                self.min_circuits,
                self.max_circuits
            );
        }
        if self.bootstrap.is_empty() && self.state_dir.is_none() {
            bail!("no bootstrap peers and no state_dir to recover candidates from");
        }
        for peer in &self.bootstrap {
            peer.descriptor()?;
        }
        Ok(())
    }

    /// The overlay side of this configuration.
    pub(crate) fn community_config(&self) -> CommunityConfig {
        CommunityConfig {
            listen_addr: self.listen_addr,
            hop_counts: self.hop_counts(),
            min_circuits: self.min_circuits,
            max_circuits: self.max_circuits,
            extend_timeout: self.extend_timeout,
            max_circuit_age: self.max_circuit_age,
            relay_enabled: self.relay_enabled,
            exit_enabled: self.exit_enabled,
            state_dir: self.state_dir.clone(),
            ..CommunityConfig::default()
        }
    }

    /// The SOCKS front side of this configuration.
    pub(crate) fn proxy_config(&self) -> ProxyConfig {
        ProxyConfig {
            socks_listen_ports: self.socks_listen_ports.clone(),
        }
    }

    /// The rendezvous side of this configuration.
    pub(crate) fn rend_config(&self) -> RendConfig {
        RendConfig {
            dl_hops: self.hops,
            sr_hops: self.hops,
            intro_hops: self.hops,
            ..RendConfig::default()
        }
    }

    /// The configured bootstrap peers as descriptors.
    pub(crate) fn bootstrap_descriptors(&self) -> Result<Vec<PeerDescriptor>> {
        self.bootstrap.iter().map(BootstrapPeer::descriptor).collect()
    }

    /// Hop counts the pool keeps circuits ready for: one per SOCKS
    /// instance, plus the default data hop count if it is longer.
    fn hop_counts(&self) -> Vec<u8> {
        let n = u8::try_from(self.socks_listen_ports.len()).unwrap_or(u8::MAX);
        let mut counts: Vec<u8> = (1..=n).collect();
        if !counts.contains(&self.hops) {
            counts.push(self.hops);
        }
        counts
    }
}

impl BootstrapPeer {
    /// Turn the entry into a descriptor, deriving the peer identity
    /// from the key.
    pub(crate) fn descriptor(&self) -> Result<PeerDescriptor> {
        let bytes = hex::decode(&self.tunnel_key)
            .map_err(|_| anyhow!("bootstrap key for {} is not valid hex", self.addr))?;
        let tunnel_key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| anyhow!("bootstrap key for {} must be 32 bytes", self.addr))?;
        let mut flags = PeerFlags::default();
        if self.relay {
            flags = flags | PeerFlags::RELAY;
        }
        if self.exit {
            flags = flags | PeerFlags::EXIT_BT;
        }
        Ok(PeerDescriptor {
            id: peer_id_for_key(&tunnel_key),
            addr: self.addr,
            tunnel_key,
            flags,
        })
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    /// A syntactically valid 32-byte key, hex encoded.
    const KEY_HEX: &str = "aa11bb22cc33dd44ee55ff660718293a4b5c6d7e8f90a1b2c3d4e5f607182930";

    #[test]
    fn full_file_parses() {
        let config: MurkConfig = toml::from_str(&format!(
            r#"
            hops = 3
            min_circuits = 1
            max_circuits = 4
            exit_enabled = true
            socks_listen_ports = [1080, 1081, 1082]
            extend_timeout = "8s"
            max_circuit_age = "15m"
            listen_addr = "0.0.0.0:7774"
            state_dir = "/var/lib/murkd"
            log_filter = "info,murk_community=debug"

            [[bootstrap]]
            addr = "192.0.2.10:7000"
            tunnel_key = "{KEY_HEX}"
            exit = true
            "#
        ))
        .unwrap();

        assert_eq!(config.hops, 3);
        assert_eq!(config.extend_timeout, Duration::from_secs(8));
        assert_eq!(config.max_circuit_age, Duration::from_secs(15 * 60));
        assert_eq!(config.socks_listen_ports, vec![1080, 1081, 1082]);
        config.validate().unwrap();

        let desc = config.bootstrap[0].descriptor().unwrap();
        assert!(desc.is_relay());
        assert!(desc.is_exit());
        assert_eq!(desc.id, peer_id_for_key(&desc.tunnel_key));
    }

    #[test]
    fn empty_file_yields_defaults() {
        let config: MurkConfig = toml::from_str("").unwrap();
        assert_eq!(config.hops, 2);
        assert_eq!(config.socks_listen_ports, vec![1080]);
        assert!(config.relay_enabled);
        assert!(!config.exit_enabled);
        // No peers and nowhere to recover them from.
        assert!(config.validate().is_err());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let parsed: std::result::Result<MurkConfig, _> = toml::from_str("torrent_port = 6881");
        assert!(parsed.is_err());
    }

    #[test]
    fn bad_bootstrap_key_fails_validation() {
        let config: MurkConfig = toml::from_str(
            r#"
            [[bootstrap]]
            addr = "192.0.2.10:7000"
            tunnel_key = "definitely not hex"
            "#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn duplicate_ports_fail_validation() {
        let config = MurkConfig {
            socks_listen_ports: vec![1080, 1080],
            state_dir: Some("/tmp".into()),
            ..MurkConfig::default()
        };
        assert!(config.validate().is_err());

        // Repeated zeros are distinct OS-assigned ports.
        let config = MurkConfig {
            socks_listen_ports: vec![0, 0],
            state_dir: Some("/tmp".into()),
            ..MurkConfig::default()
        };
        config.validate().unwrap();
    }

    #[test]
    fn zero_hops_fails_validation() {
        let config = MurkConfig {
            hops: 0,
            state_dir: Some("/tmp".into()),
            ..MurkConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn pool_covers_every_served_hop_count() {
        let config = MurkConfig {
            hops: 3,
            socks_listen_ports: vec![1080],
            ..MurkConfig::default()
        };
        assert_eq!(config.community_config().hop_counts, vec![1, 3]);

        let config = MurkConfig {
            hops: 2,
            socks_listen_ports: vec![1080, 1081, 1082],
            ..MurkConfig::default()
        };
        assert_eq!(config.community_config().hop_counts, vec![1, 2, 3]);
    }
}
