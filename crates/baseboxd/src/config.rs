//! Configuration file support for baseboxd
//!
//! Loads the controller, kernel and dispatch settings together with the
//! static port/VLAN assignment and endpoint bindings from a TOML file.
//! Default location: /etc/baseboxd/baseboxd.toml

use crate::error::{BaseboxError, Result};
use basebox_types::{IpPrefix, MacAddress, VlanId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use tracing::info;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/baseboxd/baseboxd.toml";

/// OpenFlow listener settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Address the datapath connects to
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Echo request interval in seconds, 0 disables keepalives
    #[serde(default = "default_echo_interval")]
    pub echo_interval_secs: u64,

    /// Outbound message queue depth per connection
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelConfig {
    /// Full netlink resynchronization interval in seconds
    #[serde(default = "default_resync_interval")]
    pub resync_interval_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Number of packet buffers shared by packet-in and tap traffic
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Size of a single packet buffer in bytes
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

/// Control traffic punted to the controller. ARP is always trapped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default)]
    pub lldp: bool,

    #[serde(default)]
    pub lacp: bool,
}

/// Static VLAN assignment of one switch port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortConfig {
    /// Datapath id of the switch, 0 matches any
    #[serde(default)]
    pub dpid: u64,

    pub portno: u32,

    #[serde(default)]
    pub vlans: Vec<VlanId>,

    #[serde(default = "default_pvid")]
    pub pvid: VlanId,
}

/// Static (device, VLAN, MAC) binding installed as a bridging entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub devname: String,
    pub vid: VlanId,
    pub hwaddr: MacAddress,

    /// Address assigned to the device when the endpoint terminates traffic
    #[serde(default)]
    pub address: Option<IpPrefix>,
}

/// Complete baseboxd configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseboxConfig {
    #[serde(default)]
    pub controller: ControllerConfig,

    #[serde(default)]
    pub kernel: KernelConfig,

    #[serde(default)]
    pub dispatch: DispatchConfig,

    #[serde(default)]
    pub policy: PolicyConfig,

    #[serde(default)]
    pub ports: Vec<PortConfig>,

    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::UNSPECIFIED, basebox_ofdpa::OFP_TCP_PORT))
}

fn default_echo_interval() -> u64 {
    5
}

fn default_queue_depth() -> usize {
    1024
}

fn default_resync_interval() -> u64 {
    30
}

fn default_pool_size() -> usize {
    256
}

fn default_buffer_size() -> usize {
    9216
}

fn default_pvid() -> VlanId {
    VlanId::DEFAULT
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            echo_interval_secs: default_echo_interval(),
            queue_depth: default_queue_depth(),
        }
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            resync_interval_secs: default_resync_interval(),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            buffer_size: default_buffer_size(),
        }
    }
}

impl BaseboxConfig {
    /// Load configuration from file, falling back to defaults if file not found
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        match fs::read_to_string(path) {
            Ok(content) => Self::from_toml(&content).map_err(|e| {
                BaseboxError::Config(format!("{}: {}", path.display(), e))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "config file not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(BaseboxError::Io(e)),
        }
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| BaseboxError::Config(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.controller.queue_depth == 0 {
            return Err(BaseboxError::Config("queue_depth must be > 0".to_string()));
        }

        if self.kernel.resync_interval_secs == 0 {
            return Err(BaseboxError::Config(
                "resync_interval_secs must be > 0".to_string(),
            ));
        }

        if self.dispatch.pool_size == 0 {
            return Err(BaseboxError::Config("pool_size must be > 0".to_string()));
        }

        // smallest frame plus an 802.1Q tag
        if self.dispatch.buffer_size < 64 {
            return Err(BaseboxError::Config("buffer_size must be >= 64".to_string()));
        }

        let mut seen = HashSet::new();
        for port in &self.ports {
            if port.portno == 0 {
                return Err(BaseboxError::Config("portno 0 is reserved".to_string()));
            }
            if !seen.insert((port.dpid, port.portno)) {
                return Err(BaseboxError::Config(format!(
                    "duplicate entry for port {} on dpid {:#x}",
                    port.portno, port.dpid
                )));
            }
        }

        for endpoint in &self.endpoints {
            if endpoint.devname.is_empty() || endpoint.devname.len() > 15 {
                return Err(BaseboxError::Config(format!(
                    "invalid endpoint device name '{}'",
                    endpoint.devname
                )));
            }
            if !endpoint.hwaddr.is_unicast() || endpoint.hwaddr.is_zero() {
                return Err(BaseboxError::Config(format!(
                    "endpoint {} needs a unicast hwaddr",
                    endpoint.devname
                )));
            }
        }

        Ok(())
    }

    /// Static assignment for `portno` on `dpid`; dpid 0 entries match any switch.
    pub fn port(&self, dpid: u64, portno: u32) -> Option<&PortConfig> {
        self.ports
            .iter()
            .find(|p| p.portno == portno && p.dpid == dpid)
            .or_else(|| self.ports.iter().find(|p| p.portno == portno && p.dpid == 0))
    }

    pub fn echo_interval(&self) -> Option<Duration> {
        match self.controller.echo_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.kernel.resync_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    const SAMPLE: &str = r#"
[controller]
listen_addr = "127.0.0.1:6633"

[policy]
lldp = true

[[ports]]
dpid = 1
portno = 3
vlans = [10, 20]
pvid = 10

[[ports]]
portno = 4

[[endpoints]]
devname = "port3"
vid = 10
hwaddr = "02:00:00:00:00:01"
address = "10.0.0.1/24"
"#;

    #[test]
    fn test_default_config() {
        let config = BaseboxConfig::default();
        assert_eq!(config.controller.listen_addr.port(), 6653);
        assert_eq!(config.kernel.resync_interval_secs, 30);
        assert_eq!(config.dispatch.pool_size, 256);
        assert!(!config.policy.lldp);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_sample() {
        let config = BaseboxConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(config.controller.listen_addr, "127.0.0.1:6633".parse().unwrap());
        assert_eq!(config.controller.queue_depth, 1024);
        assert!(config.policy.lldp);
        assert_eq!(config.ports.len(), 2);
        assert_eq!(config.ports[0].pvid, VlanId::new(10).unwrap());
        assert_eq!(config.ports[1].pvid, VlanId::DEFAULT);
        assert_eq!(config.endpoints[0].hwaddr.to_string(), "02:00:00:00:00:01");
        assert_eq!(
            config.endpoints[0].address,
            Some("10.0.0.1/24".parse().unwrap())
        );
    }

    #[test]
    fn test_port_lookup_falls_back_to_wildcard_dpid() {
        let config = BaseboxConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(config.port(1, 3).map(|p| p.vlans.len()), Some(2));
        assert!(config.port(2, 3).is_none());
        assert_eq!(config.port(7, 4).map(|p| p.portno), Some(4));
    }

    #[test]
    fn test_rejects_invalid_vlan() {
        let result = BaseboxConfig::from_toml("[[ports]]\nportno = 1\nvlans = [4095]\n");
        assert!(matches!(result, Err(BaseboxError::Config(_))));
    }

    #[test]
    fn test_rejects_duplicate_ports() {
        let result = BaseboxConfig::from_toml("[[ports]]\nportno = 1\n[[ports]]\nportno = 1\n");
        assert!(matches!(result, Err(BaseboxError::Config(_))));
    }

    #[test]
    fn test_rejects_zero_pool() {
        let result = BaseboxConfig::from_toml("[dispatch]\npool_size = 0\n");
        assert!(matches!(result, Err(BaseboxError::Config(_))));
    }

    #[test]
    fn test_load_or_default() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.toml");
        assert_eq!(
            BaseboxConfig::load_or_default(&missing).unwrap(),
            BaseboxConfig::default()
        );

        let path = dir.path().join("baseboxd.toml");
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = BaseboxConfig::load_or_default(&path).unwrap();
        assert_eq!(config.endpoints.len(), 1);
    }
}
