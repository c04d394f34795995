//! The simulator's configuration and cli parsing code using [serde] and [clap]. The configuration
//! file describes the topology (hosts, their interfaces and services, and the links between
//! them) and the protocol timers. Some of the general options are also exposed as CLI options,
//! which override the file.
//!
//! [schemars] is used to get each option's description (its doc comment) and default value so
//! that they can be shown in the CLI help text.
//!
//! This code only checks that values are well-formed. Whether they make sense together (for
//! example that a link refers to an interface that exists) is checked when the simulation is
//! built from the configuration.

use std::collections::BTreeMap;
use std::str::FromStr;

use clap::Parser;
use merge::Merge;
use once_cell::sync::Lazy;
use schemars::{schema_for, JsonSchema};
use serde::{Deserialize, Serialize};

use crate::host::host::HostRole;
use crate::host::network::interface::Speed;
use crate::host::services::arp::ArpConfig;
use crate::host::services::dhcp::{DhcpClientConfig, DhcpServerConfig};
use crate::host::services::switching::{PortMode, SwitchingConfig, TrunkMode};
use crate::network::address::Ipv4Address;
use crate::utility::units::{Bandwidth, Time};

const START_HELP_TEXT: &str = "\
    Simulate small switched and routed networks running ARP, DHCP, \
    MAC learning and HSRP against a virtual clock.";

const END_HELP_TEXT: &str = "\
    If units are not specified, times are given in seconds and bandwidths in bits \
    per second. Units can optionally be specified (for example: '250 ms', '3 s', \
    '100 Mbit') and are case-sensitive.";

#[derive(Debug, Clone, Parser)]
#[clap(name = "netsim", about = START_HELP_TEXT, after_help = END_HELP_TEXT)]
#[clap(version)]
#[clap(next_display_order = None)]
pub struct CliOptions {
    /// Path to the configuration file. Use '-' to read from stdin
    pub config: String,

    /// Exit after printing the final configuration
    #[clap(long)]
    pub show_config: bool,

    #[clap(flatten)]
    pub general: GeneralOptions,
}

/// Options contained in a configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFileOptions {
    pub general: GeneralOptions,

    #[serde(default)]
    pub protocols: ProtocolOptions,

    // a BTreeMap so that hosts are created in name order, for determinism
    pub hosts: BTreeMap<String, HostOptions>,

    #[serde(default)]
    pub links: Vec<LinkOptions>,
}

impl FromStr for ConfigFileOptions {
    type Err = serde_yaml::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_yaml::from_str(s)
    }
}

/// Configuration options after processing command-line and configuration file options.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigOptions {
    pub general: GeneralOptions,
    pub protocols: ProtocolOptions,
    pub hosts: BTreeMap<String, HostOptions>,
    pub links: Vec<LinkOptions>,
}

impl ConfigOptions {
    pub fn new(config_file: ConfigFileOptions, options: CliOptions) -> Self {
        // command line options take precedence over the file
        let general = options.general.with_defaults(config_file.general);

        Self {
            general,
            protocols: config_file.protocols,
            hosts: config_file.hosts,
            links: config_file.links,
        }
    }
}

/// Help messages used by Clap for command line arguments, combining the doc string with
/// the Serde default.
static GENERAL_HELP: Lazy<std::collections::HashMap<String, String>> =
    Lazy::new(|| generate_help_strs(schema_for!(GeneralOptions)));

// these must all be Option types since they aren't required by the CLI, even if they're
// required in the configuration file
#[derive(Debug, Clone, Parser, Serialize, Deserialize, Merge, JsonSchema)]
#[clap(next_help_heading = "GENERAL (Override configuration file options)")]
#[serde(deny_unknown_fields)]
pub struct GeneralOptions {
    /// The simulated time at which the simulation ends
    #[clap(long, value_name = "seconds")]
    #[clap(help = GENERAL_HELP.get("stop_time").unwrap().as_str())]
    pub stop_time: Option<Time>,

    /// Initialize randomness using seed N
    #[clap(long, value_name = "N")]
    #[clap(help = GENERAL_HELP.get("seed").unwrap().as_str())]
    #[serde(default = "default_some_1")]
    pub seed: Option<u64>,

    /// Log level of output written on stdout. If the simulator was built in release mode, then
    /// log messages at level 'trace' will always be dropped
    #[clap(long, short = 'l', value_name = "level")]
    #[clap(help = GENERAL_HELP.get("log_level").unwrap().as_str())]
    #[serde(default = "default_some_info")]
    pub log_level: Option<LogLevel>,

    /// Interval of simulated time at which to log heartbeat messages
    #[clap(long, value_name = "seconds")]
    #[clap(help = GENERAL_HELP.get("heartbeat_interval").unwrap().as_str())]
    #[serde(default = "default_some_time_10")]
    pub heartbeat_interval: Option<Time>,

    /// Pace the simulation against the wall clock, at this many simulated seconds per wall-clock
    /// second. The simulation runs as fast as possible if unset
    #[clap(long, value_name = "factor")]
    #[clap(help = GENERAL_HELP.get("time_multiplier").unwrap().as_str())]
    #[serde(default)]
    pub time_multiplier: Option<f64>,
}

impl GeneralOptions {
    /// Replace unset (`None`) values of `base` with values from `default`.
    pub fn with_defaults(mut self, default: Self) -> Self {
        self.merge(default);
        self
    }
}

#[derive(Debug, Copy, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum LogLevel {
    Error,
    Warning,
    Info,
    Debug,
    Trace,
}

impl FromStr for LogLevel {
    type Err = serde_yaml::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_yaml::from_str(s)
    }
}

impl From<LogLevel> for log::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => log::Level::Error,
            LogLevel::Warning => log::Level::Warn,
            LogLevel::Info => log::Level::Info,
            LogLevel::Debug => log::Level::Debug,
            LogLevel::Trace => log::Level::Trace,
        }
    }
}

/// Protocol timers and defaults that apply to every host.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProtocolOptions {
    pub link: LinkDefaults,
    pub arp: ArpOptions,
    pub dhcp: DhcpOptions,
    pub switching: SwitchingOptions,
    pub hsrp: HsrpOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LinkDefaults {
    /// Propagation delay of links that don't set their own
    pub delay: Time,
    /// How long interface speed and duplex negotiation takes
    pub negotiation_delay: Time,
}

impl Default for LinkDefaults {
    fn default() -> Self {
        Self {
            delay: Time::from_millis(1),
            negotiation_delay: Time::from_millis(10),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ArpOptions {
    pub entry_timeout: Time,
    pub request_timeout: Time,
    pub retries: u32,
    pub sweep_interval: Time,
}

impl Default for ArpOptions {
    fn default() -> Self {
        Self {
            entry_timeout: Time::from_secs(300),
            request_timeout: Time::from_secs(1),
            retries: 3,
            sweep_interval: Time::from_secs(10),
        }
    }
}

impl From<&ArpOptions> for ArpConfig {
    fn from(options: &ArpOptions) -> Self {
        Self {
            entry_timeout: options.entry_timeout.into(),
            request_timeout: options.request_timeout.into(),
            retries: options.retries,
            sweep_interval: options.sweep_interval.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DhcpOptions {
    /// How long an offered address is held for the client
    pub offer_hold: Time,
    pub lease_time: Time,
    /// How long a client waits for a lease
    pub client_timeout: Time,
}

impl Default for DhcpOptions {
    fn default() -> Self {
        Self {
            offer_hold: Time::from_secs(30),
            lease_time: Time::from_secs(86400),
            client_timeout: Time::from_secs(10),
        }
    }
}

impl From<&DhcpOptions> for DhcpServerConfig {
    fn from(options: &DhcpOptions) -> Self {
        Self {
            offer_hold: options.offer_hold.into(),
            lease_time: options.lease_time.into(),
        }
    }
}

impl From<&DhcpOptions> for DhcpClientConfig {
    fn from(options: &DhcpOptions) -> Self {
        Self {
            timeout: options.client_timeout.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SwitchingOptions {
    pub aging_time: Time,
    pub sweep_interval: Time,
    pub vlan_aware: bool,
}

impl Default for SwitchingOptions {
    fn default() -> Self {
        Self {
            aging_time: Time::from_secs(300),
            sweep_interval: Time::from_secs(10),
            vlan_aware: true,
        }
    }
}

impl From<&SwitchingOptions> for SwitchingConfig {
    fn from(options: &SwitchingOptions) -> Self {
        Self {
            aging_time: options.aging_time.into(),
            sweep_interval: options.sweep_interval.into(),
            vlan_aware: options.vlan_aware,
        }
    }
}

/// Defaults for the HSRP groups configured on interfaces.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HsrpOptions {
    pub hello_time: Time,
    pub hold_time: Time,
    pub priority: u8,
    pub preempt: bool,
    pub auth: String,
}

impl Default for HsrpOptions {
    fn default() -> Self {
        Self {
            hello_time: Time::from_secs(3),
            hold_time: Time::from_secs(10),
            priority: 100,
            preempt: false,
            auth: "cisco".to_string(),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceKind {
    Arp,
    DhcpClient,
    DhcpServer,
    Switching,
    Hsrp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostOptions {
    pub role: HostRole,

    #[serde(default)]
    pub default_gateway: Option<Ipv4Address>,

    /// Services are enabled in the order given, which is the order they see packets in
    #[serde(default)]
    pub services: Vec<ServiceKind>,

    #[serde(default)]
    pub interfaces: Vec<InterfaceConfig>,

    /// Address pools, if this host runs a DHCP server
    #[serde(default)]
    pub dhcp_pools: Vec<PoolOptions>,

    /// Where a DHCP server forwards requests it has no pool for
    #[serde(default)]
    pub dhcp_forwarder: Option<Ipv4Address>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InterfaceConfig {
    pub name: String,

    /// A random locally-administered address is generated if unset
    #[serde(default)]
    pub mac: Option<crate::network::address::MacAddress>,

    /// Address and prefix length, for example "10.0.0.1/24". Without a prefix length the
    /// classful mask is used
    #[serde(default)]
    pub address: Option<String>,

    /// The fastest speed the interface supports
    #[serde(default)]
    pub max_speed: Option<Speed>,

    #[serde(default = "default_true")]
    pub full_duplex: bool,

    #[serde(default = "default_true")]
    pub admin_up: bool,

    /// Obtain an address with DHCP once the simulation starts
    #[serde(default)]
    pub dhcp: bool,

    /// The VLAN mode of a switch port, as `{access: 10}` or `{trunk: {allowed: all, native: 1}}`
    #[serde(default, with = "serde_yaml::with::singleton_map_recursive")]
    pub mode: Option<PortMode>,

    #[serde(default)]
    pub hsrp: Vec<HsrpGroupOptions>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HsrpGroupOptions {
    pub group: u8,
    #[serde(default)]
    pub virtual_ip: Option<Ipv4Address>,
    #[serde(default)]
    pub priority: Option<u8>,
    #[serde(default)]
    pub preempt: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoolOptions {
    pub gateway: Ipv4Address,
    pub mask: Ipv4Address,
    pub start: Ipv4Address,
    pub end: Ipv4Address,
    #[serde(default)]
    pub exclude: Vec<Ipv4Address>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LinkOptions {
    /// The two ends, as "host:interface"
    pub ends: [String; 2],
    #[serde(default)]
    pub delay: Option<Time>,
    /// Overrides the negotiated interface speed for transmission delays
    #[serde(default)]
    pub bandwidth: Option<Bandwidth>,
    /// How an inter-switch link carries VLANs, as `all-vlans` or `{fixed: 10}`
    #[serde(default, with = "serde_yaml::with::singleton_map_recursive")]
    pub trunk: Option<TrunkMode>,
}

/// Parse "a.b.c.d/len" or "a.b.c.d" (with the classful mask).
pub fn parse_interface_address(s: &str) -> Result<(Ipv4Address, Ipv4Address), String> {
    let (ip, mask) = match s.split_once('/') {
        Some((ip, len)) => {
            let ip: Ipv4Address = ip.trim().parse().map_err(|e| format!("{e}"))?;
            let len: u32 = len
                .trim()
                .parse()
                .map_err(|_| format!("Invalid prefix length in '{s}'"))?;
            let mask = Ipv4Address::mask_from_prefix(len).map_err(|e| format!("{e}"))?;
            (ip, mask)
        }
        None => {
            let ip: Ipv4Address = s.trim().parse().map_err(|e| format!("{e}"))?;
            (ip, ip.classful_mask())
        }
    };
    Ok((ip, mask))
}

/// Generate help strings for objects in a JSON schema, including the Serde defaults if available.
fn generate_help_strs(
    schema: schemars::schema::RootSchema,
) -> std::collections::HashMap<String, String> {
    let mut defaults = std::collections::HashMap::<String, String>::new();
    for (name, obj) in &schema.schema.object.as_ref().unwrap().properties {
        if let Some(meta) = obj.clone().into_object().metadata {
            let description = meta.description.unwrap_or_default();
            let space = if !description.is_empty() { " " } else { "" };
            match meta.default {
                Some(default) => defaults.insert(
                    name.clone(),
                    format!("{}{}[default: {}]", description, space, default),
                ),
                None => defaults.insert(name.clone(), description.to_string()),
            };
        }
    }
    defaults
}

fn default_true() -> bool {
    true
}

fn default_some_1() -> Option<u64> {
    Some(1)
}

fn default_some_info() -> Option<LogLevel> {
    Some(LogLevel::Info)
}

fn default_some_time_10() -> Option<Time> {
    Some(Time::from_secs(10))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::support::simulation_time::SimulationTime;
    use crate::host::services::switching::TrunkVlans;

    fn secs(time: Option<Time>) -> SimulationTime {
        time.unwrap().into()
    }

    const CONFIG: &str = r#"
general:
  stop_time: 2 min
  seed: 7
protocols:
  arp:
    request_timeout: 500 ms
hosts:
  pc1:
    role: computer
    services: [arp, dhcp-client]
    interfaces:
      - name: eth0
        dhcp: true
  sw:
    role: switch
    services: [switching]
    interfaces:
      - name: fa0/1
        mode: {access: 10}
      - name: fa0/2
        mode: {trunk: {allowed: all, native: 1}}
links:
  - ends: ["pc1:eth0", "sw:fa0/1"]
    delay: 2 ms
"#;

    #[test]
    fn test_parse_config_file() {
        let file = ConfigFileOptions::from_str(CONFIG).unwrap();
        assert_eq!(secs(file.general.stop_time), SimulationTime::from_secs(120));
        assert_eq!(file.general.seed, Some(7));
        assert_eq!(secs(file.general.heartbeat_interval), SimulationTime::from_secs(10));
        assert_eq!(
            SimulationTime::from(file.protocols.arp.request_timeout),
            SimulationTime::from_millis(500)
        );
        assert_eq!(file.protocols.arp.retries, 3);

        let pc = &file.hosts["pc1"];
        assert_eq!(pc.role, HostRole::Computer);
        assert_eq!(pc.services, vec![ServiceKind::Arp, ServiceKind::DhcpClient]);
        assert!(pc.interfaces[0].dhcp);
        assert!(pc.interfaces[0].admin_up);

        let sw = &file.hosts["sw"];
        assert_eq!(sw.interfaces[0].mode, Some(PortMode::Access(10)));
        assert_eq!(sw.interfaces[1].mode, Some(PortMode::trunk_all()));
        assert_eq!(secs(file.links[0].delay), SimulationTime::from_millis(2));
    }

    #[test]
    fn test_vlan_modes_in_map_form() {
        let config = CONFIG
            .replace(
                "mode: {trunk: {allowed: all, native: 1}}",
                "mode: {trunk: {allowed: {only: [10, 20]}, native: 20}}",
            )
            .replace("delay: 2 ms", "delay: 2 ms\n  - ends: [\"sw:fa0/3\", \"sw2:fa0/1\"]\n    trunk: {fixed: 30}\n  - ends: [\"sw:fa0/4\", \"sw2:fa0/2\"]\n    trunk: all-vlans");
        let file = ConfigFileOptions::from_str(&config).unwrap();

        let sw = &file.hosts["sw"];
        assert_eq!(
            sw.interfaces[1].mode,
            Some(PortMode::Trunk {
                allowed: TrunkVlans::Only([10, 20].into_iter().collect()),
                native: 20,
            })
        );
        assert_eq!(file.links[0].trunk, None);
        assert_eq!(file.links[1].trunk, Some(TrunkMode::Fixed(30)));
        assert_eq!(file.links[2].trunk, Some(TrunkMode::AllVlans));

        // the written form can be read back
        let written = serde_yaml::to_string(&file).unwrap();
        let reread = ConfigFileOptions::from_str(&written).unwrap();
        assert_eq!(reread.hosts["sw"].interfaces[1].mode, sw.interfaces[1].mode);
        assert_eq!(reread.links[1].trunk, Some(TrunkMode::Fixed(30)));
    }

    #[test]
    fn test_unknown_fields_are_rejected() {
        let config = CONFIG.replace("seed: 7", "seed: 7\n  colour: blue");
        assert!(ConfigFileOptions::from_str(&config).is_err());
    }

    #[test]
    fn test_cli_overrides_file() {
        let file = ConfigFileOptions::from_str(CONFIG).unwrap();
        let cli = CliOptions::try_parse_from(["netsim", "config.yaml", "--seed", "9", "-l", "debug"])
            .unwrap();
        let config = ConfigOptions::new(file, cli);
        assert_eq!(config.general.seed, Some(9));
        assert!(matches!(config.general.log_level, Some(LogLevel::Debug)));
        assert_eq!(secs(config.general.stop_time), SimulationTime::from_secs(120));
    }

    #[test]
    fn test_interface_address() {
        let (ip, mask) = parse_interface_address("10.1.2.3/24").unwrap();
        assert_eq!(ip, Ipv4Address::new(10, 1, 2, 3));
        assert_eq!(mask, Ipv4Address::new(255, 255, 255, 0));

        let (_, mask) = parse_interface_address("172.16.0.1").unwrap();
        assert_eq!(mask, Ipv4Address::new(255, 255, 0, 0));

        assert!(parse_interface_address("10.1.2.3/40").is_err());
        assert!(parse_interface_address("10.1.2/24").is_err());
    }

    #[test]
    fn test_help_strings() {
        assert_eq!(
            GENERAL_HELP.get("seed").unwrap(),
            "Initialize randomness using seed N [default: 1]"
        );
    }
}
