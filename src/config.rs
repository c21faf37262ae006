use crate::error::{Error, Result};
use pnet::util::MacAddr;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// What the packet builder does with tuples that are neither TCP nor UDP
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum OtherProtocols {
    /// Emit the IPv4 header with the tuple protocol and a zero payload
    #[default]
    RawIp,
    /// Skip the tuple
    Drop,
}

// Raw TOML sections. Every key is optional and falls back to the built-in default.

#[derive(Deserialize, Debug)]
#[serde(default, deny_unknown_fields)]
struct FrameToml {
    src_mac: String,
    dst_mac: String,
    ttl: u8,
    tcp_sequence: u32,
    tcp_window: u16,
    tcp_flags: u8,
    other_protocols: OtherProtocols,
}

impl Default for FrameToml {
    fn default() -> Self {
        FrameToml {
            src_mac: "00:00:00:00:00:01".into(),
            dst_mac: "00:00:00:00:00:02".into(),
            ttl: 64,
            tcp_sequence: 1,
            tcp_window: 8192,
            tcp_flags: 0x02, // SYN
            other_protocols: OtherProtocols::RawIp,
        }
    }
}

#[derive(Deserialize, Debug)]
#[serde(default, deny_unknown_fields)]
struct EngineToml {
    batch_size: usize,
    first_core: usize,
    pin_threads: bool,
}

impl Default for EngineToml {
    fn default() -> Self {
        EngineToml {
            batch_size: 64,
            first_core: 1, // leave core 0 to interrupts
            pin_threads: true,
        }
    }
}

#[derive(Deserialize, Debug)]
#[serde(default, deny_unknown_fields)]
struct LifecycleToml {
    poll_interval: String,
    silence_timeout: String,
    report_interval: String,
}

impl Default for LifecycleToml {
    fn default() -> Self {
        LifecycleToml {
            poll_interval: "1ms".into(),
            silence_timeout: "2s".into(),
            report_interval: "1s".into(),
        }
    }
}

#[derive(Deserialize, Debug)]
#[serde(default, deny_unknown_fields)]
struct CounterToml {
    cardinality: usize,
    block_size: usize,
}

impl Default for CounterToml {
    fn default() -> Self {
        CounterToml {
            cardinality: 4096,
            block_size: 4096,
        }
    }
}

#[derive(Deserialize, Debug, Default)]
#[serde(default, deny_unknown_fields)]
struct ProfileToml {
    frame: FrameToml,
    engine: EngineToml,
    lifecycle: LifecycleToml,
    counter: CounterToml,
}

// Validated configuration

/// Static header values of the generated frames.
///
/// The checksums are left to zero and the TCP sequence number is constant: the generated
/// traffic is experiment traffic, not a conforming TCP/IP stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameConfig {
    pub src_mac: MacAddr,
    pub dst_mac: MacAddr,
    pub ttl: u8,
    pub tcp_sequence: u32,
    pub tcp_window: u16,
    pub tcp_flags: u8,
    pub other_protocols: OtherProtocols,
}

impl Default for FrameConfig {
    fn default() -> Self {
        FrameToml::default()
            .validate()
            .expect("default frame configuration is valid")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub batch_size: usize,
    pub first_core: usize,
    pub pin_threads: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleConfig {
    pub poll_interval: Duration,
    pub silence_timeout: Duration,
    /// Interval between two throughput logs while traffic is flowing. Zero disables them.
    pub report_interval: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterConfig {
    pub cardinality: usize,
    pub block_size: usize,
}

/// The whole run profile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    pub frame: FrameConfig,
    pub engine: EngineConfig,
    pub lifecycle: LifecycleConfig,
    pub counter: CounterConfig,
}

impl Default for Profile {
    fn default() -> Self {
        ProfileToml::default()
            .validate()
            .expect("default profile is valid")
    }
}

fn parse_mac(field: &str, s: &str) -> Result<MacAddr> {
    s.parse()
        .map_err(|_| Error::Config(format!("{field}: cannot parse \"{s}\" as a MAC address")))
}

fn parse_duration(field: &str, s: &str) -> Result<Duration> {
    humantime::parse_duration(s)
        .map_err(|e| Error::Config(format!("{field}: cannot parse \"{s}\" as a duration ({e})")))
}

impl FrameToml {
    fn validate(self) -> Result<FrameConfig> {
        Ok(FrameConfig {
            src_mac: parse_mac("frame.src_mac", &self.src_mac)?,
            dst_mac: parse_mac("frame.dst_mac", &self.dst_mac)?,
            ttl: self.ttl,
            tcp_sequence: self.tcp_sequence,
            tcp_window: self.tcp_window,
            tcp_flags: self.tcp_flags,
            other_protocols: self.other_protocols,
        })
    }
}

impl ProfileToml {
    fn validate(self) -> Result<Profile> {
        if self.engine.batch_size == 0 {
            return Err(Error::Config("engine.batch_size must be positive".into()));
        }
        let poll_interval = parse_duration("lifecycle.poll_interval", &self.lifecycle.poll_interval)?;
        if poll_interval.is_zero() {
            return Err(Error::Config("lifecycle.poll_interval must be positive".into()));
        }
        if !self.counter.cardinality.is_power_of_two() {
            return Err(Error::Config(format!(
                "counter.cardinality must be a power of two, not {}",
                self.counter.cardinality
            )));
        }
        Ok(Profile {
            frame: self.frame.validate()?,
            engine: EngineConfig {
                batch_size: self.engine.batch_size,
                first_core: self.engine.first_core,
                pin_threads: self.engine.pin_threads,
            },
            lifecycle: LifecycleConfig {
                poll_interval,
                silence_timeout: parse_duration(
                    "lifecycle.silence_timeout",
                    &self.lifecycle.silence_timeout,
                )?,
                report_interval: parse_duration(
                    "lifecycle.report_interval",
                    &self.lifecycle.report_interval,
                )?,
            },
            counter: CounterConfig {
                cardinality: self.counter.cardinality,
                block_size: self.counter.block_size,
            },
        })
    }
}

/// Parse a TOML profile. Missing keys keep their default value.
pub fn import_profile(profile: &str) -> Result<Profile> {
    let raw: ProfileToml = toml::from_str(profile)
        .map_err(|e| Error::Config(format!("ill-formed profile: {e}")))?;
    log::trace!("Profile: {raw:?}");
    raw.validate()
}

/// Load the profile file if any, otherwise use the defaults
pub fn load_profile(path: Option<&Path>) -> Result<Profile> {
    match path {
        Some(path) => {
            let content = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
            let profile = import_profile(&content)?;
            log::info!("Profile {} loaded", path.display());
            Ok(profile)
        }
        None => Ok(Profile::default()),
    }
}
