//! Node configuration
//!
//! Turns the parsed INI file into the typed settings the activation engine
//! consumes: the `[arm]` section plus one [`ServiceConfig`] per service section.

mod addresses;
mod parser;

pub use addresses::{ipv6_available, resolve_addresses, AddressError, ListenAddress};
pub use parser::{
    parse_config_file, parse_duration, parse_file, parse_yesno, ParseError, ParsedFile,
    ParsedSection,
};

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::activation::ActivationStrategy;

/// Section holding the supervisor's own settings
pub const ARM_SECTION: &str = "arm";

/// How long a relay waits for a freshly launched backend by default
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Typed view of the whole configuration file
#[derive(Debug, Clone, Default)]
pub struct ArmConfig {
    /// File the configuration was loaded from (passed to services via `-c`)
    pub path: Option<PathBuf>,
    /// Raw `DEFAULTSERVICES` value (space separated)
    pub default_services: String,
    /// Command prefix for every service (`GLOBAL_PREFIX`)
    pub global_prefix: String,
    /// Readiness probe deadline for relayed activations (`PROBE_TIMEOUT`)
    pub probe_timeout: Duration,
    /// Control socket path (`[arm] UNIXPATH`)
    pub control_path: Option<PathBuf>,
    /// Service sections by lowercased name
    pub services: BTreeMap<String, ServiceConfig>,
}

/// Settings of a single service section
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServiceConfig {
    pub name: String,
    /// Start lazily on first connection (`AUTOSTART=YES`)
    pub autostart: bool,
    pub port: Option<u16>,
    /// Host name or address to bind to (`BINDTO`)
    pub bind_to: Option<String>,
    pub unix_path: Option<PathBuf>,
    pub disable_v6: bool,
    /// Hand listening sockets to the child (cleared by `DISABLE_SOCKET_FORWARDING=YES`)
    pub socket_forwarding: bool,
    pub binary: Option<String>,
    /// Configuration file for the service, defaults to the supervisor's
    pub config: Option<PathBuf>,
    /// Per-service command prefix, overrides `GLOBAL_PREFIX`
    pub prefix: Option<String>,
    pub options: String,
    pub debug: bool,
}

impl ServiceConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            socket_forwarding: true,
            ..Self::default()
        }
    }

    /// Build a service from its parsed section
    pub fn from_section(name: &str, section: &ParsedSection) -> Result<Self, ParseError> {
        let mut svc = Self::new(name);

        if let Some(v) = get_bool(name, section, "AUTOSTART")? {
            svc.autostart = v;
        }
        if let Some(v) = section.get("PORT") {
            let port = v
                .trim()
                .parse::<u16>()
                .map_err(|_| ParseError::invalid(name, "PORT", v))?;
            svc.port = Some(port);
        }
        svc.bind_to = non_empty(section.get("BINDTO"));
        svc.unix_path = non_empty(section.get("UNIXPATH")).map(PathBuf::from);
        if let Some(v) = get_bool(name, section, "DISABLEV6")? {
            svc.disable_v6 = v;
        }
        if let Some(v) = get_bool(name, section, "DISABLE_SOCKET_FORWARDING")? {
            svc.socket_forwarding = !v;
        }
        svc.binary = non_empty(section.get("BINARY"));
        svc.config = non_empty(section.get("CONFIG")).map(PathBuf::from);
        svc.prefix = section.get("PREFIX").cloned();
        if let Some(v) = section.get("OPTIONS") {
            svc.options = v.clone();
        }
        if let Some(v) = get_bool(name, section, "DEBUG")? {
            svc.debug = v;
        }

        Ok(svc)
    }

    /// Which activation strategy this service uses
    pub fn strategy(&self) -> ActivationStrategy {
        if self.socket_forwarding {
            ActivationStrategy::Handoff
        } else {
            ActivationStrategy::Relay
        }
    }
}

impl ArmConfig {
    /// Load and convert a configuration file
    pub async fn load(path: &Path) -> Result<Self, ParseError> {
        let parsed = parse_config_file(path).await?;
        let mut config = Self::from_parsed(&parsed)?;
        config.path = Some(path.to_path_buf());
        Ok(config)
    }

    /// Convert parsed INI data into typed settings.
    ///
    /// A malformed `[arm]` section is an error. A malformed service section
    /// only drops that service.
    pub fn from_parsed(parsed: &ParsedFile) -> Result<Self, ParseError> {
        let mut config = Self {
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            ..Self::default()
        };

        if let Some(arm) = parsed.get(ARM_SECTION) {
            if let Some(v) = arm.get("DEFAULTSERVICES") {
                config.default_services = v.clone();
            }
            if let Some(v) = arm.get("GLOBAL_PREFIX") {
                config.global_prefix = v.clone();
            }
            if let Some(v) = arm.get("PROBE_TIMEOUT") {
                config.probe_timeout = parse_duration(v)
                    .ok_or_else(|| ParseError::invalid(ARM_SECTION, "PROBE_TIMEOUT", v))?;
            }
            config.control_path = non_empty(arm.get("UNIXPATH")).map(PathBuf::from);
        }

        for (name, section) in parsed {
            if name == ARM_SECTION {
                continue;
            }
            match ServiceConfig::from_section(name, section) {
                Ok(svc) => {
                    config.services.insert(name.clone(), svc);
                }
                Err(e) => log::warn!("{}: ignoring service section: {}", name, e),
            }
        }

        Ok(config)
    }

    /// Look up a service section by name
    pub fn service(&self, name: &str) -> Option<&ServiceConfig> {
        self.services.get(&name.to_lowercase())
    }
}

fn get_bool(section: &str, entries: &ParsedSection, key: &str) -> Result<Option<bool>, ParseError> {
    match entries.get(key) {
        Some(v) => parse_yesno(v)
            .map(Some)
            .ok_or_else(|| ParseError::invalid(section, key, v)),
        None => Ok(None),
    }
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value.map(|v| v.trim()).filter(|v| !v.is_empty()).map(str::to_string)
}
