//! Which services start when
//!
//! Default services are started eagerly at boot. Every other service marked
//! `AUTOSTART=YES` is started lazily, on the first connection to one of its
//! addresses.

use std::collections::BTreeSet;

use crate::activation::ActivationManager;
use crate::config::{resolve_addresses, ArmConfig, ServiceConfig, ARM_SECTION};
use crate::launcher::ServiceLauncher;

/// Services named in `[arm] DEFAULTSERVICES`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DefaultServices(BTreeSet<String>);

impl DefaultServices {
    /// Parse a space separated service list
    pub fn parse(list: &str) -> Self {
        Self(list.split_whitespace().map(str::to_lowercase).collect())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains(&name.to_lowercase())
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Read-only view over the configured services
pub struct Registry<'a> {
    config: &'a ArmConfig,
    defaults: DefaultServices,
}

impl<'a> Registry<'a> {
    pub fn new(config: &'a ArmConfig) -> Self {
        Self {
            config,
            defaults: DefaultServices::parse(&config.default_services),
        }
    }

    pub fn defaults(&self) -> &DefaultServices {
        &self.defaults
    }

    /// Services started on first connection
    pub fn lazy_services(&self) -> impl Iterator<Item = &'a ServiceConfig> + '_ {
        self.config
            .services
            .values()
            .filter(move |svc| is_lazy(svc, &self.defaults))
    }

    /// Hand every lazily started service to the activation engine.
    ///
    /// A service whose addresses cannot be resolved is skipped with an
    /// error. Returns the number of listening sockets created.
    pub fn configure<L: ServiceLauncher>(&self, manager: &mut ActivationManager<L>) -> usize {
        let mut monitored = 0;
        for svc in self.lazy_services() {
            match resolve_addresses(svc) {
                Ok(addresses) => {
                    monitored += manager.configure(&svc.name, &addresses, true, svc.strategy())
                }
                Err(e) => log::error!("{}", e),
            }
        }
        monitored
    }
}

fn is_lazy(svc: &ServiceConfig, defaults: &DefaultServices) -> bool {
    svc.autostart && svc.name != ARM_SECTION && !defaults.contains(&svc.name)
}
