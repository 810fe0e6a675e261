//! Plugin registry
//!
//! Turns a [`RelayConfig`] into the fully constructed bundle the manager
//! consumes: one device proxy, one host proxy, and the configured filters
//! and injectors. Filter and injector kinds ship built in; proxy backends
//! are registered by the embedding application, since the relay core itself
//! carries no USB transport.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use model::{DeviceProxy, HostProxy};
use tracing::debug;

use crate::config::RelayConfig;
use crate::filter::{LoggingFilter, PacketFilter, Rot13Filter};
use crate::inject::{Injector, PeriodicInjector};

/// Constructor for a device-side proxy backend
pub type DeviceProxyBuilder =
    Box<dyn Fn(&toml::Table) -> Result<Arc<dyn DeviceProxy>> + Send + Sync>;
/// Constructor for a host-side proxy backend
pub type HostProxyBuilder = Box<dyn Fn(&toml::Table) -> Result<Arc<dyn HostProxy>> + Send + Sync>;
/// Constructor for a filter kind
pub type FilterBuilder = Box<dyn Fn(&toml::Table) -> Result<Arc<dyn PacketFilter>> + Send + Sync>;
/// Constructor for an injector kind
pub type InjectorBuilder = Box<dyn Fn(&toml::Table) -> Result<Arc<dyn Injector>> + Send + Sync>;

/// The fully constructed bundle handed to `Manager::load_plugins`
pub struct PluginSet {
    pub device_proxy: Arc<dyn DeviceProxy>,
    pub host_proxy: Arc<dyn HostProxy>,
    pub filters: Vec<Arc<dyn PacketFilter>>,
    pub injectors: Vec<Arc<dyn Injector>>,
}

/// Named constructors for proxies, filters, and injectors
pub struct PluginRegistry {
    device_proxies: HashMap<String, DeviceProxyBuilder>,
    host_proxies: HashMap<String, HostProxyBuilder>,
    filters: HashMap<String, FilterBuilder>,
    injectors: HashMap<String, InjectorBuilder>,
}

impl PluginRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self {
            device_proxies: HashMap::new(),
            host_proxies: HashMap::new(),
            filters: HashMap::new(),
            injectors: HashMap::new(),
        }
    }

    /// A registry preloaded with the built-in filter and injector kinds:
    /// `log`, `rot13`, and `periodic`
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();

        registry.register_filter(
            "log",
            Box::new(|params| Ok(Arc::new(LoggingFilter::new(param_endpoint(params)?)))),
        );
        registry.register_filter(
            "rot13",
            Box::new(|params| Ok(Arc::new(Rot13Filter::new(param_endpoint(params)?)))),
        );
        registry.register_injector(
            "periodic",
            Box::new(|params| {
                let endpoint = param_endpoint(params)?
                    .ok_or_else(|| anyhow!("periodic injector requires an 'endpoint'"))?;
                let interval_ms = match params.get("interval_ms") {
                    Some(value) => value
                        .as_integer()
                        .filter(|ms| *ms > 0)
                        .ok_or_else(|| anyhow!("'interval_ms' must be a positive integer"))?
                        as u64,
                    None => 1000,
                };
                let payload = param_payload(params)?;
                Ok(Arc::new(PeriodicInjector::new(
                    endpoint,
                    payload,
                    Duration::from_millis(interval_ms),
                )))
            }),
        );

        registry
    }

    pub fn register_device_proxy(&mut self, kind: &str, builder: DeviceProxyBuilder) {
        self.device_proxies.insert(kind.to_string(), builder);
    }

    pub fn register_host_proxy(&mut self, kind: &str, builder: HostProxyBuilder) {
        self.host_proxies.insert(kind.to_string(), builder);
    }

    pub fn register_filter(&mut self, kind: &str, builder: FilterBuilder) {
        self.filters.insert(kind.to_string(), builder);
    }

    pub fn register_injector(&mut self, kind: &str, builder: InjectorBuilder) {
        self.injectors.insert(kind.to_string(), builder);
    }

    /// Construct everything the configuration names
    pub fn build(&self, config: &RelayConfig) -> Result<PluginSet> {
        let builder = self
            .device_proxies
            .get(&config.device_proxy.kind)
            .ok_or_else(|| anyhow!("unknown device proxy kind '{}'", config.device_proxy.kind))?;
        let device_proxy = builder(&config.device_proxy.params)
            .with_context(|| format!("device proxy '{}'", config.device_proxy.kind))?;

        let builder = self
            .host_proxies
            .get(&config.host_proxy.kind)
            .ok_or_else(|| anyhow!("unknown host proxy kind '{}'", config.host_proxy.kind))?;
        let host_proxy = builder(&config.host_proxy.params)
            .with_context(|| format!("host proxy '{}'", config.host_proxy.kind))?;

        let mut filters = Vec::with_capacity(config.filters.len());
        for selection in &config.filters {
            let builder = self
                .filters
                .get(&selection.kind)
                .ok_or_else(|| anyhow!("unknown filter kind '{}'", selection.kind))?;
            filters.push(
                builder(&selection.params)
                    .with_context(|| format!("filter '{}'", selection.kind))?,
            );
            debug!("built filter '{}'", selection.kind);
        }

        let mut injectors = Vec::with_capacity(config.injectors.len());
        for selection in &config.injectors {
            let builder = self
                .injectors
                .get(&selection.kind)
                .ok_or_else(|| anyhow!("unknown injector kind '{}'", selection.kind))?;
            injectors.push(
                builder(&selection.params)
                    .with_context(|| format!("injector '{}'", selection.kind))?,
            );
            debug!("built injector '{}'", selection.kind);
        }

        Ok(PluginSet {
            device_proxy,
            host_proxy,
            filters,
            injectors,
        })
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

/// Optional `endpoint` parameter, an address 0..=255
fn param_endpoint(params: &toml::Table) -> Result<Option<u8>> {
    match params.get("endpoint") {
        Some(value) => {
            let address = value
                .as_integer()
                .filter(|addr| (0..=0xff).contains(addr))
                .ok_or_else(|| anyhow!("'endpoint' must be an integer in 0..=255"))?;
            Ok(Some(address as u8))
        }
        None => Ok(None),
    }
}

/// Optional `payload` parameter, an array of byte values
fn param_payload(params: &toml::Table) -> Result<Vec<u8>> {
    match params.get("payload") {
        Some(value) => {
            let array = value
                .as_array()
                .ok_or_else(|| anyhow!("'payload' must be an array of bytes"))?;
            array
                .iter()
                .map(|entry| {
                    entry
                        .as_integer()
                        .filter(|byte| (0..=0xff).contains(byte))
                        .map(|byte| byte as u8)
                        .ok_or_else(|| anyhow!("'payload' entries must be bytes"))
                })
                .collect()
        }
        None => Ok(Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PluginSelection, ProxySelection, RelaySettings};
    use crate::testing::{MockDeviceProxy, MockHostProxy};

    fn test_config() -> RelayConfig {
        RelayConfig {
            relay: RelaySettings {
                log_level: "info".to_string(),
            },
            device_proxy: ProxySelection {
                kind: "mock".to_string(),
                params: toml::Table::new(),
            },
            host_proxy: ProxySelection {
                kind: "mock".to_string(),
                params: toml::Table::new(),
            },
            filters: Vec::new(),
            injectors: Vec::new(),
        }
    }

    fn test_registry() -> PluginRegistry {
        let mut registry = PluginRegistry::with_builtins();
        registry.register_device_proxy(
            "mock",
            Box::new(|_| Ok(Arc::new(MockDeviceProxy::default_device()))),
        );
        registry.register_host_proxy("mock", Box::new(|_| Ok(Arc::new(MockHostProxy::new()))));
        registry
    }

    #[test]
    fn test_build_with_builtin_filters() {
        let mut config = test_config();
        let mut params = toml::Table::new();
        params.insert("endpoint".to_string(), toml::Value::Integer(0x81));
        config.filters.push(PluginSelection {
            kind: "rot13".to_string(),
            params,
        });
        config.filters.push(PluginSelection {
            kind: "log".to_string(),
            params: toml::Table::new(),
        });

        let plugins = test_registry().build(&config).expect("build");
        assert_eq!(plugins.filters.len(), 2);
        assert!(plugins.injectors.is_empty());
    }

    #[test]
    fn test_build_rejects_unknown_kinds() {
        let mut config = test_config();
        config.filters.push(PluginSelection {
            kind: "does-not-exist".to_string(),
            params: toml::Table::new(),
        });
        assert!(test_registry().build(&config).is_err());
    }

    #[test]
    fn test_periodic_injector_requires_endpoint() {
        let mut config = test_config();
        config.injectors.push(PluginSelection {
            kind: "periodic".to_string(),
            params: toml::Table::new(),
        });
        assert!(test_registry().build(&config).is_err());
    }

    #[test]
    fn test_endpoint_param_bounds() {
        let mut params = toml::Table::new();
        params.insert("endpoint".to_string(), toml::Value::Integer(0x200));
        assert!(param_endpoint(&params).is_err());

        params.insert("endpoint".to_string(), toml::Value::Integer(0x81));
        assert_eq!(param_endpoint(&params).unwrap(), Some(0x81));
    }
}
