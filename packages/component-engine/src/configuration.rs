//! Configuration instances consumed by components.
//!
//! A component that requires configuration gets one
//! [`ConfigurationInstance`] per invocation from its
//! [`ConfigurationProvider`]. Static providers always return the same
//! instance; dynamic providers derive it from the event and cache one
//! instance per distinct key.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::debug;

use crate::connection::ConnectionProvider;
use crate::event::Event;

/// Reconnection policy for invocations that fail with a connection error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, delay: Duration) -> Self {
        Self { max_retries, delay }
    }

    /// Never retry.
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }

    pub fn is_enabled(&self) -> bool {
        self.max_retries > 0
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

/// Invocation counters for one configuration instance.
#[derive(Debug, Default)]
pub struct ConfigurationStats {
    inflight: AtomicUsize,
    completed: AtomicU64,
}

impl ConfigurationStats {
    /// Invocations currently running against the configuration.
    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::Acquire)
    }

    /// Invocations that finished, successfully or not.
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    /// Count an invocation as in flight until the guard drops.
    pub fn track(self: &Arc<Self>) -> InvocationTracker {
        self.inflight.fetch_add(1, Ordering::AcqRel);
        InvocationTracker {
            stats: self.clone(),
        }
    }
}

/// Moves one invocation from in-flight to completed on drop.
#[derive(Debug)]
pub struct InvocationTracker {
    stats: Arc<ConfigurationStats>,
}

impl Drop for InvocationTracker {
    fn drop(&mut self) {
        self.stats.inflight.fetch_sub(1, Ordering::AcqRel);
        self.stats.completed.fetch_add(1, Ordering::AcqRel);
    }
}

/// A resolved configuration.
pub struct ConfigurationInstance {
    name: String,
    value: serde_json::Value,
    connection_provider: Option<Arc<dyn ConnectionProvider>>,
    retry_policy: RetryPolicy,
    stats: Arc<ConfigurationStats>,
}

impl ConfigurationInstance {
    pub fn new(name: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            value,
            connection_provider: None,
            retry_policy: RetryPolicy::none(),
            stats: Arc::new(ConfigurationStats::default()),
        }
    }

    pub fn with_connection_provider(mut self, provider: Arc<dyn ConnectionProvider>) -> Self {
        self.connection_provider = Some(provider);
        self
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &serde_json::Value {
        &self.value
    }

    pub fn connection_provider(&self) -> Option<&Arc<dyn ConnectionProvider>> {
        self.connection_provider.as_ref()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry_policy
    }

    pub fn stats(&self) -> &Arc<ConfigurationStats> {
        &self.stats
    }
}

impl fmt::Debug for ConfigurationInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigurationInstance")
            .field("name", &self.name)
            .field("value", &self.value)
            .field("has_connection_provider", &self.connection_provider.is_some())
            .field("retry_policy", &self.retry_policy)
            .field("stats", &self.stats)
            .finish()
    }
}

/// Supplies the configuration instance for an event.
pub trait ConfigurationProvider: Send + Sync + 'static {
    fn get(&self, event: &Event) -> anyhow::Result<Arc<ConfigurationInstance>>;

    /// True if the instance depends on the event.
    fn is_dynamic(&self) -> bool;

    /// The single instance of a static provider.
    fn static_instance(&self) -> Option<Arc<ConfigurationInstance>> {
        None
    }
}

/// Always returns the same instance.
pub struct StaticConfigurationProvider {
    instance: Arc<ConfigurationInstance>,
}

impl StaticConfigurationProvider {
    pub fn new(instance: ConfigurationInstance) -> Self {
        Self {
            instance: Arc::new(instance),
        }
    }
}

impl ConfigurationProvider for StaticConfigurationProvider {
    fn get(&self, _event: &Event) -> anyhow::Result<Arc<ConfigurationInstance>> {
        Ok(self.instance.clone())
    }

    fn is_dynamic(&self) -> bool {
        false
    }

    fn static_instance(&self) -> Option<Arc<ConfigurationInstance>> {
        Some(self.instance.clone())
    }
}

type KeyFn = dyn Fn(&Event) -> anyhow::Result<String> + Send + Sync;
type FactoryFn = dyn Fn(&str) -> anyhow::Result<ConfigurationInstance> + Send + Sync;

/// Derives a key from each event and builds (then caches) one instance per
/// key.
pub struct DynamicConfigurationProvider {
    key: Box<KeyFn>,
    factory: Box<FactoryFn>,
    instances: DashMap<String, Arc<ConfigurationInstance>>,
}

impl DynamicConfigurationProvider {
    pub fn new<K, F>(key: K, factory: F) -> Self
    where
        K: Fn(&Event) -> anyhow::Result<String> + Send + Sync + 'static,
        F: Fn(&str) -> anyhow::Result<ConfigurationInstance> + Send + Sync + 'static,
    {
        Self {
            key: Box::new(key),
            factory: Box::new(factory),
            instances: DashMap::new(),
        }
    }

    /// Number of distinct instances built so far.
    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }
}

impl ConfigurationProvider for DynamicConfigurationProvider {
    fn get(&self, event: &Event) -> anyhow::Result<Arc<ConfigurationInstance>> {
        let key = (self.key)(event)?;
        if let Some(instance) = self.instances.get(&key) {
            return Ok(instance.clone());
        }
        let entry = self.instances.entry(key.clone());
        let instance = match entry {
            dashmap::mapref::entry::Entry::Occupied(existing) => existing.get().clone(),
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                debug!(key = %key, "building dynamic configuration instance");
                let instance = Arc::new((self.factory)(&key)?);
                vacant.insert(instance.clone());
                instance
            }
        };
        Ok(instance)
    }

    fn is_dynamic(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_retry_policy_enabled() {
        assert!(!RetryPolicy::none().is_enabled());
        assert!(RetryPolicy::new(2, Duration::from_millis(5)).is_enabled());
    }

    #[test]
    fn test_stats_track_invocations() {
        let instance = ConfigurationInstance::new("db", json!({"url": "mem"}));
        let tracker = instance.stats().track();
        assert_eq!(instance.stats().inflight(), 1);
        drop(tracker);
        assert_eq!(instance.stats().inflight(), 0);
        assert_eq!(instance.stats().completed(), 1);
    }

    #[test]
    fn test_static_provider_returns_same_instance() {
        let provider = StaticConfigurationProvider::new(ConfigurationInstance::new("cfg", json!({})));
        let a = provider.get(&Event::of("a")).unwrap();
        let b = provider.get(&Event::of("b")).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!provider.is_dynamic());
        assert!(provider.static_instance().is_some());
    }

    #[test]
    fn test_dynamic_provider_caches_per_key() {
        let provider = DynamicConfigurationProvider::new(
            |event| {
                event
                    .message()
                    .payload()
                    .as_str()
                    .map(str::to_string)
                    .ok_or_else(|| anyhow::anyhow!("tenant missing"))
            },
            |key| Ok(ConfigurationInstance::new(key, json!({ "tenant": key }))),
        );

        let a1 = provider.get(&Event::of("tenant-a")).unwrap();
        let a2 = provider.get(&Event::of("tenant-a")).unwrap();
        let b = provider.get(&Event::of("tenant-b")).unwrap();

        assert!(Arc::ptr_eq(&a1, &a2));
        assert_eq!(b.name(), "tenant-b");
        assert_eq!(provider.instance_count(), 2);
        assert!(provider.is_dynamic());
        assert!(provider.get(&Event::of(json!(1))).is_err());
    }
}
