/*!
 * Capabilities and their resolution.
 *
 * A capability interface is a named set of operations. A flavor is one
 * implementation of one interface. Each device model declares which flavor it
 * uses per interface; the resolver builds that flavor on first use and hands
 * out the same instance for every later request on the same device.
 */
use std::any::{type_name, Any};
use std::collections::{BTreeSet, HashMap};
use std::fmt::Debug;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::debug;

use testrig_core::types::Id;
use testrig_switchboard::EventParser;

use crate::device::Device;
use crate::error::{DeviceError, Result};
use crate::registry::ExtensionRegistry;
use crate::session::SwitchboardSlot;

/// A named set of operations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityInterface {
    /// Globally unique interface name
    pub name: String,
    /// Every operation a flavor of this interface must provide
    pub operations: BTreeSet<String>,
}

impl CapabilityInterface {
    /// Declare an interface
    pub fn new<N, I, S>(name: N, operations: I) -> Self
    where
        N: Into<String>,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            operations: operations.into_iter().map(Into::into).collect(),
        }
    }

    /// Operations of this interface absent from `provided`
    pub fn missing_operations<I, S>(&self, provided: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let provided: BTreeSet<String> = provided.into_iter().map(|s| s.as_ref().to_string()).collect();
        self.operations.difference(&provided).cloned().collect()
    }
}

/// What a flavor gets to build a capability for one device
#[derive(Debug, Clone)]
pub struct CapabilityContext {
    /// Device name
    pub device_name: String,
    /// Device model id
    pub model: String,
    /// Communication address
    pub address: String,
    /// The device's lazily opened switchboard
    pub switchboard: Arc<SwitchboardSlot>,
    /// The device's event parser
    pub event_parser: Arc<EventParser>,
}

/// A constructed capability instance
pub trait Capability: Any + Send + Sync + Debug {
    /// The interface this instance implements
    fn interface(&self) -> &str;

    /// The flavor that built it
    fn flavor(&self) -> &str;

    /// Operations this instance provides
    fn operations(&self) -> Vec<&'static str>;

    /// Upcast for downcasting to the concrete flavor type
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// A concrete implementation of one capability interface
#[async_trait]
pub trait CapabilityFlavor: Send + Sync + Debug {
    /// Globally unique flavor name
    fn name(&self) -> &str;

    /// The interface implemented
    fn interface(&self) -> &str;

    /// Operations the flavor declares
    fn operations(&self) -> Vec<&'static str>;

    /// Build the capability for one device
    async fn build(&self, context: &CapabilityContext) -> Result<Arc<dyn Capability>>;
}

type CacheKey = (Id, String);
type CacheSlot = Arc<OnceCell<Arc<dyn Capability>>>;

/// Resolves and memoises capability instances per (device instance, interface)
#[derive(Debug)]
pub struct CapabilityResolver {
    registry: Arc<ExtensionRegistry>,
    cache: Mutex<HashMap<CacheKey, CacheSlot>>,
}

impl CapabilityResolver {
    /// Create a resolver over a populated registry
    pub fn new(registry: Arc<ExtensionRegistry>) -> Self {
        Self {
            registry,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// The capability `interface` of `device`, built on first access
    pub async fn get(&self, device: &Device, interface: &str) -> Result<Arc<dyn Capability>> {
        let model = device.model();
        let flavor = model.flavor_for(interface).ok_or_else(|| {
            DeviceError::capability_not_ready(
                device.name(),
                interface,
                format!("model {} does not declare it", model.id),
            )
        })?;

        let slot = {
            let mut cache = self.lock();
            Arc::clone(
                cache
                    .entry((device.instance_id().clone(), interface.to_string()))
                    .or_default(),
            )
        };
        let capability = slot.get_or_try_init(|| self.build(device, interface, flavor)).await?;
        Ok(Arc::clone(capability))
    }

    /// The capability downcast to its concrete flavor type
    pub async fn get_as<T: Capability>(&self, device: &Device, interface: &str) -> Result<Arc<T>> {
        let capability = self.get(device, interface).await?;
        let flavor = capability.flavor().to_string();
        capability.into_any().downcast::<T>().map_err(|_| {
            DeviceError::capability_not_ready(
                device.name(),
                interface,
                format!("flavor {} is not a {}", flavor, type_name::<T>()),
            )
        })
    }

    /// Drop every cached instance of a device; returns how many were dropped
    pub fn evict(&self, device: &Id) -> usize {
        let mut cache = self.lock();
        let before = cache.len();
        cache.retain(|(id, _), _| id != device);
        before - cache.len()
    }

    /// Interfaces with a built instance for a device
    pub fn cached_interfaces(&self, device: &Id) -> Vec<String> {
        let mut interfaces: Vec<String> = self
            .lock()
            .iter()
            .filter(|((id, _), slot)| id == device && slot.initialized())
            .map(|((_, interface), _)| interface.clone())
            .collect();
        interfaces.sort();
        interfaces
    }

    async fn build(&self, device: &Device, interface: &str, flavor_name: &str) -> Result<Arc<dyn Capability>> {
        let not_ready = |reason: String| DeviceError::capability_not_ready(device.name(), interface, reason);

        let definition = self
            .registry
            .interface(interface)
            .ok_or_else(|| not_ready("interface is not registered".to_string()))?;
        let flavor = self
            .registry
            .flavor(flavor_name)
            .ok_or_else(|| not_ready(format!("flavor {} is not registered", flavor_name)))?;

        let capability = flavor.build(&device.capability_context()).await.map_err(|e| match e {
            e @ DeviceError::CapabilityNotReady { .. } => e,
            other => not_ready(format!("flavor {} failed to build: {}", flavor_name, other)),
        })?;

        let missing = definition.missing_operations(capability.operations());
        if !missing.is_empty() {
            return Err(not_ready(format!(
                "flavor {} does not implement {}",
                flavor_name,
                missing.join(", ")
            )));
        }

        debug!(device = %device.name(), "Resolved {} with flavor {}", interface, flavor_name);
        Ok(capability)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CacheKey, CacheSlot>> {
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
