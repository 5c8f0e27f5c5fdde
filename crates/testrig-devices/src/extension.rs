/*!
 * Extension packages and device model descriptors.
 *
 * An extension package bundles everything a family of devices needs: models,
 * capability interfaces and flavors, communication types, detection queries and
 * credential keys. The registry accepts or rejects a package as a whole.
 */
use std::fmt::{self, Debug};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use testrig_core::types::{DeviceConfig, PropertyValue};

use crate::capability::{CapabilityFlavor, CapabilityInterface};
use crate::communication::CommunicationType;
use crate::detection::{DetectQuery, Identify, MatchCriterion};
use crate::health::{HealthCheck, RecoveryHook};
use crate::keys::KeyInfo;

/// Property names a model exposes, by lifetime
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PropertySchema {
    /// Fixed at detection
    pub persistent: Vec<String>,
    /// User-settable, with their defaults
    pub optional: DeviceConfig,
    /// Read live from the device
    pub dynamic: Vec<String>,
}

/// A registered classification of device
#[derive(Clone)]
pub struct DeviceModelDescriptor {
    /// Unique model id, also used as the device type
    pub id: String,
    /// Communication type the model is reached over
    pub communication_type: String,
    /// Declared capabilities as (interface, flavor), at most one flavor per interface
    pub capabilities: Vec<(String, String)>,
    /// Ordered detection predicates as (query name, criterion)
    pub match_criteria: Vec<(String, MatchCriterion)>,
    /// Property schema
    pub properties: PropertySchema,
    /// Event parser filters as (label, pattern)
    pub event_filters: Vec<(String, String)>,
    /// Produces persistent identifiers at detection
    pub identify: Option<Arc<dyn Identify>>,
    /// Ordered readiness checks
    pub health_checks: Vec<Arc<dyn HealthCheck>>,
    /// Invoked when a health check fails
    pub recovery: Option<Arc<dyn RecoveryHook>>,
}

impl DeviceModelDescriptor {
    /// Describe a model reached over `communication_type`
    pub fn new<I: Into<String>, C: Into<String>>(id: I, communication_type: C) -> Self {
        Self {
            id: id.into(),
            communication_type: communication_type.into(),
            capabilities: Vec::new(),
            match_criteria: Vec::new(),
            properties: PropertySchema::default(),
            event_filters: Vec::new(),
            identify: None,
            health_checks: Vec::new(),
            recovery: None,
        }
    }

    /// Declare that `interface` is provided by `flavor`
    pub fn with_capability<I: Into<String>, F: Into<String>>(mut self, interface: I, flavor: F) -> Self {
        self.capabilities.push((interface.into(), flavor.into()));
        self
    }

    /// Append a detection predicate
    pub fn with_criterion<Q: Into<String>>(mut self, query: Q, criterion: MatchCriterion) -> Self {
        self.match_criteria.push((query.into(), criterion));
        self
    }

    /// Declare a persistent property
    pub fn with_persistent_property<S: Into<String>>(mut self, name: S) -> Self {
        self.properties.persistent.push(name.into());
        self
    }

    /// Declare an optional property and its default
    pub fn with_optional_property<S: Into<String>, V: Into<PropertyValue>>(mut self, name: S, default: V) -> Self {
        self.properties.optional.insert(name.into(), default.into());
        self
    }

    /// Declare a dynamic property
    pub fn with_dynamic_property<S: Into<String>>(mut self, name: S) -> Self {
        self.properties.dynamic.push(name.into());
        self
    }

    /// Add an event parser filter
    pub fn with_event_filter<L: Into<String>, P: Into<String>>(mut self, label: L, pattern: P) -> Self {
        self.event_filters.push((label.into(), pattern.into()));
        self
    }

    /// Use a custom identity hook
    pub fn with_identify<H: Identify + 'static>(mut self, identify: H) -> Self {
        self.identify = Some(Arc::new(identify));
        self
    }

    /// Append a health check
    pub fn with_health_check<H: HealthCheck + 'static>(mut self, check: H) -> Self {
        self.health_checks.push(Arc::new(check));
        self
    }

    /// Set the recovery hook
    pub fn with_recovery<R: RecoveryHook + 'static>(mut self, recovery: R) -> Self {
        self.recovery = Some(Arc::new(recovery));
        self
    }

    /// Flavor declared for `interface`
    pub fn flavor_for(&self, interface: &str) -> Option<&str> {
        self.capabilities
            .iter()
            .find(|(declared, _)| declared == interface)
            .map(|(_, flavor)| flavor.as_str())
    }

    /// Whether the model declares `interface`
    pub fn has_capability(&self, interface: &str) -> bool {
        self.flavor_for(interface).is_some()
    }

    /// Declared interfaces in declaration order
    pub fn interfaces(&self) -> Vec<&str> {
        self.capabilities.iter().map(|(interface, _)| interface.as_str()).collect()
    }
}

impl Debug for DeviceModelDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceModelDescriptor")
            .field("id", &self.id)
            .field("communication_type", &self.communication_type)
            .field("capabilities", &self.capabilities)
            .field("match_criteria", &self.match_criteria)
            .field("properties", &self.properties)
            .field("event_filters", &self.event_filters)
            .field("health_checks", &self.health_checks.iter().map(|c| c.name()).collect::<Vec<_>>())
            .field("recovery", &self.recovery.is_some())
            .finish()
    }
}

/// Canonical description of everything a package contains
///
/// Two packages with equal fingerprints are treated as the same package. Each
/// entry describes an item by name and contents, so changing an interface's
/// operations or a model's criteria under the same names changes the fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackageFingerprint {
    /// Package name
    pub name: String,
    /// Package version
    pub version: String,
    /// Model descriptions
    pub models: Vec<String>,
    /// Interfaces with their operations
    pub capability_interfaces: Vec<String>,
    /// Flavors with their interface and operations
    pub capability_flavors: Vec<String>,
    /// Communication type names
    pub communication_types: Vec<String>,
    /// Detection queries as `communication_type/query`
    pub detect_criteria: Vec<String>,
    /// Key ids
    pub keys: Vec<String>,
}

fn describe_criterion(criterion: &MatchCriterion) -> String {
    match criterion {
        MatchCriterion::Equals(expected) => format!("== {}", expected),
        MatchCriterion::Matches(pattern) => format!("~ {}", pattern.as_str()),
    }
}

fn describe_model(model: &DeviceModelDescriptor) -> String {
    let criteria: Vec<String> = model
        .match_criteria
        .iter()
        .map(|(query, criterion)| format!("{} {}", query, describe_criterion(criterion)))
        .collect();
    let health: Vec<&str> = model.health_checks.iter().map(|c| c.name()).collect();
    format!(
        "{} over {} capabilities={:?} criteria={:?} properties={:?} filters={:?} identify={} health={:?} recovery={}",
        model.id,
        model.communication_type,
        model.capabilities,
        criteria,
        model.properties,
        model.event_filters,
        model.identify.is_some(),
        health,
        model.recovery.is_some()
    )
}

fn describe_flavor(flavor: &dyn CapabilityFlavor) -> String {
    let mut operations = flavor.operations();
    operations.sort_unstable();
    format!("{} implements {} {:?}", flavor.name(), flavor.interface(), operations)
}

/// A bundle registered as one unit
#[derive(Clone, Default)]
pub struct ExtensionPackage {
    /// Package name
    pub name: String,
    /// Package version
    pub version: String,
    /// Device models
    pub models: Vec<DeviceModelDescriptor>,
    /// Capability interfaces
    pub capability_interfaces: Vec<CapabilityInterface>,
    /// Capability flavors
    pub capability_flavors: Vec<Arc<dyn CapabilityFlavor>>,
    /// Communication types
    pub communication_types: Vec<Arc<dyn CommunicationType>>,
    /// Detection queries as (communication type, query)
    pub detect_criteria: Vec<(String, Arc<dyn DetectQuery>)>,
    /// Credential keys
    pub keys: Vec<KeyInfo>,
}

impl ExtensionPackage {
    /// An empty package
    pub fn new<N: Into<String>, V: Into<String>>(name: N, version: V) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            ..Self::default()
        }
    }

    /// Add a model
    pub fn with_model(mut self, model: DeviceModelDescriptor) -> Self {
        self.models.push(model);
        self
    }

    /// Add a capability interface
    pub fn with_interface(mut self, interface: CapabilityInterface) -> Self {
        self.capability_interfaces.push(interface);
        self
    }

    /// Add a capability flavor
    pub fn with_flavor<F: CapabilityFlavor + 'static>(mut self, flavor: F) -> Self {
        self.capability_flavors.push(Arc::new(flavor));
        self
    }

    /// Add a communication type
    pub fn with_communication_type<C: CommunicationType + 'static>(mut self, communication: C) -> Self {
        self.communication_types.push(Arc::new(communication));
        self
    }

    /// Add a detection query for `communication_type`
    pub fn with_detect_query<C: Into<String>, Q: DetectQuery + 'static>(mut self, communication_type: C, query: Q) -> Self {
        self.detect_criteria.push((communication_type.into(), Arc::new(query)));
        self
    }

    /// Add a credential key
    pub fn with_key(mut self, key: KeyInfo) -> Self {
        self.keys.push(key);
        self
    }

    /// Sorted descriptions of everything in the package
    pub fn fingerprint(&self) -> PackageFingerprint {
        fn sorted(mut names: Vec<String>) -> Vec<String> {
            names.sort();
            names
        }

        PackageFingerprint {
            name: self.name.clone(),
            version: self.version.clone(),
            models: sorted(self.models.iter().map(describe_model).collect()),
            capability_interfaces: sorted(
                self.capability_interfaces
                    .iter()
                    .map(|i| format!("{} {:?}", i.name, i.operations))
                    .collect(),
            ),
            capability_flavors: sorted(self.capability_flavors.iter().map(|f| describe_flavor(f.as_ref())).collect()),
            communication_types: sorted(self.communication_types.iter().map(|c| c.name().to_string()).collect()),
            detect_criteria: sorted(
                self.detect_criteria
                    .iter()
                    .map(|(comm, query)| format!("{}/{}", comm, query.name()))
                    .collect(),
            ),
            keys: sorted(self.keys.iter().map(KeyInfo::id).collect()),
        }
    }
}

impl Debug for ExtensionPackage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionPackage")
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_builder() {
        let model = DeviceModelDescriptor::new("raspberrypi", "ssh")
            .with_capability("switchboard", "switchboard_default")
            .with_criterion("always_true", MatchCriterion::Equals(true))
            .with_persistent_property("serial_number")
            .with_optional_property("alias", "")
            .with_dynamic_property("firmware_version")
            .with_event_filter("bootup", r"Booting Linux");

        assert_eq!(model.flavor_for("switchboard"), Some("switchboard_default"));
        assert_eq!(model.flavor_for("power"), None);
        assert!(model.has_capability("switchboard"));
        assert_eq!(model.interfaces(), vec!["switchboard"]);
        assert_eq!(model.properties.optional.get("alias"), Some(&PropertyValue::from("")));
    }

    #[test]
    fn test_fingerprint_is_order_independent() {
        let a = ExtensionPackage::new("acme", "1.0")
            .with_model(DeviceModelDescriptor::new("b", "ssh"))
            .with_model(DeviceModelDescriptor::new("a", "ssh"));
        let b = ExtensionPackage::new("acme", "1.0")
            .with_model(DeviceModelDescriptor::new("a", "ssh"))
            .with_model(DeviceModelDescriptor::new("b", "ssh"));
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert!(a.fingerprint().models[0].starts_with("a over ssh"));

        let c = ExtensionPackage::new("acme", "1.1").with_model(DeviceModelDescriptor::new("a", "ssh"));
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn test_fingerprint_covers_contents() {
        let package = |operations: &[&str], pattern: &str| {
            ExtensionPackage::new("acme", "1.0")
                .with_interface(CapabilityInterface::new("power", operations.iter().copied()))
                .with_model(
                    DeviceModelDescriptor::new("widget", "ssh")
                        .with_criterion("product", MatchCriterion::matches(pattern).unwrap()),
                )
        };
        let original = package(&["on", "off"], "^widget$");
        assert_eq!(original.fingerprint(), package(&["off", "on"], "^widget$").fingerprint());
        assert_ne!(original.fingerprint(), package(&["on", "off", "cycle"], "^widget$").fingerprint());
        assert_ne!(original.fingerprint(), package(&["on", "off"], "^gadget$").fingerprint());

        let rewired = ExtensionPackage::new("acme", "1.0")
            .with_interface(CapabilityInterface::new("power", ["on", "off"]))
            .with_model(
                DeviceModelDescriptor::new("widget", "adb")
                    .with_criterion("product", MatchCriterion::matches("^widget$").unwrap()),
            );
        assert_ne!(original.fingerprint(), rewired.fingerprint());
    }
}
