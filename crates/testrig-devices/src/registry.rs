/*!
 * Extension registry for testrig.
 *
 * The registry is the catalog of everything extension packages contribute:
 * device models, capability interfaces and flavors, communication types,
 * detection queries and credential keys. It is built once at startup and then
 * shared read-only with the detection engine and the capability resolver.
 */
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use regex::Regex;
use serde::Serialize;
use tracing::{debug, info};

use crate::capability::{CapabilityFlavor, CapabilityInterface};
use crate::communication::CommunicationType;
use crate::detection::DetectQuery;
use crate::error::{DeviceError, Result};
use crate::extension::{DeviceModelDescriptor, ExtensionPackage, PackageFingerprint};
use crate::keys::KeyInfo;

/// A registered model as exported
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelSummary {
    /// Communication type the model is reached over
    pub communication_type: String,
    /// Declared capabilities, interface to flavor
    pub capabilities: BTreeMap<String, String>,
    /// Query names of the predicate chain, in order
    pub detect_criteria: Vec<String>,
}

/// A registered flavor as exported
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlavorSummary {
    /// Interface the flavor implements
    pub interface: String,
    /// Operations the flavor declares
    pub operations: BTreeSet<String>,
}

/// Read-only view of the registry, keyed by category
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistrySnapshot {
    /// Models by id
    pub models: BTreeMap<String, ModelSummary>,
    /// Interfaces by name, with their operations
    pub capability_interfaces: BTreeMap<String, BTreeSet<String>>,
    /// Flavors by name
    pub capability_flavors: BTreeMap<String, FlavorSummary>,
    /// Communication type names in registration order
    pub communication_types: Vec<String>,
    /// Detection query names per communication type
    pub detect_criteria: BTreeMap<String, Vec<String>>,
    /// Key ids
    pub keys: Vec<String>,
}

/// Catalog of registered extension packages
#[derive(Debug, Default)]
pub struct ExtensionRegistry {
    packages: BTreeMap<String, PackageFingerprint>,
    models: Vec<Arc<DeviceModelDescriptor>>,
    interfaces: BTreeMap<String, CapabilityInterface>,
    flavors: BTreeMap<String, Arc<dyn CapabilityFlavor>>,
    communication_types: Vec<Arc<dyn CommunicationType>>,
    detect_criteria: BTreeMap<String, Vec<Arc<dyn DetectQuery>>>,
    keys: Vec<KeyInfo>,
}

impl ExtensionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a package as one unit
    ///
    /// Every item is validated against the package itself and against what is
    /// already registered before anything is added. On error the registry is
    /// unchanged. Registering an identical package again is a no-op.
    pub fn register(&mut self, package: ExtensionPackage) -> Result<()> {
        let fingerprint = package.fingerprint();
        if let Some(existing) = self.packages.get(&package.name) {
            if *existing == fingerprint {
                debug!("Package {} {} already registered", package.name, package.version);
                return Ok(());
            }
            return Err(DeviceError::registration(
                &package.name,
                format!(
                    "a different package named {} (version {}) is already registered",
                    existing.name, existing.version
                ),
            ));
        }

        self.validate(&package)?;

        let ExtensionPackage {
            name,
            version,
            models,
            capability_interfaces,
            capability_flavors,
            communication_types,
            detect_criteria,
            keys,
        } = package;

        for interface in capability_interfaces {
            self.interfaces.insert(interface.name.clone(), interface);
        }
        for flavor in capability_flavors {
            self.flavors.insert(flavor.name().to_string(), flavor);
        }
        self.communication_types.extend(communication_types);
        for (communication, query) in detect_criteria {
            self.detect_criteria.entry(communication).or_default().push(query);
        }
        self.models.extend(models.into_iter().map(Arc::new));
        self.keys.extend(keys);
        self.packages.insert(name.clone(), fingerprint);

        info!("Registered extension package {} {}", name, version);
        Ok(())
    }

    fn validate(&self, package: &ExtensionPackage) -> Result<()> {
        let fail = |item: &str, reason: String| Err(DeviceError::registration(item, reason));

        if package.name.trim().is_empty() {
            return fail("<unnamed>", "package name must not be empty".to_string());
        }

        // Communication types
        let mut communication_names = HashSet::new();
        for communication in &package.communication_types {
            let name = communication.name();
            if self.communication_type(name).is_some() || !communication_names.insert(name) {
                return fail(name, "communication type is already registered".to_string());
            }
        }
        let communication_known =
            |name: &str| communication_names.contains(name) || self.communication_type(name).is_some();

        // Interfaces
        let mut interfaces: BTreeMap<&str, &CapabilityInterface> = BTreeMap::new();
        for interface in &package.capability_interfaces {
            if interface.name.trim().is_empty() {
                return fail(&package.name, "capability interface name must not be empty".to_string());
            }
            if interface.operations.is_empty() {
                return fail(&interface.name, "capability interface declares no operations".to_string());
            }
            if self.interfaces.contains_key(&interface.name)
                || interfaces.insert(interface.name.as_str(), interface).is_some()
            {
                return fail(&interface.name, "capability interface is already registered".to_string());
            }
        }
        let lookup_interface = |name: &str| interfaces.get(name).copied().or_else(|| self.interfaces.get(name));

        // Flavors
        let mut flavors: BTreeMap<&str, &str> = BTreeMap::new();
        for flavor in &package.capability_flavors {
            let name = flavor.name();
            if self.flavors.contains_key(name) || flavors.insert(name, flavor.interface()).is_some() {
                return fail(name, "capability flavor is already registered".to_string());
            }
            let Some(interface) = lookup_interface(flavor.interface()) else {
                return fail(name, format!("implements unknown interface {}", flavor.interface()));
            };
            let missing = interface.missing_operations(flavor.operations());
            if !missing.is_empty() {
                return fail(
                    name,
                    format!("does not implement {} of {}", missing.join(", "), interface.name),
                );
            }
        }
        let flavor_interface = |name: &str| {
            flavors
                .get(name)
                .map(|i| i.to_string())
                .or_else(|| self.flavors.get(name).map(|f| f.interface().to_string()))
        };

        // Detection queries
        let mut query_names: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        for (communication, query) in &package.detect_criteria {
            if !communication_known(communication) {
                return fail(
                    query.name(),
                    format!("detection query for unknown communication type {}", communication),
                );
            }
            let registered = self
                .detect_queries(communication)
                .iter()
                .any(|existing| existing.name() == query.name());
            if registered || !query_names.entry(communication.as_str()).or_default().insert(query.name()) {
                return fail(
                    query.name(),
                    format!("detection query is already registered for {}", communication),
                );
            }
        }
        let query_known = |communication: &str, query: &str| {
            query_names.get(communication).map_or(false, |names| names.contains(query))
                || self.detect_queries(communication).iter().any(|q| q.name() == query)
        };

        // Models
        let mut model_ids = HashSet::new();
        for model in &package.models {
            let id = model.id.as_str();
            if id.trim().is_empty() {
                return fail(&package.name, "device model id must not be empty".to_string());
            }
            if self.model(id).is_some() || !model_ids.insert(id) {
                return fail(id, "device model is already registered".to_string());
            }
            if !communication_known(&model.communication_type) {
                return fail(id, format!("unknown communication type {}", model.communication_type));
            }

            let mut declared = HashSet::new();
            for (interface, flavor) in &model.capabilities {
                if !declared.insert(interface.as_str()) {
                    return fail(id, format!("declares more than one flavor for {}", interface));
                }
                if lookup_interface(interface).is_none() {
                    return fail(id, format!("declares unknown interface {}", interface));
                }
                match flavor_interface(flavor) {
                    None => return fail(id, format!("declares unknown flavor {}", flavor)),
                    Some(implemented) if implemented != *interface => {
                        return fail(
                            id,
                            format!("flavor {} implements {}, not {}", flavor, implemented, interface),
                        )
                    }
                    Some(_) => {}
                }
            }

            for (query, _) in &model.match_criteria {
                if !query_known(&model.communication_type, query) {
                    return fail(
                        id,
                        format!("unknown detection query {} for {}", query, model.communication_type),
                    );
                }
            }

            for (label, pattern) in &model.event_filters {
                if let Err(e) = Regex::new(pattern) {
                    return fail(id, format!("event filter {} is not a valid pattern: {}", label, e));
                }
            }
        }

        // Keys
        let mut key_ids = HashSet::new();
        for key in &package.keys {
            if key.package != package.name {
                return fail(&key.id(), format!("key belongs to package {}, not {}", key.package, package.name));
            }
            if self.keys.contains(key) || !key_ids.insert(key.id()) {
                return fail(&key.id(), "key is already registered".to_string());
            }
        }

        Ok(())
    }

    /// A model by id
    pub fn model(&self, id: &str) -> Option<&Arc<DeviceModelDescriptor>> {
        self.models.iter().find(|m| m.id == id)
    }

    /// Ids of every registered model
    pub fn supported_models(&self) -> BTreeSet<String> {
        self.models.iter().map(|m| m.id.clone()).collect()
    }

    /// Models reached over a communication type, in registration order
    pub fn models_for_communication_type(&self, communication: &str) -> Vec<&DeviceModelDescriptor> {
        self.models
            .iter()
            .filter(|m| m.communication_type == communication)
            .map(|m| m.as_ref())
            .collect()
    }

    /// A capability interface by name
    pub fn interface(&self, name: &str) -> Option<&CapabilityInterface> {
        self.interfaces.get(name)
    }

    /// A capability flavor by name
    pub fn flavor(&self, name: &str) -> Option<Arc<dyn CapabilityFlavor>> {
        self.flavors.get(name).cloned()
    }

    /// A communication type by name
    pub fn communication_type(&self, name: &str) -> Option<Arc<dyn CommunicationType>> {
        self.communication_types.iter().find(|c| c.name() == name).cloned()
    }

    /// Communication types in registration order
    pub fn communication_types(&self) -> &[Arc<dyn CommunicationType>] {
        &self.communication_types
    }

    /// Detection queries registered for a communication type
    pub fn detect_queries(&self, communication: &str) -> &[Arc<dyn DetectQuery>] {
        self.detect_criteria.get(communication).map_or(&[], Vec::as_slice)
    }

    /// Registered credential keys
    pub fn keys(&self) -> &[KeyInfo] {
        &self.keys
    }

    /// Fingerprints of registered packages
    pub fn packages(&self) -> impl Iterator<Item = &PackageFingerprint> {
        self.packages.values()
    }

    /// Snapshot of everything registered
    pub fn export(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            models: self
                .models
                .iter()
                .map(|m| {
                    let summary = ModelSummary {
                        communication_type: m.communication_type.clone(),
                        capabilities: m.capabilities.iter().cloned().collect(),
                        detect_criteria: m.match_criteria.iter().map(|(q, _)| q.clone()).collect(),
                    };
                    (m.id.clone(), summary)
                })
                .collect(),
            capability_interfaces: self
                .interfaces
                .values()
                .map(|i| (i.name.clone(), i.operations.clone()))
                .collect(),
            capability_flavors: self
                .flavors
                .values()
                .map(|f| {
                    let summary = FlavorSummary {
                        interface: f.interface().to_string(),
                        operations: f.operations().into_iter().map(String::from).collect(),
                    };
                    (f.name().to_string(), summary)
                })
                .collect(),
            communication_types: self.communication_types.iter().map(|c| c.name().to_string()).collect(),
            detect_criteria: self
                .detect_criteria
                .iter()
                .map(|(c, queries)| (c.clone(), queries.iter().map(|q| q.name().to_string()).collect()))
                .collect(),
            keys: self.keys.iter().map(KeyInfo::id).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::capability::{Capability, CapabilityContext};
    use crate::communication::StaticComms;
    use crate::detection::{AlwaysTrue, MatchCriterion, ALWAYS_TRUE};
    use crate::keys::KeyKind;

    #[derive(Debug)]
    struct PowerFlavor {
        name: &'static str,
        interface: &'static str,
        operations: Vec<&'static str>,
    }

    #[async_trait]
    impl CapabilityFlavor for PowerFlavor {
        fn name(&self) -> &str {
            self.name
        }

        fn interface(&self) -> &str {
            self.interface
        }

        fn operations(&self) -> Vec<&'static str> {
            self.operations.clone()
        }

        async fn build(&self, _context: &CapabilityContext) -> Result<Arc<dyn Capability>> {
            Err(DeviceError::detection("not built in these tests"))
        }
    }

    fn power_flavor(name: &'static str) -> PowerFlavor {
        PowerFlavor {
            name,
            interface: "power",
            operations: vec!["on", "off"],
        }
    }

    fn virtual_comms(name: &str) -> StaticComms {
        StaticComms::new(name, Vec::new(), |_| Err(DeviceError::detection("no transport")))
    }

    fn acme() -> ExtensionPackage {
        ExtensionPackage::new("acme", "1.0")
            .with_communication_type(virtual_comms("virtual"))
            .with_detect_query("virtual", AlwaysTrue)
            .with_interface(CapabilityInterface::new("power", ["on", "off"]))
            .with_flavor(power_flavor("power_relay"))
            .with_model(
                DeviceModelDescriptor::new("board", "virtual")
                    .with_capability("power", "power_relay")
                    .with_criterion(ALWAYS_TRUE, MatchCriterion::Equals(true)),
            )
            .with_key(KeyInfo::new("id_board", KeyKind::SshPrivate, "acme"))
    }

    #[test]
    fn test_register_and_export() {
        let mut registry = ExtensionRegistry::new();
        registry.register(acme()).unwrap();

        assert_eq!(registry.supported_models(), ["board".to_string()].into_iter().collect());
        assert!(registry.flavor("power_relay").is_some());
        assert_eq!(registry.detect_queries("virtual").len(), 1);
        assert!(registry.detect_queries("serial").is_empty());

        let snapshot = registry.export();
        assert_eq!(snapshot.models["board"].capabilities["power"], "power_relay");
        assert_eq!(snapshot.models["board"].detect_criteria, vec![ALWAYS_TRUE.to_string()]);
        assert_eq!(snapshot.capability_flavors["power_relay"].interface, "power");
        assert_eq!(snapshot.communication_types, vec!["virtual".to_string()]);
        assert_eq!(snapshot.detect_criteria["virtual"], vec![ALWAYS_TRUE.to_string()]);
        assert_eq!(snapshot.keys, vec!["acme/id_board".to_string()]);
    }

    #[test]
    fn test_identical_package_is_a_no_op() {
        let mut registry = ExtensionRegistry::new();
        registry.register(acme()).unwrap();
        let before = registry.export();
        registry.register(acme()).unwrap();
        assert_eq!(registry.export(), before);
        assert_eq!(registry.packages().count(), 1);
    }

    #[test]
    fn test_same_names_with_different_contents_are_rejected() {
        let mut registry = ExtensionRegistry::new();
        registry.register(acme()).unwrap();
        let before = registry.export();

        let more_operations = ExtensionPackage::new("acme", "1.0")
            .with_communication_type(virtual_comms("virtual"))
            .with_detect_query("virtual", AlwaysTrue)
            .with_interface(CapabilityInterface::new("power", ["on", "off", "cycle"]))
            .with_flavor(PowerFlavor {
                operations: vec!["on", "off", "cycle"],
                ..power_flavor("power_relay")
            })
            .with_model(
                DeviceModelDescriptor::new("board", "virtual")
                    .with_capability("power", "power_relay")
                    .with_criterion(ALWAYS_TRUE, MatchCriterion::Equals(false)),
            )
            .with_key(KeyInfo::new("id_board", KeyKind::SshPrivate, "acme"));

        let err = registry.register(more_operations).unwrap_err();
        assert!(matches!(err, DeviceError::Registration { .. }), "{}", err);
        assert_eq!(registry.export(), before);
        assert_eq!(
            registry.interface("power").unwrap().operations,
            ["off", "on"].iter().map(|s| s.to_string()).collect::<std::collections::BTreeSet<_>>()
        );
    }

    #[test]
    fn test_collisions_leave_registry_unchanged() {
        let mut registry = ExtensionRegistry::new();
        registry.register(acme()).unwrap();
        let before = registry.export();

        let changed_version = ExtensionPackage {
            version: "1.1".to_string(),
            ..acme()
        };
        let same_model = ExtensionPackage::new("other", "1.0")
            .with_interface(CapabilityInterface::new("console", ["read"]))
            .with_model(DeviceModelDescriptor::new("board", "virtual"));
        let same_flavor = ExtensionPackage::new("other", "1.0")
            .with_communication_type(virtual_comms("bench"))
            .with_flavor(power_flavor("power_relay"));
        let same_comms = ExtensionPackage::new("other", "1.0").with_communication_type(virtual_comms("virtual"));

        for package in [changed_version, same_model, same_flavor, same_comms] {
            let err = registry.register(package).unwrap_err();
            assert!(matches!(err, DeviceError::Registration { .. }), "{}", err);
            assert_eq!(registry.export(), before);
        }
        // Nothing from the rejected packages leaked in
        assert!(registry.interface("console").is_none());
        assert!(registry.communication_type("bench").is_none());
    }

    #[test]
    fn test_shape_violations_are_rejected() {
        let cases = vec![
            (
                "incomplete flavor",
                ExtensionPackage::new("p", "1")
                    .with_interface(CapabilityInterface::new("power", ["on", "off"]))
                    .with_flavor(PowerFlavor {
                        name: "half",
                        interface: "power",
                        operations: vec!["on"],
                    }),
            ),
            (
                "flavor of unknown interface",
                ExtensionPackage::new("p", "1").with_flavor(power_flavor("power_relay")),
            ),
            (
                "model on unknown communication type",
                ExtensionPackage::new("p", "1").with_model(DeviceModelDescriptor::new("m", "carrier_pigeon")),
            ),
            (
                "two flavors for one interface",
                acme().with_flavor(power_flavor("power_pdu")).with_model(
                    DeviceModelDescriptor::new("twin", "virtual")
                        .with_capability("power", "power_relay")
                        .with_capability("power", "power_pdu"),
                ),
            ),
            (
                "unknown detection query",
                acme().with_model(
                    DeviceModelDescriptor::new("m", "virtual").with_criterion("handshake", MatchCriterion::Equals(true)),
                ),
            ),
            (
                "bad event filter",
                acme().with_model(DeviceModelDescriptor::new("m", "virtual").with_event_filter("crash", "(")),
            ),
            (
                "foreign key",
                ExtensionPackage::new("p", "1").with_key(KeyInfo::new("id", KeyKind::Other, "q")),
            ),
        ];

        for (what, package) in cases {
            let mut registry = ExtensionRegistry::new();
            let err = registry.register(package).unwrap_err();
            assert!(matches!(err, DeviceError::Registration { .. }), "{}: {}", what, err);
            assert_eq!(registry.export(), RegistrySnapshot::default(), "{}", what);
        }
    }

    #[test]
    fn test_packages_may_build_on_each_other() {
        let mut registry = ExtensionRegistry::new();
        registry.register(acme()).unwrap();

        let extra = ExtensionPackage::new("acme-extra", "0.1")
            .with_flavor(power_flavor("power_pdu"))
            .with_model(
                DeviceModelDescriptor::new("board_pdu", "virtual")
                    .with_capability("power", "power_pdu")
                    .with_criterion(ALWAYS_TRUE, MatchCriterion::Equals(true)),
            );
        registry.register(extra).unwrap();

        let names: Vec<&str> = registry
            .models_for_communication_type("virtual")
            .iter()
            .map(|m| m.id.as_str())
            .collect();
        assert_eq!(names, vec!["board", "board_pdu"]);
    }
}
