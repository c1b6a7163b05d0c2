//! Task specification and the closed set of invariant kinds.
//!
//! A task spec is immutable from the moment a job is created. The
//! sandbox plumbing treats it as opaque except for the `invariants`
//! array, which is validated into a closed tagged union at the edge:
//! unknown kinds or duplicate invariant ids are a parse error, not a
//! runtime surprise.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Errors raised while validating a task spec.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    /// The document is not valid JSON or does not match the schema.
    #[error("malformed task spec: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Two invariants share the same id.
    #[error("duplicate invariant id: {0}")]
    DuplicateInvariantId(String),

    /// A resource address is not of the form `type.name`.
    #[error("invalid resource address: {0:?} (expected \"type.name\")")]
    InvalidAddress(String),
}

/// Address of a resource in the state document, written `type.name`
/// (for example `google_compute_instance.main_0`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceAddress {
    /// Provider resource type, e.g. `google_compute_firewall`.
    pub resource_type: String,
    /// Resource name within the configuration.
    pub name: String,
}

impl ResourceAddress {
    /// Parses a `type.name` address.
    ///
    /// The name may itself contain dots; only the first dot separates
    /// the type.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::InvalidAddress`] when either part is empty.
    pub fn parse(raw: &str) -> Result<Self, TaskError> {
        match raw.split_once('.') {
            Some((ty, name)) if !ty.is_empty() && !name.is_empty() => Ok(Self {
                resource_type: ty.to_string(),
                name: name.to_string(),
            }),
            _ => Err(TaskError::InvalidAddress(raw.to_string())),
        }
    }
}

impl std::fmt::Display for ResourceAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.resource_type, self.name)
    }
}

impl Serialize for ResourceAddress {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ResourceAddress {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// One invariant: a stable id plus a kind-specific parameter set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invariant {
    /// Caller-assigned id, unique within a task spec.
    pub id: String,

    /// The predicate and its parameters.
    #[serde(flatten)]
    pub kind: InvariantKind,
}

/// The closed set of invariant kinds.
///
/// The `kind` tag determines the parameter type; adding a variant here
/// is the only way to extend the evaluator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InvariantKind {
    /// A managed resource with the given address exists in state.
    ResourceExists {
        /// Address of the required resource.
        address: ResourceAddress,
    },

    /// An attribute of a resource equals an expected value.
    AttributeEquals {
        /// Address of the resource to inspect.
        address: ResourceAddress,
        /// Dot-path into the attributes, list indices as digits
        /// (e.g. `network_interface.0.network`).
        attribute: String,
        /// Expected value.
        expected: Value,
    },

    /// A firewall resource allows the given protocol (and port).
    FirewallAllows {
        /// Address of the firewall resource.
        address: ResourceAddress,
        /// Protocol, e.g. `tcp`.
        protocol: String,
        /// Port that must appear in the allow block; `None` accepts
        /// any port list for the protocol.
        #[serde(default)]
        port: Option<u16>,
    },

    /// An access binding grants a role to a principal.
    BindingGrants {
        /// Address of the binding resource.
        address: ResourceAddress,
        /// Principal the binding must name. State commonly expands
        /// principals to full emails, so containment is matched.
        principal: String,
        /// Role the binding must carry, compared exactly.
        role: String,
    },

    /// A list-valued attribute contains an element.
    CollectionContains {
        /// Address of the resource to inspect.
        address: ResourceAddress,
        /// Dot-path to the list attribute.
        attribute: String,
        /// Element that must be present.
        element: Value,
    },
}

impl InvariantKind {
    /// Stable tag name, matching the serialized `kind` field.
    #[must_use]
    pub fn tag(&self) -> &'static str {
        match self {
            Self::ResourceExists { .. } => "resource_exists",
            Self::AttributeEquals { .. } => "attribute_equals",
            Self::FirewallAllows { .. } => "firewall_allows",
            Self::BindingGrants { .. } => "binding_grants",
            Self::CollectionContains { .. } => "collection_contains",
        }
    }
}

/// The immutable task document bundled with a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Caller-supplied task identifier.
    #[serde(default)]
    pub task_id: Option<String>,

    /// Ordered invariants to evaluate.
    #[serde(default)]
    pub invariants: Vec<Invariant>,

    /// Remainder of the document, preserved but not interpreted.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl TaskSpec {
    /// Parses and validates a task spec from a JSON value.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError`] on schema mismatch or duplicate
    /// invariant ids.
    pub fn from_value(value: Value) -> Result<Self, TaskError> {
        let spec: Self = serde_json::from_value(value)?;
        spec.check_unique_ids()?;
        Ok(spec)
    }

    /// Parses and validates a task spec from JSON text.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError`] on malformed JSON, schema mismatch, or
    /// duplicate invariant ids.
    pub fn from_json(raw: &str) -> Result<Self, TaskError> {
        let spec: Self = serde_json::from_str(raw)?;
        spec.check_unique_ids()?;
        Ok(spec)
    }

    fn check_unique_ids(&self) -> Result<(), TaskError> {
        let mut seen = std::collections::HashSet::new();
        for invariant in &self.invariants {
            if !seen.insert(invariant.id.as_str()) {
                return Err(TaskError::DuplicateInvariantId(invariant.id.clone()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_each_invariant_kind() {
        let spec = TaskSpec::from_json(
            r#"{
                "task_id": "t-1",
                "invariants": [
                    {"id": "i1", "kind": "resource_exists",
                     "address": "random_id.example"},
                    {"id": "i2", "kind": "attribute_equals",
                     "address": "google_compute_instance.main_0",
                     "attribute": "name", "expected": "vm-b"},
                    {"id": "i3", "kind": "firewall_allows",
                     "address": "google_compute_firewall.allow_ssh",
                     "protocol": "tcp", "port": 22},
                    {"id": "i4", "kind": "binding_grants",
                     "address": "google_project_iam_member.binding_0",
                     "principal": "serviceAccount:sa-1", "role": "roles/viewer"},
                    {"id": "i5", "kind": "collection_contains",
                     "address": "google_dns_record_set.www",
                     "attribute": "rrdatas", "element": "10.0.0.1"}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(spec.task_id.as_deref(), Some("t-1"));
        assert_eq!(spec.invariants.len(), 5);
        assert_eq!(spec.invariants[0].kind.tag(), "resource_exists");
        assert_eq!(spec.invariants[2].kind.tag(), "firewall_allows");
    }

    #[test]
    fn rejects_duplicate_invariant_ids() {
        let err = TaskSpec::from_json(
            r#"{"invariants": [
                {"id": "dup", "kind": "resource_exists", "address": "a.b"},
                {"id": "dup", "kind": "resource_exists", "address": "c.d"}
            ]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, TaskError::DuplicateInvariantId(id) if id == "dup"));
    }

    #[test]
    fn rejects_unknown_kind() {
        let err = TaskSpec::from_json(
            r#"{"invariants": [{"id": "x", "kind": "telepathy", "address": "a.b"}]}"#,
        );
        assert!(err.is_err());
    }

    #[test]
    fn address_requires_type_and_name() {
        assert!(ResourceAddress::parse("google_compute_instance.main").is_ok());
        assert!(ResourceAddress::parse("dangling.").is_err());
        assert!(ResourceAddress::parse(".name").is_err());
        assert!(ResourceAddress::parse("noseparator").is_err());
    }

    #[test]
    fn address_name_may_contain_dots() {
        let addr = ResourceAddress::parse("module.net.google_compute_network").unwrap();
        assert_eq!(addr.resource_type, "module");
        assert_eq!(addr.name, "net.google_compute_network");
    }

    #[test]
    fn preserves_unknown_top_level_fields() {
        let spec = TaskSpec::from_json(r#"{"task_id": "t", "provider": "gcp", "invariants": []}"#)
            .unwrap();
        assert_eq!(spec.extra.get("provider").and_then(Value::as_str), Some("gcp"));
    }
}
