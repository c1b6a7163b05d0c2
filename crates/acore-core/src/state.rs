//! Provider state document as an arena-backed value tree.
//!
//! The state file produced by the IaC tool is a deeply nested JSON
//! document. Rather than chase references through `serde_json::Value`
//! clones, the document is interned once into an arena of nodes
//! addressed by integer ids; invariant matchers operate on arena views
//! with typed accessors. Iteration order everywhere is the insertion
//! order of the source document, which makes "first match" stable.

use serde_json::Value;

/// Errors raised while parsing a state document.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// The document is not valid JSON.
    #[error("invalid JSON in state file: {0}")]
    InvalidJson(#[from] serde_json::Error),

    /// The document parses but is not an object.
    #[error("state document root is not an object")]
    NotAnObject,
}

/// Index of a node in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u32);

/// One value node. Objects keep their keys in document order.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    /// JSON null.
    Null,
    /// JSON boolean.
    Bool(bool),
    /// JSON number.
    Number(serde_json::Number),
    /// JSON string.
    String(String),
    /// JSON array, elements in document order.
    Array(Vec<NodeId>),
    /// JSON object, entries in document order.
    Object(Vec<(String, NodeId)>),
}

/// Arena of interned value nodes.
#[derive(Debug, Default)]
pub struct StateArena {
    nodes: Vec<Node>,
}

impl StateArena {
    fn intern(&mut self, value: &Value) -> NodeId {
        let node = match value {
            Value::Null => Node::Null,
            Value::Bool(b) => Node::Bool(*b),
            Value::Number(n) => Node::Number(n.clone()),
            Value::String(s) => Node::String(s.clone()),
            Value::Array(items) => {
                let ids = items.iter().map(|v| self.intern(v)).collect();
                Node::Array(ids)
            }
            Value::Object(map) => {
                let entries = map
                    .iter()
                    .map(|(k, v)| (k.clone(), self.intern(v)))
                    .collect();
                Node::Object(entries)
            }
        };
        let id = NodeId(u32::try_from(self.nodes.len()).expect("arena overflow"));
        self.nodes.push(node);
        id
    }

    /// Returns the node for an id.
    ///
    /// # Panics
    ///
    /// Panics if `id` did not come from this arena.
    #[must_use]
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0 as usize]
    }

    /// Looks up an object field by key.
    #[must_use]
    pub fn field(&self, id: NodeId, key: &str) -> Option<NodeId> {
        match self.node(id) {
            Node::Object(entries) => entries
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| *v),
            _ => None,
        }
    }

    /// Indexes into an array node.
    #[must_use]
    pub fn index(&self, id: NodeId, idx: usize) -> Option<NodeId> {
        match self.node(id) {
            Node::Array(items) => items.get(idx).copied(),
            _ => None,
        }
    }

    /// Walks a dot-path from `root`. Digit components index arrays,
    /// everything else looks up object keys
    /// (`network_interface.0.network`). A leading `values.` prefix is
    /// accepted and skipped, matching the notation task generators use
    /// for plan-style paths.
    #[must_use]
    pub fn resolve_path(&self, root: NodeId, path: &str) -> Option<NodeId> {
        let path = path.strip_prefix("values.").unwrap_or(path);
        let mut current = root;
        for part in path.split('.') {
            current = if part.chars().all(|c| c.is_ascii_digit()) && !part.is_empty() {
                self.index(current, part.parse().ok()?)?
            } else {
                self.field(current, part)?
            };
        }
        Some(current)
    }

    /// String view of a node.
    #[must_use]
    pub fn as_str(&self, id: NodeId) -> Option<&str> {
        match self.node(id) {
            Node::String(s) => Some(s),
            _ => None,
        }
    }

    /// Array view of a node.
    #[must_use]
    pub fn as_array(&self, id: NodeId) -> Option<&[NodeId]> {
        match self.node(id) {
            Node::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Reconstructs the JSON value under a node, for detail reporting.
    #[must_use]
    pub fn to_value(&self, id: NodeId) -> Value {
        match self.node(id) {
            Node::Null => Value::Null,
            Node::Bool(b) => Value::Bool(*b),
            Node::Number(n) => Value::Number(n.clone()),
            Node::String(s) => Value::String(s.clone()),
            Node::Array(items) => Value::Array(items.iter().map(|i| self.to_value(*i)).collect()),
            Node::Object(entries) => Value::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), self.to_value(*v)))
                    .collect(),
            ),
        }
    }

    /// Structural equality between a node and a plain JSON value.
    #[must_use]
    pub fn value_eq(&self, id: NodeId, expected: &Value) -> bool {
        match (self.node(id), expected) {
            (Node::Null, Value::Null) => true,
            (Node::Bool(a), Value::Bool(b)) => a == b,
            (Node::Number(a), Value::Number(b)) => a == b,
            (Node::String(a), Value::String(b)) => a == b,
            (Node::Array(items), Value::Array(exp)) => {
                items.len() == exp.len()
                    && items.iter().zip(exp).all(|(i, e)| self.value_eq(*i, e))
            }
            (Node::Object(entries), Value::Object(exp)) => {
                entries.len() == exp.len()
                    && entries
                        .iter()
                        .all(|(k, v)| exp.get(k).is_some_and(|e| self.value_eq(*v, e)))
            }
            _ => false,
        }
    }
}

/// One managed resource instance extracted from the state document.
#[derive(Debug)]
pub struct Resource {
    /// Provider resource type, e.g. `google_compute_instance`.
    pub resource_type: String,
    /// Resource name within the configuration.
    pub name: String,
    /// Provider address string, if present.
    pub provider: Option<String>,
    /// Arena node holding the instance attributes object.
    pub attributes: NodeId,
}

/// A parsed state document: the arena plus the managed resources in
/// document order.
#[derive(Debug)]
pub struct StateDoc {
    arena: StateArena,
    resources: Vec<Resource>,
}

impl StateDoc {
    /// Parses a state document from JSON text.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] on malformed JSON or a non-object root.
    pub fn parse(raw: &str) -> Result<Self, StateError> {
        let value: Value = serde_json::from_str(raw)?;
        Self::from_value(&value)
    }

    /// Builds a state document from an already-parsed JSON value.
    ///
    /// Only `mode == "managed"` resources are extracted (data sources
    /// describe reads, not deployed state). Each instance of a
    /// resource becomes its own [`Resource`].
    ///
    /// # Errors
    ///
    /// Returns [`StateError::NotAnObject`] when the root is not an
    /// object.
    pub fn from_value(value: &Value) -> Result<Self, StateError> {
        let root = value.as_object().ok_or(StateError::NotAnObject)?;
        let mut arena = StateArena::default();
        let mut resources = Vec::new();

        let empty = Vec::new();
        let raw_resources = root
            .get("resources")
            .and_then(Value::as_array)
            .unwrap_or(&empty);

        for raw in raw_resources {
            let mode = raw.get("mode").and_then(Value::as_str).unwrap_or("managed");
            if mode != "managed" {
                continue;
            }
            let Some(resource_type) = raw.get("type").and_then(Value::as_str) else {
                continue;
            };
            let Some(name) = raw.get("name").and_then(Value::as_str) else {
                continue;
            };
            let provider = raw
                .get("provider")
                .and_then(Value::as_str)
                .map(str::to_string);

            let empty_instances = Vec::new();
            let instances = raw
                .get("instances")
                .and_then(Value::as_array)
                .unwrap_or(&empty_instances);
            for instance in instances {
                let attrs = instance.get("attributes").unwrap_or(&Value::Null);
                let attributes = arena.intern(attrs);
                resources.push(Resource {
                    resource_type: resource_type.to_string(),
                    name: name.to_string(),
                    provider: provider.clone(),
                    attributes,
                });
            }
        }

        Ok(Self { arena, resources })
    }

    /// The node arena backing this document.
    #[must_use]
    pub fn arena(&self) -> &StateArena {
        &self.arena
    }

    /// All managed resource instances, in document order.
    #[must_use]
    pub fn resources(&self) -> &[Resource] {
        &self.resources
    }

    /// Resource instances matching a type, in document order.
    pub fn find_by_type<'a>(&'a self, resource_type: &'a str) -> impl Iterator<Item = &'a Resource> {
        self.resources
            .iter()
            .filter(move |r| r.resource_type == resource_type)
    }

    /// Resource instances matching a type and name, in document order.
    pub fn find<'a>(
        &'a self,
        resource_type: &'a str,
        name: &'a str,
    ) -> impl Iterator<Item = &'a Resource> {
        self.resources
            .iter()
            .filter(move |r| r.resource_type == resource_type && r.name == name)
    }
}
