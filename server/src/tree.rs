use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::OnceLock;
use tracing::debug;

use crate::error::{FormBuilderError, FormBuilderResult};
use crate::fields::FieldType;

pub type PluginId = u64;

pub const FORM_PLUGIN: &str = "FormPlugin";
pub const CHOICE_PLUGIN: &str = "ChoicePlugin";
pub const SUBMIT_PLUGIN: &str = "SubmitPlugin";

/// Role a plugin node plays while a form is assembled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginKind {
    Form,
    Field(FieldType),
    Choice,
    Submit,
    /// Anything else: rows, columns, headings. Traversed, never a field.
    Structural,
}

impl PluginKind {
    pub fn from_plugin_type(plugin_type: &str) -> Self {
        match plugin_type {
            FORM_PLUGIN => PluginKind::Form,
            CHOICE_PLUGIN => PluginKind::Choice,
            SUBMIT_PLUGIN => PluginKind::Submit,
            other => match FieldType::from_plugin_type(other) {
                Some(field_type) => PluginKind::Field(field_type),
                None => PluginKind::Structural,
            },
        }
    }
}

/// A node of the plugin arena. `parent` is a plain id, never an owning link.
#[derive(Debug, Clone)]
pub struct PluginNode {
    pub id: PluginId,
    pub plugin_type: String,
    pub parent: Option<PluginId>,
    pub config: Map<String, Value>,
    children: Vec<PluginId>,
    choices_cache: OnceLock<Vec<(String, String)>>,
}

impl PluginNode {
    fn new(id: PluginId, plugin_type: &str, parent: Option<PluginId>, config: Map<String, Value>) -> Self {
        Self {
            id,
            plugin_type: plugin_type.to_string(),
            parent,
            config,
            children: Vec::new(),
            choices_cache: OnceLock::new(),
        }
    }

    pub fn kind(&self) -> PluginKind {
        PluginKind::from_plugin_type(&self.plugin_type)
    }

    pub fn child_ids(&self) -> &[PluginId] {
        &self.children
    }

    /// Read a single config property.
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(Value::as_str)
    }

    /// Deserialize the whole config mapping into a typed struct.
    pub fn typed_config<T: DeserializeOwned>(&self) -> FormBuilderResult<T> {
        Ok(serde_json::from_value(Value::Object(self.config.clone()))?)
    }
}

/// Nested, serializable description of a plugin subtree. Used to load trees
/// from JSON files and fixtures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginSpec {
    #[serde(default)]
    pub id: Option<PluginId>,
    pub plugin_type: String,
    #[serde(default)]
    pub config: Map<String, Value>,
    #[serde(default)]
    pub children: Vec<PluginSpec>,
}

/// Arena holding every plugin node by id, with ordered child lists.
#[derive(Debug, Clone, Default)]
pub struct PluginTree {
    nodes: HashMap<PluginId, PluginNode>,
    roots: Vec<PluginId>,
    next_id: PluginId,
}

impl PluginTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a tree from nested specs. Nodes without an explicit id get the
    /// next free one.
    pub fn from_specs(specs: Vec<PluginSpec>) -> FormBuilderResult<Self> {
        let mut tree = Self::new();
        let explicit: Vec<PluginId> = collect_explicit_ids(&specs);
        tree.next_id = explicit.iter().copied().max().unwrap_or(0);
        let mut seen = HashSet::new();
        for id in explicit {
            if !seen.insert(id) {
                return Err(FormBuilderError::configuration(format!(
                    "duplicate plugin id {} in tree definition",
                    id
                )));
            }
        }
        for spec in specs {
            tree.insert_spec(None, spec)?;
        }
        Ok(tree)
    }

    pub fn from_json_str(raw: &str) -> FormBuilderResult<Self> {
        let specs: Vec<PluginSpec> = serde_json::from_str(raw)?;
        Self::from_specs(specs)
    }

    pub fn load_file(path: &Path) -> FormBuilderResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("reading plugin trees from {:?}: {}", path, e))?;
        let tree = Self::from_json_str(&raw)?;
        debug!(nodes = tree.len(), path = ?path, "loaded plugin trees");
        Ok(tree)
    }

    fn insert_spec(&mut self, parent: Option<PluginId>, spec: PluginSpec) -> FormBuilderResult<PluginId> {
        let id = match spec.id {
            Some(id) => id,
            None => self.allocate_id(),
        };
        self.attach(PluginNode::new(id, &spec.plugin_type, parent, spec.config))?;
        for child in spec.children {
            self.insert_spec(Some(id), child)?;
        }
        Ok(id)
    }

    fn allocate_id(&mut self) -> PluginId {
        self.next_id += 1;
        self.next_id
    }

    fn attach(&mut self, node: PluginNode) -> FormBuilderResult<()> {
        let id = node.id;
        match node.parent {
            Some(parent_id) => {
                let parent = self
                    .nodes
                    .get_mut(&parent_id)
                    .ok_or_else(|| FormBuilderError::not_found(format!("plugin {}", parent_id)))?;
                parent.children.push(id);
                parent.choices_cache = OnceLock::new();
            }
            None => self.roots.push(id),
        }
        self.nodes.insert(id, node);
        Ok(())
    }

    /// Append a new plugin under `parent` (or as a root) and return its id.
    pub fn add_plugin(
        &mut self,
        parent: Option<PluginId>,
        plugin_type: &str,
        config: Value,
    ) -> FormBuilderResult<PluginId> {
        let config = match config {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(FormBuilderError::configuration(format!(
                    "plugin config must be a mapping, got {}",
                    other
                )))
            }
        };
        let id = self.allocate_id();
        self.attach(PluginNode::new(id, plugin_type, parent, config))?;
        Ok(id)
    }

    pub fn get(&self, id: PluginId) -> Option<&PluginNode> {
        self.nodes.get(&id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn roots(&self) -> impl Iterator<Item = &PluginNode> {
        self.roots.iter().filter_map(|id| self.nodes.get(id))
    }

    pub fn children(&self, id: PluginId) -> impl Iterator<Item = &PluginNode> {
        self.nodes
            .get(&id)
            .map(|node| node.children.as_slice())
            .unwrap_or_default()
            .iter()
            .filter_map(|child| self.nodes.get(child))
    }

    pub fn parent(&self, id: PluginId) -> Option<&PluginNode> {
        self.nodes.get(&id).and_then(|n| n.parent).and_then(|p| self.nodes.get(&p))
    }

    /// All descendants of `id` in document order (pre-order), excluding `id`.
    pub fn descendants(&self, id: PluginId) -> Vec<&PluginNode> {
        let mut out = Vec::new();
        let mut stack: Vec<PluginId> = self
            .nodes
            .get(&id)
            .map(|n| n.children.iter().rev().copied().collect())
            .unwrap_or_default();
        while let Some(next) = stack.pop() {
            if let Some(node) = self.nodes.get(&next) {
                out.push(node);
                stack.extend(node.children.iter().rev().copied());
            }
        }
        out
    }

    /// Walk up the parent links until a node of the given kind is found.
    pub fn closest_ancestor(&self, id: PluginId, kind: PluginKind) -> Option<&PluginNode> {
        let mut current = self.parent(id);
        while let Some(node) = current {
            if node.kind() == kind {
                return Some(node);
            }
            current = self.parent(node.id);
        }
        None
    }

    /// Replace a node's config. Cached choices of the node and of its parent
    /// are dropped.
    pub fn set_config(&mut self, id: PluginId, config: Map<String, Value>) -> FormBuilderResult<()> {
        let node = self
            .nodes
            .get_mut(&id)
            .ok_or_else(|| FormBuilderError::not_found(format!("plugin {}", id)))?;
        node.config = config;
        node.choices_cache = OnceLock::new();
        let parent = node.parent;
        if let Some(parent) = parent {
            self.refresh(parent);
        }
        Ok(())
    }

    /// Drop cached derived data of a node (the choice list of a selection).
    pub fn refresh(&mut self, id: PluginId) {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.choices_cache = OnceLock::new();
        }
    }

    /// Remove a node and its whole subtree.
    pub fn remove(&mut self, id: PluginId) -> FormBuilderResult<()> {
        let node = self
            .nodes
            .get(&id)
            .ok_or_else(|| FormBuilderError::not_found(format!("plugin {}", id)))?;
        let parent = node.parent;
        let doomed: Vec<PluginId> = std::iter::once(id)
            .chain(self.descendants(id).into_iter().map(|n| n.id))
            .collect();
        for doomed_id in doomed {
            self.nodes.remove(&doomed_id);
        }
        match parent {
            Some(parent_id) => {
                if let Some(parent) = self.nodes.get_mut(&parent_id) {
                    parent.children.retain(|c| *c != id);
                    parent.choices_cache = OnceLock::new();
                }
            }
            None => self.roots.retain(|r| *r != id),
        }
        Ok(())
    }

    /// Ordered `(value, label)` pairs of the choice children of a selection
    /// node. Computed once and cached until the node is refreshed.
    pub fn choices(&self, id: PluginId) -> Vec<(String, String)> {
        let Some(node) = self.nodes.get(&id) else {
            return Vec::new();
        };
        node.choices_cache
            .get_or_init(|| {
                self.children(id)
                    .filter(|child| child.kind() == PluginKind::Choice)
                    .map(|child| {
                        let value = child.config_str("value").unwrap_or_default().to_string();
                        let label = child
                            .config_str("verbose")
                            .map(str::to_string)
                            .unwrap_or_else(|| value.clone());
                        (value, label)
                    })
                    .collect()
            })
            .clone()
    }

    /// Make the choice children of a selection node match `choices`: update
    /// labels of values that already exist (keeping their ids), add new
    /// values, delete values that are gone, and order children as given.
    pub fn sync_choices(&mut self, select_id: PluginId, choices: &[(String, String)]) -> FormBuilderResult<()> {
        let node = self
            .nodes
            .get(&select_id)
            .ok_or_else(|| FormBuilderError::not_found(format!("plugin {}", select_id)))?;
        if node.kind() != PluginKind::Field(FieldType::Select) {
            return Err(FormBuilderError::configuration(format!(
                "plugin {} ({}) does not hold choices",
                select_id, node.plugin_type
            )));
        }
        if choices.is_empty() {
            return Err(FormBuilderError::validation("Please provide at least one choice."));
        }

        let mut existing: HashMap<String, PluginId> = HashMap::new();
        let mut duplicates: Vec<PluginId> = Vec::new();
        let mut others: Vec<PluginId> = Vec::new();
        for child in self.children(select_id) {
            if child.kind() == PluginKind::Choice {
                let value = child.config_str("value").unwrap_or_default().to_string();
                match existing.entry(value) {
                    Entry::Occupied(_) => duplicates.push(child.id),
                    Entry::Vacant(slot) => {
                        slot.insert(child.id);
                    }
                }
            } else {
                others.push(child.id);
            }
        }

        let mut ordered = Vec::with_capacity(choices.len());
        for (value, verbose) in choices {
            match existing.remove(value) {
                Some(id) => {
                    if let Some(choice) = self.nodes.get_mut(&id) {
                        choice.config.insert("verbose".into(), Value::String(verbose.clone()));
                    }
                    ordered.push(id);
                }
                None => {
                    let id = self.allocate_id();
                    let mut config = Map::new();
                    config.insert("value".into(), Value::String(value.clone()));
                    config.insert("verbose".into(), Value::String(verbose.clone()));
                    self.nodes
                        .insert(id, PluginNode::new(id, CHOICE_PLUGIN, Some(select_id), config));
                    ordered.push(id);
                }
            }
        }

        // Whatever is left in `existing` was dropped from the list. Only the
        // first choice per value survives.
        let stale: Vec<PluginId> = existing.into_values().chain(duplicates).collect();
        for id in &stale {
            let subtree: Vec<PluginId> = self.descendants(*id).into_iter().map(|n| n.id).collect();
            for doomed in subtree {
                self.nodes.remove(&doomed);
            }
            self.nodes.remove(id);
        }
        debug!(select = select_id, kept = ordered.len(), removed = stale.len(), "synced choices");

        ordered.extend(others);
        if let Some(select) = self.nodes.get_mut(&select_id) {
            select.children = ordered;
            select.choices_cache = OnceLock::new();
        }
        Ok(())
    }
}

fn collect_explicit_ids(specs: &[PluginSpec]) -> Vec<PluginId> {
    let mut ids = Vec::new();
    for spec in specs {
        if let Some(id) = spec.id {
            ids.push(id);
        }
        ids.extend(collect_explicit_ids(&spec.children));
    }
    ids
}
