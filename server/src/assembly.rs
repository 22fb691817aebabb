use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::error::{FormBuilderError, FormBuilderResult};
use crate::fields::{get_form_field, FieldSpec};
use crate::tree::{PluginId, PluginKind, PluginTree};

pub const DEFAULT_SUBMIT_LABEL: &str = "Submit";
pub const LOGIN_REQUIRED_MESSAGE: &str = "Please login before submitting this form.";

/// Form-level options read from the form plugin's config.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FormOptions {
    #[serde(skip)]
    pub plugin_id: PluginId,
    pub form_name: String,
    #[serde(rename = "form_floating_labels")]
    pub floating_labels: bool,
    #[serde(rename = "form_login_required")]
    pub login_required: bool,
    #[serde(rename = "form_unique")]
    pub unique: bool,
    /// Slug of a registered form view used when the tree defines no fields.
    #[serde(deserialize_with = "deserialize_selection")]
    pub form_selection: Option<String>,
    /// Selected action identifiers, in execution order.
    #[serde(rename = "form_actions", deserialize_with = "deserialize_action_list")]
    pub actions: Vec<String>,
    pub action_parameters: Map<String, Value>,
}

fn deserialize_selection<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.map(|s| s.trim().to_string()).filter(|s| !s.is_empty()))
}

fn deserialize_action_list<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    let raw = Value::deserialize(deserializer)?;
    parse_action_list(&raw).map_err(serde::de::Error::custom)
}

/// Action lists are stored either as a JSON array or as a JSON-encoded
/// string holding that array.
pub fn parse_action_list(raw: &Value) -> Result<Vec<String>, String> {
    match raw {
        Value::Null => Ok(Vec::new()),
        Value::String(s) if s.trim().is_empty() => Ok(Vec::new()),
        Value::String(s) => {
            let inner: Value = serde_json::from_str(s).map_err(|e| format!("invalid action list: {}", e))?;
            parse_action_list(&inner)
        }
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::String(id) => Ok(id.clone()),
                other => Err(format!("action identifier must be a string, got {}", other)),
            })
            .collect(),
        other => Err(format!("invalid action list: {}", other)),
    }
}

/// One field of an assembled form.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FormField {
    pub plugin_id: PluginId,
    pub name: String,
    pub spec: FieldSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmitControl {
    pub plugin_id: Option<PluginId>,
    pub label: String,
    /// Added at render time because the tree holds no submit control.
    pub synthesized: bool,
}

/// Schema and options built from a form plugin and its descendants.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssembledForm {
    pub options: FormOptions,
    pub fields: Vec<FormField>,
    pub submit_controls: Vec<SubmitControl>,
}

/// Build the form rooted at `form_id`.
///
/// Returns `Ok(None)` when the tree defines no fields and no form view is
/// selected: there is nothing to render.
pub fn assemble(tree: &PluginTree, form_id: PluginId) -> FormBuilderResult<Option<AssembledForm>> {
    let node = tree
        .get(form_id)
        .filter(|n| n.kind() == PluginKind::Form)
        .ok_or_else(|| FormBuilderError::not_found(format!("form plugin {}", form_id)))?;

    let mut options: FormOptions = node.typed_config()?;
    options.plugin_id = form_id;
    if options.form_name.trim().is_empty() {
        options.form_name = format!("form-{}", form_id);
    }

    let mut fields = Vec::new();
    let mut submit_controls = Vec::new();
    collect_fields(tree, form_id, &mut fields, &mut submit_controls)?;

    if fields.is_empty() && options.form_selection.is_none() {
        debug!(form = form_id, "no fields, nothing to assemble");
        return Ok(None);
    }

    Ok(Some(AssembledForm {
        options,
        fields,
        submit_controls,
    }))
}

fn collect_fields(
    tree: &PluginTree,
    parent: PluginId,
    fields: &mut Vec<FormField>,
    submits: &mut Vec<SubmitControl>,
) -> FormBuilderResult<()> {
    for child in tree.children(parent) {
        match child.kind() {
            PluginKind::Field(_) => {
                if let Some((name, spec)) = get_form_field(tree, child)? {
                    let field = FormField {
                        plugin_id: child.id,
                        name,
                        spec,
                    };
                    match fields.iter_mut().find(|f| f.name == field.name) {
                        Some(existing) => {
                            warn!(field = %field.name, plugin = child.id, "duplicate field name, later plugin wins");
                            *existing = field;
                        }
                        None => fields.push(field),
                    }
                }
                // Fields are leaves of the schema; only submit controls are looked for below.
                for nested in tree.descendants(child.id) {
                    if nested.kind() == PluginKind::Submit {
                        submits.push(submit_control(nested));
                    }
                }
            }
            PluginKind::Submit => {
                submits.push(submit_control(child));
                for nested in tree.descendants(child.id) {
                    if nested.kind() == PluginKind::Submit {
                        submits.push(submit_control(nested));
                    }
                }
            }
            PluginKind::Form => {
                debug!(plugin = child.id, "nested form plugin ignored");
            }
            PluginKind::Choice | PluginKind::Structural => collect_fields(tree, child.id, fields, submits)?,
        }
    }
    Ok(())
}

fn submit_control(node: &crate::tree::PluginNode) -> SubmitControl {
    SubmitControl {
        plugin_id: Some(node.id),
        label: node
            .config_str("submit_cta")
            .filter(|l| !l.is_empty())
            .unwrap_or(DEFAULT_SUBMIT_LABEL)
            .to_string(),
        synthesized: false,
    }
}

/// Submitted form values, kept in arrival order with repeated keys.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FormData {
    values: Vec<(String, String)>,
}

impl FormData {
    pub fn from_urlencoded(body: &str) -> Self {
        Self {
            values: url::form_urlencoded::parse(body.as_bytes()).into_owned().collect(),
        }
    }

    pub fn from_pairs<K: Into<String>, V: Into<String>>(pairs: impl IntoIterator<Item = (K, V)>) -> Self {
        Self {
            values: pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }

    pub fn get_all(&self, name: &str) -> Vec<String> {
        self.values
            .iter()
            .filter(|(k, _)| k == name)
            .map(|(_, v)| v.clone())
            .collect()
    }
}

/// Result of validating submitted data against an assembled form.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BoundForm {
    pub cleaned_data: Map<String, Value>,
    /// Field errors keyed by field name.
    pub errors: BTreeMap<String, Vec<String>>,
    pub non_field_errors: Vec<String>,
}

impl BoundForm {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty() && self.non_field_errors.is_empty()
    }
}

impl AssembledForm {
    pub fn plugin_id(&self) -> PluginId {
        self.options.plugin_id
    }

    pub fn field(&self, name: &str) -> Option<&FormField> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Field ids on the page carry the plugin id so several forms never clash.
    pub fn error_key(&self, field_name: &str) -> String {
        format!("{}{}", field_name, self.plugin_id())
    }

    pub fn non_field_error_key(&self) -> String {
        self.error_key("__all__")
    }

    /// Submit controls to render: the tree's own, or a synthesized one.
    pub fn rendered_submit_controls(&self) -> Vec<SubmitControl> {
        if !self.submit_controls.is_empty() {
            return self.submit_controls.clone();
        }
        vec![SubmitControl {
            plugin_id: None,
            label: DEFAULT_SUBMIT_LABEL.to_string(),
            synthesized: true,
        }]
    }

    /// Validate `data`. Anonymous users are refused by login-required forms.
    pub fn bind(&self, data: &FormData, user: Option<&str>) -> BoundForm {
        let mut bound = BoundForm::default();
        if self.options.login_required && user.is_none() {
            bound.non_field_errors.push(LOGIN_REQUIRED_MESSAGE.to_string());
        }
        for field in &self.fields {
            match field.spec.clean(&data.get_all(&field.name)) {
                Ok(value) => {
                    bound.cleaned_data.insert(field.name.clone(), value);
                }
                Err(messages) => {
                    bound.errors.insert(field.name.clone(), messages);
                }
            }
        }
        bound
    }

    /// Errors in the wire shape: field keys namespaced with the plugin id,
    /// non-field errors under `__all__<plugin id>`.
    pub fn namespaced_errors(&self, bound: &BoundForm) -> BTreeMap<String, Vec<String>> {
        let mut errors: BTreeMap<String, Vec<String>> = bound
            .errors
            .iter()
            .map(|(name, messages)| (self.error_key(name), messages.clone()))
            .collect();
        if !bound.non_field_errors.is_empty() {
            errors.insert(self.non_field_error_key(), bound.non_field_errors.clone());
        }
        errors
    }

    /// Everything a client needs to render this form.
    pub fn describe(&self, action_url: &str) -> Value {
        let fields: Vec<Value> = self
            .fields
            .iter()
            .map(|f| {
                json!({
                    "name": f.name,
                    "id": self.error_key(&f.name),
                    "plugin_id": f.plugin_id,
                    "spec": f.spec,
                })
            })
            .collect();
        json!({
            "form_name": self.options.form_name,
            "plugin_id": self.plugin_id(),
            "action": action_url,
            "floating_labels": self.options.floating_labels,
            "login_required": self.options.login_required,
            "unique": self.options.unique,
            "form_selection": self.options.form_selection,
            "fields": fields,
            "submit": self.rendered_submit_controls(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{CHOICE_PLUGIN, FORM_PLUGIN, SUBMIT_PLUGIN};

    fn form_with(config: Value) -> (PluginTree, PluginId) {
        let mut tree = PluginTree::new();
        let form = tree.add_plugin(None, FORM_PLUGIN, config).unwrap();
        (tree, form)
    }

    #[test]
    fn test_parse_action_list_formats() {
        assert_eq!(parse_action_list(&json!(r#"["a", "b"]"#)).unwrap(), vec!["a", "b"]);
        assert_eq!(parse_action_list(&json!(["c"])).unwrap(), vec!["c"]);
        assert!(parse_action_list(&json!("")).unwrap().is_empty());
        assert!(parse_action_list(&Value::Null).unwrap().is_empty());
        assert!(parse_action_list(&json!("{not json")).is_err());
        assert!(parse_action_list(&json!([1])).is_err());
    }

    #[test]
    fn test_options_from_config() {
        let (mut tree, form) = form_with(json!({
            "form_name": "contact",
            "form_floating_labels": true,
            "form_login_required": true,
            "form_unique": true,
            "form_selection": "",
            "form_actions": "[\"abc\"]",
            "action_parameters": {"redirect_link": "/thanks/"},
        }));
        tree.add_plugin(Some(form), "CharFieldPlugin", json!({"field_name": "name"})).unwrap();

        let assembled = assemble(&tree, form).unwrap().unwrap();
        let options = &assembled.options;
        assert_eq!(options.plugin_id, form);
        assert_eq!(options.form_name, "contact");
        assert!(options.floating_labels && options.login_required && options.unique);
        assert!(options.form_selection.is_none());
        assert_eq!(options.actions, vec!["abc"]);
        assert_eq!(options.action_parameters["redirect_link"], "/thanks/");
    }

    #[test]
    fn test_fields_collected_recursively_in_document_order() {
        let (mut tree, form) = form_with(json!({"form_name": "f"}));
        tree.add_plugin(Some(form), "CharFieldPlugin", json!({"field_name": "first"})).unwrap();
        let row = tree.add_plugin(Some(form), "RowPlugin", json!({})).unwrap();
        let col = tree.add_plugin(Some(row), "ColumnPlugin", json!({})).unwrap();
        tree.add_plugin(Some(col), "EmailFieldPlugin", json!({"field_name": "nested"})).unwrap();
        let select = tree.add_plugin(Some(form), "SelectPlugin", json!({"field_name": "pick"})).unwrap();
        tree.add_plugin(Some(select), CHOICE_PLUGIN, json!({"value": "a", "verbose": "A"})).unwrap();
        tree.add_plugin(Some(form), "TextPlugin", json!({"body": "hello"})).unwrap();

        let assembled = assemble(&tree, form).unwrap().unwrap();
        let names: Vec<&str> = assembled.fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["first", "nested", "pick"]);
    }

    #[test]
    fn test_empty_tree_yields_no_form() {
        let (mut tree, form) = form_with(json!({"form_name": "empty"}));
        tree.add_plugin(Some(form), "TextPlugin", json!({})).unwrap();
        assert!(assemble(&tree, form).unwrap().is_none());
    }

    #[test]
    fn test_form_selection_keeps_empty_form() {
        let (tree, form) = form_with(json!({"form_name": "external", "form_selection": "newsletter"}));
        let assembled = assemble(&tree, form).unwrap().unwrap();
        assert!(assembled.fields.is_empty());
        assert_eq!(assembled.options.form_selection.as_deref(), Some("newsletter"));
    }

    #[test]
    fn test_non_form_root_is_not_found() {
        let mut tree = PluginTree::new();
        let text = tree.add_plugin(None, "TextPlugin", json!({})).unwrap();
        assert!(matches!(assemble(&tree, text), Err(FormBuilderError::NotFound(_))));
        assert!(matches!(assemble(&tree, 999), Err(FormBuilderError::NotFound(_))));
    }

    #[test]
    fn test_submit_control_synthesized_when_missing() {
        let (mut tree, form) = form_with(json!({}));
        tree.add_plugin(Some(form), "CharFieldPlugin", json!({"field_name": "name"})).unwrap();
        let assembled = assemble(&tree, form).unwrap().unwrap();
        assert!(assembled.submit_controls.is_empty());
        let rendered = assembled.rendered_submit_controls();
        assert_eq!(rendered.len(), 1);
        assert!(rendered[0].synthesized);
        assert_eq!(tree.len(), 2);
    }

    #[test]
    fn test_nested_submit_control_is_found() {
        let (mut tree, form) = form_with(json!({}));
        tree.add_plugin(Some(form), "CharFieldPlugin", json!({"field_name": "name"})).unwrap();
        let row = tree.add_plugin(Some(form), "RowPlugin", json!({})).unwrap();
        let col = tree.add_plugin(Some(row), "ColumnPlugin", json!({})).unwrap();
        tree.add_plugin(Some(col), SUBMIT_PLUGIN, json!({"submit_cta": "Send"})).unwrap();

        let rendered = assemble(&tree, form).unwrap().unwrap().rendered_submit_controls();
        assert_eq!(rendered.len(), 1);
        assert!(!rendered[0].synthesized);
        assert_eq!(rendered[0].label, "Send");
    }

    #[test]
    fn test_submit_inside_selection_is_found_transitively() {
        let (mut tree, form) = form_with(json!({}));
        let select = tree.add_plugin(Some(form), "SelectPlugin", json!({"field_name": "pick"})).unwrap();
        let wrapper = tree.add_plugin(Some(select), "RowPlugin", json!({})).unwrap();
        tree.add_plugin(Some(wrapper), SUBMIT_PLUGIN, json!({})).unwrap();

        let assembled = assemble(&tree, form).unwrap().unwrap();
        assert_eq!(assembled.rendered_submit_controls().len(), 1);
        assert_eq!(assembled.fields.len(), 1);
    }

    #[test]
    fn test_bind_valid_and_invalid() {
        let (mut tree, form) = form_with(json!({"form_name": "signup"}));
        tree.add_plugin(Some(form), "CharFieldPlugin", json!({"field_name": "username", "field_required": true}))
            .unwrap();
        tree.add_plugin(Some(form), "EmailFieldPlugin", json!({"field_name": "email", "field_required": true}))
            .unwrap();
        let assembled = assemble(&tree, form).unwrap().unwrap();

        let data = FormData::from_urlencoded("username=testuser&email=test%40example.com");
        let bound = assembled.bind(&data, None);
        assert!(bound.is_valid());
        assert_eq!(bound.cleaned_data["email"], "test@example.com");

        let bound = assembled.bind(&FormData::from_urlencoded("email=not-an-email"), None);
        assert!(!bound.is_valid());
        let errors = assembled.namespaced_errors(&bound);
        assert!(errors.contains_key(&format!("username{}", form)));
        assert!(errors.contains_key(&format!("email{}", form)));
    }

    #[test]
    fn test_login_required_rejects_anonymous() {
        let (mut tree, form) = form_with(json!({"form_login_required": true}));
        tree.add_plugin(Some(form), "CharFieldPlugin", json!({"field_name": "name"})).unwrap();
        let assembled = assemble(&tree, form).unwrap().unwrap();
        let data = FormData::from_pairs([("name", "x")]);

        let anonymous = assembled.bind(&data, None);
        assert!(!anonymous.is_valid());
        let errors = assembled.namespaced_errors(&anonymous);
        assert_eq!(errors[&format!("__all__{}", form)], vec![LOGIN_REQUIRED_MESSAGE.to_string()]);

        assert!(assembled.bind(&data, Some("alice")).is_valid());
    }

    #[test]
    fn test_describe_includes_synthesized_submit() {
        let (mut tree, form) = form_with(json!({"form_name": "contact", "form_floating_labels": true}));
        tree.add_plugin(Some(form), "CharFieldPlugin", json!({"field_name": "name", "field_label": "Name"}))
            .unwrap();
        let description = assemble(&tree, form).unwrap().unwrap().describe("/@form-builder/1");
        assert_eq!(description["form_name"], "contact");
        assert_eq!(description["floating_labels"], true);
        assert_eq!(description["fields"][0]["id"], format!("name{}", form));
        assert_eq!(description["fields"][0]["spec"]["label"], "Name");
        assert_eq!(description["submit"][0]["synthesized"], true);
    }
}
