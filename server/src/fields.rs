use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use tracing::warn;

use crate::error::FormBuilderResult;
use crate::tree::{PluginKind, PluginNode, PluginTree};

lazy_static! {
    static ref EMAIL_RE: Regex =
        Regex::new(r"^[A-Za-z0-9.!#$%&'*+/=?^_`{|}~-]+@[A-Za-z0-9](?:[A-Za-z0-9-]*[A-Za-z0-9])?(?:\.[A-Za-z0-9](?:[A-Za-z0-9-]*[A-Za-z0-9])?)+$").unwrap();
}

const MSG_REQUIRED: &str = "This field is required.";
const NO_SELECTION_LABEL: &str = "No selection";

/// One entry of a choice list. Groups nest further entries under a label.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Choice {
    Item(String, String),
    Group(String, Vec<Choice>),
}

impl Choice {
    pub fn item(value: impl Into<String>, label: impl Into<String>) -> Self {
        Choice::Item(value.into(), label.into())
    }
}

/// First selectable value of a (possibly grouped) choice list.
pub fn first_choice(choices: &[Choice]) -> Option<&str> {
    for choice in choices {
        match choice {
            Choice::Item(value, _) => return Some(value.as_str()),
            Choice::Group(_, nested) => {
                if let Some(value) = first_choice(nested) {
                    return Some(value);
                }
            }
        }
    }
    None
}

/// Supported field plugins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Text,
    Email,
    Url,
    Decimal,
    Integer,
    Textarea,
    Date,
    DateTime,
    Time,
    Boolean,
    Select,
}

impl FieldType {
    pub fn from_plugin_type(plugin_type: &str) -> Option<Self> {
        let field_type = match plugin_type {
            "CharFieldPlugin" => FieldType::Text,
            "EmailFieldPlugin" => FieldType::Email,
            "UrlFieldPlugin" => FieldType::Url,
            "DecimalFieldPlugin" => FieldType::Decimal,
            "IntegerFieldPlugin" => FieldType::Integer,
            "TextareaFieldPlugin" => FieldType::Textarea,
            "DateFieldPlugin" => FieldType::Date,
            "DateTimeFieldPlugin" => FieldType::DateTime,
            "TimeFieldPlugin" => FieldType::Time,
            "BooleanFieldPlugin" => FieldType::Boolean,
            "SelectPlugin" => FieldType::Select,
            _ => return None,
        };
        Some(field_type)
    }

    pub fn plugin_type(&self) -> &'static str {
        match self {
            FieldType::Text => "CharFieldPlugin",
            FieldType::Email => "EmailFieldPlugin",
            FieldType::Url => "UrlFieldPlugin",
            FieldType::Decimal => "DecimalFieldPlugin",
            FieldType::Integer => "IntegerFieldPlugin",
            FieldType::Textarea => "TextareaFieldPlugin",
            FieldType::Date => "DateFieldPlugin",
            FieldType::DateTime => "DateTimeFieldPlugin",
            FieldType::Time => "TimeFieldPlugin",
            FieldType::Boolean => "BooleanFieldPlugin",
            FieldType::Select => "SelectPlugin",
        }
    }
}

/// Canonical kind of the form input a field produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FormFieldKind {
    Text,
    Email,
    Url,
    Decimal,
    Integer,
    Boolean,
    Date,
    DateTime,
    Time,
    SingleSelect,
    MultiSelect,
}

/// How a selection field is presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectStyle {
    #[default]
    Select,
    Radio,
    Multiselect,
    Checkbox,
}

impl SelectStyle {
    pub fn is_multiple(&self) -> bool {
        matches!(self, SelectStyle::Multiselect | SelectStyle::Checkbox)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WidgetKind {
    Input,
    Textarea,
    Checkbox,
    Switch,
    Select,
    Radio,
    SelectMultiple,
    CheckboxMultiple,
}

/// Presentation hints for the renderer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WidgetHints {
    pub widget: WidgetKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_type: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<u32>,
    pub attributes: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub classes: Vec<String>,
}

impl WidgetHints {
    fn new(widget: WidgetKind, input_type: Option<&'static str>) -> Self {
        Self {
            widget,
            input_type,
            placeholder: None,
            rows: None,
            attributes: BTreeMap::new(),
            classes: Vec::new(),
        }
    }

    /// Add CSS classes; each argument may hold several space-separated names.
    pub fn add_classes(&mut self, classes: &[&str]) {
        for name in classes.iter().flat_map(|c| c.split_whitespace()) {
            if !self.classes.iter().any(|c| c == name) {
                self.classes.push(name.to_string());
            }
        }
    }

    pub fn add_attribute(&mut self, name: &str, value: &str) {
        self.attributes.insert(name.to_string(), value.to_string());
    }

    /// Attributes rendered as ` key="value"` pairs. Additional classes are
    /// merged into `class`.
    pub fn attributes_html(&self) -> String {
        let mut attrs = self.attributes.clone();
        if !self.classes.is_empty() {
            let merged = match attrs.get("class") {
                Some(existing) if !existing.is_empty() => format!("{} {}", existing, self.classes.join(" ")),
                _ => self.classes.join(" "),
            };
            attrs.insert("class".to_string(), merged);
        }
        attrs
            .iter()
            .map(|(k, v)| format!(" {}=\"{}\"", k, escape_attr(v)))
            .collect()
    }
}

fn escape_attr(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('"', "&quot;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Config properties a field plugin may carry.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FieldConfig {
    pub field_name: String,
    pub field_label: String,
    pub field_required: bool,
    pub field_placeholder: String,
    pub field_help: String,
    pub min_length: Option<usize>,
    pub max_length: Option<usize>,
    pub min_value: Option<Value>,
    pub max_value: Option<Value>,
    pub decimal_places: Option<u32>,
    pub field_rows: Option<u32>,
    pub field_as_switch: bool,
    pub field_select: SelectStyle,
    pub attributes: BTreeMap<String, String>,
}

/// Declarative description of one form input.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldSpec {
    pub field_type: FieldType,
    pub kind: FormFieldKind,
    pub label: String,
    pub required: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub help_text: String,
    pub widget: WidgetHints,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub choices: Vec<Choice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decimal_places: Option<u32>,
}

/// Upper bound on configured decimal places.
pub const MAX_DECIMAL_PLACES: u32 = 30;

/// Build the `(name, spec)` pair of a field plugin. Returns `None` for nodes
/// that are not fields or that have no field name yet.
pub fn get_form_field(tree: &PluginTree, node: &PluginNode) -> FormBuilderResult<Option<(String, FieldSpec)>> {
    let PluginKind::Field(field_type) = node.kind() else {
        return Ok(None);
    };
    let config: FieldConfig = node.typed_config()?;
    let name = config.field_name.trim().to_string();
    if name.is_empty() {
        warn!(plugin = node.id, plugin_type = %node.plugin_type, "field plugin without field_name skipped");
        return Ok(None);
    }

    let (kind, mut widget) = match field_type {
        FieldType::Text => (FormFieldKind::Text, WidgetHints::new(WidgetKind::Input, Some("text"))),
        FieldType::Email => (FormFieldKind::Email, WidgetHints::new(WidgetKind::Input, Some("email"))),
        FieldType::Url => (FormFieldKind::Url, WidgetHints::new(WidgetKind::Input, Some("url"))),
        FieldType::Decimal => (FormFieldKind::Decimal, WidgetHints::new(WidgetKind::Input, Some("number"))),
        FieldType::Integer => (FormFieldKind::Integer, WidgetHints::new(WidgetKind::Input, Some("number"))),
        FieldType::Textarea => (FormFieldKind::Text, WidgetHints::new(WidgetKind::Textarea, None)),
        FieldType::Date => (FormFieldKind::Date, WidgetHints::new(WidgetKind::Input, Some("date"))),
        FieldType::DateTime => (
            FormFieldKind::DateTime,
            WidgetHints::new(WidgetKind::Input, Some("datetime-local")),
        ),
        FieldType::Time => (FormFieldKind::Time, WidgetHints::new(WidgetKind::Input, Some("time"))),
        FieldType::Boolean => {
            let widget = if config.field_as_switch { WidgetKind::Switch } else { WidgetKind::Checkbox };
            (FormFieldKind::Boolean, WidgetHints::new(widget, Some("checkbox")))
        }
        FieldType::Select => {
            let (kind, widget) = match config.field_select {
                SelectStyle::Select => (FormFieldKind::SingleSelect, WidgetKind::Select),
                SelectStyle::Radio => (FormFieldKind::SingleSelect, WidgetKind::Radio),
                SelectStyle::Multiselect => (FormFieldKind::MultiSelect, WidgetKind::SelectMultiple),
                SelectStyle::Checkbox => (FormFieldKind::MultiSelect, WidgetKind::CheckboxMultiple),
            };
            (kind, WidgetHints::new(widget, None))
        }
    };

    if !config.field_placeholder.is_empty() {
        widget.placeholder = Some(config.field_placeholder.clone());
    }
    if field_type == FieldType::Textarea {
        widget.rows = Some(config.field_rows.unwrap_or(10));
    }
    let decimal_places = config.decimal_places.map(|places| places.min(MAX_DECIMAL_PLACES));
    if field_type == FieldType::Decimal {
        let step = match decimal_places {
            Some(0) | None => "1".to_string(),
            Some(places) => format!("0.{}1", "0".repeat(places as usize - 1)),
        };
        widget.add_attribute("step", &step);
    }
    for (key, value) in &config.attributes {
        widget.add_attribute(key, value);
    }

    let mut choices = Vec::new();
    if field_type == FieldType::Select {
        if !config.field_required && !config.field_select.is_multiple() {
            choices.push(Choice::item("", NO_SELECTION_LABEL));
        }
        choices.extend(tree.choices(node.id).into_iter().map(|(v, l)| Choice::Item(v, l)));
    }

    let label = if config.field_label.is_empty() { name.clone() } else { config.field_label.clone() };
    let spec = FieldSpec {
        field_type,
        kind,
        label,
        required: config.field_required,
        help_text: config.field_help.clone(),
        widget,
        choices,
        min_length: config.min_length,
        max_length: config.max_length,
        min_value: config.min_value.as_ref().and_then(bound_to_string),
        max_value: config.max_value.as_ref().and_then(bound_to_string),
        decimal_places,
    };
    Ok(Some((name, spec)))
}

fn bound_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Human readable one-liner for any plugin node, used in listings.
pub fn short_description(node: &PluginNode) -> String {
    match node.kind() {
        PluginKind::Form => match node.config_str("form_name").filter(|n| !n.is_empty()) {
            Some(name) => format!("({})", name),
            None => "<unnamed>".to_string(),
        },
        PluginKind::Choice => format!(
            "{} ({})",
            node.config_str("verbose").unwrap_or_default(),
            node.config_str("value").unwrap_or_default()
        ),
        PluginKind::Submit => node.config_str("submit_cta").unwrap_or("Submit").to_string(),
        PluginKind::Field(_) => format!(
            "{} ({})",
            node.config_str("field_label").unwrap_or_default(),
            node.config_str("field_name").unwrap_or_default()
        ),
        PluginKind::Structural => format!("{} ({})", node.plugin_type, node.id),
    }
}

impl FieldSpec {
    pub fn is_multiple(&self) -> bool {
        self.kind == FormFieldKind::MultiSelect
    }

    /// Validate the raw submitted values for this field and return the
    /// cleaned value, or the list of error messages.
    pub fn clean(&self, raw: &[String]) -> Result<Value, Vec<String>> {
        if self.is_multiple() {
            return self.clean_multiple(raw);
        }
        let value = raw.first().map(|s| s.trim()).unwrap_or_default();

        if self.kind == FormFieldKind::Boolean {
            let checked = matches!(value.to_ascii_lowercase().as_str(), "on" | "true" | "1" | "yes");
            if self.required && !checked {
                return Err(vec![MSG_REQUIRED.to_string()]);
            }
            return Ok(Value::Bool(checked));
        }

        if value.is_empty() {
            if self.required {
                return Err(vec![MSG_REQUIRED.to_string()]);
            }
            return Ok(match self.kind {
                FormFieldKind::Text | FormFieldKind::Email | FormFieldKind::Url | FormFieldKind::SingleSelect => {
                    Value::String(String::new())
                }
                _ => Value::Null,
            });
        }

        match self.kind {
            FormFieldKind::Text => self.check_length(value).map(|_| Value::String(value.to_string())),
            FormFieldKind::Email => {
                self.check_length(value)?;
                if EMAIL_RE.is_match(value) {
                    Ok(Value::String(value.to_string()))
                } else {
                    Err(vec!["Enter a valid email address.".to_string()])
                }
            }
            FormFieldKind::Url => {
                self.check_length(value)?;
                clean_url(value).map(Value::String)
            }
            FormFieldKind::Integer => self.clean_integer(value),
            FormFieldKind::Decimal => self.clean_decimal(value),
            FormFieldKind::Date => NaiveDate::parse_from_str(value, "%Y-%m-%d")
                .map(|d| Value::String(d.format("%Y-%m-%d").to_string()))
                .map_err(|_| vec!["Enter a valid date.".to_string()]),
            FormFieldKind::DateTime => parse_datetime(value)
                .map(|dt| Value::String(dt.format("%Y-%m-%dT%H:%M:%S").to_string()))
                .ok_or_else(|| vec!["Enter a valid date/time.".to_string()]),
            FormFieldKind::Time => parse_time(value)
                .map(|t| Value::String(t.format("%H:%M:%S").to_string()))
                .ok_or_else(|| vec!["Enter a valid time.".to_string()]),
            FormFieldKind::SingleSelect => {
                if self.has_choice(value) {
                    Ok(Value::String(value.to_string()))
                } else {
                    Err(vec![invalid_choice(value)])
                }
            }
            FormFieldKind::Boolean | FormFieldKind::MultiSelect => unreachable!("handled above"),
        }
    }

    fn clean_multiple(&self, raw: &[String]) -> Result<Value, Vec<String>> {
        let values: Vec<&str> = raw.iter().map(|s| s.trim()).filter(|s| !s.is_empty()).collect();
        if values.is_empty() && self.required {
            return Err(vec![MSG_REQUIRED.to_string()]);
        }
        let errors: Vec<String> = values
            .iter()
            .filter(|v| !self.has_choice(v))
            .map(|v| invalid_choice(v))
            .collect();
        if !errors.is_empty() {
            return Err(errors);
        }
        Ok(Value::Array(values.into_iter().map(|v| Value::String(v.to_string())).collect()))
    }

    fn has_choice(&self, value: &str) -> bool {
        fn contains(choices: &[Choice], value: &str) -> bool {
            choices.iter().any(|c| match c {
                Choice::Item(v, _) => v == value,
                Choice::Group(_, nested) => contains(nested, value),
            })
        }
        contains(&self.choices, value)
    }

    fn check_length(&self, value: &str) -> Result<(), Vec<String>> {
        let len = value.chars().count();
        if let Some(min) = self.min_length {
            if len < min {
                return Err(vec![format!(
                    "Ensure this value has at least {} characters (it has {}).",
                    min, len
                )]);
            }
        }
        if let Some(max) = self.max_length {
            if len > max {
                return Err(vec![format!(
                    "Ensure this value has at most {} characters (it has {}).",
                    max, len
                )]);
            }
        }
        Ok(())
    }

    fn clean_integer(&self, value: &str) -> Result<Value, Vec<String>> {
        let number: i64 = value
            .parse()
            .map_err(|_| vec!["Enter a whole number.".to_string()])?;
        let mut errors = Vec::new();
        if let Some(min) = self.min_value.as_deref().and_then(|m| m.parse::<i64>().ok()) {
            if number < min {
                errors.push(format!("Ensure this value is greater than or equal to {}.", min));
            }
        }
        if let Some(max) = self.max_value.as_deref().and_then(|m| m.parse::<i64>().ok()) {
            if number > max {
                errors.push(format!("Ensure this value is less than or equal to {}.", max));
            }
        }
        if errors.is_empty() {
            Ok(Value::from(number))
        } else {
            Err(errors)
        }
    }

    /// Decimals stay strings end to end; only bounds and precision are checked.
    fn clean_decimal(&self, value: &str) -> Result<Value, Vec<String>> {
        let parsed = DecimalParts::parse(value).ok_or_else(|| vec!["Enter a number.".to_string()])?;
        let mut errors = Vec::new();
        if let Some(places) = self.decimal_places {
            if parsed.fraction.len() > places as usize {
                errors.push(format!(
                    "Ensure that there are no more than {} decimal places.",
                    places
                ));
            }
        }
        if let Some(min) = self.min_value.as_deref().and_then(DecimalParts::parse) {
            if parsed.compare(&min) == Ordering::Less {
                errors.push(format!(
                    "Ensure this value is greater than or equal to {}.",
                    self.min_value.as_deref().unwrap_or_default()
                ));
            }
        }
        if let Some(max) = self.max_value.as_deref().and_then(DecimalParts::parse) {
            if parsed.compare(&max) == Ordering::Greater {
                errors.push(format!(
                    "Ensure this value is less than or equal to {}.",
                    self.max_value.as_deref().unwrap_or_default()
                ));
            }
        }
        if errors.is_empty() {
            Ok(Value::String(parsed.to_string()))
        } else {
            Err(errors)
        }
    }
}

fn invalid_choice(value: &str) -> String {
    format!("Select a valid choice. {} is not one of the available choices.", value)
}

fn clean_url(value: &str) -> Result<String, Vec<String>> {
    let candidate = if value.contains("://") { value.to_string() } else { format!("http://{}", value) };
    let invalid = || vec!["Enter a valid URL.".to_string()];
    let parsed = url::Url::parse(&candidate).map_err(|_| invalid())?;
    let scheme_ok = matches!(parsed.scheme(), "http" | "https" | "ftp" | "ftps");
    match parsed.host_str() {
        Some(host) if scheme_ok && (host.contains('.') || host == "localhost") => Ok(candidate),
        _ => Err(invalid()),
    }
}

fn parse_datetime(value: &str) -> Option<NaiveDateTime> {
    ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
}

fn parse_time(value: &str) -> Option<NaiveTime> {
    ["%H:%M:%S", "%H:%M"]
        .iter()
        .find_map(|fmt| NaiveTime::parse_from_str(value, fmt).ok())
}

/// A decimal number held as its digit strings.
#[derive(Debug, Clone, PartialEq, Eq)]
struct DecimalParts {
    negative: bool,
    integer: String,
    fraction: String,
}

impl DecimalParts {
    fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let (negative, body) = match raw.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, raw.strip_prefix('+').unwrap_or(raw)),
        };
        let (integer, fraction) = match body.split_once('.') {
            Some((i, f)) => (i, f),
            None => (body, ""),
        };
        if integer.is_empty() && fraction.is_empty() {
            return None;
        }
        if !integer.chars().all(|c| c.is_ascii_digit()) || !fraction.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        let integer = integer.trim_start_matches('0');
        Some(Self {
            negative,
            integer: if integer.is_empty() { "0".to_string() } else { integer.to_string() },
            fraction: fraction.to_string(),
        })
    }

    fn is_zero(&self) -> bool {
        self.integer == "0" && self.fraction.chars().all(|c| c == '0')
    }

    fn compare_magnitude(&self, other: &Self) -> Ordering {
        self.integer
            .len()
            .cmp(&other.integer.len())
            .then_with(|| self.integer.cmp(&other.integer))
            .then_with(|| {
                let width = self.fraction.len().max(other.fraction.len());
                let a = format!("{:0<width$}", self.fraction, width = width);
                let b = format!("{:0<width$}", other.fraction, width = width);
                a.cmp(&b)
            })
    }

    fn compare(&self, other: &Self) -> Ordering {
        let self_negative = self.negative && !self.is_zero();
        let other_negative = other.negative && !other.is_zero();
        match (self_negative, other_negative) {
            (false, true) => Ordering::Greater,
            (true, false) => Ordering::Less,
            (false, false) => self.compare_magnitude(other),
            (true, true) => other.compare_magnitude(self),
        }
    }
}

impl std::fmt::Display for DecimalParts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.negative && !self.is_zero() {
            write!(f, "-")?;
        }
        write!(f, "{}", self.integer)?;
        if !self.fraction.is_empty() {
            write!(f, ".{}", self.fraction)?;
        }
        Ok(())
    }
}

/// Display a decimal with exactly `places` fractional digits. Extra digits
/// are cut off, missing ones padded with zeros. Values that do not parse
/// are returned unchanged.
pub fn format_decimal(value: Option<&str>, places: u32) -> String {
    let Some(raw) = value else {
        return String::new();
    };
    let Some(mut parts) = DecimalParts::parse(raw) else {
        return raw.to_string();
    };
    let places = places.min(MAX_DECIMAL_PLACES) as usize;
    if parts.fraction.len() > places {
        parts.fraction.truncate(places);
    } else {
        parts.fraction = format!("{:0<width$}", parts.fraction, width = places);
    }
    parts.to_string()
}
