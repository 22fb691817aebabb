use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::assembly::FormOptions;
use crate::database::Database;
use crate::error::{FormBuilderError, FormBuilderResult};
use crate::mail::Mailer;
use crate::registry::ActionRegistry;
use crate::settings::Settings;
use crate::views::AjaxRequest;

/// Redirect marker telling the client to reload the current page.
pub const SAME_PAGE: &str = "result";

/// Per-submission state the actions write into.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmissionResult {
    pub redirect: Option<String>,
    pub render_success: Option<String>,
    pub message: String,
    pub field_errors: BTreeMap<String, Vec<String>>,
}

impl Default for SubmissionResult {
    fn default() -> Self {
        Self {
            redirect: Some(SAME_PAGE.to_string()),
            render_success: None,
            message: String::new(),
            field_errors: BTreeMap::new(),
        }
    }
}

impl SubmissionResult {
    pub fn append_message(&mut self, message: &str) {
        if !self.message.is_empty() {
            self.message.push('\n');
        }
        self.message.push_str(message);
    }
}

/// Long-lived collaborators the actions may use for side effects.
#[derive(Clone)]
pub struct Services {
    pub database: Arc<Database>,
    pub mailer: Arc<dyn Mailer>,
    pub settings: Arc<Settings>,
}

/// Mutable context handed to each action in turn.
pub struct ActionContext<'a> {
    pub cleaned_data: &'a Map<String, Value>,
    pub request: &'a AjaxRequest,
    pub options: &'a FormOptions,
    /// The form's parameter bag, keyed by namespaced field names.
    pub parameters: &'a Map<String, Value>,
    pub services: &'a Services,
    pub result: SubmissionResult,
}

impl ActionContext<'_> {
    /// String parameter, `None` when missing or not a string.
    pub fn parameter_str(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).and_then(Value::as_str)
    }
}

/// How a chain run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ChainOutcome {
    Completed(SubmissionResult),
    /// An action rejected the submission; later actions did not run.
    Rejected { message: String },
}

impl ChainOutcome {
    /// Body of the error response for a rejected chain.
    pub fn rejection_body(message: &str) -> Value {
        json!({"result": "error", "msg": message})
    }
}

/// Run the selected actions strictly in order.
///
/// A `Validation` error stops the chain and becomes `ChainOutcome::Rejected`.
/// Side effects of actions that already ran are kept. Any other error is
/// returned as is.
pub fn run_actions(
    registry: &ActionRegistry,
    action_ids: &[String],
    cleaned_data: &Map<String, Value>,
    request: &AjaxRequest,
    options: &FormOptions,
    services: &Services,
) -> FormBuilderResult<ChainOutcome> {
    let mut ctx = ActionContext {
        cleaned_data,
        request,
        options,
        parameters: &options.action_parameters,
        services,
        result: SubmissionResult::default(),
    };

    for id in action_ids {
        let Some(entry) = registry.get_action_class(id) else {
            warn!(action = %id, form = %options.form_name, "skipping unknown action");
            continue;
        };
        debug!(action = entry.label, form = %options.form_name, "executing action");
        let action = entry.instantiate();
        match action.execute(&mut ctx) {
            Ok(()) => {}
            Err(FormBuilderError::Validation(message)) => {
                info!(action = entry.label, form = %options.form_name, "submission rejected: {}", message);
                return Ok(ChainOutcome::Rejected { message });
            }
            Err(err) => return Err(err),
        }
    }

    Ok(ChainOutcome::Completed(ctx.result))
}
