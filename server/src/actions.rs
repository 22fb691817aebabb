//! Built-in post-submission actions.

use serde_json::{json, Value};
use tracing::{info, warn};

use crate::database::NewEntry;
use crate::error::FormBuilderResult;
use crate::execution::ActionContext;
use crate::registry::{ActionDescriptor, ActionRegistry, FormAction, ParameterField, ParameterKind};

/// Register every built-in action.
pub fn register_builtin_actions(registry: &mut ActionRegistry) -> FormBuilderResult<()> {
    registry.register::<SaveToDatabaseAction>()?;
    registry.register::<SendMailAction>()?;
    registry.register::<SuccessMessageAction>()?;
    registry.register::<RedirectAction>()?;
    Ok(())
}

/// Persists the cleaned data. Forms marked unique keep one entry per user.
#[derive(Default)]
pub struct SaveToDatabaseAction;

impl FormAction for SaveToDatabaseAction {
    fn execute(&self, ctx: &mut ActionContext<'_>) -> FormBuilderResult<()> {
        let entry_data = Value::Object(ctx.cleaned_data.clone());
        let html_headers = json!({
            "user_agent": ctx.request.header("user-agent").unwrap_or_default(),
            "referer": ctx.request.header("referer").unwrap_or_default(),
        });
        let user = ctx.request.user.as_deref();
        let entry = NewEntry {
            form_name: &ctx.options.form_name,
            form_user: user,
            entry_data: &entry_data,
            html_headers: &html_headers,
        };

        let database = &ctx.services.database;
        match (ctx.options.unique, user) {
            (true, Some(user)) => {
                database.save_unique_entry(&entry, user)?;
            }
            _ => {
                database.create_entry(&entry)?;
            }
        }
        Ok(())
    }
}

impl ActionDescriptor for SaveToDatabaseAction {
    fn verbose_name() -> &'static str {
        "Save form submission"
    }

    fn identity() -> &'static str {
        "formbuilder.actions.SaveToDatabaseAction"
    }
}

pub const RECIPIENTS_PARAM: &str = "sendemail_recipients";
pub const TEMPLATE_PARAM: &str = "sendemail_template";

static SEND_MAIL_FIELDS: [ParameterField; 2] = [
    ParameterField {
        name: RECIPIENTS_PARAM,
        label: "Mail recipients",
        kind: ParameterKind::Textarea,
        required: false,
    },
    ParameterField {
        name: TEMPLATE_PARAM,
        label: "Mail template",
        kind: ParameterKind::Select,
        required: false,
    },
];

/// Mails the submission to the configured recipients, or to the site
/// administrators when none are set.
#[derive(Default)]
pub struct SendMailAction;

impl FormAction for SendMailAction {
    fn execute(&self, ctx: &mut ActionContext<'_>) -> FormBuilderResult<()> {
        let recipients: Vec<String> = ctx
            .parameter_str(RECIPIENTS_PARAM)
            .unwrap_or_default()
            .split_whitespace()
            .map(str::to_string)
            .collect();
        let template = ctx.parameter_str(TEMPLATE_PARAM).unwrap_or("default");
        let subject = mail_subject(&ctx.options.form_name);
        let body = render_mail_body(&ctx.options.form_name, ctx.cleaned_data, template);

        let mailer = &ctx.services.mailer;
        if recipients.is_empty() {
            mailer.mail_admins(&subject, &body)?;
        } else {
            mailer.send_mail(&subject, &body, &ctx.services.settings.from_email, &recipients)?;
        }
        info!(form = %ctx.options.form_name, recipients = recipients.len(), "submission mail sent");
        Ok(())
    }
}

impl ActionDescriptor for SendMailAction {
    fn verbose_name() -> &'static str {
        "Send email"
    }

    fn identity() -> &'static str {
        "formbuilder.actions.SendMailAction"
    }

    fn parameter_fields() -> &'static [ParameterField] {
        &SEND_MAIL_FIELDS
    }
}

/// `"test_form"` becomes `"Test form form submission"`.
pub fn mail_subject(form_name: &str) -> String {
    let readable = form_name.replace(['_', '-'], " ");
    let mut chars = readable.chars();
    let capitalized: String = match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    };
    format!("{} form submission", capitalized).trim_start().to_string()
}

fn render_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(true) => "yes".to_string(),
        Value::Bool(false) => "no".to_string(),
        Value::Array(items) => items.iter().map(render_value).collect::<Vec<_>>().join(", "),
        other => other.to_string(),
    }
}

fn render_mail_body(form_name: &str, data: &serde_json::Map<String, Value>, template: &str) -> String {
    let mut body = format!("Form submission: {}\n\n", form_name);
    match template {
        "table" => {
            let width = data.keys().map(|k| k.chars().count()).max().unwrap_or(0);
            for (key, value) in data {
                body.push_str(&format!("{:<width$}  {}\n", key, render_value(value), width = width));
            }
        }
        other => {
            if other != "default" {
                warn!(template = other, "unknown mail template, using default");
            }
            for (key, value) in data {
                body.push_str(&format!("{}: {}\n", key, render_value(value)));
            }
        }
    }
    body
}

pub const MESSAGE_PARAM: &str = "submitmessage_message";

static SUCCESS_MESSAGE_FIELDS: [ParameterField; 1] = [ParameterField {
    name: MESSAGE_PARAM,
    label: "Message",
    kind: ParameterKind::Textarea,
    required: true,
}];

/// Replaces the form with a message instead of reloading the page.
#[derive(Default)]
pub struct SuccessMessageAction;

impl FormAction for SuccessMessageAction {
    fn execute(&self, ctx: &mut ActionContext<'_>) -> FormBuilderResult<()> {
        let message = ctx.parameter_str(MESSAGE_PARAM).unwrap_or_default().to_string();
        ctx.result.redirect = None;
        ctx.result.render_success = Some("message".to_string());
        ctx.result.append_message(&message);
        Ok(())
    }
}

impl ActionDescriptor for SuccessMessageAction {
    fn verbose_name() -> &'static str {
        "Success message"
    }

    fn identity() -> &'static str {
        "formbuilder.actions.SuccessMessageAction"
    }

    fn parameter_fields() -> &'static [ParameterField] {
        &SUCCESS_MESSAGE_FIELDS
    }
}

pub const REDIRECT_PARAM: &str = "redirect_link";

static REDIRECT_FIELDS: [ParameterField; 1] = [ParameterField {
    name: REDIRECT_PARAM,
    label: "Redirect link",
    kind: ParameterKind::Url,
    required: true,
}];

/// Sends the client to a fixed link after submission.
#[derive(Default)]
pub struct RedirectAction;

impl FormAction for RedirectAction {
    fn execute(&self, ctx: &mut ActionContext<'_>) -> FormBuilderResult<()> {
        match ctx.parameter_str(REDIRECT_PARAM).map(str::trim).filter(|l| !l.is_empty()) {
            Some(link) => ctx.result.redirect = Some(link.to_string()),
            None => warn!(form = %ctx.options.form_name, "redirect action without a link"),
        }
        Ok(())
    }
}

impl ActionDescriptor for RedirectAction {
    fn verbose_name() -> &'static str {
        "Redirect after submission"
    }

    fn identity() -> &'static str {
        "formbuilder.actions.RedirectAction"
    }

    fn parameter_fields() -> &'static [ParameterField] {
        &REDIRECT_FIELDS
    }
}
