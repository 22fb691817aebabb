use serde_json::json;
use std::collections::HashMap;
use tracing::{debug, info};

use crate::assembly::{assemble, AssembledForm, FormData};
use crate::error::{FormBuilderError, FormBuilderResult};
use crate::execution::{run_actions, ChainOutcome};
use crate::tree::FORM_PLUGIN;
use crate::views::{view_key, AjaxGetHandler, AjaxPostHandler, AjaxResponse, PluginCall, PluginHandler, ViewCall};

/// Server side handlers by plugin type.
#[derive(Default)]
pub struct PluginPool {
    handlers: HashMap<String, Box<dyn PluginHandler>>,
}

impl PluginPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pool with the form plugin handler installed.
    pub fn with_builtin_plugins() -> Self {
        let mut pool = Self::new();
        pool.register(FORM_PLUGIN, FormPluginHandler);
        pool
    }

    pub fn register(&mut self, plugin_type: &str, handler: impl PluginHandler + 'static) {
        self.handlers.insert(plugin_type.to_string(), Box::new(handler));
    }

    pub fn get(&self, plugin_type: &str) -> Option<&dyn PluginHandler> {
        self.handlers.get(plugin_type).map(|h| h.as_ref())
    }
}

/// Handles submissions to, and render requests for, form plugins.
pub struct FormPluginHandler;

impl PluginHandler for FormPluginHandler {
    fn as_ajax_post(&self) -> Option<&dyn AjaxPostHandler> {
        Some(self)
    }

    fn as_ajax_get(&self) -> Option<&dyn AjaxGetHandler> {
        Some(self)
    }
}

impl FormPluginHandler {
    fn assembled(call: &PluginCall<'_>) -> FormBuilderResult<Option<AssembledForm>> {
        assemble(call.tree, call.instance.id)
    }

    /// Hand the request to the form view picked by `form_selection`.
    fn delegate_to_selection(call: &PluginCall<'_>, slug: &str, post: bool) -> FormBuilderResult<AjaxResponse> {
        let key = view_key(slug);
        let views = &call.context.views;
        let view = views
            .instantiate(&key)
            .ok_or_else(|| FormBuilderError::not_found(format!("form view {:?}", slug)))?;
        let handler = if post {
            view.as_ajax_post().or(view.as_post())
        } else {
            view.as_ajax_get().or(view.as_get())
        }
        .ok_or_else(|| FormBuilderError::not_found(format!("handler of form view {:?}", slug)))?;
        debug!(plugin = call.instance.id, slug, "delegating to selected form view");
        handler.handle(&ViewCall {
            request: call.request,
            slug,
            params: call.params,
            context: call.context,
        })
    }
}

impl AjaxPostHandler for FormPluginHandler {
    fn ajax_post(&self, call: &PluginCall<'_>) -> FormBuilderResult<AjaxResponse> {
        let form = Self::assembled(call)?
            .ok_or_else(|| FormBuilderError::not_found(format!("form in plugin {}", call.instance.id)))?;
        if form.fields.is_empty() {
            if let Some(slug) = form.options.form_selection.as_deref() {
                return Self::delegate_to_selection(call, slug, true);
            }
        }
        if !call.params.is_empty() {
            debug!(plugin = call.instance.id, params = ?call.params, "form post parameters");
        }

        let data = FormData::from_urlencoded(&call.request.body);
        let bound = form.bind(&data, call.request.user.as_deref());
        if !bound.is_valid() {
            info!(form = %form.options.form_name, errors = bound.errors.len(), "invalid form submission");
            return Ok(AjaxResponse::json(json!({
                "result": "invalid form",
                "redirect": null,
                "msg": bound.non_field_errors.join("\n"),
                "field_errors": form.namespaced_errors(&bound),
                "errors": bound.non_field_errors,
            })));
        }

        let outcome = run_actions(
            &call.context.registry,
            &form.options.actions,
            &bound.cleaned_data,
            call.request,
            &form.options,
            &call.context.services,
        )?;
        match outcome {
            ChainOutcome::Rejected { message } => Ok(AjaxResponse::rejected(&message)),
            ChainOutcome::Completed(result) => {
                info!(form = %form.options.form_name, "form submitted");
                Ok(AjaxResponse::json(json!({
                    "result": "success",
                    "redirect": result.redirect,
                    "render_success": result.render_success,
                    "msg": result.message,
                    "content": result.message,
                    "field_errors": result.field_errors,
                    "errors": [],
                })))
            }
        }
    }
}

impl AjaxGetHandler for FormPluginHandler {
    fn ajax_get(&self, call: &PluginCall<'_>) -> FormBuilderResult<AjaxResponse> {
        let Some(form) = Self::assembled(call)? else {
            return Ok(AjaxResponse::json(json!({"result": "success", "form": null})));
        };
        if form.fields.is_empty() {
            if let Some(slug) = form.options.form_selection.as_deref() {
                return Self::delegate_to_selection(call, slug, false);
            }
        }
        let action_url = format!("{}/{}", call.context.services.settings.url_prefix, call.instance.id);
        Ok(AjaxResponse::json(json!({
            "result": "success",
            "form": form.describe(&action_url),
        })))
    }
}
