use axum::http::header::{HeaderName, HeaderValue, ACCEPT};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha384};
use std::any::TypeId;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, error, info};

use crate::error::{FormBuilderError, FormBuilderResult};
use crate::execution::{ChainOutcome, Services};
use crate::plugins::PluginPool;
use crate::registry::ActionRegistry;
use crate::tree::{PluginId, PluginNode, PluginTree};

/// Decoded path parameters.
pub type Params = Map<String, Value>;

const RANDOM_SLUG_LENGTH: usize = 12;

/// Decode the comma separated parameter segment of an ajax url.
///
/// `k=v` and `k%3Dv` tokens become string entries, bare tokens become `true`.
/// Later keys overwrite earlier ones. Empty tokens are ignored.
pub fn decode_path(path: &str) -> Params {
    let mut params = Map::new();
    for token in path.split(',').filter(|t| !t.is_empty()) {
        if let Some((key, value)) = token.split_once('=') {
            params.insert(key.to_string(), Value::String(value.to_string()));
        } else if let Some((key, value)) = token.split_once("%3D") {
            params.insert(key.to_string(), Value::String(value.to_string()));
        } else {
            params.insert(token.to_string(), Value::Bool(true));
        }
    }
    params
}

/// An inbound request as seen by ajax handlers.
#[derive(Debug, Clone)]
pub struct AjaxRequest {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    /// Authenticated user name, `None` for anonymous requests.
    pub user: Option<String>,
    pub body: String,
}

impl AjaxRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            user: None,
            body: String::new(),
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Add a header. Invalid names or values are dropped.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
            self.headers.insert(name, value);
        }
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Whether the client accepts a JSON response. No `Accept` header means
    /// anything goes.
    pub fn accepts_json(&self) -> bool {
        let Some(accept) = self.headers.get(ACCEPT).and_then(|v| v.to_str().ok()) else {
            return true;
        };
        accept.split(',').any(|range| {
            let mut parts = range.split(';').map(str::trim);
            let media = parts.next().unwrap_or_default().to_ascii_lowercase();
            let refused = parts.any(|p| {
                p.strip_prefix("q=")
                    .and_then(|q| q.parse::<f32>().ok())
                    .is_some_and(|q| q <= 0.0)
            });
            !refused && matches!(media.as_str(), "application/json" | "application/*" | "*/*")
        })
    }
}

/// Status plus JSON body.
#[derive(Debug, Clone, PartialEq)]
pub struct AjaxResponse {
    pub status: StatusCode,
    pub body: Value,
}

impl AjaxResponse {
    pub fn json(body: Value) -> Self {
        Self {
            status: StatusCode::OK,
            body,
        }
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    /// A rejection shown to the user, still a 200.
    pub fn rejected(message: &str) -> Self {
        Self::json(ChainOutcome::rejection_body(message))
    }

    pub fn not_found(what: &str) -> Self {
        Self::json(json!({"result": "error", "msg": format!("Not found: {}", what)}))
            .with_status(StatusCode::NOT_FOUND)
    }

    pub fn method_not_allowed() -> Self {
        Self::json(json!({"result": "error", "msg": "Method not allowed"}))
            .with_status(StatusCode::METHOD_NOT_ALLOWED)
    }

    pub fn server_error() -> Self {
        Self::json(json!({"result": "error", "msg": "Internal server error"}))
            .with_status(StatusCode::INTERNAL_SERVER_ERROR)
    }

    /// Map a handler error onto a well-formed response.
    pub fn from_error(err: FormBuilderError) -> Self {
        match err {
            FormBuilderError::Validation(message) => Self::rejected(&message),
            FormBuilderError::NotFound(what) => Self::not_found(&what),
            other => {
                error!("ajax handler failed: {}", other);
                Self::server_error()
            }
        }
    }
}

impl IntoResponse for AjaxResponse {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

/// Everything a plugin handler gets for one call.
pub struct PluginCall<'a> {
    pub request: &'a AjaxRequest,
    pub tree: &'a PluginTree,
    pub instance: &'a PluginNode,
    pub params: &'a Params,
    pub context: &'a AjaxContext,
}

pub trait AjaxPostHandler: Send + Sync {
    fn ajax_post(&self, call: &PluginCall<'_>) -> FormBuilderResult<AjaxResponse>;
}

pub trait AjaxGetHandler: Send + Sync {
    fn ajax_get(&self, call: &PluginCall<'_>) -> FormBuilderResult<AjaxResponse>;
}

/// Server side of a plugin type. Each capability is optional.
pub trait PluginHandler: Send + Sync {
    fn as_ajax_post(&self) -> Option<&dyn AjaxPostHandler> {
        None
    }

    fn as_ajax_get(&self) -> Option<&dyn AjaxGetHandler> {
        None
    }
}

/// Everything a registered form view gets for one call.
pub struct ViewCall<'a> {
    pub request: &'a AjaxRequest,
    pub slug: &'a str,
    pub params: &'a Params,
    pub context: &'a AjaxContext,
}

pub trait ViewHandler: Send + Sync {
    fn handle(&self, call: &ViewCall<'_>) -> FormBuilderResult<AjaxResponse>;
}

/// A standalone view reachable by slug. The ajax specific methods win over
/// the generic ones.
pub trait FormView: Send + Sync {
    fn as_ajax_post(&self) -> Option<&dyn ViewHandler> {
        None
    }

    fn as_ajax_get(&self) -> Option<&dyn ViewHandler> {
        None
    }

    fn as_post(&self) -> Option<&dyn ViewHandler> {
        None
    }

    fn as_get(&self) -> Option<&dyn ViewHandler> {
        None
    }
}

struct ViewEntry {
    slug: String,
    type_id: TypeId,
    factory: fn() -> Box<dyn FormView>,
}

fn build_view<V: FormView + Default + 'static>() -> Box<dyn FormView> {
    Box::new(V::default())
}

/// Hex SHA-384 of a view slug.
pub fn view_key(slug: &str) -> String {
    let mut hasher = Sha384::new();
    hasher.update(slug.as_bytes());
    hex::encode(hasher.finalize())
}

fn random_slug() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..RANDOM_SLUG_LENGTH].to_string()
}

/// Views addressable by the hash of their slug.
#[derive(Default)]
pub struct FormViewRegistry {
    entries: HashMap<String, ViewEntry>,
}

impl FormViewRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a view type under `slug` (random if absent) and return its key.
    pub fn register_form_view<V: FormView + Default + 'static>(&mut self, slug: Option<&str>) -> FormBuilderResult<String> {
        let slug = match slug.filter(|s| !s.is_empty()) {
            Some(slug) => slug.to_string(),
            None => random_slug(),
        };
        let key = view_key(&slug);
        let type_id = TypeId::of::<V>();
        if let Some(existing) = self.entries.get(&key) {
            if existing.type_id != type_id {
                return Err(FormBuilderError::configuration(format!(
                    "form view slug {:?} is already taken",
                    slug
                )));
            }
        }
        debug!(slug = %slug, key = %key, "registered form view");
        self.entries.insert(
            key.clone(),
            ViewEntry {
                slug,
                type_id,
                factory: build_view::<V>,
            },
        );
        Ok(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn slug(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(|e| e.slug.as_str())
    }

    /// Fresh view instance for `key`.
    pub fn instantiate(&self, key: &str) -> Option<Box<dyn FormView>> {
        self.entries.get(key).map(|e| (e.factory)())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// What an ajax url points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchTarget {
    Plugin { id: PluginId, parameter: Option<String> },
    View { form_id: String, parameter: Option<String> },
}

impl DispatchTarget {
    /// Numeric segments address plugin instances, anything else a view key.
    pub fn parse(target: &str, parameter: Option<&str>) -> Self {
        let parameter = parameter.filter(|p| !p.is_empty()).map(str::to_string);
        match target.parse::<PluginId>() {
            Ok(id) if target.chars().all(|c| c.is_ascii_digit()) => DispatchTarget::Plugin { id, parameter },
            _ => DispatchTarget::View {
                form_id: target.to_string(),
                parameter,
            },
        }
    }
}

/// Shared state behind the ajax endpoint.
#[derive(Clone)]
pub struct AjaxContext {
    pub registry: Arc<ActionRegistry>,
    pub views: Arc<FormViewRegistry>,
    pub plugins: Arc<PluginPool>,
    pub services: Services,
    pub tree: Arc<RwLock<PluginTree>>,
}

impl AjaxContext {
    /// Route a request. Requests that do not accept JSON, or use a method
    /// other than GET and POST, are not ajax calls and get a 405.
    pub fn dispatch(&self, target: &DispatchTarget, request: &AjaxRequest) -> AjaxResponse {
        if !request.accepts_json() {
            debug!(path = %request.path, "request does not accept json");
            return AjaxResponse::method_not_allowed();
        }
        let result = match request.method {
            Method::POST => self.ajax_post(target, request),
            Method::GET => self.ajax_get(target, request),
            _ => return AjaxResponse::method_not_allowed(),
        };
        result.unwrap_or_else(AjaxResponse::from_error)
    }

    fn ajax_post(&self, target: &DispatchTarget, request: &AjaxRequest) -> FormBuilderResult<AjaxResponse> {
        match target {
            DispatchTarget::Plugin { id, parameter } => {
                self.call_plugin(*id, parameter.as_deref(), request, |handler, call| {
                    let post = handler.as_ajax_post().ok_or_else(|| {
                        FormBuilderError::not_found(format!("ajax_post on plugin {}", call.instance.id))
                    })?;
                    info!(plugin = call.instance.id, "ajax post");
                    post.ajax_post(call)
                })
            }
            DispatchTarget::View { form_id, parameter } => {
                self.call_view(form_id, parameter.as_deref(), request, |view| {
                    view.as_ajax_post().or(view.as_post())
                })
            }
        }
    }

    fn ajax_get(&self, target: &DispatchTarget, request: &AjaxRequest) -> FormBuilderResult<AjaxResponse> {
        match target {
            DispatchTarget::Plugin { id, parameter } => {
                self.call_plugin(*id, parameter.as_deref(), request, |handler, call| {
                    let get = handler.as_ajax_get().ok_or_else(|| {
                        FormBuilderError::not_found(format!("ajax_get on plugin {}", call.instance.id))
                    })?;
                    get.ajax_get(call)
                })
            }
            DispatchTarget::View { form_id, parameter } => {
                self.call_view(form_id, parameter.as_deref(), request, |view| {
                    view.as_ajax_get().or(view.as_get())
                })
            }
        }
    }

    fn call_plugin<F>(
        &self,
        id: PluginId,
        parameter: Option<&str>,
        request: &AjaxRequest,
        f: F,
    ) -> FormBuilderResult<AjaxResponse>
    where
        F: FnOnce(&dyn PluginHandler, &PluginCall<'_>) -> FormBuilderResult<AjaxResponse>,
    {
        let tree = self
            .tree
            .read()
            .map_err(|_| FormBuilderError::from(anyhow::anyhow!("plugin tree lock poisoned")))?;
        let instance = tree
            .get(id)
            .ok_or_else(|| FormBuilderError::not_found(format!("plugin {}", id)))?;
        let handler = self
            .plugins
            .get(&instance.plugin_type)
            .ok_or_else(|| FormBuilderError::not_found(format!("handler for {}", instance.plugin_type)))?;
        let params = parameter.map(decode_path).unwrap_or_default();
        let call = PluginCall {
            request,
            tree: &tree,
            instance,
            params: &params,
            context: self,
        };
        f(handler, &call)
    }

    fn call_view<F>(&self, key: &str, parameter: Option<&str>, request: &AjaxRequest, pick: F) -> FormBuilderResult<AjaxResponse>
    where
        F: for<'v> FnOnce(&'v dyn FormView) -> Option<&'v dyn ViewHandler>,
    {
        let view = self
            .views
            .instantiate(key)
            .ok_or_else(|| FormBuilderError::not_found(format!("form view {}", key)))?;
        let handler = pick(view.as_ref()).ok_or_else(|| FormBuilderError::not_found(format!("handler of form view {}", key)))?;
        let params = parameter.map(decode_path).unwrap_or_default();
        let call = ViewCall {
            request,
            slug: self.views.slug(key).unwrap_or_default(),
            params: &params,
            context: self,
        };
        handler.handle(&call)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::tests::{contact_tree, fixture, NewsletterView};
    use serde_json::json;

    #[derive(Default)]
    struct GetOnlyView;

    impl ViewHandler for GetOnlyView {
        fn handle(&self, call: &ViewCall<'_>) -> FormBuilderResult<AjaxResponse> {
            Ok(AjaxResponse::json(json!({"result": "success", "params": call.params})))
        }
    }

    impl FormView for GetOnlyView {
        fn as_ajax_get(&self) -> Option<&dyn ViewHandler> {
            Some(self)
        }
    }

    #[derive(Default)]
    struct OtherView;

    impl FormView for OtherView {}

    #[test]
    fn test_decode_path_key_values() {
        let params = decode_path("key1=value1,key2=value2");
        assert_eq!(Value::Object(params), json!({"key1": "value1", "key2": "value2"}));
    }

    #[test]
    fn test_decode_path_encoded_equals() {
        let params = decode_path("key1%3Dvalue1,key2%3Dvalue2");
        assert_eq!(Value::Object(params), json!({"key1": "value1", "key2": "value2"}));
    }

    #[test]
    fn test_decode_path_flags_and_overwrites() {
        assert_eq!(
            Value::Object(decode_path("flag1,flag2,key=value")),
            json!({"flag1": true, "flag2": true, "key": "value"})
        );
        assert_eq!(
            Value::Object(decode_path("s=test,active,debug=1")),
            json!({"s": "test", "active": true, "debug": "1"})
        );
        assert_eq!(Value::Object(decode_path("a=1,a=2")), json!({"a": "2"}));
        assert_eq!(Value::Object(decode_path("a=b=c")), json!({"a": "b=c"}));
        assert_eq!(Value::Object(decode_path("x=1,")), json!({"x": "1"}));
        assert!(decode_path("").is_empty());
    }

    #[test]
    fn test_accepts_json() {
        let request = |accept: &str| AjaxRequest::new(Method::POST, "/").with_header("accept", accept);
        assert!(AjaxRequest::new(Method::POST, "/").accepts_json());
        assert!(request("application/json").accepts_json());
        assert!(request("text/html, */*;q=0.8").accepts_json());
        assert!(request("application/*").accepts_json());
        assert!(!request("text/html").accepts_json());
        assert!(!request("application/json;q=0").accepts_json());
    }

    #[test]
    fn test_dispatch_target_parse() {
        assert_eq!(
            DispatchTarget::parse("42", Some("a=1")),
            DispatchTarget::Plugin { id: 42, parameter: Some("a=1".to_string()) }
        );
        assert_eq!(
            DispatchTarget::parse("abc123", None),
            DispatchTarget::View { form_id: "abc123".to_string(), parameter: None }
        );
        assert!(matches!(DispatchTarget::parse("+5", None), DispatchTarget::View { .. }));
    }

    #[test]
    fn test_register_form_view_keys() {
        let mut views = FormViewRegistry::new();
        let key = views.register_form_view::<NewsletterView>(Some("newsletter")).unwrap();
        assert_eq!(key.len(), 96);
        assert_eq!(key, view_key("newsletter"));
        assert_eq!(views.register_form_view::<NewsletterView>(Some("newsletter")).unwrap(), key);
        assert_eq!(views.len(), 1);
        assert!(matches!(
            views.register_form_view::<OtherView>(Some("newsletter")),
            Err(FormBuilderError::Configuration(_))
        ));

        let random = views.register_form_view::<OtherView>(None).unwrap();
        assert_eq!(views.slug(&random).map(str::len), Some(12));
        assert!(views.contains(&random));
    }

    #[test]
    fn test_dispatch_unknown_targets_are_not_found() {
        let (tree, _) = contact_tree(&[]);
        let fx = fixture(tree);
        let request = AjaxRequest::new(Method::POST, "/").with_header("accept", "application/json");

        let response = fx.context.dispatch(&DispatchTarget::Plugin { id: 999, parameter: None }, &request);
        assert_eq!(response.status, StatusCode::NOT_FOUND);

        let unknown = DispatchTarget::View { form_id: view_key("nope"), parameter: None };
        assert_eq!(fx.context.dispatch(&unknown, &request).status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_dispatch_plugin_without_capability_is_not_found() {
        let (tree, form) = contact_tree(&[]);
        let field = tree.children(form).next().map(|n| n.id).unwrap();
        let fx = fixture(tree);
        let request = AjaxRequest::new(Method::POST, "/");
        let response = fx.context.dispatch(&DispatchTarget::Plugin { id: field, parameter: None }, &request);
        assert_eq!(response.status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_dispatch_view_falls_back_to_generic_method() {
        let (tree, _) = contact_tree(&[]);
        let fx = fixture(tree);
        let post = AjaxRequest::new(Method::POST, "/").with_header("accept", "application/json");
        let target = DispatchTarget::View { form_id: view_key("newsletter"), parameter: None };
        let response = fx.context.dispatch(&target, &post);
        assert_eq!(response.body, json!({"result": "success", "view": "newsletter"}));

        let rejected = fx.context.dispatch(&target, &post.clone().with_body("spam"));
        assert_eq!(rejected.status, StatusCode::OK);
        assert_eq!(rejected.body, json!({"result": "error", "msg": "No spam please"}));

        // Newsletter has no get handler at all.
        let get = AjaxRequest::new(Method::GET, "/");
        assert_eq!(fx.context.dispatch(&target, &get).status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_dispatch_non_ajax_requests_fall_through() {
        let (tree, form) = contact_tree(&[]);
        let fx = fixture(tree);
        let target = DispatchTarget::Plugin { id: form, parameter: None };

        let html = AjaxRequest::new(Method::POST, "/").with_header("accept", "text/html");
        assert_eq!(fx.context.dispatch(&target, &html).status, StatusCode::METHOD_NOT_ALLOWED);

        let put = AjaxRequest::new(Method::PUT, "/").with_header("accept", "application/json");
        assert_eq!(fx.context.dispatch(&target, &put).status, StatusCode::METHOD_NOT_ALLOWED);
    }

    #[test]
    fn test_view_receives_decoded_parameters() {
        let (tree, _) = contact_tree(&[]);
        let mut fx = fixture(tree);
        let mut views = FormViewRegistry::new();
        let key = views.register_form_view::<GetOnlyView>(Some("report")).unwrap();
        fx.context.views = Arc::new(views);

        let target = DispatchTarget::View { form_id: key, parameter: Some("page=2,all".into()) };
        let response = fx.context.dispatch(&target, &AjaxRequest::new(Method::GET, "/"));
        assert_eq!(response.body["params"], json!({"page": "2", "all": true}));
    }

    #[test]
    fn test_from_error_maps_kinds() {
        assert_eq!(
            AjaxResponse::from_error(FormBuilderError::validation("nope")).body,
            json!({"result": "error", "msg": "nope"})
        );
        assert_eq!(
            AjaxResponse::from_error(FormBuilderError::not_found("x")).status,
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AjaxResponse::from_error(FormBuilderError::configuration("x")).status,
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
