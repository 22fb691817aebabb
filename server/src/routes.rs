use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, Method, Uri};
use axum::response::IntoResponse;
use axum::routing::any;
use axum::Router;
use std::collections::HashMap;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

use crate::views::{AjaxContext, AjaxRequest, AjaxResponse, DispatchTarget};

/// Module name the form-builder url patterns are mounted from.
pub const FORM_BUILDER_URLCONF: &str = "formbuilder::routes";
/// Namespace of the form-builder mount.
pub const FORM_BUILDER_NAMESPACE: &str = "form_builder";

/// One included set of url patterns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlMount {
    pub prefix: String,
    /// Name the patterns were included by. May be an alias.
    pub urlconf: String,
    pub namespace: Option<String>,
}

/// Ordered list of mounted url patterns of a site.
#[derive(Debug, Clone, Default)]
pub struct UrlConf {
    mounts: Vec<UrlMount>,
    /// Alias → module name, used to resolve `urlconf` of a mount.
    aliases: HashMap<String, String>,
}

impl UrlConf {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mount(&mut self, mount: UrlMount) {
        self.mounts.push(mount);
    }

    pub fn alias(&mut self, name: &str, module: &str) {
        self.aliases.insert(name.to_string(), module.to_string());
    }

    pub fn mounts(&self) -> &[UrlMount] {
        &self.mounts
    }

    /// Module a mount's `urlconf` ultimately refers to.
    pub fn resolve<'a>(&'a self, urlconf: &'a str) -> &'a str {
        let mut current = urlconf;
        // Alias chains are short; the bound guards against cycles.
        for _ in 0..self.aliases.len() {
            match self.aliases.get(current) {
                Some(next) => current = next,
                None => break,
            }
        }
        current
    }

    fn has_form_builder(&self) -> bool {
        self.mounts.iter().any(|m| {
            m.namespace.as_deref() == Some(FORM_BUILDER_NAMESPACE)
                || m.urlconf == FORM_BUILDER_URLCONF
                || self.resolve(&m.urlconf) == FORM_BUILDER_URLCONF
        })
    }

    /// Put the form-builder patterns in front of all others. Returns `false`
    /// if they were already installed.
    pub fn install_form_builder_urls(&mut self, prefix: &str) -> bool {
        if self.has_form_builder() {
            debug!("form builder urls already installed");
            return false;
        }
        self.mounts.insert(
            0,
            UrlMount {
                prefix: prefix.to_string(),
                urlconf: FORM_BUILDER_URLCONF.to_string(),
                namespace: Some(FORM_BUILDER_NAMESPACE.to_string()),
            },
        );
        info!(prefix, "installed form builder urls");
        true
    }
}

/// Shared state of the HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub ajax: AjaxContext,
    /// Header carrying the authenticated user name.
    pub user_header: String,
}

/// Routes of one form-builder mount: `/<target>` and `/<target>/<parameter>`.
fn form_builder_routes() -> Router<AppState> {
    Router::new()
        .route("/:target", any(ajax_view))
        .route("/:target/:parameter", any(ajax_view))
}

/// Build the router for every form-builder mount in `urlconf`. Mounts of
/// other modules belong to the host platform and are skipped.
pub fn build_router(state: AppState, urlconf: &UrlConf) -> Router {
    let mut router = Router::new();
    for mount in urlconf.mounts() {
        if urlconf.resolve(&mount.urlconf) == FORM_BUILDER_URLCONF {
            router = router.nest(&mount.prefix, form_builder_routes());
        } else {
            debug!(prefix = %mount.prefix, urlconf = %mount.urlconf, "skipping foreign mount");
        }
    }
    router
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn ajax_view(
    State(state): State<AppState>,
    Path(segments): Path<HashMap<String, String>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let Some(target) = segments.get("target") else {
        return AjaxResponse::not_found("ajax target");
    };
    let target = DispatchTarget::parse(target, segments.get("parameter").map(String::as_str));
    let user = headers
        .get(state.user_header.as_str())
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .map(str::to_string);
    let request = AjaxRequest {
        method,
        path: uri.path().to_string(),
        headers,
        user,
        body: String::from_utf8_lossy(&body).into_owned(),
    };
    // Actions hit SQLite and SMTP synchronously.
    let ajax = state.ajax.clone();
    match tokio::task::spawn_blocking(move || ajax.dispatch(&target, &request)).await {
        Ok(response) => response,
        Err(err) => {
            error!("ajax dispatch panicked: {}", err);
            AjaxResponse::server_error()
        }
    }
}
