pub mod actions;
pub mod assembly;
pub mod database;
pub mod error;
pub mod execution;
pub mod fields;
pub mod mail;
pub mod plugins;
pub mod registry;
pub mod routes;
pub mod settings;
pub mod tree;
pub mod views;

use std::sync::{Arc, RwLock};
use tracing::info;

use crate::database::Database;
use crate::error::FormBuilderResult;
use crate::execution::Services;
use crate::mail::mailer_from_settings;
use crate::plugins::PluginPool;
use crate::registry::ActionRegistry;
use crate::settings::Settings;
use crate::tree::PluginTree;
use crate::views::{AjaxContext, FormViewRegistry};

/// Registry holding the built-in actions.
pub fn default_registry() -> FormBuilderResult<ActionRegistry> {
    let mut registry = ActionRegistry::new();
    actions::register_builtin_actions(&mut registry)?;
    Ok(registry)
}

/// Plugin trees named by the settings, or an empty tree.
pub fn load_trees(settings: &Settings) -> FormBuilderResult<PluginTree> {
    match &settings.trees_path {
        Some(path) => PluginTree::load_file(path),
        None => Ok(PluginTree::new()),
    }
}

/// Wire up everything the ajax endpoint needs.
pub fn build_context(
    settings: Settings,
    tree: PluginTree,
    registry: ActionRegistry,
    views: FormViewRegistry,
) -> FormBuilderResult<AjaxContext> {
    let database = Database::open(&settings.database_path)?;
    let mailer = mailer_from_settings(&settings)?;
    info!(
        plugins = tree.len(),
        actions = registry.len(),
        views = views.len(),
        "form builder ready"
    );
    Ok(AjaxContext {
        registry: Arc::new(registry),
        views: Arc::new(views),
        plugins: Arc::new(PluginPool::with_builtin_plugins()),
        services: Services {
            database: Arc::new(database),
            mailer,
            settings: Arc::new(settings),
        },
        tree: Arc::new(RwLock::new(tree)),
    })
}
