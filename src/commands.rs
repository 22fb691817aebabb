use anyhow::{Context, Result};
use inquire::Confirm;
use serde_json::Value;
use std::fmt::Write as _;
use std::path::Path;
use tracing::info;

use formbuilder_server::assembly::assemble;
use formbuilder_server::database::{Database, FormEntryRecord};
use formbuilder_server::fields::short_description;
use formbuilder_server::registry::ActionRegistry;
use formbuilder_server::settings::Settings;
use formbuilder_server::tree::{PluginId, PluginTree};
use formbuilder_server::views::decode_path;

pub fn cmd_actions() -> Result<()> {
    let registry = formbuilder_server::default_registry()?;
    print!("{}", render_actions(&registry));
    Ok(())
}

pub fn cmd_decode(path: &str) -> Result<()> {
    let params = Value::Object(decode_path(path));
    println!("{}", serde_json::to_string_pretty(&params)?);
    Ok(())
}

pub fn cmd_inspect(trees: &Path, form: Option<PluginId>) -> Result<()> {
    let tree = PluginTree::load_file(trees).with_context(|| format!("loading {}", trees.display()))?;
    match form {
        Some(id) => println!("{}", render_form(&tree, id)?),
        None => print!("{}", render_tree(&tree)),
    }
    Ok(())
}

pub fn cmd_entries_list(settings: &Settings, form: Option<&str>, limit: i64) -> Result<()> {
    let db = Database::open(&settings.database_path)?;
    let entries = db.list_entries(form, Some(limit))?;
    if entries.is_empty() {
        println!("No entries");
        return Ok(());
    }
    print!("{}", render_entries(&entries));
    let total = db.count_entries(form)?;
    if total > entries.len() as i64 {
        println!("({} of {} entries shown)", entries.len(), total);
    }
    Ok(())
}

pub fn cmd_entries_show(settings: &Settings, id: i64) -> Result<()> {
    let db = Database::open(&settings.database_path)?;
    let entry = db.get_entry(id)?.with_context(|| format!("no form entry with id {}", id))?;
    println!("{}", serde_json::to_string_pretty(&entry)?);
    Ok(())
}

pub fn cmd_entries_delete(settings: &Settings, id: i64, yes: bool) -> Result<()> {
    let db = Database::open(&settings.database_path)?;
    let entry = db.get_entry(id)?.with_context(|| format!("no form entry with id {}", id))?;
    if !yes {
        let confirmed = Confirm::new(&format!("Delete entry {} of form {}?", entry.id, entry.form_name))
            .with_default(false)
            .prompt()?;
        if !confirmed {
            return Ok(());
        }
    }
    db.delete_entry(id)?;
    info!(id, form = %entry.form_name, "deleted form entry");
    println!("✅ Deleted entry {}", id);
    Ok(())
}

fn render_actions(registry: &ActionRegistry) -> String {
    let mut out = String::new();
    if registry.is_empty() {
        out.push_str("No actions registered\n");
        return out;
    }
    for entry in registry.iter() {
        let _ = writeln!(out, "{}  {}", entry.id, entry.label);
        for field in entry.parameters {
            let _ = writeln!(out, "    {} ({})", field.name, field.label);
        }
    }
    out
}

fn render_tree(tree: &PluginTree) -> String {
    fn walk(tree: &PluginTree, id: PluginId, depth: usize, out: &mut String) {
        if let Some(node) = tree.get(id) {
            let _ = writeln!(
                out,
                "{}{} {} {}",
                "  ".repeat(depth),
                node.id,
                node.plugin_type,
                short_description(node)
            );
            for child in node.child_ids() {
                walk(tree, *child, depth + 1, out);
            }
        }
    }

    let mut out = String::new();
    for root in tree.roots() {
        walk(tree, root.id, 0, &mut out);
    }
    out
}

fn render_form(tree: &PluginTree, id: PluginId) -> Result<String> {
    match assemble(tree, id)? {
        Some(form) => Ok(serde_json::to_string_pretty(&form.describe(&format!("<prefix>/{}", id)))?),
        None => Ok("no form".to_string()),
    }
}

fn render_entries(entries: &[FormEntryRecord]) -> String {
    let mut out = String::new();
    for entry in entries {
        let _ = writeln!(
            out,
            "{:>6}  {}  {:<24}  {}",
            entry.id,
            entry.entry_created_at,
            entry.form_name,
            entry.form_user.as_deref().unwrap_or("-")
        );
    }
    out
}
