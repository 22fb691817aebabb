use anyhow::Result;
use std::path::PathBuf;

use formbuilder_server::settings::Settings;

pub const LOG_ENV: &str = "FORMBUILDER_LOG";
pub const DEFAULT_LIST_LIMIT: i64 = 50;

/// Settings from the environment, with the `--database` flag taking precedence.
pub fn load_settings(database: Option<PathBuf>) -> Result<Settings> {
    let mut settings = Settings::from_env()?;
    if let Some(path) = database {
        settings.database_path = path;
    }
    Ok(settings)
}
