use anyhow::{Context, Result};
use std::path::PathBuf;

// Environment keys
pub const ENV_DATABASE: &str = "FORMBUILDER_DATABASE";
pub const ENV_ADMINS: &str = "FORMBUILDER_ADMINS";
pub const ENV_FROM_EMAIL: &str = "FORMBUILDER_FROM_EMAIL";
pub const ENV_USER_HEADER: &str = "FORMBUILDER_USER_HEADER";
pub const ENV_URL_PREFIX: &str = "FORMBUILDER_URL_PREFIX";
pub const ENV_TREES: &str = "FORMBUILDER_TREES";
pub const ENV_SMTP_HOST: &str = "FORMBUILDER_SMTP_HOST";
pub const ENV_SMTP_PORT: &str = "FORMBUILDER_SMTP_PORT";
pub const ENV_SMTP_USER: &str = "FORMBUILDER_SMTP_USER";
pub const ENV_SMTP_PASSWORD: &str = "FORMBUILDER_SMTP_PASSWORD";

// Defaults
pub const DEFAULT_FROM_EMAIL: &str = "webmaster@localhost";
pub const DEFAULT_USER_HEADER: &str = "x-remote-user";
pub const DEFAULT_URL_PREFIX: &str = "/@form-builder";
pub const DEFAULT_SMTP_PORT: u16 = 587;
const DATABASE_DIR: &str = "formbuilder";
const DATABASE_FILENAME: &str = "entries.db";

/// Runtime settings shared by the server binary and the CLI.
#[derive(Debug, Clone)]
pub struct Settings {
    pub database_path: PathBuf,
    /// Recipients used by the mail action when a form has no explicit recipients.
    pub admins: Vec<String>,
    pub from_email: String,
    /// Header set by the platform's auth layer with the current user name.
    pub user_header: String,
    pub url_prefix: String,
    pub trees_path: Option<PathBuf>,
    /// Outgoing mail server. Mail is only logged when unset.
    pub smtp: Option<SmtpSettings>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            admins: Vec::new(),
            from_email: DEFAULT_FROM_EMAIL.to_string(),
            user_header: DEFAULT_USER_HEADER.to_string(),
            url_prefix: DEFAULT_URL_PREFIX.to_string(),
            trees_path: None,
            smtp: None,
        }
    }
}

impl Settings {
    /// Load settings from the process environment. A `.env` file in the
    /// working directory is read first if present.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Self::default();

        if let Some(path) = lookup(ENV_DATABASE).filter(|v| !v.trim().is_empty()) {
            settings.database_path = PathBuf::from(path);
        }
        if let Some(admins) = lookup(ENV_ADMINS) {
            settings.admins = parse_address_list(&admins);
        }
        if let Some(from) = lookup(ENV_FROM_EMAIL).filter(|v| !v.trim().is_empty()) {
            settings.from_email = from.trim().to_string();
        }
        if let Some(header) = lookup(ENV_USER_HEADER).filter(|v| !v.trim().is_empty()) {
            settings.user_header = header.trim().to_ascii_lowercase();
        }
        if let Some(prefix) = lookup(ENV_URL_PREFIX).filter(|v| !v.trim().is_empty()) {
            settings.url_prefix = normalize_prefix(&prefix)?;
        }
        settings.trees_path = lookup(ENV_TREES)
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);

        if let Some(host) = lookup(ENV_SMTP_HOST).filter(|v| !v.trim().is_empty()) {
            let port = match lookup(ENV_SMTP_PORT).filter(|v| !v.trim().is_empty()) {
                Some(raw) => raw
                    .trim()
                    .parse::<u16>()
                    .with_context(|| format!("{} must be a port number, got {:?}", ENV_SMTP_PORT, raw))?,
                None => DEFAULT_SMTP_PORT,
            };
            settings.smtp = Some(SmtpSettings {
                host: host.trim().to_string(),
                port,
                username: lookup(ENV_SMTP_USER).filter(|v| !v.is_empty()),
                password: lookup(ENV_SMTP_PASSWORD).filter(|v| !v.is_empty()),
            });
        }

        Ok(settings)
    }
}

fn default_database_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(DATABASE_DIR)
        .join(DATABASE_FILENAME)
}

fn parse_address_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn normalize_prefix(raw: &str) -> Result<String> {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        anyhow::bail!("{} must not be the site root", ENV_URL_PREFIX);
    }
    if trimmed.starts_with('/') {
        Ok(trimmed.to_string())
    } else {
        Ok(format!("/{}", trimmed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_environment_is_empty() {
        let settings = Settings::from_lookup(|_| None).unwrap();
        assert_eq!(settings.from_email, DEFAULT_FROM_EMAIL);
        assert_eq!(settings.user_header, DEFAULT_USER_HEADER);
        assert_eq!(settings.url_prefix, DEFAULT_URL_PREFIX);
        assert!(settings.admins.is_empty());
        assert!(settings.database_path.ends_with("formbuilder/entries.db"));
        assert!(settings.trees_path.is_none());
        assert!(settings.smtp.is_none());
    }

    #[test]
    fn test_overrides_from_lookup() {
        let settings = Settings::from_lookup(lookup_from(&[
            (ENV_DATABASE, "/tmp/forms.db"),
            (ENV_ADMINS, "ops@example.com, , web@example.com"),
            (ENV_FROM_EMAIL, "forms@example.com"),
            (ENV_USER_HEADER, "X-Forwarded-User"),
            (ENV_URL_PREFIX, "forms/"),
            (ENV_TREES, "trees.json"),
        ]))
        .unwrap();

        assert_eq!(settings.database_path, PathBuf::from("/tmp/forms.db"));
        assert_eq!(settings.admins, vec!["ops@example.com", "web@example.com"]);
        assert_eq!(settings.from_email, "forms@example.com");
        assert_eq!(settings.user_header, "x-forwarded-user");
        assert_eq!(settings.url_prefix, "/forms");
        assert_eq!(settings.trees_path, Some(PathBuf::from("trees.json")));
    }

    #[test]
    fn test_smtp_settings() {
        let settings = Settings::from_lookup(lookup_from(&[
            (ENV_SMTP_HOST, "mail.example.com"),
            (ENV_SMTP_USER, "forms"),
            (ENV_SMTP_PASSWORD, "secret"),
        ]))
        .unwrap();
        assert_eq!(
            settings.smtp,
            Some(SmtpSettings {
                host: "mail.example.com".to_string(),
                port: DEFAULT_SMTP_PORT,
                username: Some("forms".to_string()),
                password: Some("secret".to_string()),
            })
        );

        let local = Settings::from_lookup(lookup_from(&[(ENV_SMTP_HOST, "localhost"), (ENV_SMTP_PORT, "1025")]))
            .unwrap();
        assert_eq!(local.smtp.map(|s| s.port), Some(1025));

        let bad_port = Settings::from_lookup(lookup_from(&[(ENV_SMTP_HOST, "localhost"), (ENV_SMTP_PORT, "smtp")]));
        assert!(bad_port.is_err());
    }

    #[test]
    fn test_root_prefix_is_rejected() {
        let result = Settings::from_lookup(lookup_from(&[(ENV_URL_PREFIX, "/")]));
        assert!(result.is_err());
    }
}
