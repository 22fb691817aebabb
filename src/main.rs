use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;
mod config;

#[derive(Parser, Debug)]
#[command(name = "formbuilder", version, about = "Form builder operator CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Verbose logs
    #[arg(short, long, global = true)]
    verbose: bool,
    /// SQLite database with form entries (overrides FORMBUILDER_DATABASE)
    #[arg(long, global = true)]
    database: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List registered actions with their identifiers
    Actions,
    /// Decode an ajax path parameter segment, e.g. `s=test,debug`
    Decode { path: String },
    /// Show the plugin trees of a file, or the schema of one form
    Inspect {
        /// JSON file with plugin trees
        trees: PathBuf,
        /// Form plugin id to assemble
        #[arg(long)]
        form: Option<u64>,
    },
    /// Manage stored form entries
    Entries {
        #[command(subcommand)]
        command: EntriesCommand,
    },
}

#[derive(Subcommand, Debug)]
enum EntriesCommand {
    /// List entries, newest first
    List {
        #[arg(long)]
        form: Option<String>,
        #[arg(long, default_value_t = config::DEFAULT_LIST_LIMIT)]
        limit: i64,
    },
    /// Show one entry
    Show { id: i64 },
    /// Delete one entry
    Delete {
        id: i64,
        /// Do not ask for confirmation
        #[arg(long)]
        yes: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "info" } else { "warn" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var(config::LOG_ENV).unwrap_or_else(|_| filter.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::Actions => commands::cmd_actions()?,
        Commands::Decode { path } => commands::cmd_decode(&path)?,
        Commands::Inspect { trees, form } => commands::cmd_inspect(&trees, form)?,
        Commands::Entries { command } => {
            let settings = config::load_settings(cli.database)?;
            match command {
                EntriesCommand::List { form, limit } => commands::cmd_entries_list(&settings, form.as_deref(), limit)?,
                EntriesCommand::Show { id } => commands::cmd_entries_show(&settings, id)?,
                EntriesCommand::Delete { id, yes } => commands::cmd_entries_delete(&settings, id, yes)?,
            }
        }
    }
    Ok(())
}
