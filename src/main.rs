//! # kb-admin CLI (`kbadmin`)
//!
//! Every list/detail/edit action of the knowledge-base admin, plus the HTTP
//! server that exposes the same actions and the upload relay.
//!
//! ## Usage
//!
//! ```bash
//! kbadmin --config ./config/kbadmin.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `kbadmin tables` | Probe every entity table and list relations |
//! | `kbadmin list <table>` | Search, filter and sort a table |
//! | `kbadmin get <table> <id>` | Print one record |
//! | `kbadmin detail <table> <id>` | Print a record with its related rows |
//! | `kbadmin create <table> --set k=v` | Create a record at the end of the order |
//! | `kbadmin update <table> <id> --set k=v` | Patch a record |
//! | `kbadmin copy <table> <id>` | Duplicate a record and its links |
//! | `kbadmin delete <table> <id>` | Delete a record and its links |
//! | `kbadmin reorder <table> <from> <to>` | Move a row in the manual order |
//! | `kbadmin links <relation> <side> <id>` | Show linked rows |
//! | `kbadmin link <relation> <side> <id> <ids>...` | Replace links |
//! | `kbadmin counts <relation> <side>` | Links per row |
//! | `kbadmin upload <id> <file>` | Send a file to cloud storage |
//! | `kbadmin serve` | Start the HTTP API |

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use kb_admin::listing::{ListOptions, SortKey};
use kb_admin::{config, crud, joins, server, storage, tables};

/// kb-admin: list, search, reorder and edit knowledge-base records.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. Secrets are read from the environment variables it names.
#[derive(Parser)]
#[command(
    name = "kbadmin",
    about = "kb-admin: admin CLI and HTTP relay for the anatomy knowledge base",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/kbadmin.toml")]
    config: PathBuf,

    /// Log debug events to stderr.
    #[arg(long, short, global = true)]
    verbose: bool,

    /// Only log errors.
    #[arg(long, short, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Probe every entity table and list the known relations.
    Tables,

    /// List a table's records.
    ///
    /// Rows are in manual (`display_order`) order unless `--sort` is given.
    List {
        /// Table name (`muscles`) or singular slug (`muscle`).
        table: String,

        /// Case-insensitive text matched against the table's text fields.
        #[arg(long)]
        search: Option<String>,

        /// Sort key: `field` or `field:asc|desc`.
        #[arg(long)]
        sort: Option<String>,

        /// Equality filter `field=value`; repeatable.
        #[arg(long = "filter", value_parser = parse_key_val)]
        filters: Vec<(String, String)>,
    },

    /// Print a record as JSON.
    Get { table: String, id: String },

    /// Print a record with its linked rows, parent and children.
    Detail { table: String, id: String },

    /// Create a record.
    ///
    /// Values that parse as JSON keep their type (`--set display_order=3`),
    /// everything else is stored as a string.
    Create {
        table: String,
        #[arg(long = "set", value_parser = parse_key_val, required = true)]
        fields: Vec<(String, String)>,
    },

    /// Patch fields of a record.
    Update {
        table: String,
        id: String,
        #[arg(long = "set", value_parser = parse_key_val)]
        fields: Vec<(String, String)>,
    },

    /// Duplicate a record (and its join-table links) at the end of the order.
    Copy { table: String, id: String },

    /// Delete a record after removing its join-table links.
    Delete { table: String, id: String },

    /// Move the row at position `from` to position `to` (zero-based).
    Reorder {
        table: String,
        from: usize,
        to: usize,
        /// Order scope value, required for media (the entry id).
        #[arg(long)]
        scope: Option<String>,
    },

    /// Show the rows linked to `id` through a join table.
    Links {
        /// Join table, e.g. `muscle_organs`.
        relation: String,
        /// `left`, `right`, or the entity `id` belongs to.
        side: String,
        id: String,
    },

    /// Replace the links of `id` with exactly `ids`.
    Link {
        relation: String,
        side: String,
        id: String,
        ids: Vec<String>,
    },

    /// Number of links per row on one side of a join table.
    Counts { relation: String, side: String },

    /// Upload a file to cloud storage under `<root>/<id>/`.
    Upload {
        id: String,
        file: PathBuf,
        /// Also add the file to the entry's media list.
        #[arg(long)]
        attach: bool,
    },

    /// Start the HTTP admin API on `[server].bind`.
    Serve,
}

/// Parse a `key=value` pair for `--set` and `--filter`.
fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("invalid KEY=VALUE: no '=' found in '{}'", s))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

fn init_tracing(quiet: bool, verbose: bool) -> anyhow::Result<()> {
    let level = if quiet {
        "error"
    } else if verbose {
        "debug"
    } else {
        "warn"
    };

    let filter = tracing_subscriber::EnvFilter::try_from_env("KB_ADMIN_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|error| anyhow::anyhow!("failed to initialize tracing subscriber: {error}"))?;

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.quiet, cli.verbose)?;

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Tables => {
            tables::list_tables(&cfg).await?;
        }
        Commands::List {
            table,
            search,
            sort,
            filters,
        } => {
            let opts = ListOptions {
                search,
                filters,
                sort: sort.as_deref().map(SortKey::parse).transpose()?,
            };
            crud::run_list(&cfg, &table, &opts).await?;
        }
        Commands::Get { table, id } => {
            crud::run_get(&cfg, &table, &id).await?;
        }
        Commands::Detail { table, id } => {
            joins::run_detail(&cfg, &table, &id).await?;
        }
        Commands::Create { table, fields } => {
            crud::run_create(&cfg, &table, &fields).await?;
        }
        Commands::Update { table, id, fields } => {
            crud::run_update(&cfg, &table, &id, &fields).await?;
        }
        Commands::Copy { table, id } => {
            crud::run_copy(&cfg, &table, &id).await?;
        }
        Commands::Delete { table, id } => {
            crud::run_delete(&cfg, &table, &id).await?;
        }
        Commands::Reorder {
            table,
            from,
            to,
            scope,
        } => {
            crud::run_reorder(&cfg, &table, from, to, scope.as_deref()).await?;
        }
        Commands::Links { relation, side, id } => {
            joins::run_links(&cfg, &relation, &side, &id).await?;
        }
        Commands::Link {
            relation,
            side,
            id,
            ids,
        } => {
            joins::run_link(&cfg, &relation, &side, &id, &ids).await?;
        }
        Commands::Counts { relation, side } => {
            joins::run_counts(&cfg, &relation, &side).await?;
        }
        Commands::Upload { id, file, attach } => {
            storage::run_upload(&cfg, &id, &file, attach).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}
