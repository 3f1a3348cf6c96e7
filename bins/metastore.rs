//! Operator tool for poking at a datastore from the shell.
//!
//! The backend comes from `config.toml` (or `CONFIG_PATH`) and the `STORE_*`
//! environment variables; flags override both.

use std::io::Write;
use std::process::ExitCode;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use tracing::{error, info};

use datastore::{
    delete_multi, id_key, open_store, register_entity, split_id_key, Entity, RawEntity, Store,
    Value,
};

#[derive(Parser, Debug)]
#[clap(
    name = "metastore",
    version = env!("CARGO_PKG_VERSION"),
    about = "Inspect and maintain a metadata store"
)]
struct Cli {
    /// Backend: 'cloud' or 'file'.
    #[clap(long, global = true)]
    backend: Option<String>,
    /// Project id (optionally project/database) or file store name.
    #[clap(long, global = true)]
    id: Option<String>,
    /// Credentials location (cloud) or base directory (file).
    #[clap(long, global = true)]
    location: Option<String>,
    /// Emit JSON logs.
    #[clap(long, global = true)]
    json_logs: bool,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the keys of a kind
    Keys {
        kind: String,
        /// Dot-separated key parts, e.g. "ID,Email" (file backend)
        #[clap(long, value_delimiter = ',')]
        key_parts: Vec<String>,
        /// Filter as "<field> <op> <value>", repeatable
        #[clap(long = "filter")]
        filters: Vec<String>,
        #[clap(long)]
        limit: Option<usize>,
        #[clap(long, default_value_t = 0)]
        offset: usize,
        /// Order by this field
        #[clap(long)]
        order: Option<String>,
    },
    /// Print an entity's stored bytes
    Cat {
        kind: String,
        /// Key name; numeric names are treated as ids
        name: String,
    },
    /// Delete entities by name, or every entity of the kind with --all
    Rm {
        kind: String,
        names: Vec<String>,
        #[clap(long)]
        all: bool,
    },
    /// Pack an id, Unix timestamp and sub-time into one key id
    PackId {
        id: i64,
        timestamp: i64,
        sub_time: i64,
    },
    /// Split a packed key id into id, Unix timestamp and sub-time
    SplitId { key_id: i64 },
}

fn new_raw() -> Box<dyn Entity> {
    Box::new(RawEntity::default())
}

/// Integers stay integers so key-part filters compare numerically.
fn parse_value(s: &str) -> Value {
    match s.parse::<i64>() {
        Ok(n) => Value::Int(n),
        Err(_) => Value::from(s),
    }
}

/// Splits `"<field> <op> <value>"`.
fn parse_filter(s: &str) -> Result<(String, String, Value)> {
    let mut parts = s.splitn(3, ' ');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(field), Some(op), Some(value)) if !field.is_empty() => {
            Ok((field.to_string(), op.to_string(), parse_value(value)))
        }
        _ => Err(anyhow!("filter must look like \"<field> <op> <value>\", got {s:?}")),
    }
}

fn key_for(store: &dyn Store, kind: &str, name: &str) -> datastore::Key {
    match name.parse::<i64>() {
        Ok(id) => store.id_key(kind, id),
        Err(_) => store.name_key(kind, name),
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::PackId {
            id,
            timestamp,
            sub_time,
        } => {
            println!("{}", id_key(id, timestamp, sub_time));
            return Ok(());
        }
        Command::SplitId { key_id } => {
            let (id, ts, st) = split_id_key(key_id);
            println!("{id} {ts} {st}");
            return Ok(());
        }
        _ => {}
    }

    let mut cfg = configs::AppConfig::load_and_validate()?.store;
    if let Some(b) = cli.backend {
        cfg.backend = b;
    }
    if let Some(id) = cli.id {
        cfg.id = id;
    }
    if let Some(loc) = cli.location {
        cfg.location = loc;
    }
    cfg.validate()?;
    let store = open_store(&cfg).await.context("opening store")?;

    match cli.command {
        Command::Keys {
            kind,
            key_parts,
            filters,
            limit,
            offset,
            order,
        } => {
            register_entity(&kind, new_raw);
            let parts: Vec<&str> = key_parts.iter().map(String::as_str).collect();
            let mut q = store.new_query(&kind, true, &parts);
            for f in &filters {
                let (field, op, value) = parse_filter(f)?;
                q.filter_field(&field, &op, value)?;
            }
            if let Some(n) = limit {
                q.limit(n);
            }
            q.offset(offset);
            if let Some(field) = order {
                q.order(&field);
            }
            let keys = store.get_all(q.as_ref(), &mut Vec::new()).await?;
            let mut out = std::io::stdout().lock();
            for key in &keys {
                writeln!(out, "{key}")?;
            }
            info!(kind = %kind, count = keys.len(), "listed keys");
        }
        Command::Cat { kind, name } => {
            let key = key_for(store.as_ref(), &kind, &name);
            let mut entity = RawEntity::default();
            store
                .get(&key, &mut entity)
                .await
                .with_context(|| format!("reading {key}"))?;
            std::io::stdout().write_all(&entity.bytes)?;
        }
        Command::Rm { kind, names, all } => {
            let keys = if all {
                let q = store.new_query(&kind, true, &[]);
                store.get_all(q.as_ref(), &mut Vec::new()).await?
            } else {
                names
                    .iter()
                    .map(|n| key_for(store.as_ref(), &kind, n))
                    .collect()
            };
            let deleted = delete_multi(store.as_ref(), &keys).await?;
            info!(kind = %kind, deleted, "deleted entities");
        }
        Command::PackId { .. } | Command::SplitId { .. } => {}
    }
    Ok(())
}

fn main() -> ExitCode {
    dotenv().ok();
    let cli = Cli::parse();
    common::utils::logging::init_logging(cli.json_logs);

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!(event = "runtime_build_failed", error = %e, "failed to build tokio runtime");
            return ExitCode::FAILURE;
        }
    };

    match rt.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(event = "command_failed", error = %format!("{e:#}"), "metastore failed");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filters_parse_with_typed_values() {
        let (field, op, value) = parse_filter("ID >= 10").unwrap();
        assert_eq!((field.as_str(), op.as_str()), ("ID", ">="));
        assert_eq!(value, Value::Int(10));

        let (_, _, value) = parse_filter("Email = a b@example.com").unwrap();
        assert_eq!(value, Value::from("a b@example.com"));

        assert!(parse_filter("Email").is_err());
    }

    #[test]
    fn cli_parses_global_flags() {
        let cli = Cli::parse_from([
            "metastore",
            "--backend",
            "file",
            "keys",
            "User",
            "--key-parts",
            "ID,Email",
        ]);
        assert_eq!(cli.backend.as_deref(), Some("file"));
        match cli.command {
            Command::Keys { kind, key_parts, .. } => {
                assert_eq!(kind, "User");
                assert_eq!(key_parts, vec!["ID", "Email"]);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
