use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use identity_kernel_api::{IdentityKernelApi, API_CONTRACT_VERSION};
use identity_kernel_core::{ContactId, IdentifyRequest};
use identity_kernel_store_sqlite::SqliteStore;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "ik")]
#[command(about = "Identity Kernel CLI")]
struct Cli {
    #[arg(long, env = "DATABASE_PATH", default_value = "./identity_kernel.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Reconcile an email and/or phone number and print the consolidated contact.
    Identify(IdentifyArgs),
    Contact {
        #[command(subcommand)]
        command: Box<ContactCommand>,
    },
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
}

#[derive(Debug, Args)]
struct IdentifyArgs {
    #[arg(long)]
    email: Option<String>,
    #[arg(long = "phone", alias = "phone-number")]
    phone: Option<String>,
}

#[derive(Debug, Subcommand)]
enum ContactCommand {
    /// Consolidated view of the group containing one contact.
    Show(ContactShowArgs),
    /// Every stored contact record ordered by id.
    List,
}

#[derive(Debug, Args)]
struct ContactShowArgs {
    #[arg(long)]
    id: i64,
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    Backup(DbBackupArgs),
    Restore(DbRestoreArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct DbRestoreArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

/// Logs go to stderr so stdout stays a single JSON document.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Command::Identify(args) => run_identify(&IdentityKernelApi::new(cli.db), args),
        Command::Contact { command } => run_contact(&IdentityKernelApi::new(cli.db), *command),
        Command::Db { command } => {
            let mut store = SqliteStore::open(&cli.db)?;
            run_db(*command, &mut store)
        }
    }
}

fn run_identify(api: &IdentityKernelApi, args: IdentifyArgs) -> Result<()> {
    let request = IdentifyRequest { email: args.email, phone: args.phone };
    let outcome = api.identify(&request)?;
    let mut value = serde_json::to_value(&outcome).context("failed to serialize reconciliation")?;
    if let Value::Object(object) = &mut value {
        object.insert(
            "api_contract_version".to_string(),
            Value::String(API_CONTRACT_VERSION.to_string()),
        );
    }
    emit_json(value)
}

fn run_contact(api: &IdentityKernelApi, command: ContactCommand) -> Result<()> {
    match command {
        ContactCommand::Show(args) => {
            let id = ContactId(args.id);
            let contact =
                api.contact_show(id)?.ok_or_else(|| anyhow!("contact not found: {id}"))?;
            emit_json(serde_json::json!({ "contact": contact }))
        }
        ContactCommand::List => {
            let contacts = api.contact_list()?;
            emit_json(serde_json::json!({ "contacts": contacts }))
        }
    }
}

fn run_db(command: DbCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => run_db_schema_version(store),
        DbCommand::Migrate(args) => run_db_migrate(&args, store),
        DbCommand::Backup(args) => run_db_backup(&args, store),
        DbCommand::Restore(args) => run_db_restore(&args, store),
        DbCommand::IntegrityCheck => run_db_integrity_check(store),
    }
}

fn run_db_schema_version(store: &SqliteStore) -> Result<()> {
    let status = store.schema_status()?;
    emit_json(serde_json::json!({
        "current_version": status.current_version,
        "target_version": status.target_version,
        "pending_versions": status.pending_versions,
        "up_to_date": status.pending_versions.is_empty(),
        "inferred_from_legacy": status.inferred_from_legacy
    }))
}

fn run_db_migrate(args: &DbMigrateArgs, store: &mut SqliteStore) -> Result<()> {
    let before = store.schema_status()?;
    if args.dry_run {
        emit_json(serde_json::json!({
            "dry_run": true,
            "current_version": before.current_version,
            "target_version": before.target_version,
            "would_apply_versions": before.pending_versions,
            "inferred_from_legacy": before.inferred_from_legacy
        }))?;
        return Ok(());
    }

    store.migrate()?;
    let after = store.schema_status()?;
    emit_json(serde_json::json!({
        "dry_run": false,
        "before_version": before.current_version,
        "applied_versions": before.pending_versions,
        "after_version": after.current_version,
        "target_version": after.target_version,
        "up_to_date": after.pending_versions.is_empty()
    }))
}

fn run_db_backup(args: &DbBackupArgs, store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    store.backup_database(&args.out)?;
    emit_json(serde_json::json!({
        "backup_path": args.out,
        "status": "ok"
    }))
}

fn run_db_restore(args: &DbRestoreArgs, store: &mut SqliteStore) -> Result<()> {
    store.restore_database(&args.input)?;
    let status = store.schema_status()?;
    emit_json(serde_json::json!({
        "restored_from": args.input,
        "current_version": status.current_version,
        "target_version": status.target_version,
        "pending_versions": status.pending_versions
    }))
}

fn run_db_integrity_check(store: &SqliteStore) -> Result<()> {
    let report = store.integrity_check()?;
    let healthy = report.is_healthy();
    let mut value = serde_json::to_value(&report).context("failed to serialize integrity report")?;
    if let Value::Object(object) = &mut value {
        object.insert("healthy".to_string(), Value::Bool(healthy));
    }
    emit_json(value)
}
