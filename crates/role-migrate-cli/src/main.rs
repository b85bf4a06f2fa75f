use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use role_migrate_core::card::{convert_results, count_missing_deeplinks, ensure_deeplinks};
use role_migrate_core::{
    parse_raw_records, run_migration, validate_batch_size, MigrationPlan, MigrationReport,
    UpsertStore, DEFAULT_BATCH_SIZE, DEFAULT_SOURCE_FILENAME, DEFAULT_TABLE_NAME,
};
use role_migrate_store_rest::{validate_table_name, RestStore, StoreConfig};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing_subscriber::EnvFilter;
use ulid::Ulid;

const CLI_CONTRACT_VERSION: &str = "cli.v1";
const SUPABASE_TABLE_ENV: &str = "SUPABASE_TABLE";
const SUPABASE_BATCH_SIZE_ENV: &str = "SUPABASE_BATCH_SIZE";
const TELEGRAM_BOT_USERNAME_ENV: &str = "TELEGRAM_BOT_USERNAME";

#[derive(Debug, Parser)]
#[command(name = "role-migrate")]
#[command(about = "Role library migration CLI")]
struct Cli {
    /// Print a JSON document instead of the text summary.
    #[arg(long, global = true, default_value_t = false)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Normalize role cards and upsert them into the role table.
    Migrate(MigrateArgs),
    /// Fill in Telegram start links for every role with an id.
    Deeplink(DeeplinkArgs),
    /// Turn a raw result export into a list of v2 cards.
    Convert(ConvertArgs),
}

#[derive(Debug, Args)]
struct MigrateArgs {
    #[arg(long, default_value = DEFAULT_SOURCE_FILENAME)]
    file: PathBuf,

    #[arg(long, env = SUPABASE_TABLE_ENV, default_value = DEFAULT_TABLE_NAME)]
    table: String,

    #[arg(
        long,
        env = SUPABASE_BATCH_SIZE_ENV,
        default_value_t = DEFAULT_BATCH_SIZE,
        allow_negative_numbers = true
    )]
    batch_size: i64,

    /// Validate and report without writing anything.
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DeeplinkArgs {
    #[arg(long, default_value = DEFAULT_SOURCE_FILENAME)]
    file: PathBuf,

    #[arg(long, env = TELEGRAM_BOT_USERNAME_ENV)]
    bot_username: String,
}

#[derive(Debug, Args)]
struct ConvertArgs {
    #[arg(long)]
    source: PathBuf,

    #[arg(long, default_value = DEFAULT_SOURCE_FILENAME)]
    output: PathBuf,
}

#[derive(Debug, Serialize)]
struct MigrateOutput<'a> {
    run_id: String,
    generated_at: String,
    source: &'a Path,
    source_sha256: String,
    table: &'a str,
    batch_size: i64,
    #[serde(flatten)]
    report: &'a MigrationReport,
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc().format(&Rfc3339).context("failed to format current timestamp")
}

fn sha256_tagged(bytes: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(bytes)))
}

fn read_source(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).with_context(|| format!("input file not found or unreadable: {}", path.display()))
}

fn read_json_file(path: &Path) -> Result<Value> {
    let bytes = read_source(path)?;
    serde_json::from_slice(&bytes)
        .with_context(|| format!("failed to parse JSON from {}", path.display()))
}

fn write_json_file(path: &Path, value: &Value) -> Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }
    let rendered = serde_json::to_string_pretty(value)?;
    fs::write(path, rendered).with_context(|| format!("failed to write {}", path.display()))
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

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Migrate(args) => run_migrate(&args, cli.json),
        Command::Deeplink(args) => run_deeplink(&args, cli.json),
        Command::Convert(args) => run_convert(&args, cli.json),
    }
}

fn run_migrate(args: &MigrateArgs, json: bool) -> Result<()> {
    validate_batch_size(args.batch_size)?;
    let plan = MigrationPlan {
        table: args.table.trim().to_string(),
        batch_size: args.batch_size,
        dry_run: args.dry_run,
    };

    let mut store = if plan.dry_run {
        None
    } else {
        validate_table_name(&plan.table)?;
        let config = StoreConfig::from_env().context("store credentials are not configured")?;
        tracing::info!("Connecting to {} (table {})", config.url, plan.table);
        Some(RestStore::new(config))
    };

    let bytes = read_source(&args.file)?;
    let text = std::str::from_utf8(&bytes)
        .with_context(|| format!("input file is not valid UTF-8: {}", args.file.display()))?;
    let raw_records = parse_raw_records(text)
        .with_context(|| format!("failed to load roles from {}", args.file.display()))?;
    tracing::info!("Loaded {} roles from {}", raw_records.len(), args.file.display());

    let report = run_migration(
        &raw_records,
        &plan,
        store.as_mut().map(|store| store as &mut dyn UpsertStore),
    )?;

    if json {
        let output = MigrateOutput {
            run_id: Ulid::new().to_string(),
            generated_at: now_rfc3339()?,
            source: &args.file,
            source_sha256: sha256_tagged(&bytes),
            table: &plan.table,
            batch_size: plan.batch_size,
            report: &report,
        };
        emit_json(serde_json::to_value(output)?)
    } else {
        print_report(&report, &plan, &args.file)
    }
}

fn print_report(report: &MigrationReport, plan: &MigrationPlan, source: &Path) -> Result<()> {
    println!("Loaded {} roles from {}", report.loaded, source.display());
    println!("Normalized {} roles, skipped {}", report.normalized, report.skipped.len());
    for skipped in &report.skipped {
        println!(
            "  - skipped index={} role_id={}: {}",
            skipped.index, skipped.identity_hint, skipped.reason
        );
    }

    if report.dry_run {
        println!("Dry-run mode: nothing was written to {}", plan.table);
        match &report.sample {
            Some(sample) => {
                println!("Sample record:");
                println!("{}", serde_json::to_string_pretty(sample)?);
            }
            None => println!("No records to sample."),
        }
        return Ok(());
    }

    println!(
        "Migration finished for {}: {} batches ({} degraded)",
        plan.table, report.batches, report.degraded_batches
    );
    println!("  accepted: {}", report.accepted);
    println!("  failed: {}", report.failed.len());
    for failed in &report.failed {
        println!("  - role_id={}: {}", failed.role_id, failed.error);
    }
    Ok(())
}

fn run_deeplink(args: &DeeplinkArgs, json: bool) -> Result<()> {
    let bot_username = args.bot_username.trim();
    if bot_username.is_empty() {
        bail!("{TELEGRAM_BOT_USERNAME_ENV} must not be empty");
    }

    let mut document = read_json_file(&args.file)?;
    let roles = document
        .as_array_mut()
        .ok_or_else(|| anyhow!("{} must contain a JSON array of roles", args.file.display()))?;

    let missing = count_missing_deeplinks(roles);
    let total = roles.len();
    let updated = ensure_deeplinks(roles, bot_username);
    write_json_file(&args.file, &document)?;
    tracing::info!("Updated {updated} deeplinks in {}", args.file.display());

    if json {
        return emit_json(serde_json::json!({
            "file": args.file,
            "bot_username": bot_username,
            "roles": total,
            "missing_before": missing,
            "updated": updated,
        }));
    }

    println!("Roles: {total}");
    println!("Missing deeplinks before update: {missing}");
    println!("Deeplinks written: {updated}");
    println!("Saved {}", args.file.display());
    Ok(())
}

fn run_convert(args: &ConvertArgs, json: bool) -> Result<()> {
    let payload = read_json_file(&args.source)?;
    let cards = convert_results(&payload)
        .with_context(|| format!("failed to convert {}", args.source.display()))?;
    let written = cards.len();
    write_json_file(&args.output, &Value::Array(cards))?;
    tracing::info!("Converted {written} roles into {}", args.output.display());

    if json {
        return emit_json(serde_json::json!({
            "source": args.source,
            "output": args.output,
            "written": written,
        }));
    }

    println!("Converted {written} roles -> {}", args.output.display());
    Ok(())
}
