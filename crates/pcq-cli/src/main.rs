use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::builder::BoolishValueParser;
use clap::{ArgAction, Args, Parser, Subcommand};
use pcq_api::{run_disposal_job, DisposalEngine, JobTrigger, PcqApi, API_CONTRACT_VERSION};
use pcq_core::{
    AnswerUpdate, DisposerConfig, FieldKey, LeadershipContext, LeadershipTracker, PcqError, PcqId,
    QuestionnaireRecord, DEFAULT_RETENTION_DAYS, MAX_RETENTION_DAYS,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use time::OffsetDateTime;
use tracing_subscriber::EnvFilter;
use zeroize::Zeroize;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "pcq")]
#[command(about = "Protected characteristics questionnaire store and retention disposer")]
struct Cli {
    #[arg(long, env = "PCQ_DB_PATH", default_value = "./pcq.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Record {
        #[command(subcommand)]
        command: Box<RecordCommand>,
    },
    /// Run one disposal sweep and fail on error.
    Dispose(DisposeArgs),
    /// Scheduler entry point: runs the disposer only when `TASK_NAME=pcq-disposer`.
    Job(DisposeArgs),
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct KeyArgs {
    /// File holding the hex-encoded 32-byte field key.
    #[arg(long, env = "PCQ_KEY_FILE")]
    key_file: PathBuf,
}

#[derive(Debug, Subcommand)]
enum RecordCommand {
    Save(SaveArgs),
    Get(GetArgs),
    FindByDcn(FindByDcnArgs),
    FindByCase(FindByCaseArgs),
    ListUnlinked(ListUnlinkedArgs),
    LinkCase(LinkCaseArgs),
    Submit(SubmitArgs),
    Reseal(ResealArgs),
    Delete(DeleteArgs),
    Count,
}

#[derive(Debug, Args)]
struct SaveArgs {
    /// JSON questionnaire record.
    #[arg(long)]
    file: PathBuf,
    #[command(flatten)]
    key: KeyArgs,
}

#[derive(Debug, Args)]
struct GetArgs {
    #[arg(long)]
    id: String,
    #[command(flatten)]
    key: KeyArgs,
}

#[derive(Debug, Args)]
struct FindByDcnArgs {
    #[arg(long)]
    dcn: String,
    #[command(flatten)]
    key: KeyArgs,
}

#[derive(Debug, Args)]
struct FindByCaseArgs {
    #[arg(long)]
    case_id: String,
    #[command(flatten)]
    key: KeyArgs,
}

#[derive(Debug, Args)]
struct ListUnlinkedArgs {
    #[arg(long, default_value_t = 100)]
    limit: u32,
    #[command(flatten)]
    key: KeyArgs,
}

#[derive(Debug, Args)]
struct LinkCaseArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    case_id: String,
}

#[derive(Debug, Args)]
struct SubmitArgs {
    #[arg(long)]
    id: String,
    /// JSON answer update.
    #[arg(long)]
    file: PathBuf,
}

#[derive(Debug, Args)]
struct ResealArgs {
    #[arg(long)]
    id: String,
    #[command(flatten)]
    key: KeyArgs,
    #[arg(long)]
    new_key_file: PathBuf,
}

#[derive(Debug, Args)]
struct DeleteArgs {
    #[arg(long)]
    id: String,
}

#[derive(Debug, Args)]
struct DisposeArgs {
    #[arg(
        long,
        env = "DISPOSER_ENABLED",
        action = ArgAction::Set,
        value_parser = BoolishValueParser::new(),
        default_value = "false"
    )]
    enabled: bool,
    #[arg(
        long,
        env = "DISPOSER_DRY_RUN",
        action = ArgAction::Set,
        value_parser = BoolishValueParser::new(),
        default_value = "false"
    )]
    dry_run: bool,
    #[arg(
        long,
        env = "DISPOSER_KEEP_NO_CASE_ID_FOR_DAYS",
        default_value_t = DEFAULT_RETENTION_DAYS,
        value_parser = clap::value_parser!(u32).range(..=i64::from(MAX_RETENTION_DAYS))
    )]
    keep_no_case_id_for_days: u32,
    /// Treat this process as the cluster leader for the run.
    #[arg(long, default_value_t = false)]
    as_leader: bool,
}

impl DisposeArgs {
    fn engine(&self) -> DisposalEngine {
        let leadership = Arc::new(LeadershipTracker::new());
        if self.as_leader {
            leadership.on_granted(LeadershipContext(serde_json::json!({ "source": "pcq-cli" })));
        }
        DisposalEngine::new(
            DisposerConfig {
                enabled: self.enabled,
                dry_run: self.dry_run,
                retention_days: self.keep_no_case_id_for_days,
            },
            leadership,
        )
    }
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            object.insert(
                "api_contract_version".to_string(),
                Value::String(API_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "api_contract_version": API_CONTRACT_VERSION,
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
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let api = PcqApi::new(cli.db);
    match cli.command {
        Command::Db { command } => run_db(command, &api),
        Command::Record { command } => run_record(*command, &api),
        Command::Dispose(args) => run_dispose(&args, &api),
        Command::Job(args) => run_job(&args, &api),
    }
}

fn run_db(command: DbCommand, api: &PcqApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "pending_scripts": status.pending_scripts,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => {
            let result = api.migrate(args.dry_run)?;
            let value =
                serde_json::to_value(&result).context("failed to serialize migrate result")?;
            emit_json(value)
        }
    }
}

fn run_record(command: RecordCommand, api: &PcqApi) -> Result<()> {
    match command {
        RecordCommand::Save(args) => {
            let record: QuestionnaireRecord = read_json_file(&args.file)?;
            let key = read_key_file(&args.key.key_file)?;
            api.save_answers(&record, &key)?;
            emit_json(serde_json::json!({ "saved": true, "pcq_id": record.pcq_id }))
        }
        RecordCommand::Get(args) => {
            let key = read_key_file(&args.key.key_file)?;
            let record = api.get_answers(&PcqId::new(args.id)?, &key)?;
            let value = serde_json::to_value(&record).context("failed to serialize pcq record")?;
            emit_json(value)
        }
        RecordCommand::FindByDcn(args) => {
            let key = read_key_file(&args.key.key_file)?;
            let records = api.find_by_dcn_number(&args.dcn, &key)?;
            emit_json(serde_json::json!({ "records": records }))
        }
        RecordCommand::FindByCase(args) => {
            let key = read_key_file(&args.key.key_file)?;
            let records = api.find_by_case_id(&args.case_id, &key)?;
            emit_json(serde_json::json!({ "records": records }))
        }
        RecordCommand::ListUnlinked(args) => {
            let key = read_key_file(&args.key.key_file)?;
            let records = api.list_without_case(args.limit, &key)?;
            emit_json(serde_json::json!({ "records": records }))
        }
        RecordCommand::LinkCase(args) => {
            let result = api.link_case(&PcqId::new(args.id)?, &args.case_id)?;
            let value = serde_json::to_value(&result).context("failed to serialize link result")?;
            emit_json(value)
        }
        RecordCommand::Submit(args) => run_record_submit(&args, api),
        RecordCommand::Reseal(args) => {
            let pcq_id = PcqId::new(args.id)?;
            let old_key = read_key_file(&args.key.key_file)?;
            let new_key = read_key_file(&args.new_key_file)?;
            api.reseal(&pcq_id, &old_key, &new_key)?;
            emit_json(serde_json::json!({ "resealed": true, "pcq_id": pcq_id }))
        }
        RecordCommand::Delete(args) => {
            let pcq_id = PcqId::new(args.id)?;
            let deleted = api.delete_record(&pcq_id)?;
            emit_json(serde_json::json!({ "pcq_id": pcq_id, "deleted": deleted }))
        }
        RecordCommand::Count => emit_json(serde_json::json!({ "count": api.count_records()? })),
    }
}

fn run_record_submit(args: &SubmitArgs, api: &PcqApi) -> Result<()> {
    let pcq_id = PcqId::new(args.id.clone())?;
    let update: AnswerUpdate = read_json_file(&args.file)?;
    match api.submit_answers(&pcq_id, &update) {
        Ok(()) => emit_json(serde_json::json!({ "pcq_id": pcq_id, "applied": true })),
        Err(err) if is_stale_write(&err) => {
            tracing::warn!(pcq_id = %pcq_id, "{err}");
            emit_json(serde_json::json!({
                "pcq_id": pcq_id,
                "applied": false,
                "reason": err.to_string()
            }))
        }
        Err(err) => Err(err),
    }
}

fn is_stale_write(err: &anyhow::Error) -> bool {
    let pcq_error = err.downcast_ref::<PcqError>();
    matches!(pcq_error, Some(PcqError::StaleWrite(_)))
}

fn run_dispose(args: &DisposeArgs, api: &PcqApi) -> Result<()> {
    let engine = args.engine();
    let now = OffsetDateTime::now_utc();
    let outcome = engine.dispose_pcq_with(|| api.open_checked_store(), now)?;
    let value = serde_json::to_value(&outcome).context("failed to serialize disposal outcome")?;
    emit_json(value)
}

fn run_job(args: &DisposeArgs, api: &PcqApi) -> Result<()> {
    let open_store = || api.open_checked_store();
    let report = run_disposal_job(&JobTrigger::from_env(), &args.engine(), open_store);
    let value = serde_json::to_value(&report).context("failed to serialize job report")?;
    emit_json(value)
}

fn read_json_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let body = fs::read_to_string(path)
        .with_context(|| format!("failed to read JSON file {}", path.display()))?;
    serde_json::from_str(&body)
        .with_context(|| format!("failed to parse JSON file {}", path.display()))
}

fn read_key_file(path: &Path) -> Result<FieldKey> {
    let mut body = fs::read_to_string(path)
        .with_context(|| format!("failed to read key file {}", path.display()))?;
    let key = FieldKey::from_hex(&body)
        .with_context(|| format!("key file {} must hold 32 hex-encoded bytes", path.display()));
    body.zeroize();
    key
}
