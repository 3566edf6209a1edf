use std::fmt::Display;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::builder::BoolishValueParser;
use clap::{ArgAction, Parser};
use pcq_api::{
    run_disposal_job, DisposalEngine, JobReport, JobTrigger, PcqApi, SchemaStatus,
    API_CONTRACT_VERSION,
};
use pcq_core::{
    DisposerConfig, LeadershipContext, LeadershipEvent, LeadershipState, LeadershipTracker,
    DEFAULT_RETENTION_DAYS, MAX_RETENTION_DAYS,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";

#[derive(Debug, Clone)]
struct ServiceState {
    api: PcqApi,
    leadership: Arc<LeadershipTracker>,
    engine: DisposalEngine,
    trigger: JobTrigger,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    #[serde(skip)]
    status: StatusCode,
    service_contract_version: &'static str,
    error: String,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Clone, Serialize)]
struct LeadershipResponse {
    is_leader: bool,
    context: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct GrantRequest {
    #[serde(default)]
    context: Value,
}

#[derive(Debug, Parser)]
#[command(name = "pcq-service")]
#[command(about = "HTTP host for the PCQ store, leadership events, and the disposal job")]
struct Args {
    #[arg(long, env = "PCQ_DB_PATH", default_value = "./pcq.sqlite3")]
    db: PathBuf,
    #[arg(long, env = "PCQ_BIND", default_value = "127.0.0.1:4550")]
    bind: SocketAddr,
    #[arg(long, env = "TASK_NAME")]
    task_name: Option<String>,
    #[arg(
        long,
        env = "DISPOSER_ENABLED",
        action = ArgAction::Set,
        value_parser = BoolishValueParser::new(),
        default_value = "false"
    )]
    disposer_enabled: bool,
    #[arg(
        long,
        env = "DISPOSER_DRY_RUN",
        action = ArgAction::Set,
        value_parser = BoolishValueParser::new(),
        default_value = "false"
    )]
    disposer_dry_run: bool,
    #[arg(
        long,
        env = "DISPOSER_KEEP_NO_CASE_ID_FOR_DAYS",
        default_value_t = DEFAULT_RETENTION_DAYS,
        value_parser = clap::value_parser!(u32).range(..=i64::from(MAX_RETENTION_DAYS))
    )]
    keep_no_case_id_for_days: u32,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status;
        (status, Json(self)).into_response()
    }
}

impl ServiceState {
    fn new(api: PcqApi, disposer: DisposerConfig, trigger: JobTrigger) -> Self {
        let leadership = Arc::new(LeadershipTracker::new());
        let engine = DisposalEngine::new(disposer, Arc::clone(&leadership));
        Self {
            api,
            leadership,
            engine,
            trigger,
        }
    }

    fn error(status: StatusCode, message: impl Into<String>) -> ServiceError {
        ServiceError {
            status,
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: message.into(),
        }
    }

    fn internal(err: impl Display) -> ServiceError {
        Self::error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    }

    fn leadership_response(&self) -> LeadershipResponse {
        match self.leadership.state() {
            LeadershipState::Leader { context } => LeadershipResponse {
                is_leader: true,
                context: Some(context.0),
            },
            LeadershipState::Follower => LeadershipResponse {
                is_leader: false,
                context: None,
            },
        }
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/db/schema-version", get(db_schema_version))
        .route("/v1/leadership", get(leadership_show))
        .route("/v1/leadership/granted", post(leadership_granted))
        .route("/v1/leadership/revoked", post(leadership_revoked))
        .route("/v1/jobs/disposal", post(jobs_disposal))
        .with_state(state)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let api = PcqApi::new(args.db);

    // A pending migration aborts startup; the process exits non-zero.
    api.open_checked_store()?;

    let disposer = DisposerConfig {
        enabled: args.disposer_enabled,
        dry_run: args.disposer_dry_run,
        retention_days: args.keep_no_case_id_for_days,
    };
    let state = ServiceState::new(api, disposer, JobTrigger::new(args.task_name));
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, ?disposer, "pcq-service listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn db_schema_version(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<SchemaStatus>>, ServiceError> {
    match state.api.schema_status() {
        Ok(status) => Ok(Json(envelope(status))),
        Err(err) => Err(ServiceState::internal(err)),
    }
}

async fn leadership_show(
    State(state): State<ServiceState>,
) -> Json<ServiceEnvelope<LeadershipResponse>> {
    Json(envelope(state.leadership_response()))
}

async fn leadership_granted(
    State(state): State<ServiceState>,
    Json(request): Json<GrantRequest>,
) -> Json<ServiceEnvelope<LeadershipResponse>> {
    let context = LeadershipContext(request.context);
    state.leadership.apply(LeadershipEvent::Granted { context });
    tracing::info!("leadership granted");
    Json(envelope(state.leadership_response()))
}

async fn leadership_revoked(
    State(state): State<ServiceState>,
) -> Json<ServiceEnvelope<LeadershipResponse>> {
    state.leadership.apply(LeadershipEvent::Revoked);
    tracing::info!("leadership revoked");
    Json(envelope(state.leadership_response()))
}

async fn jobs_disposal(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<JobReport>>, ServiceError> {
    let report = tokio::task::spawn_blocking(move || {
        let open_store = || state.api.open_checked_store();
        run_disposal_job(&state.trigger, &state.engine, open_store)
    })
    .await
    .map_err(ServiceState::internal)?;
    Ok(Json(envelope(report)))
}
