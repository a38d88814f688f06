use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use identity_kernel_api::{
    kernel_error, parse_contact_id, IdentityKernelApi, MigrateResult, API_CONTRACT_VERSION,
};
use identity_kernel_core::{ConsolidatedContact, IdentifyRequest, KernelError, Reconciliation};
use identity_kernel_store_sqlite::{IntegrityReport, SchemaStatus};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const SERVICE_NAME: &str = "identity-kernel-service";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");
const INTERNAL_ERROR_MESSAGE: &str = "internal server error";

#[derive(Debug, Clone)]
struct ServiceState {
    api: IdentityKernelApi,
    expose_errors: bool,
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
struct ServiceErrorBody {
    service_contract_version: &'static str,
    error: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    retryable: bool,
}

#[derive(Debug, Clone)]
struct ServiceError {
    status: StatusCode,
    body: ServiceErrorBody,
}

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Clone, Serialize)]
struct LivenessResponse {
    status: &'static str,
    timestamp: String,
    service: &'static str,
    version: &'static str,
}

#[derive(Debug, Clone, Serialize)]
struct IdentifyResponse {
    contact: ConsolidatedContact,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceInfo {
    message: &'static str,
    version: &'static str,
    endpoints: Endpoints,
}

#[derive(Debug, Clone, Serialize)]
struct Endpoints {
    identify: &'static str,
    health: &'static str,
    info: &'static str,
}

#[derive(Debug, Clone, Serialize)]
struct NotFoundBody {
    service_contract_version: &'static str,
    error: String,
    available_endpoints: Endpoints,
}

const ENDPOINTS: Endpoints =
    Endpoints { identify: "POST /identify", health: "GET /health", info: "GET /" };

#[derive(Debug, Parser)]
#[command(name = "identity-kernel-service")]
#[command(about = "Local HTTP service for Identity Kernel contact reconciliation")]
struct Args {
    #[arg(long, env = "DATABASE_PATH", default_value = "./identity_kernel.sqlite3")]
    db: PathBuf,
    #[arg(long, env = "IDENTITY_KERNEL_BIND", default_value = "127.0.0.1:3000")]
    bind: SocketAddr,
    #[arg(long, env = "IDENTITY_KERNEL_BUSY_TIMEOUT_MS", default_value_t = 5_000)]
    busy_timeout_ms: u64,
    /// Return internal error details to callers instead of a generic message.
    #[arg(long, env = "IDENTITY_KERNEL_EXPOSE_ERRORS")]
    expose_errors: bool,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl ServiceState {
    fn error(status: StatusCode, message: impl Into<String>) -> ServiceError {
        ServiceError {
            status,
            body: ServiceErrorBody {
                service_contract_version: SERVICE_CONTRACT_VERSION,
                error: message.into(),
                retryable: false,
            },
        }
    }

    fn map_error(&self, err: &anyhow::Error) -> ServiceError {
        match kernel_error(err) {
            Some(KernelError::Validation(message)) => {
                Self::error(StatusCode::BAD_REQUEST, message.clone())
            }
            Some(KernelError::Conflict(_)) => {
                tracing::warn!(error = %format!("{err:#}"), "request hit a retryable conflict");
                let mut mapped = Self::error(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "identity store is busy; retry the request",
                );
                mapped.body.retryable = true;
                mapped
            }
            _ => {
                tracing::error!(error = %format!("{err:#}"), "request failed");
                let message = if self.expose_errors {
                    format!("{err:#}")
                } else {
                    INTERNAL_ERROR_MESSAGE.to_string()
                };
                Self::error(StatusCode::INTERNAL_SERVER_ERROR, message)
            }
        }
    }

    /// Run a blocking store call off the async runtime and map its failure.
    async fn run<T, F>(&self, call: F) -> Result<T, ServiceError>
    where
        T: Send + 'static,
        F: FnOnce(IdentityKernelApi) -> Result<T> + Send + 'static,
    {
        let api = self.api.clone();
        let joined = tokio::task::spawn_blocking(move || call(api)).await;
        match joined {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(self.map_error(&err)),
            Err(err) => Err(self.map_error(&anyhow::Error::new(err).context("store task failed"))),
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

fn request_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ServiceError> {
    payload.map(|Json(request)| request).map_err(|rejection| {
        ServiceState::error(StatusCode::BAD_REQUEST, format!("invalid request body: {rejection}"))
    })
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/", get(service_info))
        .route("/health", get(liveness))
        .route("/identify", post(identify))
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/v1/identify", post(identify_v1))
        .route("/v1/contacts/:contact_id", get(contact_show))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/db/integrity", get(db_integrity))
        .fallback(not_found)
        .with_state(state)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("SIGINT received, shutting down gracefully"),
        () = terminate => tracing::info!("SIGTERM received, shutting down gracefully"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let api = IdentityKernelApi::new(args.db.clone())
        .with_busy_timeout(Duration::from_millis(args.busy_timeout_ms));
    let migration = api
        .migrate(false)
        .with_context(|| format!("failed to migrate database at {}", args.db.display()))?;
    tracing::info!(
        db = %args.db.display(),
        schema_version = ?migration.after_version,
        applied = ?migration.would_apply_versions,
        "database ready"
    );

    let state = ServiceState { api, expose_errors: args.expose_errors };
    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;
    tracing::info!(bind = %args.bind, "identity kernel service listening");

    axum::serve(listener, app(state)).with_graceful_shutdown(shutdown_signal()).await?;
    tracing::info!("identity kernel service stopped");
    Ok(())
}

async fn service_info() -> Json<ServiceInfo> {
    Json(ServiceInfo {
        message: "Identity Kernel contact reconciliation API",
        version: env!("CARGO_PKG_VERSION"),
        endpoints: ENDPOINTS,
    })
}

async fn liveness() -> Result<Json<LivenessResponse>, ServiceError> {
    let timestamp = OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| ServiceState::error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;
    Ok(Json(LivenessResponse {
        status: "OK",
        timestamp,
        service: SERVICE_NAME,
        version: env!("CARGO_PKG_VERSION"),
    }))
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn not_found(uri: Uri) -> (StatusCode, Json<NotFoundBody>) {
    (
        StatusCode::NOT_FOUND,
        Json(NotFoundBody {
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: format!("endpoint not found: {}", uri.path()),
            available_endpoints: ENDPOINTS,
        }),
    )
}

async fn identify(
    State(state): State<ServiceState>,
    payload: Result<Json<IdentifyRequest>, JsonRejection>,
) -> Result<Json<IdentifyResponse>, ServiceError> {
    let request = request_body(payload)?;
    let outcome = state.run(move |api| api.identify(&request)).await?;
    Ok(Json(IdentifyResponse { contact: outcome.contact }))
}

async fn identify_v1(
    State(state): State<ServiceState>,
    payload: Result<Json<IdentifyRequest>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<Reconciliation>>, ServiceError> {
    let request = request_body(payload)?;
    let outcome = state.run(move |api| api.identify(&request)).await?;
    Ok(Json(envelope(outcome)))
}

async fn contact_show(
    State(state): State<ServiceState>,
    Path(contact_id): Path<String>,
) -> Result<Json<ServiceEnvelope<ConsolidatedContact>>, ServiceError> {
    let id = parse_contact_id(&contact_id).map_err(|err| state.map_error(&err))?;
    let contact = state.run(move |api| api.contact_show(id)).await?;
    let contact = contact.ok_or_else(|| {
        ServiceState::error(StatusCode::NOT_FOUND, format!("contact not found: {id}"))
    })?;
    Ok(Json(envelope(contact)))
}

async fn db_schema_version(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<SchemaStatus>>, ServiceError> {
    let status = state.run(|api| api.schema_status()).await?;
    Ok(Json(envelope(status)))
}

async fn db_migrate(
    State(state): State<ServiceState>,
    payload: Result<Json<MigrateRequest>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<MigrateResult>>, ServiceError> {
    let request = request_body(payload)?;
    let result = state.run(move |api| api.migrate(request.dry_run)).await?;
    Ok(Json(envelope(result)))
}

async fn db_integrity(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<IntegrityReport>>, ServiceError> {
    let report = state.run(|api| api.integrity_check()).await?;
    Ok(Json(envelope(report)))
}
