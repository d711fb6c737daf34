use axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;

use crate::{
    aggregate::{UnitCount, UnitFilter},
    db::models::{HealthReport, ListOrder, Observation},
    error::{ErrorKind, StoreError},
    log_error,
    settings::{AuditSettings, CategoryRule},
    store::ObservationStore,
};

const ENABLE_LOGS: bool = true;
const LOG_TARGET: &str = "audit::http";

const BANNER: &str = "Shelf audit API is running! Try /check_db to verify the observations table.";

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub store: ObservationStore,
}

/// Create the API router
pub fn create_router(store: ObservationStore) -> Router {
    let state = AppState { store };

    Router::new()
        .route("/", get(banner))
        .route("/check_db", get(check_db))
        .route("/save", post(save))
        .route("/measurements", get(measurements))
        .route("/get_count", get(get_count))
        .route("/flag_observation", post(flag_observation))
        .route("/categories", get(get_categories).put(put_category))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ===== Route Handlers =====

async fn banner() -> &'static str {
    BANNER
}

async fn check_db(State(state): State<AppState>) -> Result<Json<CheckDbResponse>, ApiError> {
    let report = state.store.check_health().await?;
    let status = if report.table_exists {
        "Database is working"
    } else {
        "Table 'observations' does not exist"
    };

    Ok(Json(CheckDbResponse {
        status: status.to_string(),
        report,
    }))
}

async fn save(State(state): State<AppState>, body: Bytes) -> Result<Json<SaveResponse>, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(ApiError::BadRequest("No data received".into()));
    }
    let raw: Value = serde_json::from_slice(&body)
        .map_err(|err| ApiError::BadRequest(format!("Body is not valid JSON: {err}")))?;

    let outcome = state.store.save(&raw).await?;
    let message = if outcome.is_duplicate() {
        "Data already saved"
    } else {
        "Data saved successfully!"
    };

    Ok(Json(SaveResponse {
        message: message.to_string(),
        id: outcome.id(),
        duplicate: outcome.is_duplicate(),
    }))
}

async fn measurements(
    State(state): State<AppState>,
    Query(params): Query<MeasurementsQuery>,
) -> Result<Json<Vec<Observation>>, ApiError> {
    let observations = state.store.list(params.order.unwrap_or_default()).await?;
    Ok(Json(observations))
}

async fn get_count(
    State(state): State<AppState>,
    Query(params): Query<CountQuery>,
) -> Result<Json<UnitCount>, ApiError> {
    let filter = UnitFilter {
        store_name: params.store_name.unwrap_or_default(),
        product: params.product.unwrap_or_default(),
        product_type: params.product_type,
        section: params.section,
    };
    let count = state.store.count_units(filter).await?;
    Ok(Json(count))
}

async fn flag_observation(
    State(state): State<AppState>,
    Json(request): Json<FlagRequest>,
) -> Result<Json<FlagResponse>, ApiError> {
    let observation = state
        .store
        .set_flag(request.id, request.flagged, &request.reason)
        .await?;

    Ok(Json(FlagResponse {
        message: format!("Observation {} updated", observation.id),
        observation,
    }))
}

async fn get_categories(State(state): State<AppState>) -> Json<AuditSettings> {
    Json(state.store.settings())
}

async fn put_category(
    State(state): State<AppState>,
    Json(rule): Json<CategoryRule>,
) -> Result<Json<AuditSettings>, ApiError> {
    let settings = state.store.upsert_category(rule)?;
    Ok(Json(settings))
}

// ===== Request/Response Types =====

#[derive(Deserialize)]
struct MeasurementsQuery {
    order: Option<ListOrder>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CountQuery {
    store_name: Option<String>,
    product: Option<String>,
    product_type: Option<String>,
    section: Option<String>,
}

#[derive(Deserialize)]
struct FlagRequest {
    id: i64,
    #[serde(default)]
    reason: String,
    #[serde(default = "flag_default")]
    flagged: bool,
}

fn flag_default() -> bool {
    true
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CheckDbResponse {
    status: String,
    #[serde(flatten)]
    report: HealthReport,
}

#[derive(Serialize)]
struct SaveResponse {
    message: String,
    id: i64,
    duplicate: bool,
}

#[derive(Serialize)]
struct FlagResponse {
    message: String,
    observation: Observation,
}

// ===== Error Handling =====

#[derive(Debug)]
pub enum ApiError {
    Store(StoreError),
    BadRequest(String),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::Store(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message, details) = match &self {
            ApiError::Store(err) => {
                let status = match err.kind() {
                    ErrorKind::Validation => StatusCode::BAD_REQUEST,
                    ErrorKind::NotFound => StatusCode::NOT_FOUND,
                    ErrorKind::StorageUnavailable => {
                        log_error!("{err}: {}", err.detail().unwrap_or_default());
                        StatusCode::SERVICE_UNAVAILABLE
                    }
                };
                (status, err.to_string(), err.detail().map(str::to_string))
            }
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone(), None),
        };

        let body = Json(json!({
            "error": message,
            "details": details,
        }));

        (status, body).into_response()
    }
}
