//! Version 1 of the JSON API.
//!
//! Handlers are thin wrappers that validate input, call into the services
//! held by [`ApiState`] and return JSON payloads.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use time::OffsetDateTime;

use super::ApiError;
use crate::agents::openfda::{AdverseEventReport, ReactionCount, TimeWindow};
use crate::agents::pubmed::DEFAULT_MAX_RESULTS;
use crate::agents::{Agents, Article, DrugProfile, MolecularInfo, SafetyOverview, TrialSummary};
use crate::ai::{AiChatInput, AiChatResponse, AiProviderInfo};
use crate::briefing::{Briefing, Comparison, DrugReport, ReportListing};
use crate::db::{with_conn, DbPool};
use crate::errors::GenieError;
use crate::logging::{list_events, EventRecord};
use crate::model_manager::ModelManager;
use crate::workers::{parse_drug_list, BatchRunner, BatchStatus};

/// Shared state injected into each handler.
#[derive(Clone)]
pub struct ApiState {
    pub db: DbPool,
    pub model_manager: Arc<ModelManager>,
    pub briefing: Arc<Briefing>,
    pub batches: Arc<BatchRunner>,
    pub agents: Agents,
}

type SharedState = Arc<ApiState>;
type ApiResult<T> = Result<Json<T>, ApiError>;

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/providers", get(list_providers))
        .route(
            "/v1/providers/:id/credential",
            put(set_credential).delete(clear_credential),
        )
        .route("/v1/chat", post(chat))
        .route("/v1/drugs/:name", get(drug_profile))
        .route("/v1/drugs/:name/structure", get(drug_structure))
        .route("/v1/drugs/:name/safety", get(drug_safety))
        .route("/v1/drugs/:name/adverse-events", get(adverse_events))
        .route("/v1/trials", get(trials))
        .route("/v1/literature", get(literature))
        .route("/v1/reports", post(create_report).get(list_reports))
        .route("/v1/reports/:id", get(get_report))
        .route("/v1/compare", post(compare))
        .route("/v1/batches", post(submit_batch))
        .route("/v1/batches/:id", get(batch_status))
        .route("/v1/events", get(events))
        .with_state(Arc::new(state))
}

/// Liveness plus a database round trip.
async fn health(State(state): State<SharedState>) -> Json<Value> {
    let db_ok = with_conn(&state.db, |conn| {
        Ok(conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?)
    })
    .await
    .is_ok();
    Json(json!({
        "ok": db_ok,
        "db": db_ok,
        "version": env!("CARGO_PKG_VERSION"),
        "ts": OffsetDateTime::now_utc().unix_timestamp(),
    }))
}

async fn list_providers(State(state): State<SharedState>) -> ApiResult<Vec<AiProviderInfo>> {
    Ok(Json(state.model_manager.list_providers().await?))
}

#[derive(Deserialize)]
pub struct CredentialInput {
    pub api_key: String,
}

async fn set_credential(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(input): Json<CredentialInput>,
) -> ApiResult<AiProviderInfo> {
    Ok(Json(state.model_manager.set_credential(&id, &input.api_key).await?))
}

async fn clear_credential(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> ApiResult<AiProviderInfo> {
    Ok(Json(state.model_manager.clear_credential(&id).await?))
}

async fn chat(
    State(state): State<SharedState>,
    Json(input): Json<AiChatInput>,
) -> ApiResult<AiChatResponse> {
    Ok(Json(state.model_manager.chat(&input).await?))
}

fn found<T>(value: Option<T>, what: String) -> ApiResult<T> {
    value
        .map(Json)
        .ok_or_else(|| ApiError(GenieError::NotFound(what)))
}

async fn drug_profile(
    State(state): State<SharedState>,
    Path(name): Path<String>,
) -> ApiResult<DrugProfile> {
    found(state.agents.rxnav.profile(&name).await?, format!("RxNorm concept for '{name}'"))
}

async fn drug_structure(
    State(state): State<SharedState>,
    Path(name): Path<String>,
) -> ApiResult<MolecularInfo> {
    found(state.agents.pubchem.structure(&name).await?, format!("PubChem compound '{name}'"))
}

async fn drug_safety(
    State(state): State<SharedState>,
    Path(name): Path<String>,
) -> ApiResult<SafetyOverview> {
    found(state.agents.fda.safety_overview(&name).await?, format!("FDA label for '{name}'"))
}

#[derive(Deserialize)]
pub struct AdverseEventQuery {
    pub window: Option<String>,
    pub limit: Option<u32>,
}

#[derive(Serialize)]
pub struct AdverseEvents {
    pub reactions: Vec<ReactionCount>,
    pub reports: Vec<AdverseEventReport>,
}

async fn adverse_events(
    State(state): State<SharedState>,
    Path(name): Path<String>,
    Query(query): Query<AdverseEventQuery>,
) -> ApiResult<AdverseEvents> {
    let window = match query.window.as_deref() {
        Some(raw) => TimeWindow::parse(raw)?,
        None => TimeWindow::default(),
    };
    let limit = query.limit.unwrap_or(10);
    let reactions = state.agents.fda.reaction_counts(&name, window, limit).await?;
    let reports = state.agents.fda.recent_reports(&name, window, limit).await?;
    Ok(Json(AdverseEvents { reactions, reports }))
}

#[derive(Deserialize)]
pub struct TrialsQuery {
    pub drug: String,
    pub condition: Option<String>,
}

async fn trials(
    State(state): State<SharedState>,
    Query(query): Query<TrialsQuery>,
) -> ApiResult<TrialSummary> {
    if query.drug.trim().is_empty() {
        return Err(GenieError::InvalidRequest("drug is required".into()).into());
    }
    let summary = state
        .agents
        .trials
        .search(&query.drug, query.condition.as_deref())
        .await?;
    found(summary, format!("Clinical trials for '{}'", query.drug.trim()))
}

#[derive(Deserialize)]
pub struct LiteratureQuery {
    pub q: String,
    pub max: Option<u32>,
}

async fn literature(
    State(state): State<SharedState>,
    Query(query): Query<LiteratureQuery>,
) -> ApiResult<Vec<Article>> {
    let max = query.max.unwrap_or(DEFAULT_MAX_RESULTS);
    Ok(Json(state.agents.pubmed.search(&query.q, max).await?))
}

#[derive(Deserialize)]
pub struct ReportInput {
    pub drug_name: String,
    pub condition: Option<String>,
}

async fn create_report(
    State(state): State<SharedState>,
    Json(input): Json<ReportInput>,
) -> Result<(StatusCode, Json<DrugReport>), ApiError> {
    let report = state
        .briefing
        .generate(&input.drug_name, input.condition.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(report)))
}

#[derive(Deserialize)]
pub struct ListQuery {
    pub limit: Option<usize>,
}

async fn list_reports(
    State(state): State<SharedState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Vec<ReportListing>> {
    Ok(Json(state.briefing.list(query.limit.unwrap_or(20)).await?))
}

async fn get_report(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> ApiResult<DrugReport> {
    Ok(Json(state.briefing.fetch(&id).await?))
}

#[derive(Deserialize)]
pub struct CompareInput {
    pub drugs: Vec<String>,
}

async fn compare(
    State(state): State<SharedState>,
    Json(input): Json<CompareInput>,
) -> ApiResult<Comparison> {
    Ok(Json(state.briefing.compare(&input.drugs).await?))
}

/// Either an explicit list or uploaded text (plain lines or CSV).
#[derive(Deserialize)]
pub struct BatchInput {
    pub drugs: Option<Vec<String>>,
    pub text: Option<String>,
}

async fn submit_batch(
    State(state): State<SharedState>,
    Json(input): Json<BatchInput>,
) -> Result<(StatusCode, Json<BatchStatus>), ApiError> {
    let names = match (input.drugs, input.text) {
        (Some(drugs), _) => drugs,
        (None, Some(text)) => parse_drug_list(&text)?,
        (None, None) => {
            return Err(GenieError::InvalidRequest("provide either 'drugs' or 'text'".into()).into())
        }
    };
    let queued = state.batches.submit(names).await?;
    Ok((StatusCode::ACCEPTED, Json(queued)))
}

async fn batch_status(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> ApiResult<BatchStatus> {
    Ok(Json(state.batches.status(&id).await?))
}

#[derive(Deserialize)]
pub struct EventsQuery {
    pub module: Option<String>,
    pub limit: Option<usize>,
}

async fn events(
    State(state): State<SharedState>,
    Query(query): Query<EventsQuery>,
) -> ApiResult<Vec<EventRecord>> {
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let records = with_conn(&state.db, move |conn| {
        Ok(list_events(conn, query.module.as_deref(), limit)?)
    })
    .await?;
    Ok(Json(records))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::tests::unreachable_config;
    use crate::db::init_db;
    use crate::model_manager::tests::{providers, FakeBackend};
    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request};
    use tower::ServiceExt;

    fn app(dir: &tempfile::TempDir, keys: &[(&str, Option<&str>)]) -> Router {
        let pool = init_db(dir.path(), &providers(keys)).unwrap();
        let model_manager = ModelManager::new(pool.clone(), FakeBackend::failing(&["deepseek"]));
        let agents = Agents::new(&unreachable_config(), None).unwrap();
        let briefing = Briefing::new(pool.clone(), model_manager.clone(), agents.clone());
        let batches = BatchRunner::new(pool.clone(), briefing.clone());
        router(ApiState {
            db: pool,
            model_manager,
            briefing,
            batches,
            agents,
        })
    }

    async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                request = request.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let response = app.clone().oneshot(request.body(body).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    fn question() -> Value {
        json!({ "messages": [{ "role": "user", "content": "What class is atorvastatin?" }] })
    }

    #[tokio::test]
    async fn health_reports_database() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir, &[]);
        let (status, body) = call(&app, Method::GET, "/v1/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);
    }

    #[tokio::test]
    async fn chat_without_credentials_is_service_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir, &[("deepseek", None), ("groq", None)]);
        let (status, body) = call(&app, Method::POST, "/v1/chat", Some(question())).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["code"], "CFG-1001");
        assert!(body["explain"].as_str().unwrap().contains("GROQ_API_KEY"));
    }

    #[tokio::test]
    async fn credentials_set_through_the_api_enable_chat() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir, &[("deepseek", Some("k1")), ("groq", None)]);

        // deepseek is scripted to fail, so the only credential leads nowhere
        let (status, body) = call(&app, Method::POST, "/v1/chat", Some(question())).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["code"], "AI-1001");
        assert_eq!(body["attempts"][0]["provider_id"], "deepseek");

        let (status, body) = call(
            &app,
            Method::PUT,
            "/v1/providers/groq/credential",
            Some(json!({ "api_key": "gsk_test" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["has_credentials"], true);

        let (status, body) = call(&app, Method::POST, "/v1/chat", Some(question())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["provider_id"], "groq");
        assert_eq!(body["content"], "groq says hi");

        let (status, providers) = call(&app, Method::GET, "/v1/providers", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(providers.as_array().unwrap().len(), 2);

        let (_, events) = call(&app, Method::GET, "/v1/events?module=ai.settings", None).await;
        assert_eq!(events[0]["code"], "AI-0001");
    }

    #[tokio::test]
    async fn invalid_requests_map_to_client_errors() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir, &[("groq", Some("k"))]);

        let (status, body) =
            call(&app, Method::POST, "/v1/chat", Some(json!({ "messages": [] }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "REQ-1001");

        let (status, _) = call(
            &app,
            Method::DELETE,
            "/v1/providers/mistral/credential",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(&app, Method::POST, "/v1/compare", Some(json!({ "drugs": ["aspirin"] }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(&app, Method::GET, "/v1/reports/missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = call(
            &app,
            Method::POST,
            "/v1/batches",
            Some(json!({ "text": "name,dose\naspirin,100mg" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("drug_name"));

        let (status, _) = call(
            &app,
            Method::GET,
            "/v1/drugs/aspirin/adverse-events?window=3w",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = call(
            &app,
            Method::GET,
            "/v1/drugs/aspirin/adverse-events?window=20000y",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "REQ-1001");
    }

    #[tokio::test]
    async fn unreachable_sources_surface_as_bad_gateway() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir, &[]);
        let (status, body) = call(&app, Method::GET, "/v1/drugs/aspirin/structure", None).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["code"], "SRC-1001");
    }

    #[tokio::test]
    async fn reports_are_created_and_listed() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(&dir, &[("groq", Some("k"))]);
        let (status, report) = call(
            &app,
            Method::POST,
            "/v1/reports",
            Some(json!({ "drug_name": "atorvastatin" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(report["summary"], "groq says hi");
        assert_eq!(report["sources"]["trials"]["status"], "unavailable");

        let id = report["id"].as_str().unwrap();
        let (status, fetched) = call(&app, Method::GET, &format!("/v1/reports/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fetched["drug_name"], "atorvastatin");

        let (_, listed) = call(&app, Method::GET, "/v1/reports?limit=5", None).await;
        assert_eq!(listed.as_array().unwrap().len(), 1);
    }
}
