use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};

use axum::extract::{Request, State};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use chrono::Utc;
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use khata_core::store::{Database, SqliteRecordStore};
use khata_core::sync::{
    commit_batch, fetch_delta, CommitContext, PullRequest, PullResponse, PushRequest,
    PushResponse, DEFAULT_PAGE_SIZE,
};
use khata_core::OwnerId;

use crate::auth::{extract_bearer_token, AuthenticatedFarmer, JwtVerifier};
use crate::config::AppConfig;
use crate::error::AppError;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    jwt_verifier: Arc<JwtVerifier>,
    db: Arc<Mutex<Database>>,
}

impl AppState {
    pub fn from_config(config: Arc<AppConfig>) -> Result<Self, AppError> {
        let db = Database::open(&config.db_path)
            .map_err(|error| AppError::Config(format!("cannot open database: {error}")))?;
        Ok(Self {
            jwt_verifier: Arc::new(JwtVerifier::new(&config)),
            db: Arc::new(Mutex::new(db)),
            config,
        })
    }
}

pub fn app_router(state: AppState) -> Router {
    let protected_routes = Router::new()
        .route("/sync/push", post(sync_push))
        .route("/sync/pull", post(sync_pull))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/healthz", get(healthz))
        .nest("/v1", protected_routes)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers(Any)
                .allow_methods(Any),
        )
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: i64,
}

async fn healthz() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: Utc::now().timestamp(),
    })
}

async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = extract_bearer_token(request.headers())?;
    let farmer = state.jwt_verifier.verify_access_token(token)?;
    request.extensions_mut().insert(farmer);
    Ok(next.run(request).await)
}

async fn sync_push(
    State(state): State<AppState>,
    Extension(farmer): Extension<AuthenticatedFarmer>,
    Json(request): Json<PushRequest>,
) -> Result<Json<PushResponse>, AppError> {
    if request.mutations.len() > state.config.max_batch_len {
        return Err(AppError::bad_request(format!(
            "push batch exceeds {} mutations",
            state.config.max_batch_len
        )));
    }

    let owner_hash = owner_fingerprint(&farmer.owner);
    let batch_len = request.mutations.len();
    let db = state.db.clone();
    let ctx = CommitContext {
        owner: farmer.owner,
        now_ms: Utc::now().timestamp_millis(),
    };

    let results = tokio::task::spawn_blocking(move || {
        let db = db
            .lock()
            .map_err(|_| AppError::internal("database lock poisoned"))?;
        let store = SqliteRecordStore::new(db.connection());
        Ok::<_, AppError>(commit_batch(&store, &ctx, &request.mutations))
    })
    .await
    .map_err(|error| AppError::internal(format!("push task failed: {error}")))??;

    tracing::info!(
        endpoint = "sync_push",
        owner = owner_hash,
        mutations = batch_len,
        "Committed push batch"
    );
    Ok(Json(PushResponse { results }))
}

async fn sync_pull(
    State(state): State<AppState>,
    Extension(farmer): Extension<AuthenticatedFarmer>,
    Json(request): Json<PullRequest>,
) -> Result<Json<PullResponse>, AppError> {
    let page_size = request
        .page_size
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .min(state.config.max_page_size);

    let owner_hash = owner_fingerprint(&farmer.owner);
    let db = state.db.clone();
    let owner = farmer.owner;

    let page = tokio::task::spawn_blocking(move || {
        let db = db
            .lock()
            .map_err(|_| AppError::internal("database lock poisoned"))?;
        let store = SqliteRecordStore::new(db.connection());
        fetch_delta(&store, &owner, request.cursor.as_ref(), page_size).map_err(AppError::from)
    })
    .await
    .map_err(|error| AppError::internal(format!("pull task failed: {error}")))??;

    tracing::info!(
        endpoint = "sync_pull",
        owner = owner_hash,
        entries = page.entries.len(),
        has_more = page.has_more,
        "Served delta page"
    );
    Ok(Json(PullResponse {
        entries: page.entries,
        next_cursor: page.next_cursor,
        has_more: page.has_more,
    }))
}

fn owner_fingerprint(owner: &OwnerId) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    owner.as_str().hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{self, StatusCode};
    use chrono::NaiveDate;
    use http_body_util::BodyExt;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use khata_core::models::{EntryMutation, MutationKind};
    use khata_core::{EntryId, EntryPayload};
    use pretty_assertions::assert_eq;
    use serde::Serialize;
    use tower::ServiceExt;

    use super::*;

    const SECRET: &str = "0123456789abcdef0123456789abcdef-test";

    fn router(dir: &tempfile::TempDir, max_batch_len: usize) -> Router {
        let config = Arc::new(AppConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            db_path: dir.path().join("khata.db"),
            jwt_secret: SECRET.to_string(),
            jwt_issuer: None,
            auth_clock_skew: Duration::from_secs(60),
            max_batch_len,
            max_page_size: 500,
        });
        app_router(AppState::from_config(config).unwrap())
    }

    #[derive(Serialize)]
    struct TestClaims {
        sub: String,
        exp: i64,
    }

    fn token(sub: &str) -> String {
        let claims = TestClaims {
            sub: sub.to_string(),
            exp: Utc::now().timestamp() + 300,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    fn payload(activity: &str) -> EntryPayload {
        EntryPayload {
            date: NaiveDate::from_ymd_opt(2025, 6, 1).unwrap(),
            activity: activity.to_string(),
            description: None,
            cost: 500,
            income: 0,
            images: vec![],
        }
    }

    fn create_mutation(tag: &str) -> EntryMutation {
        EntryMutation {
            client_tag: tag.to_string(),
            kind: MutationKind::Create,
            id: EntryId::new(),
            base_version: 0,
            payload: Some(payload("sowing")),
        }
    }

    async fn send(
        router: Router,
        uri: &str,
        bearer: Option<&str>,
        body: &serde_json::Value,
    ) -> (StatusCode, serde_json::Value) {
        let mut builder = http::Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(bearer) = bearer {
            builder = builder.header("authorization", format!("Bearer {bearer}"));
        }
        let request = builder.body(Body::from(body.to_string())).unwrap();

        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    fn push_body(mutations: Vec<EntryMutation>) -> serde_json::Value {
        serde_json::to_value(PushRequest { mutations }).unwrap()
    }

    fn pull_body() -> serde_json::Value {
        serde_json::to_value(PullRequest {
            cursor: None,
            page_size: None,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn push_without_token_is_unauthorized() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(&dir, 200);

        let body = push_body(vec![create_mutation("c1")]);
        let (status, json) = send(app, "/v1/sync/push", None, &body).await;

        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(json["error"].is_string());
    }

    #[tokio::test]
    async fn oversized_push_batch_is_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(&dir, 2);
        let bearer = token("farmer-1");

        let mutations = (0..3)
            .map(|index| create_mutation(&format!("c{index}")))
            .collect();
        let (status, json) = send(app, "/v1/sync/push", Some(&bearer), &push_body(mutations)).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"].is_string());
    }

    #[tokio::test]
    async fn push_then_pull_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(&dir, 200);
        let bearer = token("farmer-1");

        let mutation = create_mutation("c1");
        let (status, json) = send(
            app.clone(),
            "/v1/sync/push",
            Some(&bearer),
            &push_body(vec![mutation]),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["results"][0]["client_tag"], "c1");
        assert_eq!(json["results"][0]["status"], "accepted");
        assert_eq!(json["results"][0]["new_version"], 1);

        let (status, json) = send(app, "/v1/sync/pull", Some(&bearer), &pull_body()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["entries"].as_array().unwrap().len(), 1);
        assert_eq!(json["entries"][0]["payload"]["activity"], "sowing");
        assert_eq!(json["has_more"], false);
    }

    #[tokio::test]
    async fn foreign_record_outcome_is_inline_not_http_error() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(&dir, 200);

        let mutation = create_mutation("c1");
        let id = mutation.id;
        let owner_token = token("farmer-1");
        let (status, _) = send(
            app.clone(),
            "/v1/sync/push",
            Some(&owner_token),
            &push_body(vec![mutation]),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let intruder = EntryMutation {
            client_tag: "x1".to_string(),
            kind: MutationKind::Update,
            id,
            base_version: 1,
            payload: Some(payload("tampering")),
        };
        let intruder_token = token("farmer-2");
        let (status, json) = send(
            app,
            "/v1/sync/push",
            Some(&intruder_token),
            &push_body(vec![intruder]),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["results"][0]["status"], "rejected");
    }

    #[tokio::test]
    async fn healthz_needs_no_token() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(&dir, 200);

        let request = http::Request::builder()
            .method("GET")
            .uri("/healthz")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
