use crate::database::{LoadError, Located};
use crate::{
    DEFAULT_DATABASE, Database, DatabaseSource, GameSession, GenerationOptions, Generated, Group,
    KNOWN_DATABASES, LoadedDatabase, MAX_ATTEMPTS, Phase, Preset, RecordingRenderer, RenderEvent,
    SessionError, SubmitOutcome, Toggle, render::mistake_visual,
};
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use parking_lot::Mutex;
use rand::SeedableRng;
use rand::rngs::SmallRng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{info, warn};

type SharedState = Arc<AppState>;

/// One game shared by every client of the server.
pub struct AppState {
    session: Mutex<GameSession>,
    source: DatabaseSource,
}

impl AppState {
    pub fn new(source: DatabaseSource, rng: SmallRng) -> Self {
        Self {
            session: Mutex::new(GameSession::new(rng)),
            source,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub addr: SocketAddr,
    /// Serve databases from this directory instead of the bundled copies.
    pub data_dir: Option<PathBuf>,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            data_dir: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum WebError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("initial game could not be dealt: {0}")]
    Session(#[from] SessionError),
}

pub async fn serve(config: WebConfig) -> Result<(), WebError> {
    let source = match &config.data_dir {
        Some(dir) => DatabaseSource::Directory(dir.clone()),
        None => DatabaseSource::Bundled,
    };
    let state = Arc::new(AppState::new(source, SmallRng::from_entropy()));
    switch_database(
        state.clone(),
        DEFAULT_DATABASE.to_string(),
        GenerationOptions::default(),
    )
    .await
    .map_err(|err| match err {
        SwitchError::Session(err) => WebError::Session(err),
        SwitchError::Aborted => WebError::Io(std::io::Error::other("database load aborted")),
    })?;

    let router = build_router(state);
    info!(
        %config.addr,
        data_dir = ?config.data_dir,
        "Binding HTTP listener"
    );
    let listener = TcpListener::bind(config.addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("HTTP server exited");
    Ok(())
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        let status = match err {
            SessionError::Busy | SessionError::NotPlaying => StatusCode::CONFLICT,
            SessionError::NoDatabase => StatusCode::SERVICE_UNAVAILABLE,
            SessionError::IncompleteSelection(_) | SessionError::UnknownExpression(_) => {
                StatusCode::BAD_REQUEST
            }
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let payload = json!({ "error": self.message });
        (self.status, Json(payload)).into_response()
    }
}

fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/api/state", get(api_state))
        .route("/api/database", post(api_database))
        .route("/api/new-game", post(api_new_game))
        .route("/api/toggle", post(api_toggle))
        .route("/api/deselect", post(api_deselect))
        .route("/api/shuffle", post(api_shuffle))
        .route("/api/submit", post(api_submit))
        .route("/healthz", get(health))
        .with_state(state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(true))
                .on_response(DefaultOnResponse::new().include_headers(true)),
        )
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        if let Ok(mut stream) = signal(SignalKind::terminate()) {
            let _ = stream.recv().await;
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok", "service": "connections-web" }))
}

#[derive(Debug)]
enum SwitchError {
    Session(SessionError),
    Aborted,
}

impl From<SwitchError> for ApiError {
    fn from(err: SwitchError) -> Self {
        match err {
            SwitchError::Session(err) => err.into(),
            SwitchError::Aborted => ApiError::internal("database load aborted"),
        }
    }
}

/// Marks the session busy, reads the document without holding the lock, then
/// installs it and deals a new puzzle.
///
/// The read runs on its own task so a dropped request cannot leave the
/// session busy.
async fn switch_database(
    state: SharedState,
    id: String,
    options: GenerationOptions,
) -> Result<(Generated, Vec<RenderEvent>), SwitchError> {
    let mut renderer = RecordingRenderer::default();
    state
        .session
        .lock()
        .begin_load(&mut renderer)
        .map_err(SwitchError::Session)?;

    let task = tokio::spawn(async move {
        let result = read_database(&state.source, &id).await;
        let loaded = LoadedDatabase::from_result(&id, result);
        let mut session = state.session.lock();
        session.finish_load(loaded, &mut renderer);
        let generated = session.new_game(&options, &mut renderer)?;
        Ok::<_, SessionError>((generated, renderer.take()))
    });
    match task.await {
        Ok(result) => result.map_err(SwitchError::Session),
        Err(err) => {
            warn!(error = %err, "database load task failed");
            Err(SwitchError::Aborted)
        }
    }
}

async fn read_database(source: &DatabaseSource, id: &str) -> Result<Database, LoadError> {
    match source.locate(id)? {
        Located::Embedded(raw) => Database::parse(id, raw),
        Located::File(path) => {
            let raw = tokio::fs::read_to_string(&path)
                .await
                .map_err(|source| LoadError::Io {
                    path: path.clone(),
                    source,
                })?;
            Database::parse(id, &raw)
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct GameRequest {
    preset: Option<Preset>,
    options: Option<GenerationOptions>,
}

impl GameRequest {
    /// Explicit options win over a preset. Larger attempt budgets are clamped
    /// to [`MAX_ATTEMPTS`] by the generator.
    fn options(self) -> Result<GenerationOptions, ApiError> {
        let options = self
            .options
            .unwrap_or_else(|| self.preset.unwrap_or_default().options());
        if options.min_difficulty > options.max_difficulty {
            return Err(ApiError::bad_request(format!(
                "minDifficulty {} exceeds maxDifficulty {}",
                options.min_difficulty, options.max_difficulty
            )));
        }
        if options.max_attempts > MAX_ATTEMPTS {
            return Err(ApiError::bad_request(format!(
                "maxAttempts may be at most {MAX_ATTEMPTS}"
            )));
        }
        Ok(options)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DatabaseRequest {
    database: String,
    #[serde(flatten)]
    game: GameRequest,
}

#[derive(Debug, Deserialize)]
struct ToggleRequest {
    expression: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatePayload {
    database: Option<String>,
    known_databases: Vec<&'static str>,
    phase: Phase,
    busy: bool,
    grid: Vec<String>,
    selected: Vec<String>,
    found: Vec<Group>,
    mistakes_remaining: u8,
    mistake_visual: String,
    can_submit: bool,
}

impl StatePayload {
    fn capture(session: &GameSession) -> Self {
        Self {
            database: session.database_id().map(str::to_string),
            known_databases: KNOWN_DATABASES.iter().map(|(id, _)| *id).collect(),
            phase: session.phase(),
            busy: session.is_busy(),
            grid: session.grid().to_vec(),
            selected: session.selected().to_vec(),
            found: session.found_groups().to_vec(),
            mistakes_remaining: session.mistakes_remaining(),
            mistake_visual: mistake_visual(session.mistakes_remaining()),
            can_submit: session.can_submit(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationPayload {
    attempts: usize,
    fell_back: bool,
}

impl From<&Generated> for GenerationPayload {
    fn from(generated: &Generated) -> Self {
        Self {
            attempts: generated.attempts,
            fell_back: generated.fell_back,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ActionPayload {
    events: Vec<RenderEvent>,
    state: StatePayload,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation: Option<GenerationPayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    outcome: Option<SubmitOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    toggle: Option<Toggle>,
}

impl ActionPayload {
    fn new(session: &GameSession, events: Vec<RenderEvent>) -> Self {
        Self {
            events,
            state: StatePayload::capture(session),
            generation: None,
            outcome: None,
            toggle: None,
        }
    }
}

async fn api_state(State(state): State<SharedState>) -> Json<StatePayload> {
    Json(StatePayload::capture(&state.session.lock()))
}

async fn api_database(
    State(state): State<SharedState>,
    Json(request): Json<DatabaseRequest>,
) -> Result<Json<ActionPayload>, ApiError> {
    let options = request.game.options()?;
    let (generated, events) = switch_database(state.clone(), request.database, options).await?;
    let session = state.session.lock();
    let mut payload = ActionPayload::new(&session, events);
    payload.generation = Some(GenerationPayload::from(&generated));
    Ok(Json(payload))
}

async fn api_new_game(
    State(state): State<SharedState>,
    Json(request): Json<GameRequest>,
) -> Result<Json<ActionPayload>, ApiError> {
    let options = request.options()?;
    let mut renderer = RecordingRenderer::default();
    let mut session = state.session.lock();
    let generated = session.new_game(&options, &mut renderer)?;
    let mut payload = ActionPayload::new(&session, renderer.take());
    payload.generation = Some(GenerationPayload::from(&generated));
    Ok(Json(payload))
}

async fn api_toggle(
    State(state): State<SharedState>,
    Json(request): Json<ToggleRequest>,
) -> Result<Json<ActionPayload>, ApiError> {
    let mut session = state.session.lock();
    let toggle = session.toggle(&request.expression)?;
    let mut payload = ActionPayload::new(&session, Vec::new());
    payload.toggle = Some(toggle);
    Ok(Json(payload))
}

async fn api_deselect(State(state): State<SharedState>) -> Result<Json<ActionPayload>, ApiError> {
    let mut session = state.session.lock();
    session.deselect_all()?;
    Ok(Json(ActionPayload::new(&session, Vec::new())))
}

async fn api_shuffle(State(state): State<SharedState>) -> Result<Json<ActionPayload>, ApiError> {
    let mut renderer = RecordingRenderer::default();
    let mut session = state.session.lock();
    session.shuffle(&mut renderer)?;
    Ok(Json(ActionPayload::new(&session, renderer.take())))
}

async fn api_submit(State(state): State<SharedState>) -> Result<Json<ActionPayload>, ApiError> {
    let mut renderer = RecordingRenderer::default();
    let mut session = state.session.lock();
    let outcome = session.submit(&mut renderer)?;
    let mut payload = ActionPayload::new(&session, renderer.take());
    payload.outcome = Some(outcome);
    Ok(Json(payload))
}

#[cfg(all(test, feature = "web"))]
mod tests {
    use super::*;
    use crate::render::NullRenderer;
    use axum::{body, body::Body, http::Request};
    use serde_json::Value;
    use tower::ServiceExt;

    fn test_state() -> SharedState {
        let state = Arc::new(AppState::new(
            DatabaseSource::Bundled,
            SmallRng::seed_from_u64(17),
        ));
        state
            .session
            .lock()
            .switch_database(
                &state.source,
                DEFAULT_DATABASE,
                &GenerationOptions::default(),
                &mut NullRenderer,
            )
            .unwrap();
        state
    }

    async fn call(state: &SharedState, request: Request<Body>) -> (StatusCode, Value) {
        let response = build_router(state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn post_json(uri: &str, payload: Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(payload.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let state = test_state();
        let (status, payload) =
            call(&state, Request::get("/healthz").body(Body::empty()).unwrap()).await;
        assert!(status.is_success());
        assert_eq!(payload["status"], "ok");
    }

    #[tokio::test]
    async fn state_shows_dealt_board() {
        let state = test_state();
        let (status, payload) =
            call(&state, Request::get("/api/state").body(Body::empty()).unwrap()).await;
        assert!(status.is_success());
        assert_eq!(payload["phase"], "playing");
        assert_eq!(payload["database"], DEFAULT_DATABASE);
        assert_eq!(payload["grid"].as_array().unwrap().len(), 16);
        assert_eq!(payload["mistakeVisual"], "○○○○");
    }

    #[tokio::test]
    async fn toggling_a_group_and_submitting_finds_it() {
        let state = test_state();
        let group = state.session.lock().puzzle().unwrap().groups[2].clone();
        for expression in &group.expressions {
            let (status, payload) = call(
                &state,
                post_json("/api/toggle", json!({ "expression": expression })),
            )
            .await;
            assert!(status.is_success());
            assert_eq!(payload["toggle"], "selected");
        }

        let (status, payload) = call(&state, post_json("/api/submit", json!({}))).await;
        assert!(status.is_success());
        assert_eq!(payload["outcome"]["outcome"], "correct");
        assert_eq!(payload["outcome"]["category"], group.category.as_str());
        assert_eq!(payload["state"]["grid"].as_array().unwrap().len(), 12);
        let kinds: Vec<&str> = payload["events"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|event| event["kind"].as_str())
            .collect();
        assert_eq!(kinds, vec!["message", "found_group", "grid"]);
    }

    #[tokio::test]
    async fn session_errors_map_to_status_codes() {
        let state = test_state();
        let (status, payload) = call(
            &state,
            post_json("/api/toggle", json!({ "expression": "nope" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(payload["error"].as_str().unwrap().contains("nope"));

        let (status, _) = call(&state, post_json("/api/submit", json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        state
            .session
            .lock()
            .begin_load(&mut NullRenderer)
            .unwrap();
        let (status, _) = call(&state, post_json("/api/new-game", json!({}))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        let (status, _) = call(&state, post_json("/api/deselect", json!({}))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        let (status, _) = call(
            &state,
            post_json("/api/database", json!({ "database": "series-strategies" })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn switching_database_reports_loading() {
        let state = test_state();
        let (status, payload) = call(
            &state,
            post_json(
                "/api/database",
                json!({ "database": "series-strategies", "preset": "medium" }),
            ),
        )
        .await;
        assert!(status.is_success());
        assert_eq!(payload["state"]["database"], "series-strategies");
        assert_eq!(payload["state"]["busy"], false);
        let events = payload["events"].as_array().unwrap();
        assert_eq!(events[0], json!({ "kind": "loading", "loading": true }));
        assert_eq!(events[1], json!({ "kind": "loading", "loading": false }));
        assert!(payload["generation"]["attempts"].as_u64().unwrap() >= 1);
    }

    #[tokio::test]
    async fn unknown_database_falls_back() {
        let state = test_state();
        let (status, payload) = call(
            &state,
            post_json("/api/database", json!({ "database": "topology" })),
        )
        .await;
        assert!(status.is_success());
        assert_eq!(payload["state"]["database"], DEFAULT_DATABASE);
        assert_eq!(payload["state"]["phase"], "playing");
    }

    #[tokio::test]
    async fn shuffle_and_deselect_clear_selection() {
        let state = test_state();
        let first = state.session.lock().grid()[0].clone();
        call(&state, post_json("/api/toggle", json!({ "expression": first }))).await;
        let (_, payload) = call(&state, post_json("/api/deselect", json!({}))).await;
        assert!(payload["state"]["selected"].as_array().unwrap().is_empty());

        call(&state, post_json("/api/toggle", json!({ "expression": first }))).await;
        let (status, payload) = call(&state, post_json("/api/shuffle", json!({}))).await;
        assert!(status.is_success());
        assert!(payload["state"]["selected"].as_array().unwrap().is_empty());
        assert_eq!(payload["events"][0]["kind"], "grid");
    }

    #[tokio::test]
    async fn unusable_generation_options_are_rejected() {
        let state = test_state();
        let before = state.session.lock().grid().to_vec();

        let (status, payload) = call(
            &state,
            post_json(
                "/api/new-game",
                json!({ "options": { "minDifficulty": 5, "maxDifficulty": 1 } }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(payload["error"].as_str().unwrap().contains("minDifficulty"));

        let (status, _) = call(
            &state,
            post_json(
                "/api/new-game",
                json!({ "options": { "maxAttempts": 3_000_000 } }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(
            &state,
            post_json(
                "/api/database",
                json!({
                    "database": "series-strategies",
                    "options": { "minDifficulty": 4, "maxDifficulty": 2 }
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(!state.session.lock().is_busy());
        assert_eq!(state.session.lock().grid(), before.as_slice());
    }

    #[tokio::test]
    async fn explicit_attempt_budget_within_cap_is_used() {
        let state = test_state();
        let (status, payload) = call(
            &state,
            post_json(
                "/api/new-game",
                json!({ "options": { "minDifficulty": 5, "maxDifficulty": 5, "maxAttempts": 3 } }),
            ),
        )
        .await;
        assert!(status.is_success());
        assert!(payload["generation"]["attempts"].as_u64().unwrap() <= 3);
    }
}
