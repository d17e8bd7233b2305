pub mod config;
pub mod coordinator;
pub mod store;

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use exchange_core::{
    DrawPhase, ExchangeError, ExchangeState, Identity, IdentityEvent, NewWishlistItem,
    Participant, RosterEntry, WishlistItem, WishlistPatch,
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::coordinator::{Coordinator, ExchangeUpdate, SharedCoordinator};
use crate::store::{JsonFileStore, MemoryStore, StateStore};

#[derive(Clone)]
pub struct AppState {
    coordinator: SharedCoordinator,
}

impl AppState {
    pub fn new(coordinator: SharedCoordinator) -> Self {
        Self { coordinator }
    }

    pub async fn load(settings: &Settings) -> Self {
        let store = store_for(settings);
        let coordinator = Coordinator::load(store, settings).await;
        Self::new(coordinator.into_shared())
    }

    pub fn coordinator(&self) -> SharedCoordinator {
        self.coordinator.clone()
    }
}

pub fn store_for(settings: &Settings) -> Arc<dyn StateStore> {
    match &settings.state_path {
        Some(path) => {
            info!(path = %path.display(), "persisting to file");
            Arc::new(JsonFileStore::new(path.clone()))
        }
        None => {
            warn!("no state path configured, exchange will not survive a restart");
            Arc::new(MemoryStore::new())
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/session", post(login).delete(logout))
        .route("/participants", get(list_participants))
        .route("/participants/:id", get(get_participant))
        .route("/me", get(get_me))
        .route("/me/target", get(get_target))
        .route("/wishlist", post(add_item))
        .route("/wishlist/:item_id", patch(update_item).delete(remove_item))
        .route("/draw", get(draw_status).post(draw))
        .route("/draw/reset", post(reset_draw))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

// Never carries the drawn target.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ParticipantView {
    pub id: String,
    pub name: String,
    pub email: String,
    pub photo_ref: Option<String>,
    pub wishlist: Vec<WishlistItem>,
}

impl From<&Participant> for ParticipantView {
    fn from(p: &Participant) -> Self {
        Self {
            id: p.id.clone(),
            name: p.name.clone(),
            email: p.email.clone(),
            photo_ref: p.photo_ref.clone(),
            wishlist: p.wishlist.clone(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DrawStatus {
    pub phase: DrawPhase,
    pub can_draw: bool,
    pub participants: usize,
}

impl From<&ExchangeState> for DrawStatus {
    fn from(state: &ExchangeState) -> Self {
        Self {
            phase: state.phase(),
            can_draw: state.can_draw(),
            participants: state.participants.len(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerMessage {
    Roster {
        roster: Vec<RosterEntry>,
        drawing_complete: bool,
    },
    Update(ExchangeUpdate),
}

fn reject(err: ExchangeError) -> Response {
    let status = match &err {
        ExchangeError::NoActiveParticipant => StatusCode::UNAUTHORIZED,
        ExchangeError::ItemNotFound => StatusCode::NOT_FOUND,
        ExchangeError::EmptyIdentity | ExchangeError::EmptyName => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        ExchangeError::NotEnoughParticipants { .. }
        | ExchangeError::AlreadyDrawn
        | ExchangeError::Assignment(_) => StatusCode::CONFLICT,
    };
    (status, err.to_string()).into_response()
}

fn active_view(state: &ExchangeState) -> Response {
    match state.active_participant() {
        Some(p) => (StatusCode::OK, Json(ParticipantView::from(p))).into_response(),
        None => reject(ExchangeError::NoActiveParticipant),
    }
}

async fn login(State(state): State<AppState>, Json(identity): Json<Identity>) -> Response {
    let mut coordinator = state.coordinator.lock().await;
    match coordinator
        .handle_identity_event(IdentityEvent::LoggedIn(identity))
        .await
    {
        Ok(snapshot) => active_view(&snapshot),
        Err(err) => reject(err),
    }
}

async fn logout(State(state): State<AppState>) -> Response {
    let mut coordinator = state.coordinator.lock().await;
    match coordinator
        .handle_identity_event(IdentityEvent::LoggedOut)
        .await
    {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => reject(err),
    }
}

async fn list_participants(State(state): State<AppState>) -> impl IntoResponse {
    let roster = state.coordinator.lock().await.roster();
    (StatusCode::OK, Json(roster))
}

async fn get_participant(
    State(state): State<AppState>,
    Path(participant_id): Path<String>,
) -> Response {
    let coordinator = state.coordinator.lock().await;
    let Some(participant) = coordinator.participant(&participant_id) else {
        return (StatusCode::NOT_FOUND, "participant not found").into_response();
    };
    (StatusCode::OK, Json(ParticipantView::from(&participant))).into_response()
}

async fn get_me(State(state): State<AppState>) -> Response {
    let snapshot = state.coordinator.lock().await.snapshot();
    active_view(&snapshot)
}

async fn get_target(State(state): State<AppState>) -> Response {
    let coordinator = state.coordinator.lock().await;
    if coordinator.active_participant().is_none() {
        return reject(ExchangeError::NoActiveParticipant);
    }
    match coordinator.drawn_target() {
        Some(target) => (StatusCode::OK, Json(ParticipantView::from(&target))).into_response(),
        None => (StatusCode::NOT_FOUND, "no assignment yet").into_response(),
    }
}

async fn add_item(State(state): State<AppState>, Json(item): Json<NewWishlistItem>) -> Response {
    let mut coordinator = state.coordinator.lock().await;
    match coordinator.add_wishlist_item(item).await {
        Ok(snapshot) => active_view(&snapshot),
        Err(err) => reject(err),
    }
}

async fn update_item(
    State(state): State<AppState>,
    Path(item_id): Path<String>,
    Json(patch): Json<WishlistPatch>,
) -> Response {
    let mut coordinator = state.coordinator.lock().await;
    match coordinator.update_wishlist_item(item_id, patch).await {
        Ok(snapshot) => active_view(&snapshot),
        Err(err) => reject(err),
    }
}

async fn remove_item(State(state): State<AppState>, Path(item_id): Path<String>) -> Response {
    let mut coordinator = state.coordinator.lock().await;
    match coordinator.remove_wishlist_item(item_id).await {
        Ok(snapshot) => active_view(&snapshot),
        Err(err) => reject(err),
    }
}

async fn draw_status(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.coordinator.lock().await.snapshot();
    (StatusCode::OK, Json(DrawStatus::from(snapshot.as_ref())))
}

async fn draw(State(state): State<AppState>) -> Response {
    let mut coordinator = state.coordinator.lock().await;
    match coordinator.perform_draw().await {
        Ok(snapshot) => (StatusCode::OK, Json(DrawStatus::from(snapshot.as_ref()))).into_response(),
        Err(err) => reject(err),
    }
}

async fn reset_draw(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.coordinator.lock().await.reset_draw().await;
    (StatusCode::OK, Json(DrawStatus::from(snapshot.as_ref())))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(stream: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = stream.split();

    let (initial, mut updates) = {
        let coordinator = state.coordinator.lock().await;
        let snapshot = coordinator.snapshot();
        (
            ServerMessage::Roster {
                roster: snapshot.roster(),
                drawing_complete: snapshot.drawing_complete,
            },
            coordinator.subscribe(),
        )
    };

    if send_json(&mut sender, &initial).await.is_err() {
        return;
    }

    // Forward broadcasts until the client goes away.
    let mut send_task = tokio::spawn(async move {
        loop {
            match updates.recv().await {
                Ok(update) => {
                    if send_json(&mut sender, &ServerMessage::Update(update))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "websocket subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            if matches!(message, Message::Close(_)) {
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
    debug!("websocket closed");
}

async fn send_json(
    sender: &mut SplitSink<WebSocket, Message>,
    message: &ServerMessage,
) -> Result<(), axum::Error> {
    let text = serde_json::to_string(message).map_err(axum::Error::new)?;
    sender.send(Message::Text(text)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::ServiceExt;
    use uuid::Uuid;

    async fn json_body(res: Response) -> Value {
        let bytes = res.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> Response {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        app.clone().oneshot(request).await.unwrap()
    }

    async fn login(app: &Router, id: &str, name: &str) -> Response {
        send(
            app,
            Method::POST,
            "/session",
            Some(json!({ "id": id, "display_name": name, "email": format!("{id}@example.com") })),
        )
        .await
    }

    async fn test_app() -> (Router, AppState) {
        let settings = Settings {
            draw_seed: Some(42),
            ..Settings::default()
        };
        let state = AppState::load(&settings).await;
        (app(state.clone()), state)
    }

    #[tokio::test]
    async fn login_registers_participant_and_me_returns_profile() {
        let (app, _) = test_app().await;

        let res = send(&app, Method::GET, "/me", None).await;
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

        let res = login(&app, "a", "Alice").await;
        assert_eq!(res.status(), StatusCode::OK);
        let body = json_body(res).await;
        assert_eq!(body["id"], "a");
        assert_eq!(body["name"], "Alice");
        assert_eq!(body["wishlist"], json!([]));

        let res = send(&app, Method::GET, "/me", None).await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(json_body(res).await["email"], "a@example.com");

        let res = send(&app, Method::POST, "/session", Some(json!({ "id": " " }))).await;
        assert_eq!(res.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let res = send(&app, Method::DELETE, "/session", None).await;
        assert_eq!(res.status(), StatusCode::NO_CONTENT);
        let res = send(&app, Method::GET, "/me", None).await;
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

        // logout keeps the roster
        let roster = json_body(send(&app, Method::GET, "/participants", None).await).await;
        assert_eq!(roster.as_array().unwrap().len(), 1);
        assert_eq!(roster[0]["is_active"], false);
    }

    #[tokio::test]
    async fn wishlist_add_update_remove() {
        let (app, _) = test_app().await;

        let res = send(&app, Method::POST, "/wishlist", Some(json!({ "name": "Socks" }))).await;
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

        login(&app, "a", "Alice").await;
        let res = send(
            &app,
            Method::POST,
            "/wishlist",
            Some(json!({ "name": "Socks", "description": "Wool, size 10" })),
        )
        .await;
        assert_eq!(res.status(), StatusCode::OK);
        let body = json_body(res).await;
        let item = &body["wishlist"][0];
        assert_eq!(item["name"], "Socks");
        assert_eq!(item["description"], "Wool, size 10");
        assert!(item.get("link").is_none());
        let item_id = item["id"].as_str().unwrap().to_string();

        let res = send(&app, Method::POST, "/wishlist", Some(json!({ "name": "  " }))).await;
        assert_eq!(res.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let res = send(
            &app,
            Method::PATCH,
            &format!("/wishlist/{item_id}"),
            Some(json!({ "link": "https://example.com/socks" })),
        )
        .await;
        assert_eq!(res.status(), StatusCode::OK);
        let body = json_body(res).await;
        assert_eq!(body["wishlist"][0]["id"], item_id.as_str());
        assert_eq!(body["wishlist"][0]["name"], "Socks");
        assert_eq!(body["wishlist"][0]["link"], "https://example.com/socks");

        let res = send(
            &app,
            Method::PATCH,
            "/wishlist/unknown",
            Some(json!({ "name": "Hat" })),
        )
        .await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);

        let res = send(&app, Method::DELETE, &format!("/wishlist/{item_id}"), None).await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(json_body(res).await["wishlist"], json!([]));

        let res = send(&app, Method::DELETE, &format!("/wishlist/{item_id}"), None).await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn draw_lifecycle() {
        let (app, _) = test_app().await;

        login(&app, "a", "Alice").await;
        let res = send(&app, Method::POST, "/draw", None).await;
        assert_eq!(res.status(), StatusCode::CONFLICT);

        login(&app, "b", "Bob").await;
        let status = json_body(send(&app, Method::GET, "/draw", None).await).await;
        assert_eq!(status["phase"], "not_drawn");
        assert_eq!(status["can_draw"], true);

        let res = send(&app, Method::GET, "/me/target", None).await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);

        let res = send(&app, Method::POST, "/draw", None).await;
        assert_eq!(res.status(), StatusCode::OK);
        let status = json_body(res).await;
        assert_eq!(status["phase"], "drawn");
        assert_eq!(status["can_draw"], false);
        assert_eq!(status["participants"], 2);

        let res = send(&app, Method::POST, "/draw", None).await;
        assert_eq!(res.status(), StatusCode::CONFLICT);

        let res = send(&app, Method::GET, "/me/target", None).await;
        assert_eq!(res.status(), StatusCode::OK);
        let target = json_body(res).await;
        assert_eq!(target["id"], "a");
        assert_eq!(target["name"], "Alice");

        let res = send(&app, Method::POST, "/draw/reset", None).await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(json_body(res).await["phase"], "not_drawn");

        let res = send(&app, Method::GET, "/me/target", None).await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn roster_and_profiles_hide_assignments() {
        let (app, _) = test_app().await;
        for (id, name) in [("a", "Alice"), ("b", "Bob"), ("c", "Carol")] {
            login(&app, id, name).await;
        }
        send(&app, Method::POST, "/draw", None).await;

        let roster = json_body(send(&app, Method::GET, "/participants", None).await).await;
        let entries = roster.as_array().unwrap();
        assert_eq!(entries.len(), 3);
        let names: Vec<&str> = entries.iter().map(|e| e["name"].as_str().unwrap()).collect();
        assert_eq!(names, vec!["Alice", "Bob", "Carol"]);
        for entry in entries {
            assert_eq!(entry["has_drawn"], true);
            assert!(entry.get("drawn_id").is_none());
            assert!(entry.get("drawnId").is_none());
        }
        assert_eq!(entries[2]["is_active"], true);

        let res = send(&app, Method::GET, "/participants/b", None).await;
        assert_eq!(res.status(), StatusCode::OK);
        let profile = json_body(res).await;
        assert_eq!(profile["name"], "Bob");
        assert!(profile.get("drawn_id").is_none());

        let res = send(&app, Method::GET, "/participants/zed", None).await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn persistence_writes_and_loads_exchange() {
        let path = std::env::temp_dir().join(format!("exchange_state_{}.json", Uuid::new_v4()));
        let settings = Settings {
            state_path: Some(path.clone()),
            ..Settings::default()
        };
        let state = AppState::load(&settings).await;
        let app = app(state);

        login(&app, "a", "Alice").await;
        login(&app, "b", "Bob").await;
        let res = send(&app, Method::POST, "/draw", None).await;
        assert_eq!(res.status(), StatusCode::OK);

        let saved: Value = serde_json::from_slice(&tokio::fs::read(&path).await.unwrap()).unwrap();
        assert_eq!(saved["drawingComplete"], true);
        assert_eq!(saved["activeParticipantId"], "b");
        assert_eq!(saved["participants"][0]["drawnId"], "b");

        let loaded = AppState::load(&settings).await;
        let coordinator = loaded.coordinator();
        let coordinator = coordinator.lock().await;
        assert_eq!(coordinator.roster().len(), 2);
        assert_eq!(coordinator.drawn_target().map(|p| p.id), Some("a".to_string()));

        let _ = tokio::fs::remove_file(&path).await;
    }
}
