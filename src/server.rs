use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::header::{COOKIE, SET_COOKIE};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::Json;
use serde_json::json;
use tokio::net::TcpListener;

use crate::api::GatewayClient;
use crate::app::Settings;
use crate::error::{ProxyError, ServeError};
use crate::proxy::{Action, Params, Proxy, ProxyReply};
use crate::session::SessionStore;

pub const API_PATH: &str = "/api-handler";

#[derive(Clone)]
pub struct ServerState {
    proxy: Arc<Proxy>,
    sessions: Arc<SessionStore>,
    cookie_name: Arc<str>,
}

impl ServerState {
    pub fn new(settings: &Settings) -> Result<Self, ServeError> {
        let client = GatewayClient::new(settings)?;
        Ok(Self {
            proxy: Arc::new(Proxy::new(client, settings)),
            sessions: Arc::new(SessionStore::new(settings.session_ttl())),
            cookie_name: Arc::from(settings.session_cookie.as_str()),
        })
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }
}

pub fn build_router(state: ServerState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route(API_PATH, any(api_handler))
        .with_state(state)
}

pub async fn serve(settings: &Settings) -> Result<(), ServeError> {
    let addr = settings.socket_addr()?;
    let app = build_router(ServerState::new(settings)?);
    let listener = TcpListener::bind(addr).await?;
    log::info!("proxy listening on http://{}{}", listener.local_addr()?, API_PATH);
    log::info!("default gateway is {}", settings.default_base_url);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("failed to listen for shutdown signal: {}", e);
            }
            log::info!("shutting down");
        })
        .await?;
    Ok(())
}

async fn healthz() -> Json<serde_json::Value> {
    Json(json!({ "ok": true }))
}

async fn api_handler(
    State(state): State<ServerState>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if method != Method::POST {
        return method_not_allowed();
    }
    let mut params: Params = url::form_urlencoded::parse(&body).into_owned().collect();
    let Some(action) = params.remove("action") else {
        return method_not_allowed();
    };
    let action = match action.parse::<Action>() {
        Ok(action) => action,
        Err(e) => {
            log::warn!("{}", e);
            return (StatusCode::BAD_REQUEST, Json(ProxyReply::failure("Invalid action"))).into_response();
        }
    };

    let cookie = session_cookie(&headers, &state.cookie_name);
    let (id, session, fresh) = state.sessions.checkout(cookie.as_deref());
    log::debug!("session {} -> {}", id, action);
    let (reply, update) = state.proxy.execute(&session, action, &params).await;
    // Only the change itself is written, onto the session as it is now; a
    // slow create cannot undo a selection or config saved meanwhile.
    if let Some(update) = update {
        state.sessions.update(&id, update);
    }

    let mut response = Json(reply).into_response();
    if fresh {
        let value = format!("{}={}; Path=/; HttpOnly; SameSite=Lax", state.cookie_name, id);
        match HeaderValue::from_str(&value) {
            Ok(v) => {
                response.headers_mut().insert(SET_COOKIE, v);
            }
            Err(e) => log::error!("invalid session cookie header: {}", e),
        }
    }
    response
}

fn method_not_allowed() -> Response {
    let reply = ProxyReply::failure(ProxyError::MissingAction.to_string());
    (StatusCode::METHOD_NOT_ALLOWED, Json(reply)).into_response()
}

fn session_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v.to_string())
}
