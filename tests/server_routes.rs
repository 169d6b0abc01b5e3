use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::header::{CONTENT_TYPE, COOKIE, SET_COOKIE};
use axum::http::{Request, StatusCode};
use gateway_console::app::Settings;
use gateway_console::server::{API_PATH, ServerState, build_router};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn app() -> (Router, ServerState) {
    app_with(Settings::default())
}

fn app_with(settings: Settings) -> (Router, ServerState) {
    let state = ServerState::new(&settings).unwrap();
    (build_router(state.clone()), state)
}

fn form(body: &str, cookie: Option<&str>) -> Request<Body> {
    let mut req = Request::builder()
        .method("POST")
        .uri(API_PATH)
        .header(CONTENT_TYPE, "application/x-www-form-urlencoded");
    if let Some(cookie) = cookie {
        req = req.header(COOKIE, cookie);
    }
    req.body(Body::from(body.to_string())).unwrap()
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Option<String>, Value) {
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let cookie = resp
        .headers()
        .get(SET_COOKIE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map(str::to_string);
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    (status, cookie, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn get_is_method_not_allowed() {
    let (app, _) = app();
    let req = Request::builder().uri(API_PATH).body(Body::empty()).unwrap();
    let (status, _, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(body, json!({"success": false, "message": "Method not allowed"}));
}

#[tokio::test]
async fn post_without_action_is_method_not_allowed() {
    let (app, _) = app();
    let (status, _, body) = send(&app, form("api_key=k", None)).await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn unknown_action_is_a_client_error() {
    let (app, _) = app();
    let (status, _, body) = send(&app, form("action=format_disk", None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, json!({"success": false, "message": "Invalid action"}));
}

#[tokio::test]
async fn config_round_trips_within_a_session() {
    let (app, _) = app();
    let (status, cookie, body) =
        send(&app, form("action=save_config&api_key=sk-abc&base_url=https%3A%2F%2Fgw.example%2Fapi%2Fv1", None))
            .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"success": true}));
    let cookie = cookie.expect("session cookie issued");
    assert!(cookie.starts_with("gwc_session="));

    let (_, again, body) = send(&app, form("action=get_config", Some(&cookie))).await;
    assert!(again.is_none());
    assert_eq!(
        body["data"],
        json!({"api_key": "sk-abc", "base_url": "https://gw.example/api/v1", "instance_key": null})
    );
}

#[tokio::test]
async fn sessions_do_not_leak_into_each_other() {
    let (app, state) = app();
    let (_, first, _) = send(&app, form("action=select_instance&instance_key=alpha", None)).await;
    let (_, second, body) = send(&app, form("action=get_config", None)).await;
    assert_ne!(first, second);
    assert_eq!(body["data"]["instance_key"], Value::Null);
    assert_eq!(body["data"]["base_url"], gateway_console::app::DEFAULT_BASE_URL);

    let (_, _, body) = send(&app, form("action=get_config", first.as_deref())).await;
    assert_eq!(body["data"]["instance_key"], "alpha");
    assert_eq!(state.sessions().len(), 2);
}

#[tokio::test]
async fn select_instance_echoes_the_key() {
    let (app, _) = app();
    let (status, _, body) = send(&app, form("action=select_instance&instance_key=ghost", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"success": true, "instance_key": "ghost"}));
}

#[tokio::test]
async fn healthz_answers() {
    let (app, _) = app();
    let req = Request::builder().uri("/healthz").body(Body::empty()).unwrap();
    let (status, _, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"ok": true}));
}

async fn slow_gateway(status: u16, body: Value) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/instances"))
        .respond_with(
            ResponseTemplate::new(status)
                .set_body_json(body)
                .set_delay(Duration::from_millis(300)),
        )
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn failed_create_keeps_a_selection_made_while_it_ran() {
    let gateway = slow_gateway(500, json!({"error": "boom"})).await;
    let (app, _) = app_with(Settings { default_base_url: gateway.uri(), ..Settings::default() });
    let (_, cookie, _) = send(&app, form("action=select_instance&instance_key=a", None)).await;
    let cookie = cookie.unwrap();

    let create = tokio::spawn({
        let app = app.clone();
        let req = form("action=create_instance&phone_number=%2B15550100", Some(&cookie));
        async move { send(&app, req).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    send(&app, form("action=select_instance&instance_key=b", Some(&cookie))).await;

    let (_, _, created) = create.await.unwrap();
    assert_eq!(created["success"], false);
    let (_, _, body) = send(&app, form("action=get_config", Some(&cookie))).await;
    assert_eq!(body["data"]["instance_key"], "b");
}

#[tokio::test]
async fn successful_create_keeps_config_saved_while_it_ran() {
    let gateway = slow_gateway(201, json!({"data": {"instance_key": "fresh"}})).await;
    let (app, _) = app_with(Settings { default_base_url: gateway.uri(), ..Settings::default() });
    let (_, cookie, _) = send(&app, form("action=get_config", None)).await;
    let cookie = cookie.unwrap();

    let create = tokio::spawn({
        let app = app.clone();
        let req = form("action=create_instance&phone_number=%2B15550100", Some(&cookie));
        async move { send(&app, req).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    send(&app, form("action=save_config&api_key=sk-new&base_url=http%3A%2F%2Fother", Some(&cookie))).await;

    let (_, _, created) = create.await.unwrap();
    assert_eq!(created["success"], true);
    let (_, _, body) = send(&app, form("action=get_config", Some(&cookie))).await;
    assert_eq!(
        body["data"],
        json!({"api_key": "sk-new", "base_url": "http://other", "instance_key": "fresh"})
    );
}
