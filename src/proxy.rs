//! Credential-holding proxy between the panel and the gateway.
//!
//! Every named action is either a local session update or exactly one
//! forwarded gateway request. The API key never leaves the server.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::api::{Credentials, GatewayClient, UpstreamReply};
use crate::app::Settings;
use crate::error::{ProxyError, UpstreamError};
use crate::session::{SessionConfig, SessionUpdate};

pub type Params = HashMap<String, String>;

/// Page size for message listings.
pub const MESSAGE_PAGE_SIZE: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    SaveConfig,
    GetConfig,
    CreateInstance,
    StartInstance,
    GetQr,
    GetStatus,
    ListInstances,
    SelectInstance,
    SendText,
    SendMedia,
    GetMessages,
}

impl Action {
    pub const ALL: [Action; 11] = [
        Self::SaveConfig,
        Self::GetConfig,
        Self::CreateInstance,
        Self::StartInstance,
        Self::GetQr,
        Self::GetStatus,
        Self::ListInstances,
        Self::SelectInstance,
        Self::SendText,
        Self::SendMedia,
        Self::GetMessages,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::SaveConfig => "save_config",
            Self::GetConfig => "get_config",
            Self::CreateInstance => "create_instance",
            Self::StartInstance => "start_instance",
            Self::GetQr => "get_qr",
            Self::GetStatus => "get_status",
            Self::ListInstances => "list_instances",
            Self::SelectInstance => "select_instance",
            Self::SendText => "send_text",
            Self::SendMedia => "send_media",
            Self::GetMessages => "get_messages",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| ProxyError::UnknownAction(s.to_string()))
    }
}

/// JSON envelope returned for every action.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProxyReply {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    /// Gateway HTTP status for forwarded actions, `0` if it was unreachable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_key: Option<String>,
}

impl ProxyReply {
    pub fn ok() -> Self {
        Self { success: true, ..Self::default() }
    }

    pub fn ok_data(data: Value) -> Self {
        Self { success: true, data: Some(data), ..Self::default() }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self { success: false, message: Some(message.into()), ..Self::default() }
    }

    fn forwarded(reply: UpstreamReply) -> Self {
        Self {
            success: true,
            data: Some(reply.data),
            status: Some(reply.code),
            ..Self::default()
        }
    }

    /// The gateway body, or `null` when there is none.
    pub fn body(&self) -> &Value {
        self.data.as_ref().unwrap_or(&Value::Null)
    }

    /// Splits a reply into the gateway body or the reason it failed.
    pub fn outcome(&self) -> Result<&Value, UpstreamError> {
        let body = self.body();
        let status = self.status.unwrap_or(200);
        let error_text = |v: &Value| v.get("error").and_then(Value::as_str).map(str::to_string);

        if !self.success {
            let message = self
                .message
                .clone()
                .or_else(|| self.error.as_ref().and_then(error_text))
                .unwrap_or_else(|| "Unknown error".to_string());
            return Err(UpstreamError::Rejected { status, message });
        }
        if self.status == Some(0) {
            let message = error_text(body).unwrap_or_else(|| "Transport Error".to_string());
            return Err(UpstreamError::Transport { message });
        }
        if let Some(raw) = body.get("raw_response").and_then(Value::as_str) {
            return Err(UpstreamError::Decode { status, raw_response: raw.to_string() });
        }
        if let Some(message) = error_text(body) {
            return Err(UpstreamError::Rejected { status, message });
        }
        if !(200..300).contains(&status) {
            let message = body
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("HTTP {}", status));
            return Err(UpstreamError::Rejected { status, message });
        }
        Ok(body)
    }
}

pub struct Proxy {
    client: GatewayClient,
    default_api_key: String,
    default_base_url: String,
}

impl Proxy {
    pub fn new(client: GatewayClient, settings: &Settings) -> Self {
        Self {
            client,
            default_api_key: settings.default_api_key.clone(),
            default_base_url: settings.default_base_url.clone(),
        }
    }

    fn credentials<'a>(&'a self, session: &'a SessionConfig) -> Credentials<'a> {
        Credentials {
            api_key: session.api_key.as_deref().unwrap_or(&self.default_api_key),
            base_url: session.base_url.as_deref().unwrap_or(&self.default_base_url),
        }
    }

    /// Parses `action` and dispatches it. Unknown actions are rejected here,
    /// before anything is sent upstream.
    pub async fn handle(
        &self,
        session: &mut SessionConfig,
        action: &str,
        params: &Params,
    ) -> Result<ProxyReply, ProxyError> {
        let action = action.parse::<Action>()?;
        Ok(self.dispatch(session, action, params).await)
    }

    /// Runs `action` and applies its session change to `session` in place.
    pub async fn dispatch(&self, session: &mut SessionConfig, action: Action, params: &Params) -> ProxyReply {
        let (reply, update) = self.execute(session, action, params).await;
        if let Some(update) = update {
            update.apply(session);
        }
        reply
    }

    /// Runs `action` against a snapshot of the session. The session is not
    /// touched; the change to make, if any, is returned with the reply so
    /// callers holding shared sessions can apply it to the current state.
    pub async fn execute(
        &self,
        session: &SessionConfig,
        action: Action,
        params: &Params,
    ) -> (ProxyReply, Option<SessionUpdate>) {
        let param = |name: &str| params.get(name).cloned().unwrap_or_default();

        match action {
            Action::SaveConfig => {
                let base_url = param("base_url");
                log::info!("session gateway set to {}", base_url);
                let update = SessionUpdate::Config { api_key: param("api_key"), base_url };
                (ProxyReply::ok(), Some(update))
            }
            Action::GetConfig => {
                let creds = self.credentials(session);
                let reply = ProxyReply::ok_data(json!({
                    "api_key": creds.api_key,
                    "base_url": creds.base_url,
                    "instance_key": session.selected_instance_key,
                }));
                (reply, None)
            }
            Action::CreateInstance => {
                let mut payload = json!({ "phone_number": param("phone_number") });
                if let Some(key) = params.get("instance_key").filter(|k| !k.is_empty()) {
                    payload["instance_key"] = json!(key);
                }
                let reply = self.send(session, Method::POST, "/instances", Some(&payload)).await;
                if !reply.is_created() {
                    log::warn!("create_instance rejected with HTTP {}", reply.code);
                    let failed = ProxyReply {
                        error: Some(reply.data),
                        status: Some(reply.code),
                        ..ProxyReply::failure("Failed to create instance")
                    };
                    return (failed, None);
                }
                let update = match reply.data.pointer("/data/instance_key").and_then(Value::as_str) {
                    Some(key) => {
                        log::info!("created instance {}", key);
                        Some(SessionUpdate::Select(key.to_string()))
                    }
                    None => {
                        log::warn!("create_instance reply carried no instance_key");
                        None
                    }
                };
                (ProxyReply { status: Some(reply.code), ..ProxyReply::ok_data(reply.data) }, update)
            }
            Action::StartInstance => (self.instance_call(session, Method::POST, "start").await, None),
            Action::GetQr => (self.instance_call(session, Method::GET, "qr").await, None),
            Action::GetStatus => (self.instance_call(session, Method::GET, "status").await, None),
            Action::ListInstances => (self.forward(session, Method::GET, "/instances", None).await, None),
            Action::SelectInstance => {
                // Trusted as given; the gateway is not asked whether it exists.
                let key = param("instance_key");
                let reply = ProxyReply { instance_key: Some(key.clone()), ..ProxyReply::ok() };
                (reply, Some(SessionUpdate::Select(key)))
            }
            Action::SendText => {
                let payload = json!({
                    "instance_key": session.instance_key_or_empty(),
                    "to": param("to"),
                    "text": param("text"),
                });
                (self.forward(session, Method::POST, "/messages/text", Some(&payload)).await, None)
            }
            Action::SendMedia => {
                let payload = json!({
                    "instance_key": session.instance_key_or_empty(),
                    "to": param("to"),
                    "media": param("media"),
                    "caption": param("caption"),
                });
                (self.forward(session, Method::POST, "/messages/media", Some(&payload)).await, None)
            }
            Action::GetMessages => {
                // The serializer is !Send; it must be gone before the await.
                let endpoint = {
                    let mut query = url::form_urlencoded::Serializer::new(String::new());
                    query.append_pair("instance_key", session.instance_key_or_empty());
                    query.append_pair("limit", &MESSAGE_PAGE_SIZE.to_string());
                    if let Some(direction) = params.get("direction").filter(|d| !d.is_empty() && *d != "all") {
                        query.append_pair("direction", direction);
                    }
                    format!("/messages?{}", query.finish())
                };
                (self.forward(session, Method::GET, &endpoint, None).await, None)
            }
        }
    }

    async fn instance_call(&self, session: &SessionConfig, method: Method, verb: &str) -> ProxyReply {
        let endpoint = format!("/instances/{}/{}", session.instance_key_or_empty(), verb);
        self.forward(session, method, &endpoint, None).await
    }

    async fn forward(
        &self,
        session: &SessionConfig,
        method: Method,
        endpoint: &str,
        body: Option<&Value>,
    ) -> ProxyReply {
        ProxyReply::forwarded(self.send(session, method, endpoint, body).await)
    }

    async fn send(
        &self,
        session: &SessionConfig,
        method: Method,
        endpoint: &str,
        body: Option<&Value>,
    ) -> UpstreamReply {
        self.client
            .request(self.credentials(session), method, endpoint, body)
            .await
            .into_reply()
    }
}
