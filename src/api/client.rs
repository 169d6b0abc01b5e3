use std::error::Error as _;

use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client as HttpClient, Method};
use serde_json::{Value, json};

use crate::app::Settings;
use crate::utils::{ECHO_LIMIT, truncate_chars};

/// The pair of values a session needs to talk to the gateway.
#[derive(Debug, Clone, Copy)]
pub struct Credentials<'a> {
    pub api_key: &'a str,
    pub base_url: &'a str,
}

/// The three ways a forwarded call can end. Callers react differently to
/// each, so they are never collapsed into one error string.
#[derive(Debug, Clone, PartialEq)]
pub enum Upstream {
    /// The gateway could not be reached at all.
    Transport { message: String, details: String },
    /// The gateway answered, but not with JSON.
    Decode { status: u16, raw_response: String },
    /// The gateway answered with JSON (an empty body decodes to `null`).
    Decoded { status: u16, body: Value },
}

impl Upstream {
    pub fn classify(status: u16, text: &str) -> Self {
        if text.is_empty() {
            return Self::Decoded { status, body: Value::Null };
        }
        match serde_json::from_str::<Value>(text) {
            Ok(body) => Self::Decoded { status, body },
            Err(_) => Self::Decode {
                status,
                raw_response: truncate_chars(text, ECHO_LIMIT),
            },
        }
    }

    fn transport(err: &reqwest::Error, url: &str) -> Self {
        let mut description = err.to_string();
        let mut source = err.source();
        while let Some(cause) = source {
            description.push_str(": ");
            description.push_str(&cause.to_string());
            source = cause.source();
        }
        Self::Transport {
            message: format!("Transport Error: {}", truncate_chars(&description, ECHO_LIMIT)),
            details: format!("Failed to connect to {}", url),
        }
    }

    /// HTTP status of the gateway reply, `0` when it was never reached.
    pub fn code(&self) -> u16 {
        match self {
            Self::Transport { .. } => 0,
            Self::Decode { status, .. } | Self::Decoded { status, .. } => *status,
        }
    }

    /// Normalised `{code, data}` form handed back to proxy callers.
    pub fn into_reply(self) -> UpstreamReply {
        let code = self.code();
        let data = match self {
            Self::Transport { message, details } => json!({ "error": message, "details": details }),
            Self::Decode { raw_response, .. } => json!({
                "error": "Invalid JSON Response",
                "raw_response": raw_response,
            }),
            Self::Decoded { body, .. } => body,
        };
        UpstreamReply { code, data }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamReply {
    pub code: u16,
    pub data: Value,
}

impl UpstreamReply {
    pub fn is_created(&self) -> bool {
        self.code == 200 || self.code == 201
    }
}

#[derive(Debug, Clone)]
pub struct GatewayClient {
    pub http: HttpClient,
}

impl GatewayClient {
    pub fn new(settings: &Settings) -> Result<Self, reqwest::Error> {
        let http = HttpClient::builder()
            .timeout(settings.upstream_timeout())
            .danger_accept_invalid_certs(settings.accept_invalid_certs)
            .build()?;
        Ok(Self { http })
    }

    fn with_auth(req: reqwest::RequestBuilder, api_key: &str) -> reqwest::RequestBuilder {
        req.header(AUTHORIZATION, format!("Bearer {}", api_key))
            .header(CONTENT_TYPE, "application/json")
    }

    /// Sends one request to `base_url + endpoint`. Never fails: every outcome
    /// is described by the returned [`Upstream`].
    pub async fn request(
        &self,
        creds: Credentials<'_>,
        method: Method,
        endpoint: &str,
        body: Option<&Value>,
    ) -> Upstream {
        let url = format!("{}{}", creds.base_url, endpoint);
        log::debug!("{} {}", method, url);
        let mut req = Self::with_auth(self.http.request(method, &url), creds.api_key);
        if let Some(body) = body {
            req = req.json(body);
        }
        let resp = match req.send().await {
            Ok(resp) => resp,
            Err(e) => {
                log::warn!("gateway unreachable at {}: {}", url, e);
                return Upstream::transport(&e, &url);
            }
        };
        let status = resp.status().as_u16();
        match resp.text().await {
            Ok(text) => Upstream::classify(status, &text),
            Err(e) => {
                log::warn!("gateway body read failed for {}: {}", url, e);
                Upstream::transport(&e, &url)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_body_is_null_data() {
        let out = Upstream::classify(204, "");
        assert_eq!(out, Upstream::Decoded { status: 204, body: Value::Null });
    }

    #[test]
    fn html_body_is_a_decode_failure() {
        let page = format!("<html>{}</html>", "x".repeat(1000));
        let reply = Upstream::classify(502, &page).into_reply();
        assert_eq!(reply.code, 502);
        assert_eq!(reply.data["error"], "Invalid JSON Response");
        assert_eq!(reply.data["raw_response"].as_str().unwrap().chars().count(), ECHO_LIMIT);
    }

    #[test]
    fn json_error_bodies_pass_through_verbatim() {
        let reply = Upstream::classify(404, r#"{"error":"instance not found"}"#).into_reply();
        assert_eq!(reply.code, 404);
        assert_eq!(reply.data, json!({"error": "instance not found"}));
        assert!(!reply.is_created());
    }
}
