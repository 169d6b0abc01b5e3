use std::sync::Mutex;

use async_trait::async_trait;
use reqwest::Client as HttpClient;

use crate::error::TransportError;
use crate::proxy::{Action, Params, Proxy, ProxyReply};
use crate::session::SessionConfig;

/// How the controller reaches the proxy.
#[async_trait]
pub trait ProxyTransport: Send + Sync {
    async fn call(&self, action: Action, params: Params) -> Result<ProxyReply, TransportError>;
}

/// Talks to a running proxy over HTTP, keeping its session cookie.
pub struct HttpTransport {
    http: HttpClient,
    endpoint: String,
}

impl HttpTransport {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, TransportError> {
        let http = HttpClient::builder().cookie_store(true).build()?;
        Ok(Self { http, endpoint: endpoint.into() })
    }
}

#[async_trait]
impl ProxyTransport for HttpTransport {
    async fn call(&self, action: Action, params: Params) -> Result<ProxyReply, TransportError> {
        let mut form: Vec<(String, String)> = vec![("action".into(), action.as_str().into())];
        form.extend(params);
        let resp = self.http.post(&self.endpoint).form(&form).send().await?;
        let status = resp.status();
        let text = resp.text().await?;
        match serde_json::from_str::<ProxyReply>(&text) {
            Ok(reply) => Ok(reply),
            Err(_) if !status.is_success() => Err(TransportError::Status {
                status: status.as_u16(),
                body: crate::utils::truncate_chars(&text, crate::utils::ECHO_LIMIT),
            }),
            Err(e) => Err(TransportError::Decode(e)),
        }
    }
}

/// Runs the proxy in-process with a private session.
pub struct LocalTransport {
    proxy: Proxy,
    session: Mutex<SessionConfig>,
}

impl LocalTransport {
    pub fn new(proxy: Proxy) -> Self {
        Self { proxy, session: Mutex::new(SessionConfig::default()) }
    }

    pub fn session(&self) -> SessionConfig {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SessionConfig> {
        self.session.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ProxyTransport for LocalTransport {
    async fn call(&self, action: Action, params: Params) -> Result<ProxyReply, TransportError> {
        let session = self.session();
        let (reply, update) = self.proxy.execute(&session, action, &params).await;
        if let Some(update) = update {
            update.apply(&mut self.lock());
        }
        Ok(reply)
    }
}
