//! Pairing and status state machine.
//!
//! [`Controller::handle`] is a pure reducer: it takes one [`Event`], updates
//! the owned state and returns the [`Effect`]s the driver must carry out.
//! Proxy calls and timers never run inside it, so every transition sees a
//! consistent state, but replies and timer firings can arrive in any order
//! and each handler re-checks the state it depends on.

use std::time::Duration;

use serde_json::Value;

use crate::api::models::{
    CodeLookup, Direction, Instance, PairingCode, Status, instances_from_body, messages_from_body,
    status_from_body,
};
use crate::controller::view::{
    InstanceCard, Level, MessageKind, MessageView, PairingView, UiEvent,
};
use crate::error::{TransportError, ValidationError};
use crate::proxy::{Action, Params, ProxyReply};

pub const MAX_RETRIES: u32 = 10;
pub const RETRIEVAL_DELAY: Duration = Duration::from_millis(3000);
pub const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(5000);
pub const RELOAD_DELAY: Duration = Duration::from_millis(1000);
pub const MESSAGE_REFRESH_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    pub max_retries: u32,
    pub retrieval_delay: Duration,
    pub status_poll_interval: Duration,
    pub reload_delay: Duration,
    /// Background message refresh period; `None` disables it.
    pub message_refresh: Option<Duration>,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            retrieval_delay: RETRIEVAL_DELAY,
            status_poll_interval: STATUS_POLL_INTERVAL,
            reload_delay: RELOAD_DELAY,
            message_refresh: Some(MESSAGE_REFRESH_INTERVAL),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingState {
    Idle,
    Starting,
    AwaitingCode,
    Paired,
    TimedOut,
    Failed,
}

impl PairingState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Paired | Self::TimedOut)
    }
}

/// One run of start → code retrieval → paired/timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    pub id: u64,
    pub instance_key: String,
    pub state: PairingState,
    pub retry_count: u32,
    /// Set once a code has been shown; no further retrievals are scheduled.
    pub code: Option<PairingCode>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageTab {
    #[default]
    Incoming,
    Outgoing,
}

impl MessageTab {
    pub fn direction(self) -> Direction {
        match self {
            Self::Incoming => Direction::In,
            Self::Outgoing => Direction::Out,
        }
    }
}

/// Identifies which call a proxy reply belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Instances,
    Select { instance_key: String, phone_number: String, status: Status },
    Create,
    SaveConfig,
    LoadConfig,
    Start { attempt: u64 },
    Retrieval { attempt: u64, instance_key: String },
    Status { instance_key: String },
    Send(MessageKind),
    Messages { direction: Direction },
}

#[derive(Debug)]
pub enum Event {
    LoadInstances,
    SelectInstance { instance_key: String, phone_number: String, status: Status },
    CreateInstance { phone_number: String, instance_key: Option<String> },
    SaveConfig { api_key: String, base_url: String },
    LoadConfig,
    StartPairing,
    SendText { to: String, text: String },
    SendMedia { to: String, media: String, caption: String },
    SwitchMessageTab(MessageTab),
    RefreshMessages,
    /// A deferred code retrieval is due.
    RetrievalDue { attempt: u64, instance_key: String },
    /// The recurring status poll fired.
    StatusTick,
    Reply { request: Request, result: Result<ProxyReply, TransportError> },
}

#[derive(Debug)]
pub enum Effect {
    Call { action: Action, params: Params, request: Request },
    After { delay: Duration, event: Event },
    StartStatusPoll,
    StopStatusPoll,
    Ui(UiEvent),
}

/// Read-only view of the controller, for callers and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub state: PairingState,
    pub retry_count: u32,
    pub selected: Option<String>,
    pub polling: bool,
}

#[derive(Debug)]
pub struct Controller {
    timing: Timing,
    selected: Option<String>,
    /// Selection sent to the proxy but not yet confirmed. The proxy session
    /// may already point at it.
    pending_selection: Option<String>,
    attempt: Option<Attempt>,
    next_attempt: u64,
    polling: bool,
    message_tab: MessageTab,
    instances: Vec<Instance>,
}

impl Controller {
    pub fn new(timing: Timing) -> Self {
        Self {
            timing,
            selected: None,
            pending_selection: None,
            attempt: None,
            next_attempt: 0,
            polling: false,
            message_tab: MessageTab::default(),
            instances: Vec::new(),
        }
    }

    pub fn timing(&self) -> Timing {
        self.timing
    }

    pub fn pairing_state(&self) -> PairingState {
        self.attempt.as_ref().map_or(PairingState::Idle, |a| a.state)
    }

    pub fn attempt(&self) -> Option<&Attempt> {
        self.attempt.as_ref()
    }

    pub fn selected(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    pub fn is_polling(&self) -> bool {
        self.polling
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            state: self.pairing_state(),
            retry_count: self.attempt.as_ref().map_or(0, |a| a.retry_count),
            selected: self.selected.clone(),
            polling: self.polling,
        }
    }

    pub fn handle(&mut self, event: Event) -> Vec<Effect> {
        let mut fx = Effects::default();
        match event {
            Event::LoadInstances => self.load_instances(&mut fx),
            Event::SelectInstance { instance_key, phone_number, status } => {
                // Stop polling right away so nothing more is asked about the
                // previous instance, even before the proxy confirms.
                self.stop_poll(&mut fx);
                self.pending_selection = Some(instance_key.clone());
                let mut params = Params::new();
                params.insert("instance_key".into(), instance_key.clone());
                fx.call(
                    Action::SelectInstance,
                    params,
                    Request::Select { instance_key, phone_number, status },
                );
            }
            Event::CreateInstance { phone_number, instance_key } => {
                if phone_number.trim().is_empty() {
                    return fx.reject(ValidationError::MissingPhoneNumber);
                }
                fx.notify(Level::Info, "Creating instance...");
                let mut params = Params::new();
                params.insert("phone_number".into(), phone_number);
                if let Some(key) = instance_key.filter(|k| !k.is_empty()) {
                    params.insert("instance_key".into(), key);
                }
                fx.call(Action::CreateInstance, params, Request::Create);
            }
            Event::SaveConfig { api_key, base_url } => {
                if api_key.is_empty() || base_url.is_empty() {
                    return fx.reject(ValidationError::IncompleteConfig);
                }
                let mut params = Params::new();
                params.insert("api_key".into(), api_key);
                params.insert("base_url".into(), base_url);
                fx.call(Action::SaveConfig, params, Request::SaveConfig);
            }
            Event::LoadConfig => fx.call(Action::GetConfig, Params::new(), Request::LoadConfig),
            Event::StartPairing => self.start_pairing(&mut fx),
            Event::SendText { to, text } => {
                if self.selected.is_none() {
                    return fx.reject(ValidationError::NoInstanceSelected);
                }
                if to.is_empty() || text.is_empty() {
                    return fx.reject(ValidationError::IncompleteMessage);
                }
                let mut params = Params::new();
                params.insert("to".into(), to);
                params.insert("text".into(), text);
                fx.call(Action::SendText, params, Request::Send(MessageKind::Text));
            }
            Event::SendMedia { to, media, caption } => {
                if self.selected.is_none() {
                    return fx.reject(ValidationError::NoInstanceSelected);
                }
                if to.is_empty() || media.is_empty() {
                    return fx.reject(ValidationError::IncompleteMessage);
                }
                let mut params = Params::new();
                params.insert("to".into(), to);
                params.insert("media".into(), media);
                params.insert("caption".into(), caption);
                fx.call(Action::SendMedia, params, Request::Send(MessageKind::Media));
            }
            Event::SwitchMessageTab(tab) => {
                self.message_tab = tab;
                self.refresh_messages(&mut fx);
            }
            Event::RefreshMessages => self.refresh_messages(&mut fx),
            Event::RetrievalDue { attempt, instance_key } => {
                if self.awaiting_code(attempt, &instance_key).is_some() {
                    fx.call(Action::GetQr, Params::new(), Request::Retrieval { attempt, instance_key });
                } else {
                    log::debug!("dropping stale code retrieval for attempt {}", attempt);
                }
            }
            Event::StatusTick => {
                if !self.polling {
                    return fx.0;
                }
                if let Some(key) = self.target().map(str::to_string) {
                    fx.call(Action::GetStatus, Params::new(), Request::Status { instance_key: key });
                }
            }
            Event::Reply { request, result } => self.on_reply(request, result, &mut fx),
        }
        fx.0
    }

    fn on_reply(&mut self, request: Request, result: Result<ProxyReply, TransportError>, fx: &mut Effects) {
        match request {
            Request::Instances => match result {
                Ok(reply) => {
                    self.instances = if reply.success { instances_from_body(reply.body()) } else { Vec::new() };
                    fx.ui(UiEvent::Instances(self.cards()));
                    if self.instances.is_empty() {
                        fx.notify(Level::Info, "No instances found");
                    } else {
                        fx.notify(Level::Success, "Instances loaded!");
                    }
                }
                Err(e) => fx.notify(Level::Error, format!("Error: {}", e)),
            },
            Request::Select { instance_key, phone_number, status } => {
                if self.pending_selection.as_deref() != Some(instance_key.as_str()) {
                    log::debug!("ignoring superseded selection of {}", instance_key);
                    return;
                }
                self.pending_selection = None;
                self.on_selected(instance_key, phone_number, status, result, fx);
            }
            Request::Create => match result {
                Ok(reply) if reply.success => {
                    fx.notify(Level::Success, "Instance created!");
                    // The proxy selects the new instance; mirror it locally.
                    if let Some(key) = reply.body().pointer("/data/instance_key").and_then(Value::as_str) {
                        if self.selected.as_deref() != Some(key) {
                            self.stop_poll(fx);
                            self.selected = Some(key.to_string());
                        }
                    }
                    fx.after(self.timing.reload_delay, Event::LoadInstances);
                }
                Ok(reply) => fx.notify(
                    Level::Error,
                    format!("Failed: {}", reply.message.as_deref().unwrap_or("Unknown error")),
                ),
                Err(e) => fx.notify(Level::Error, format!("Error: {}", e)),
            },
            Request::SaveConfig => match result {
                Ok(reply) if reply.success => {
                    fx.notify(Level::Success, "Configuration saved!");
                    self.load_instances(fx);
                }
                Ok(_) => fx.notify(Level::Error, "Save failed"),
                Err(e) => fx.notify(Level::Error, format!("Save failed: {}", e)),
            },
            Request::LoadConfig => match result {
                Ok(reply) if reply.success => {
                    let body = reply.body();
                    let field = |k: &str| body.get(k).and_then(Value::as_str).unwrap_or_default().to_string();
                    fx.ui(UiEvent::Config { api_key: field("api_key"), base_url: field("base_url") });
                }
                Ok(_) => log::warn!("config load refused"),
                Err(e) => log::error!("config load failed: {}", e),
            },
            Request::Start { attempt } => self.on_started(attempt, result, fx),
            Request::Retrieval { attempt, instance_key } => {
                self.on_retrieval(attempt, &instance_key, result, fx)
            }
            Request::Status { instance_key } => self.on_status(&instance_key, result, fx),
            Request::Send(kind) => match result {
                Ok(reply) => match reply.outcome() {
                    Ok(_) => {
                        fx.notify(Level::Success, "Sent successfully!");
                        fx.ui(UiEvent::ComposerCleared(kind));
                        fx.after(self.timing.reload_delay, Event::RefreshMessages);
                    }
                    Err(e) => {
                        log::warn!("send failed: {}", e);
                        fx.notify(Level::Error, "Failed to send");
                    }
                },
                Err(e) => fx.notify(Level::Error, format!("Error: {}", e)),
            },
            Request::Messages { direction } => match result {
                Ok(reply) => {
                    if direction != self.message_tab.direction() {
                        return;
                    }
                    let items = messages_from_body(reply.body())
                        .iter()
                        .map(|m| MessageView::new(m, direction))
                        .collect();
                    fx.ui(UiEvent::Messages { direction, items });
                }
                // Background refresh; the next tick tries again.
                Err(e) => log::warn!("message refresh failed: {}", e),
            },
        }
    }

    fn on_selected(
        &mut self,
        instance_key: String,
        phone_number: String,
        status: Status,
        result: Result<ProxyReply, TransportError>,
        fx: &mut Effects,
    ) {
        match result {
            Ok(reply) if reply.success => {
                log::info!("selected instance {}", instance_key);
                self.selected = Some(instance_key.clone());
                fx.ui(UiEvent::Instances(self.cards()));
                fx.ui(UiEvent::Selected {
                    instance_key,
                    phone_number: phone_number.clone(),
                    status: status.clone(),
                });
                fx.ui(UiEvent::StatusIndicator(status.clone()));
                fx.notify(Level::Success, format!("Instance {} selected", phone_number));
                if status.is_paired() {
                    fx.ui(UiEvent::Pairing(PairingView::Paired("Connected Successfully!".into())));
                }
            }
            Ok(reply) => fx.notify(
                Level::Error,
                format!("Selection failed: {}", reply.message.unwrap_or_default()),
            ),
            Err(e) => fx.notify(Level::Error, format!("Selection failed: {}", e)),
        }
    }

    fn start_pairing(&mut self, fx: &mut Effects) {
        let Some(instance_key) = self.target().map(str::to_string) else {
            fx.notify(Level::Error, ValidationError::NoInstanceSelected.to_string());
            return;
        };
        self.stop_poll(fx);
        self.next_attempt += 1;
        let id = self.next_attempt;
        log::info!("pairing attempt {} for {}", id, instance_key);
        self.attempt = Some(Attempt {
            id,
            instance_key,
            state: PairingState::Starting,
            retry_count: 0,
            code: None,
        });
        fx.ui(UiEvent::Pairing(PairingView::loading("Starting instance...", None)));
        fx.notify(Level::Info, "Starting instance...");
        fx.call(Action::StartInstance, Params::new(), Request::Start { attempt: id });
    }

    fn on_started(&mut self, attempt: u64, result: Result<ProxyReply, TransportError>, fx: &mut Effects) {
        let retrieval_delay = self.timing.retrieval_delay;
        let target = self.target().map(str::to_string);
        let Some(current) = self.attempt.as_mut().filter(|a| a.id == attempt) else {
            log::debug!("ignoring start reply for superseded attempt {}", attempt);
            return;
        };
        if current.state != PairingState::Starting {
            return;
        }
        if target.as_deref() != Some(current.instance_key.as_str()) {
            // Another instance was selected while this one was starting.
            log::info!("abandoning attempt {} for deselected {}", attempt, current.instance_key);
            current.state = PairingState::Failed;
            return;
        }

        let failure = match &result {
            Ok(reply) => reply.outcome().err().map(|e| {
                if e.is_retryable() {
                    format!("Gateway unreachable, try again: {}", e)
                } else {
                    e.to_string()
                }
            }),
            Err(e) => Some(e.to_string()),
        };
        if let Some(reason) = failure {
            log::warn!("attempt {} failed to start: {}", attempt, reason);
            current.state = PairingState::Failed;
            fx.notify(Level::Error, reason);
            fx.ui(UiEvent::Pairing(PairingView::Error("Failed to start instance".into())));
            return;
        }

        current.state = PairingState::AwaitingCode;
        let instance_key = current.instance_key.clone();
        fx.ui(UiEvent::Pairing(PairingView::loading(
            "Generating QR Code...",
            Some("This may take a few seconds".into()),
        )));
        fx.after(retrieval_delay, Event::RetrievalDue { attempt, instance_key });
        self.start_poll(fx);
    }

    fn on_retrieval(
        &mut self,
        attempt: u64,
        instance_key: &str,
        result: Result<ProxyReply, TransportError>,
        fx: &mut Effects,
    ) {
        let timing = self.timing;
        let Some(current) = self.awaiting_code(attempt, instance_key) else {
            log::debug!("ignoring code reply for attempt {} ({})", attempt, instance_key);
            return;
        };

        let reply = match result {
            Ok(reply) => reply,
            Err(e) => {
                log::error!("code retrieval failed: {}", e);
                current.state = PairingState::Failed;
                fx.ui(UiEvent::Pairing(PairingView::Error("Failed to get QR".into())));
                return;
            }
        };
        if let Err(e) = reply.outcome() {
            log::debug!("code retrieval came back empty: {}", e);
        }

        match CodeLookup::from_body(reply.body()) {
            CodeLookup::Code(code) => {
                current.retry_count = 0;
                current.code = Some(code.clone());
                fx.ui(UiEvent::Pairing(PairingView::Code(code)));
                fx.notify(Level::Success, "QR Generated! Scan it.");
            }
            CodeLookup::AlreadyPaired(status) => {
                current.state = PairingState::Paired;
                fx.ui(UiEvent::StatusIndicator(status));
                fx.ui(UiEvent::Pairing(PairingView::Paired("Already Connected!".into())));
                fx.notify(Level::Success, "Instance connected");
                self.stop_poll(fx);
                self.load_instances(fx);
            }
            CodeLookup::Nothing if current.retry_count < timing.max_retries => {
                current.retry_count += 1;
                fx.ui(UiEvent::Pairing(PairingView::loading(
                    "Generating QR Code...",
                    Some(format!("Retry {}/{}", current.retry_count, timing.max_retries)),
                )));
                fx.after(
                    timing.retrieval_delay,
                    Event::RetrievalDue { attempt, instance_key: instance_key.to_string() },
                );
            }
            CodeLookup::Nothing => {
                log::warn!("attempt {} timed out waiting for a code", attempt);
                current.state = PairingState::TimedOut;
                fx.ui(UiEvent::Pairing(PairingView::TimedOut));
                self.stop_poll(fx);
            }
        }
    }

    fn on_status(&mut self, instance_key: &str, result: Result<ProxyReply, TransportError>, fx: &mut Effects) {
        if self.target() != Some(instance_key) {
            log::debug!("ignoring status for deselected instance {}", instance_key);
            return;
        }
        let reply = match result {
            Ok(reply) if reply.success => reply,
            Ok(_) => return,
            Err(e) => {
                log::warn!("status check failed: {}", e);
                return;
            }
        };
        let Some(status) = status_from_body(reply.body()) else {
            return;
        };
        fx.ui(UiEvent::StatusIndicator(status.clone()));
        if !status.is_paired() {
            return;
        }

        let was_polling = self.polling;
        self.stop_poll(fx);
        let newly_paired = match self.attempt.as_mut() {
            Some(a) if a.instance_key == instance_key && a.state != PairingState::Paired => {
                a.state = PairingState::Paired;
                true
            }
            _ => false,
        };
        if newly_paired || was_polling {
            log::info!("{} is {}", instance_key, status);
            fx.ui(UiEvent::Pairing(PairingView::Paired("Connected Successfully!".into())));
            self.load_instances(fx);
        }
    }

    /// The instance the proxy session points at, or will once a pending
    /// selection lands.
    fn target(&self) -> Option<&str> {
        self.pending_selection.as_deref().or(self.selected.as_deref())
    }

    /// The current attempt, if it is still waiting for a code for `instance_key`
    /// and that instance is still the target.
    fn awaiting_code(&mut self, attempt: u64, instance_key: &str) -> Option<&mut Attempt> {
        if self.target() != Some(instance_key) {
            return None;
        }
        self.attempt.as_mut().filter(|a| {
            a.id == attempt
                && a.instance_key == instance_key
                && a.state == PairingState::AwaitingCode
                && a.code.is_none()
        })
    }

    fn load_instances(&mut self, fx: &mut Effects) {
        fx.notify(Level::Info, "Loading instances...");
        fx.call(Action::ListInstances, Params::new(), Request::Instances);
    }

    fn refresh_messages(&mut self, fx: &mut Effects) {
        if self.selected.is_none() {
            return;
        }
        let direction = self.message_tab.direction();
        let mut params = Params::new();
        params.insert("direction".into(), direction.as_str().into());
        fx.call(Action::GetMessages, params, Request::Messages { direction });
    }

    fn start_poll(&mut self, fx: &mut Effects) {
        self.polling = true;
        fx.push(Effect::StartStatusPoll);
    }

    fn stop_poll(&mut self, fx: &mut Effects) {
        if self.polling {
            self.polling = false;
            fx.push(Effect::StopStatusPoll);
        }
    }

    fn cards(&self) -> Vec<InstanceCard> {
        self.instances
            .iter()
            .map(|i| InstanceCard::new(i, self.selected.as_deref()))
            .collect()
    }
}

impl Default for Controller {
    fn default() -> Self {
        Self::new(Timing::default())
    }
}

#[derive(Default)]
struct Effects(Vec<Effect>);

impl Effects {
    fn push(&mut self, effect: Effect) {
        self.0.push(effect);
    }

    fn call(&mut self, action: Action, params: Params, request: Request) {
        self.push(Effect::Call { action, params, request });
    }

    fn after(&mut self, delay: Duration, event: Event) {
        self.push(Effect::After { delay, event });
    }

    fn ui(&mut self, event: UiEvent) {
        self.push(Effect::Ui(event));
    }

    fn notify(&mut self, level: Level, message: impl Into<String>) {
        self.ui(UiEvent::notify(level, message));
    }

    fn reject(&mut self, err: ValidationError) -> Vec<Effect> {
        self.notify(Level::Error, err.to_string());
        std::mem::take(&mut self.0)
    }
}
