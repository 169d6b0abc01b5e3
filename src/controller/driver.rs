use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at};
use tokio_util::sync::CancellationToken;

use crate::controller::machine::{Controller, Effect, Event, Snapshot, Timing};
use crate::controller::transport::ProxyTransport;
use crate::controller::view::UiEvent;
use crate::error::TransportError;
use crate::utils::{spawn_after, spawn_async};

enum Command {
    Event(Event),
    Snapshot(oneshot::Sender<Snapshot>),
    Shutdown,
}

/// Cheap handle for feeding events to a running controller.
#[derive(Clone)]
pub struct ControllerHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl ControllerHandle {
    pub fn send(&self, event: Event) -> Result<(), TransportError> {
        self.tx.send(Command::Event(event)).map_err(|_| TransportError::Closed)
    }

    pub async fn snapshot(&self) -> Result<Snapshot, TransportError> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(Command::Snapshot(tx)).map_err(|_| TransportError::Closed)?;
        rx.await.map_err(|_| TransportError::Closed)
    }

    /// Stops the driver and every timer it owns.
    pub fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
    }
}

/// Owns the controller and turns its effects into proxy calls and timers.
/// Events are handled strictly one after another on this task.
struct Driver {
    controller: Controller,
    transport: Arc<dyn ProxyTransport>,
    tx: mpsc::UnboundedSender<Command>,
    ui: mpsc::UnboundedSender<UiEvent>,
    timers: CancellationToken,
    status_poll: Option<CancellationToken>,
}

/// Starts a controller on the current runtime. UI events arrive on the
/// returned receiver; the join handle yields the final controller state.
pub fn spawn(
    transport: Arc<dyn ProxyTransport>,
    timing: Timing,
) -> (ControllerHandle, mpsc::UnboundedReceiver<UiEvent>, JoinHandle<Controller>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (ui_tx, ui_rx) = mpsc::unbounded_channel();
    let driver = Driver {
        controller: Controller::new(timing),
        transport,
        tx: tx.clone(),
        ui: ui_tx,
        timers: CancellationToken::new(),
        status_poll: None,
    };
    let join = tokio::spawn(driver.run(rx));
    (ControllerHandle { tx }, ui_rx, join)
}

impl Driver {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) -> Controller {
        if let Some(period) = self.controller.timing().message_refresh {
            self.every(period, self.timers.clone(), || Event::RefreshMessages);
        }
        while let Some(command) = rx.recv().await {
            match command {
                Command::Event(event) => {
                    for effect in self.controller.handle(event) {
                        self.apply(effect);
                    }
                }
                Command::Snapshot(reply) => {
                    let _ = reply.send(self.controller.snapshot());
                }
                Command::Shutdown => break,
            }
        }
        self.timers.cancel();
        log::debug!("controller stopped");
        self.controller
    }

    fn apply(&mut self, effect: Effect) {
        match effect {
            Effect::Call { action, params, request } => {
                let transport = self.transport.clone();
                let tx = self.tx.clone();
                let token = self.timers.clone();
                spawn_async(async move {
                    let result = tokio::select! {
                        _ = token.cancelled() => return,
                        result = transport.call(action, params) => result,
                    };
                    let _ = tx.send(Command::Event(Event::Reply { request, result }));
                });
            }
            Effect::After { delay, event } => {
                let tx = self.tx.clone();
                let token = self.timers.clone();
                spawn_after(delay, async move {
                    if !token.is_cancelled() {
                        let _ = tx.send(Command::Event(event));
                    }
                });
            }
            Effect::StartStatusPoll => {
                self.stop_status_poll();
                let token = self.timers.child_token();
                let period = self.controller.timing().status_poll_interval;
                self.every(period, token.clone(), || Event::StatusTick);
                self.status_poll = Some(token);
            }
            Effect::StopStatusPoll => self.stop_status_poll(),
            Effect::Ui(event) => {
                let _ = self.ui.send(event);
            }
        }
    }

    fn stop_status_poll(&mut self) {
        if let Some(token) = self.status_poll.take() {
            token.cancel();
        }
    }

    /// Sends `make()` every `period`, first after one full period.
    fn every<F>(&self, period: Duration, token: CancellationToken, make: F)
    where
        F: Fn() -> Event + Send + 'static,
    {
        let tx = self.tx.clone();
        spawn_async(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if token.is_cancelled() || tx.send(Command::Event(make())).is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }
}
