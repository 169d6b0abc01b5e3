//! Client-side controller: instance selection, pairing and status polling.

pub mod driver;
pub mod machine;
pub mod transport;
pub mod view;

pub use driver::{ControllerHandle, spawn};
pub use machine::{Controller, Event, PairingState, Snapshot, Timing};
pub use transport::{HttpTransport, LocalTransport, ProxyTransport};
pub use view::{PairingView, UiEvent};

#[cfg(test)]
mod tests {
    //! Timer-driven behaviour, run on a paused clock against a scripted proxy.

    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::{Value, json};

    use super::*;
    use crate::api::models::Status;
    use crate::error::TransportError;
    use crate::proxy::{Action, Params, ProxyReply};

    /// Records each call with the instance the proxy session pointed at.
    struct ScriptedProxy {
        selected: Mutex<Option<String>>,
        qr: Mutex<Value>,
        status: Mutex<Value>,
        calls: Mutex<Vec<(Action, Option<String>)>>,
    }

    impl ScriptedProxy {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                selected: Mutex::new(None),
                qr: Mutex::new(json!({"data": {"status": "STARTING"}})),
                status: Mutex::new(json!({"data": {"status": "STARTING"}})),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn count(&self, action: Action) -> usize {
            self.calls.lock().unwrap().iter().filter(|(a, _)| *a == action).count()
        }

        fn status_calls_for(&self, key: &str) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(a, k)| *a == Action::GetStatus && k.as_deref() == Some(key))
                .count()
        }
    }

    #[async_trait]
    impl ProxyTransport for ScriptedProxy {
        async fn call(&self, action: Action, params: Params) -> Result<ProxyReply, TransportError> {
            if action == Action::SelectInstance {
                *self.selected.lock().unwrap() = params.get("instance_key").cloned();
            }
            let selected = self.selected.lock().unwrap().clone();
            self.calls.lock().unwrap().push((action, selected));
            let body = match action {
                Action::GetQr => self.qr.lock().unwrap().clone(),
                Action::GetStatus => self.status.lock().unwrap().clone(),
                _ => json!({"data": []}),
            };
            Ok(ProxyReply { status: Some(200), ..ProxyReply::ok_data(body) })
        }
    }

    fn quiet_timing() -> Timing {
        Timing { message_refresh: None, ..Timing::default() }
    }

    async fn select(handle: &ControllerHandle, key: &str) {
        handle
            .send(Event::SelectInstance {
                instance_key: key.into(),
                phone_number: "+15550100".into(),
                status: Status::Disconnected,
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(handle.snapshot().await.unwrap().selected.as_deref(), Some(key));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_retries() {
        let proxy = ScriptedProxy::new();
        let (handle, _ui, join) = spawn(proxy.clone(), quiet_timing());
        select(&handle, "a").await;
        handle.send(Event::StartPairing).unwrap();

        tokio::time::sleep(Duration::from_secs(60)).await;
        let snap = handle.snapshot().await.unwrap();
        assert_eq!(snap.state, PairingState::TimedOut);
        assert!(!snap.polling);
        assert_eq!(proxy.count(Action::GetQr), 11);

        let status_calls = proxy.count(Action::GetStatus);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(proxy.count(Action::GetQr), 11);
        assert_eq!(proxy.count(Action::GetStatus), status_calls);

        handle.shutdown();
        join.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn status_poll_pairs_and_silences_retries() {
        let proxy = ScriptedProxy::new();
        let (handle, mut ui, join) = spawn(proxy.clone(), quiet_timing());
        select(&handle, "a").await;
        handle.send(Event::StartPairing).unwrap();

        // Two empty retrievals (t=3s, t=6s), then the poll at t=10s sees the device.
        tokio::time::sleep(Duration::from_millis(7_000)).await;
        *proxy.status.lock().unwrap() = json!({"data": {"status": "CONNECTED"}});
        tokio::time::sleep(Duration::from_millis(3_500)).await;

        let snap = handle.snapshot().await.unwrap();
        assert_eq!(snap.state, PairingState::Paired);
        assert!(!snap.polling);
        let qr_calls = proxy.count(Action::GetQr);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(proxy.count(Action::GetQr), qr_calls);
        assert_eq!(handle.snapshot().await.unwrap().state, PairingState::Paired);

        handle.shutdown();
        join.await.unwrap();
        let mut saw_paired = false;
        while let Ok(event) = ui.try_recv() {
            if let UiEvent::Pairing(PairingView::Paired(_)) = event {
                saw_paired = true;
            }
        }
        assert!(saw_paired);
    }

    #[tokio::test(start_paused = true)]
    async fn switching_instance_stops_polling_the_old_one() {
        let proxy = ScriptedProxy::new();
        let (handle, _ui, join) = spawn(proxy.clone(), quiet_timing());
        select(&handle, "a").await;
        handle.send(Event::StartPairing).unwrap();

        tokio::time::sleep(Duration::from_millis(5_500)).await;
        assert_eq!(proxy.status_calls_for("a"), 1);
        select(&handle, "b").await;
        let qr_calls = proxy.count(Action::GetQr);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(proxy.status_calls_for("a"), 1);
        assert_eq!(proxy.count(Action::GetStatus), 1);
        assert_eq!(proxy.count(Action::GetQr), qr_calls);

        handle.shutdown();
        join.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn background_refresh_waits_for_a_selection() {
        let proxy = ScriptedProxy::new();
        let timing = Timing { message_refresh: Some(Duration::from_secs(10)), ..Timing::default() };
        let (handle, _ui, join) = spawn(proxy.clone(), timing);

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(proxy.count(Action::GetMessages), 0);

        select(&handle, "a").await;
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(proxy.count(Action::GetMessages), 2);

        handle.shutdown();
        join.await.unwrap();
    }
}
