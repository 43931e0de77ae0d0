// Operator start/stop control.
//
// `stop` pauses queue consumption and aggregate publication; unsettled
// deliveries stay on the broker. `start` resumes both and rebuilds state with
// a snapshot of every namespaced channel plus every channel already tracked.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::NamespaceFilter;
use crate::engine::{EngineError, EngineHandle};
use crate::error::RestError;
use crate::rest::ChannelEnumerator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Running,
    Stopped,
}

/// Shared start/stop state observed by ingestion and publication.
#[derive(Debug, Clone)]
pub struct RunSwitch {
    state: Arc<watch::Sender<RunState>>,
}

impl Default for RunSwitch {
    fn default() -> Self {
        Self::new(RunState::Running)
    }
}

impl RunSwitch {
    pub fn new(initial: RunState) -> Self {
        Self { state: Arc::new(watch::Sender::new(initial)) }
    }

    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.state() == RunState::Running
    }

    /// Returns whether the state changed.
    pub fn set(&self, next: RunState) -> bool {
        self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.state.subscribe()
    }
}

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("engine unavailable: {0}")]
    Engine(#[from] EngineError),
    #[error("channel enumeration failed: {0}")]
    Enumerate(#[from] RestError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlReport {
    pub state: RunState,
    /// Channels submitted for resync by a start command.
    pub resync_channels: usize,
}

pub struct Controller<C> {
    switch: RunSwitch,
    engine: EngineHandle,
    enumerator: Arc<C>,
    namespace: NamespaceFilter,
}

impl<C: ChannelEnumerator> Controller<C> {
    pub fn new(
        switch: RunSwitch,
        engine: EngineHandle,
        enumerator: Arc<C>,
        namespace: NamespaceFilter,
    ) -> Self {
        Self { switch, engine, enumerator, namespace }
    }

    pub fn state(&self) -> ControlReport {
        ControlReport { state: self.switch.state(), resync_channels: 0 }
    }

    /// Resume and request a resync. The switch is running even when the
    /// resync request fails.
    pub async fn start(&self) -> Result<ControlReport, ControlError> {
        if self.switch.set(RunState::Running) {
            info!("aggregation resumed");
        }

        let mut channels: BTreeSet<String> = self
            .enumerator
            .list_channels()
            .await
            .inspect_err(|error| warn!(error = %error, "start: channel enumeration failed"))?
            .into_iter()
            .filter(|channel| self.namespace.matches(channel))
            .collect();
        channels.extend(self.engine.view().await?.channels.into_iter().map(|c| c.channel));

        let resync_channels = channels.len();
        self.engine.resync(channels).await?;
        info!(channels = resync_channels, "start: resync requested");
        Ok(ControlReport { state: RunState::Running, resync_channels })
    }

    pub fn stop(&self) -> ControlReport {
        if self.switch.set(RunState::Stopped) {
            info!("aggregation stopped");
        }
        self.state()
    }
}

#[cfg(test)]
mod tests {
    use presence_common::protocol::queue::PresenceEnvelope;
    use presence_common::types::{ChannelPresence, PresenceAction, PresenceMessage};
    use tokio::sync::broadcast;

    use super::*;
    use crate::engine::test_support::{engine_with, FixedChannels, ScriptedSource};

    fn namespace() -> NamespaceFilter {
        NamespaceFilter::new("^presence:.*").unwrap()
    }

    async fn settle() {
        for _ in 0..32 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn switch_reports_changes_only() {
        let switch = RunSwitch::default();
        let mut rx = switch.subscribe();
        assert!(switch.is_running());
        assert!(!switch.set(RunState::Running));
        assert!(!rx.has_changed().unwrap());

        assert!(switch.set(RunState::Stopped));
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), RunState::Stopped);
    }

    #[tokio::test]
    async fn start_resumes_and_resyncs_namespace_and_tracked_channels() {
        let source = Arc::new(ScriptedSource::default());
        source.push(Ok(vec![ChannelPresence {
            channel: "presence:a".into(),
            presence: vec![PresenceMessage::new("x", "1", PresenceAction::Present, 10)],
        }]));
        let (engine, handle) = engine_with(Arc::clone(&source));
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        tokio::spawn(engine.run(shutdown_rx));

        handle
            .apply_presence(PresenceEnvelope {
                channel: "presence:gone".into(),
                presence: vec![PresenceMessage::new("y", "2", PresenceAction::Enter, 5)],
            })
            .await
            .unwrap();

        let switch = RunSwitch::new(RunState::Stopped);
        let enumerator = Arc::new(FixedChannels::new(Ok(vec![
            "presence:a".into(),
            "chat:lobby".into(),
        ])));
        let controller = Controller::new(switch.clone(), handle.clone(), enumerator, namespace());

        let report = controller.start().await.unwrap();
        assert_eq!(report, ControlReport { state: RunState::Running, resync_channels: 2 });
        assert!(switch.is_running());

        settle().await;
        assert_eq!(
            source.requests(),
            vec![vec!["presence:a".to_string(), "presence:gone".to_string()]]
        );
        let view = handle.view().await.unwrap();
        assert_eq!(view.channel("presence:a").unwrap().members.len(), 1);
        assert!(view.channel("presence:gone").is_none());
    }

    #[tokio::test]
    async fn start_with_failed_enumeration_still_resumes() {
        let (engine, handle) = engine_with(Arc::new(ScriptedSource::default()));
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        tokio::spawn(engine.run(shutdown_rx));

        let switch = RunSwitch::new(RunState::Stopped);
        let enumerator =
            Arc::new(FixedChannels::new(Err(RestError::Status { status: 500, body: String::new() })));
        let controller = Controller::new(switch.clone(), handle, enumerator, namespace());

        let err = controller.start().await.unwrap_err();
        assert!(matches!(err, ControlError::Enumerate(_)));
        assert!(switch.is_running());
    }

    #[tokio::test]
    async fn stop_pauses_without_touching_state() {
        let source = Arc::new(ScriptedSource::default());
        let (_engine, handle) = engine_with(Arc::clone(&source));
        let switch = RunSwitch::default();
        let enumerator = Arc::new(FixedChannels::new(Ok(Vec::new())));
        let controller = Controller::new(switch.clone(), handle, enumerator, namespace());

        assert_eq!(controller.stop().state, RunState::Stopped);
        assert_eq!(controller.stop().state, RunState::Stopped);
        assert!(!switch.is_running());
        assert!(source.requests().is_empty());
    }
}
