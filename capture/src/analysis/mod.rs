mod session;
#[cfg(test)]
mod tests;

use std::sync::Arc;
use std::time::Duration;

use threat_hud_common::config::CaptureConfig;
use threat_hud_common::state::LoopState;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::classifier::Classifier;
use crate::device::CaptureDevice;

use session::{SessionContext, Shared};

pub use session::LoopStats;

#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub interval: Duration,
    /// Upper bound on one classification request.
    pub request_timeout: Duration,
    /// JPEG quality, 1..=100.
    pub jpeg_quality: u8,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self::from(&CaptureConfig::default())
    }
}

impl From<&CaptureConfig> for LoopSettings {
    fn from(config: &CaptureConfig) -> Self {
        Self {
            interval: config.interval(),
            request_timeout: config.request_timeout(),
            jpeg_quality: config.jpeg_quality_percent(),
        }
    }
}

struct Session {
    id: u64,
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

struct Control<D> {
    device: D,
    session: Option<Session>,
    next_id: u64,
}

/// Camera lifecycle plus the periodic capture → encode → classify loop.
///
/// `start` and `stop` are serialized with each other; the session task owns
/// the device handle, so at most one handle is ever open. Observers read
/// [`LoopState`] through [`CaptureAnalysisLoop::state`] or a watch receiver
/// from [`CaptureAnalysisLoop::subscribe`].
pub struct CaptureAnalysisLoop<D: CaptureDevice, C: Classifier> {
    control: Mutex<Control<D>>,
    classifier: Arc<C>,
    shared: Arc<Shared>,
    settings: LoopSettings,
}

impl<D: CaptureDevice, C: Classifier> CaptureAnalysisLoop<D, C> {
    pub fn new(device: D, classifier: C, settings: LoopSettings) -> Self {
        Self {
            control: Mutex::new(Control {
                device,
                session: None,
                next_id: 1,
            }),
            classifier: Arc::new(classifier),
            shared: Arc::new(Shared::new()),
            settings,
        }
    }

    pub fn classifier(&self) -> &C {
        &self.classifier
    }

    pub fn settings(&self) -> &LoopSettings {
        &self.settings
    }

    /// Current state, without waiting for the next tick.
    pub fn state(&self) -> LoopState {
        self.shared.state()
    }

    pub fn subscribe(&self) -> watch::Receiver<LoopState> {
        self.shared.subscribe()
    }

    pub fn stats(&self) -> LoopStats {
        self.shared.stats()
    }

    /// Acquire the device and begin ticking. Idempotent while running.
    ///
    /// A failed acquire leaves the loop disabled with `DeviceUnavailable`;
    /// it is not retried until `start` is called again.
    pub async fn start(&self) -> LoopState {
        let mut control = self.control.lock().await;
        self.reap(&mut control).await;
        if control.session.is_some() {
            return self.state();
        }

        let handle = match control.device.acquire().await {
            Ok(handle) => handle,
            Err(err) => {
                warn!(error = %err, "capture device unavailable, HUD offline");
                self.shared.set(LoopState::offline());
                return self.state();
            }
        };

        let id = control.next_id;
        control.next_id += 1;
        self.shared.begin(id);

        let (stop_tx, stop_rx) = oneshot::channel();
        let ctx = SessionContext {
            id,
            shared: Arc::clone(&self.shared),
            classifier: Arc::clone(&self.classifier),
            settings: self.settings.clone(),
        };
        let task = tokio::spawn(session::run(ctx, handle, stop_rx));
        control.session = Some(Session {
            id,
            stop: stop_tx,
            task,
        });

        info!(
            session = id,
            interval_ms = self.settings.interval.as_millis() as u64,
            quality = self.settings.jpeg_quality,
            "capture started"
        );
        self.state()
    }

    /// Stop ticking, abandon any in-flight request, release the device and
    /// reset the state. Idempotent.
    pub async fn stop(&self) -> LoopState {
        let mut control = self.control.lock().await;
        let Some(session) = control.session.take() else {
            return self.state();
        };

        // Revoke write access first so a response landing now is discarded.
        self.shared.end(session.id, LoopState::default());
        let _ = session.stop.send(());
        join(session.id, session.task).await;

        info!(session = session.id, "capture stopped");
        self.state()
    }

    pub async fn is_running(&self) -> bool {
        let control = self.control.lock().await;
        control
            .session
            .as_ref()
            .is_some_and(|s| !s.task.is_finished())
    }

    /// Collect a session that ended on its own (device lost). A session that
    /// has already given up write access counts as ended even if its task is
    /// still winding down.
    async fn reap(&self, control: &mut Control<D>) {
        let ended = control.session.as_ref().is_some_and(|s| {
            s.task.is_finished() || !self.shared.is_current(s.id)
        });
        if !ended {
            return;
        }
        if let Some(session) = control.session.take() {
            join(session.id, session.task).await;
            self.shared.end(session.id, LoopState::offline());
        }
    }
}

async fn join(id: u64, task: JoinHandle<()>) {
    if let Err(e) = task.await {
        error!(error = %e, session = id, "capture session task failed");
    }
}

impl<D: CaptureDevice, C: Classifier> Drop for CaptureAnalysisLoop<D, C> {
    /// Teardown without `stop`: the session task sees its stop channel close
    /// and releases the handle on its own.
    fn drop(&mut self) {
        if let Some(session) = self.control.get_mut().session.take() {
            self.shared.end(session.id, LoopState::default());
            let _ = session.stop.send(());
        }
    }
}
