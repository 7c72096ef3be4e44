use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use threat_hud_common::classification::ClassificationResult;
use threat_hud_common::frame::{EncodedImage, Frame};
use threat_hud_common::state::LoopState;
use tokio::sync::{oneshot, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::LoopSettings;
use crate::classifier::{ClassifyError, Classifier};
use crate::device::{DeviceError, DeviceHandle};
use crate::encoder::FrameEncoder;

type InFlight = Pin<Box<dyn Future<Output = Result<ClassificationResult, ClassifyError>> + Send>>;

/// Counters since the loop was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoopStats {
    pub ticks: u64,
    /// Ticks skipped because the previous request was still outstanding.
    pub skipped_busy: u64,
    /// Ticks skipped because the device had no frame to give.
    pub skipped_not_ready: u64,
    pub requests: u64,
    pub failures: u64,
    /// Responses dropped because capture was stopped before they arrived.
    pub discarded: u64,
}

#[derive(Default)]
struct Counters {
    ticks: AtomicU64,
    skipped_busy: AtomicU64,
    skipped_not_ready: AtomicU64,
    requests: AtomicU64,
    failures: AtomicU64,
    discarded: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// State shared between the loop's control surface and its session task.
///
/// `current` names the session allowed to write. It only changes inside the
/// watch channel's write lock, so a session that has been ended can never
/// publish afterwards.
pub(super) struct Shared {
    state_tx: watch::Sender<LoopState>,
    current: AtomicU64,
    counters: Counters,
}

impl Shared {
    pub(super) fn new() -> Self {
        Self {
            state_tx: watch::Sender::new(LoopState::default()),
            current: AtomicU64::new(0),
            counters: Counters::default(),
        }
    }

    pub(super) fn state(&self) -> LoopState {
        self.state_tx.borrow().clone()
    }

    pub(super) fn subscribe(&self) -> watch::Receiver<LoopState> {
        self.state_tx.subscribe()
    }

    pub(super) fn stats(&self) -> LoopStats {
        let c = &self.counters;
        LoopStats {
            ticks: c.ticks.load(Ordering::Relaxed),
            skipped_busy: c.skipped_busy.load(Ordering::Relaxed),
            skipped_not_ready: c.skipped_not_ready.load(Ordering::Relaxed),
            requests: c.requests.load(Ordering::Relaxed),
            failures: c.failures.load(Ordering::Relaxed),
            discarded: c.discarded.load(Ordering::Relaxed),
        }
    }

    pub(super) fn set(&self, state: LoopState) {
        self.state_tx.send_if_modified(|s| {
            if *s == state {
                return false;
            }
            *s = state;
            true
        });
    }

    /// Hand write access to `session` and mark capture enabled.
    pub(super) fn begin(&self, session: u64) {
        self.state_tx.send_modify(|s| {
            self.current.store(session, Ordering::SeqCst);
            *s = LoopState {
                enabled: true,
                ..LoopState::default()
            };
        });
    }

    /// Revoke `session`'s write access and publish `next`. No-op if the
    /// session was already ended.
    pub(super) fn end(&self, session: u64, next: LoopState) -> bool {
        let mut ended = false;
        self.state_tx.send_if_modified(|s| {
            if self.current.load(Ordering::SeqCst) != session {
                return false;
            }
            self.current.store(0, Ordering::SeqCst);
            ended = true;
            if *s == next {
                return false;
            }
            *s = next;
            true
        });
        ended
    }

    pub(super) fn is_current(&self, session: u64) -> bool {
        self.current.load(Ordering::SeqCst) == session
    }

    /// Run `update` if `session` still owns an enabled loop. Returns whether it ran.
    fn apply(&self, session: u64, update: impl FnOnce(&mut LoopState) -> bool) -> bool {
        let mut accepted = false;
        self.state_tx.send_if_modified(|s| {
            if self.current.load(Ordering::SeqCst) != session || !s.enabled {
                return false;
            }
            accepted = true;
            update(s)
        });
        accepted
    }
}

enum Tick {
    Dispatch(EncodedImage),
    Skip,
    DeviceLost(DeviceError),
    Stopped,
}

pub(super) struct SessionContext<C> {
    pub(super) id: u64,
    pub(super) shared: Arc<Shared>,
    pub(super) classifier: Arc<C>,
    pub(super) settings: LoopSettings,
}

/// Drive one capture session until `stop` fires (or its sender is dropped)
/// or the device goes away. The handle is released before this returns.
pub(super) async fn run<H, C>(ctx: SessionContext<C>, mut handle: H, mut stop: oneshot::Receiver<()>)
where
    H: DeviceHandle,
    C: Classifier,
{
    let mut ticker = tokio::time::interval(ctx.settings.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut frame = Frame::new(0, 0);
    let mut encoder = FrameEncoder::new(ctx.settings.jpeg_quality);
    let mut in_flight: Option<InFlight> = None;

    let lost = loop {
        tokio::select! {
            biased;
            _ = &mut stop => break None,
            outcome = wait(&mut in_flight), if in_flight.is_some() => {
                in_flight = None;
                ctx.apply_outcome(outcome);
            }
            _ = ticker.tick() => {
                let busy = in_flight.is_some();
                match ctx.tick(&mut handle, &mut frame, &mut encoder, busy, &mut stop).await {
                    Tick::Dispatch(image) => in_flight = Some(ctx.dispatch(image)),
                    Tick::Skip => {}
                    Tick::DeviceLost(err) => break Some(err),
                    Tick::Stopped => break None,
                }
            }
        }
    };

    if in_flight.take().is_some() {
        bump(&ctx.shared.counters.discarded);
        debug!(session = ctx.id, "abandoning in-flight request");
    }
    handle.release().await;

    match lost {
        Some(err) => {
            warn!(error = %err, session = ctx.id, "capture device lost, going offline");
            ctx.shared.end(ctx.id, LoopState::offline());
        }
        None => info!(session = ctx.id, "capture session stopped"),
    }
}

async fn wait(in_flight: &mut Option<InFlight>) -> Result<ClassificationResult, ClassifyError> {
    match in_flight {
        Some(request) => request.await,
        None => std::future::pending().await,
    }
}

impl<C: Classifier> SessionContext<C> {
    async fn tick<H: DeviceHandle>(
        &self,
        handle: &mut H,
        frame: &mut Frame,
        encoder: &mut FrameEncoder,
        busy: bool,
        stop: &mut oneshot::Receiver<()>,
    ) -> Tick {
        let counters = &self.shared.counters;
        bump(&counters.ticks);

        if !self.shared.is_current(self.id) {
            return Tick::Skip;
        }
        if busy {
            bump(&counters.skipped_busy);
            debug!(session = self.id, "previous request outstanding, skipping tick");
            return Tick::Skip;
        }
        if handle.is_disconnected() {
            return Tick::DeviceLost(DeviceError::Disconnected);
        }
        let dims = handle.dimensions().filter(|&(w, h)| w > 0 && h > 0);
        let Some((width, height)) = dims.filter(|_| handle.is_ready()) else {
            bump(&counters.skipped_not_ready);
            debug!(session = self.id, "device not ready, skipping tick");
            return Tick::Skip;
        };

        if frame.resize_to(width, height) {
            debug!(width, height, "capture buffer resized");
        }
        // A slow device must not hold up `stop`.
        let captured = tokio::select! {
            biased;
            _ = stop => return Tick::Stopped,
            captured = handle.capture_frame(frame) => captured,
        };
        if let Err(err) = captured {
            if err.is_fatal() {
                return Tick::DeviceLost(err);
            }
            warn!(error = %err, "frame capture failed, skipping tick");
            return Tick::Skip;
        }

        match encoder.encode(frame) {
            Ok(image) => {
                bump(&counters.requests);
                Tick::Dispatch(image)
            }
            Err(err) => {
                warn!(error = %err, "frame encoding failed, skipping tick");
                Tick::Skip
            }
        }
    }

    fn dispatch(&self, image: EncodedImage) -> InFlight {
        let classifier = Arc::clone(&self.classifier);
        let timeout = self.settings.request_timeout;
        Box::pin(async move {
            match tokio::time::timeout(timeout, classifier.classify(image)).await {
                Ok(result) => result,
                Err(_) => Err(ClassifyError::Timeout),
            }
        })
    }

    fn apply_outcome(&self, outcome: Result<ClassificationResult, ClassifyError>) {
        match outcome {
            Ok(result) => {
                debug!(
                    threat = %result.threat_level,
                    label = result.label,
                    objects = result.objects.len(),
                    "classification received"
                );
                let now_ms = Utc::now().timestamp_millis();
                let applied = self.shared.apply(self.id, |s| {
                    s.last_result = Some(result);
                    s.last_error = None;
                    s.last_result_at_ms = Some(now_ms);
                    true
                });
                if !applied {
                    bump(&self.shared.counters.discarded);
                }
            }
            Err(err) => {
                bump(&self.shared.counters.failures);
                let kind = err.kind();
                warn!(error = %err, %kind, "classification failed, keeping last result");
                let applied = self.shared.apply(self.id, |s| {
                    if s.last_error == Some(kind) {
                        return false;
                    }
                    s.last_error = Some(kind);
                    true
                });
                if !applied {
                    bump(&self.shared.counters.discarded);
                }
            }
        }
    }
}
