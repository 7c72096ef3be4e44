use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use image::Rgb;
use threat_hud_common::classification::{ClassificationResult, ThreatLevel};
use threat_hud_common::frame::{EncodedImage, Frame};
use threat_hud_common::state::{ErrorKind, HudView, LoopState};
use tokio::time::sleep;

use super::*;
use crate::classifier::ClassifyError;
use crate::device::{DeviceError, DeviceHandle};

// ---------------------------------------------------------------------------
// Fake camera
// ---------------------------------------------------------------------------

#[derive(Default)]
struct CameraProbe {
    deny: AtomicBool,
    not_ready: AtomicBool,
    disconnected: AtomicBool,
    /// Dimensions not reported yet.
    no_dims: AtomicBool,
    capture_latency: Mutex<Duration>,
    acquires: AtomicUsize,
    open: AtomicUsize,
    max_open: AtomicUsize,
    dims: Mutex<(u32, u32)>,
}

struct FakeCamera {
    probe: Arc<CameraProbe>,
}

struct FakeHandle {
    probe: Arc<CameraProbe>,
}

fn fake_camera(width: u32, height: u32) -> (FakeCamera, Arc<CameraProbe>) {
    let probe = Arc::new(CameraProbe::default());
    *probe.dims.lock().unwrap() = (width, height);
    (
        FakeCamera {
            probe: Arc::clone(&probe),
        },
        probe,
    )
}

impl CaptureDevice for FakeCamera {
    type Handle = FakeHandle;

    async fn acquire(&mut self) -> Result<FakeHandle, DeviceError> {
        self.probe.acquires.fetch_add(1, Ordering::SeqCst);
        if self.probe.deny.load(Ordering::SeqCst) {
            return Err(DeviceError::PermissionDenied("denied by test".into()));
        }
        let open = self.probe.open.fetch_add(1, Ordering::SeqCst) + 1;
        self.probe.max_open.fetch_max(open, Ordering::SeqCst);
        Ok(FakeHandle {
            probe: Arc::clone(&self.probe),
        })
    }
}

impl DeviceHandle for FakeHandle {
    fn dimensions(&self) -> Option<(u32, u32)> {
        if self.probe.no_dims.load(Ordering::SeqCst) {
            return None;
        }
        Some(*self.probe.dims.lock().unwrap())
    }

    fn is_ready(&self) -> bool {
        !self.probe.not_ready.load(Ordering::SeqCst)
    }

    fn is_disconnected(&self) -> bool {
        self.probe.disconnected.load(Ordering::SeqCst)
    }

    async fn capture_frame(&mut self, frame: &mut Frame) -> Result<(), DeviceError> {
        let latency = *self.probe.capture_latency.lock().unwrap();
        if !latency.is_zero() {
            sleep(latency).await;
        }
        if self.probe.disconnected.load(Ordering::SeqCst) {
            return Err(DeviceError::Disconnected);
        }
        for px in frame.pixels_mut().pixels_mut() {
            *px = Rgb([40, 200, 90]);
        }
        Ok(())
    }

    async fn release(self) {
        self.probe.open.fetch_sub(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Stub classifier
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ClassifierProbe {
    script: Mutex<VecDeque<Result<ClassificationResult, ClassifyError>>>,
    latency: Mutex<Duration>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    sizes: Mutex<Vec<(u32, u32)>>,
}

impl ClassifierProbe {
    fn push(&self, outcome: Result<ClassificationResult, ClassifyError>) {
        self.script.lock().unwrap().push_back(outcome);
    }

    fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = latency;
    }
}

struct StubClassifier {
    probe: Arc<ClassifierProbe>,
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Classifier for StubClassifier {
    async fn classify(&self, image: EncodedImage) -> Result<ClassificationResult, ClassifyError> {
        let probe = &self.probe;
        probe.calls.fetch_add(1, Ordering::SeqCst);
        probe.sizes.lock().unwrap().push((image.width, image.height));
        let now = probe.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        probe.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlightGuard(&probe.in_flight);

        let latency = *probe.latency.lock().unwrap();
        if !latency.is_zero() {
            sleep(latency).await;
        }
        let next = probe.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(reading(ThreatLevel::Safe, "PERSON")))
    }
}

fn reading(level: ThreatLevel, label: &str) -> ClassificationResult {
    ClassificationResult {
        threat_level: level,
        label: label.into(),
        objects: Vec::new(),
    }
}

type TestLoop = CaptureAnalysisLoop<FakeCamera, StubClassifier>;

fn build(width: u32, height: u32) -> (TestLoop, Arc<CameraProbe>, Arc<ClassifierProbe>) {
    build_with(width, height, LoopSettings::default())
}

fn build_with(
    width: u32,
    height: u32,
    settings: LoopSettings,
) -> (TestLoop, Arc<CameraProbe>, Arc<ClassifierProbe>) {
    let (camera, cam) = fake_camera(width, height);
    let cls = Arc::new(ClassifierProbe::default());
    let classifier = StubClassifier {
        probe: Arc::clone(&cls),
    };
    (CaptureAnalysisLoop::new(camera, classifier, settings), cam, cls)
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn start_enables_and_first_tick_classifies() {
    let (hud, cam, cls) = build(64, 48);

    let state = hud.start().await;
    assert!(state.enabled);
    assert_eq!(state.last_error, None);
    assert_eq!(cam.open.load(Ordering::SeqCst), 1);

    sleep(Duration::from_millis(10)).await;
    assert_eq!(cls.calls.load(Ordering::SeqCst), 1);
    let state = hud.state();
    assert_eq!(state.last_result, Some(reading(ThreatLevel::Safe, "PERSON")));
    assert!(state.last_result_at_ms.is_some());
    assert!(hud.is_running().await);
}

#[tokio::test(start_paused = true)]
async fn permission_denied_goes_offline_without_retry() {
    let (hud, cam, cls) = build(64, 48);
    cam.deny.store(true, Ordering::SeqCst);

    let state = hud.start().await;
    assert!(!state.enabled);
    assert_eq!(state.last_error, Some(ErrorKind::DeviceUnavailable));
    assert_eq!(state.last_result, None);
    assert_eq!(state.view(), HudView::Offline);

    sleep(Duration::from_secs(3)).await;
    assert_eq!(cam.acquires.load(Ordering::SeqCst), 1);
    assert_eq!(cam.open.load(Ordering::SeqCst), 0);
    assert_eq!(cls.calls.load(Ordering::SeqCst), 0);
    assert!(!hud.is_running().await);
}

#[tokio::test(start_paused = true)]
async fn start_is_idempotent() {
    let (hud, cam, _cls) = build(64, 48);

    hud.start().await;
    hud.start().await;
    hud.start().await;

    assert_eq!(cam.acquires.load(Ordering::SeqCst), 1);
    assert_eq!(cam.max_open.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn stop_releases_device_and_resets_state() {
    let (hud, cam, _cls) = build(64, 48);
    hud.start().await;
    sleep(Duration::from_millis(600)).await;
    assert!(hud.state().last_result.is_some());

    let state = hud.stop().await;
    assert_eq!(state, LoopState::default());
    assert_eq!(state.view(), HudView::Standby);
    assert_eq!(cam.open.load(Ordering::SeqCst), 0);
    assert!(!hud.is_running().await);
}

#[tokio::test(start_paused = true)]
async fn stop_twice_matches_stop_once() {
    let (hud, _cam, _cls) = build(64, 48);
    hud.start().await;
    sleep(Duration::from_millis(10)).await;

    let once = hud.stop().await;
    let twice = hud.stop().await;
    assert_eq!(once, twice);

    let (never_started, _, _) = build(64, 48);
    assert_eq!(never_started.stop().await, LoopState::default());
}

#[tokio::test(start_paused = true)]
async fn restart_cycles_never_overlap_handles() {
    let (hud, cam, _cls) = build(64, 48);
    for _ in 0..5 {
        hud.start().await;
        sleep(Duration::from_millis(700)).await;
        hud.stop().await;
        assert_eq!(cam.open.load(Ordering::SeqCst), 0);
    }
    assert_eq!(cam.acquires.load(Ordering::SeqCst), 5);
    assert_eq!(cam.max_open.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn concurrent_start_stop_keeps_one_handle() {
    let (hud, cam, _cls) = build(32, 32);
    let hud = Arc::new(hud);

    let mut tasks = Vec::new();
    for i in 0..20 {
        let hud = Arc::clone(&hud);
        tasks.push(tokio::spawn(async move {
            if i % 2 == 0 {
                hud.start().await;
            } else {
                hud.stop().await;
            }
        }));
    }
    for t in tasks {
        t.await.unwrap();
    }
    hud.stop().await;

    assert_eq!(cam.max_open.load(Ordering::SeqCst), 1);
    assert_eq!(cam.open.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn dropping_the_loop_releases_the_device() {
    let (hud, cam, _cls) = build(64, 48);
    hud.start().await;
    sleep(Duration::from_millis(10)).await;
    assert_eq!(cam.open.load(Ordering::SeqCst), 1);

    drop(hud);
    sleep(Duration::from_millis(10)).await;
    assert_eq!(cam.open.load(Ordering::SeqCst), 0);
}

// ---------------------------------------------------------------------------
// Device conditions
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn disconnect_is_treated_like_denial() {
    let (hud, cam, _cls) = build(64, 48);
    hud.start().await;
    sleep(Duration::from_millis(10)).await;
    assert!(hud.state().last_result.is_some());

    cam.disconnected.store(true, Ordering::SeqCst);
    sleep(Duration::from_millis(600)).await;

    let state = hud.state();
    assert!(!state.enabled);
    assert_eq!(state.last_error, Some(ErrorKind::DeviceUnavailable));
    assert_eq!(state.last_result, None);
    assert_eq!(cam.open.load(Ordering::SeqCst), 0);
    assert!(!hud.is_running().await);

    // No silent reacquire; an explicit start works once the camera is back.
    sleep(Duration::from_secs(2)).await;
    assert_eq!(cam.acquires.load(Ordering::SeqCst), 1);
    cam.disconnected.store(false, Ordering::SeqCst);
    assert!(hud.start().await.enabled);
    assert_eq!(cam.max_open.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn stream_lost_before_first_frame_goes_offline() {
    let (hud, cam, cls) = build(64, 48);
    cam.no_dims.store(true, Ordering::SeqCst);
    cam.not_ready.store(true, Ordering::SeqCst);
    assert!(hud.start().await.enabled);
    sleep(Duration::from_millis(1100)).await;
    assert_eq!(hud.state().view(), HudView::Scanning);

    cam.disconnected.store(true, Ordering::SeqCst);
    sleep(Duration::from_millis(600)).await;

    let state = hud.state();
    assert!(!state.enabled);
    assert_eq!(state.last_error, Some(ErrorKind::DeviceUnavailable));
    assert_eq!(state.view(), HudView::Offline);
    assert_eq!(cam.open.load(Ordering::SeqCst), 0);
    assert_eq!(cls.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn restart_right_after_device_loss_reacquires() {
    let (hud, cam, _cls) = build(64, 48);
    let mut rx = hud.subscribe();
    hud.start().await;
    cam.disconnected.store(true, Ordering::SeqCst);

    loop {
        rx.changed().await.unwrap();
        if rx.borrow_and_update().view() == HudView::Offline {
            break;
        }
    }
    cam.disconnected.store(false, Ordering::SeqCst);
    let state = hud.start().await;
    assert!(state.enabled);
    assert_eq!(cam.acquires.load(Ordering::SeqCst), 2);
    assert_eq!(cam.max_open.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn stop_does_not_wait_for_slow_capture() {
    let (hud, cam, cls) = build(64, 48);
    *cam.capture_latency.lock().unwrap() = Duration::from_secs(10);
    hud.start().await;
    sleep(Duration::from_millis(100)).await;

    let before = tokio::time::Instant::now();
    let state = hud.stop().await;
    assert!(before.elapsed() < Duration::from_secs(1));
    assert_eq!(state, LoopState::default());
    assert_eq!(cam.open.load(Ordering::SeqCst), 0);
    assert_eq!(cls.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn not_ready_device_skips_ticks() {
    let (hud, cam, cls) = build(64, 48);
    cam.not_ready.store(true, Ordering::SeqCst);
    hud.start().await;

    sleep(Duration::from_millis(1600)).await;
    assert_eq!(cls.calls.load(Ordering::SeqCst), 0);
    assert!(hud.stats().skipped_not_ready >= 3);
    assert_eq!(hud.state().view(), HudView::Scanning);

    cam.not_ready.store(false, Ordering::SeqCst);
    sleep(Duration::from_millis(500)).await;
    assert_eq!(cls.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn capture_buffer_tracks_resolution_changes() {
    let (hud, cam, cls) = build(64, 48);
    hud.start().await;
    sleep(Duration::from_millis(10)).await;

    *cam.dims.lock().unwrap() = (32, 16);
    sleep(Duration::from_millis(500)).await;
    *cam.dims.lock().unwrap() = (80, 60);
    sleep(Duration::from_millis(500)).await;

    let sizes = cls.sizes.lock().unwrap().clone();
    assert_eq!(sizes, vec![(64, 48), (32, 16), (80, 60)]);
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn danger_result_is_exposed_verbatim() {
    let (hud, _cam, cls) = build(64, 48);
    cls.push(Ok(
        ClassificationResult::from_response(br#"{"threat":"DANGER","label":"weapon"}"#).unwrap(),
    ));
    let mut rx = hud.subscribe();

    hud.start().await;
    sleep(Duration::from_millis(10)).await;

    assert!(rx.has_changed().unwrap());
    let state = rx.borrow_and_update().clone();
    let result = state.last_result.unwrap();
    assert_eq!(result.threat_level, ThreatLevel::Danger);
    assert_eq!(result.label, "weapon");
}

#[tokio::test(start_paused = true)]
async fn server_error_keeps_previous_result() {
    let (hud, _cam, cls) = build(64, 48);
    cls.push(Ok(reading(ThreatLevel::Safe, "PERSON")));
    cls.push(Err(ClassifyError::Status(500)));

    hud.start().await;
    sleep(Duration::from_millis(10)).await;
    let before = hud.state();
    assert_eq!(before.last_result, Some(reading(ThreatLevel::Safe, "PERSON")));

    sleep(Duration::from_millis(500)).await;
    let after = hud.state();
    assert!(after.enabled);
    assert_eq!(after.last_error, Some(ErrorKind::BackendError));
    assert_eq!(after.last_result, before.last_result);
    assert_eq!(after.last_result_at_ms, before.last_result_at_ms);
    assert!(matches!(after.view(), HudView::Tracking { stale: true, .. }));

    // The loop keeps going and recovers on the next good response.
    sleep(Duration::from_millis(500)).await;
    assert_eq!(hud.state().last_error, None);
    assert_eq!(hud.stats().failures, 1);
}

#[tokio::test(start_paused = true)]
async fn network_failure_before_any_result() {
    let (hud, _cam, cls) = build(64, 48);
    cls.push(Err(ClassifyError::Unreachable("connection refused".into())));

    hud.start().await;
    sleep(Duration::from_millis(10)).await;
    let state = hud.state();
    assert!(state.enabled);
    assert_eq!(state.last_result, None);
    assert_eq!(state.last_error, Some(ErrorKind::NetworkUnreachable));
}

#[tokio::test(start_paused = true)]
async fn slow_backend_never_overlaps_requests() {
    let (hud, _cam, cls) = build(64, 48);
    cls.set_latency(Duration::from_millis(1200));

    hud.start().await;
    sleep(Duration::from_secs(6)).await;

    assert_eq!(cls.max_in_flight.load(Ordering::SeqCst), 1);
    let stats = hud.stats();
    assert!(stats.skipped_busy > 0);
    assert!(cls.calls.load(Ordering::SeqCst) < 12);
    assert!(cls.calls.load(Ordering::SeqCst) >= 3);
}

#[tokio::test(start_paused = true)]
async fn hung_request_times_out_and_loop_continues() {
    let settings = LoopSettings {
        request_timeout: Duration::from_millis(1200),
        ..LoopSettings::default()
    };
    let (hud, _cam, cls) = build_with(64, 48, settings);
    cls.set_latency(Duration::from_secs(60));

    hud.start().await;
    sleep(Duration::from_millis(1300)).await;
    assert_eq!(hud.state().last_error, Some(ErrorKind::NetworkUnreachable));
    assert_eq!(cls.calls.load(Ordering::SeqCst), 1);
    assert_eq!(cls.in_flight.load(Ordering::SeqCst), 0);

    // The next tick (t=1500ms) dispatches a fresh request.
    sleep(Duration::from_millis(300)).await;
    assert_eq!(cls.calls.load(Ordering::SeqCst), 2);
    assert_eq!(cls.max_in_flight.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn stop_mid_flight_discards_response() {
    let (hud, cam, cls) = build(64, 48);
    cls.set_latency(Duration::from_secs(1));
    cls.push(Ok(reading(ThreatLevel::Danger, "KNIFE")));

    hud.start().await;
    sleep(Duration::from_millis(100)).await;
    assert_eq!(cls.in_flight.load(Ordering::SeqCst), 1);

    let mut rx = hud.subscribe();
    let stopped = hud.stop().await;
    assert_eq!(stopped, LoopState::default());
    let _ = rx.borrow_and_update();

    sleep(Duration::from_secs(3)).await;
    assert!(!rx.has_changed().unwrap());
    assert_eq!(hud.state(), LoopState::default());
    assert_eq!(cls.in_flight.load(Ordering::SeqCst), 0);
    assert_eq!(cls.calls.load(Ordering::SeqCst), 1);
    assert_eq!(cam.open.load(Ordering::SeqCst), 0);
    assert_eq!(hud.stats().discarded, 1);
}

#[tokio::test(start_paused = true)]
async fn observers_are_notified_per_result() {
    let (hud, _cam, cls) = build(64, 48);
    cls.push(Ok(reading(ThreatLevel::Safe, "PERSON")));
    cls.push(Ok(reading(ThreatLevel::Caution, "CELL PHONE")));
    let mut rx = hud.subscribe();

    hud.start().await;
    rx.changed().await.unwrap();
    assert!(rx.borrow_and_update().enabled);

    rx.changed().await.unwrap();
    assert_eq!(
        rx.borrow_and_update().last_result.as_ref().map(|r| r.threat_level),
        Some(ThreatLevel::Safe)
    );

    rx.changed().await.unwrap();
    assert_eq!(
        rx.borrow_and_update().last_result.as_ref().map(|r| r.label.clone()),
        Some("CELL PHONE".to_string())
    );
}
