use threat_hud_common::classification::ThreatLevel;
use threat_hud_common::state::{HudView, LoopState};
use tokio::sync::watch;
use tracing::{info, warn};

/// Log every change of what the HUD would display.
pub async fn run_console_renderer(mut rx: watch::Receiver<LoopState>) {
    let mut last: Option<HudView> = None;
    loop {
        let view = rx.borrow_and_update().view();
        if last.as_ref() != Some(&view) {
            render(&view);
            last = Some(view);
        }
        if rx.changed().await.is_err() {
            break;
        }
    }
}

fn render(view: &HudView) {
    match view {
        HudView::Offline => warn!("SENSOR OFFLINE"),
        HudView::Standby => info!("HUD standby"),
        HudView::Scanning => info!("SCANNING..."),
        HudView::Tracking {
            threat,
            label,
            objects,
            stale,
        } => {
            let label = label.as_str();
            let objects = objects.len();
            if *threat == ThreatLevel::Danger {
                warn!(%threat, label, objects, stale, "HUD");
            } else {
                info!(%threat, label, objects, stale, "HUD");
            }
        }
    }
}
