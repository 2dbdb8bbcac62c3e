//! Progress bars driven by the import event bus.

use std::collections::HashMap;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use assetsync_core::events::{Event, EventBus, ImportEvent};
use assetsync_core::models::{AssetIdentifier, BatchStatus};

use crate::style;

const SCALE: u64 = 1000;

fn bar_style() -> ProgressStyle {
    ProgressStyle::with_template("{spinner:.blue} {prefix:30!} [{bar:30.cyan/blue}] {percent:>3}% {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ")
}

/// Render one bar per asset until the returned task is aborted.
pub fn spawn(bus: &EventBus) -> JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        let multi = MultiProgress::new();
        let mut bars: HashMap<AssetIdentifier, ProgressBar> = HashMap::new();

        loop {
            let event = match rx.recv().await {
                Ok(Event::Import(event)) => event,
                Ok(Event::Transfer(_)) => continue,
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            };
            match event {
                ImportEvent::Progress { asset, progress } => {
                    let bar = bars.entry(asset.clone()).or_insert_with(|| {
                        let bar = multi.add(ProgressBar::new(SCALE));
                        bar.set_style(bar_style());
                        bar.set_prefix(asset.source_asset_id.clone());
                        bar
                    });
                    bar.set_position((progress.clamp(0.0, 1.0) * SCALE as f64) as u64);
                }
                ImportEvent::Finalized { asset, status, error } => {
                    let line = match error {
                        Some(e) => format!("{}: {}", asset, e),
                        None => asset.to_string(),
                    };
                    if let Some(bar) = bars.remove(&asset) {
                        bar.finish_and_clear();
                    }
                    let _ = multi.println(style::outcome(status, &line));
                }
                ImportEvent::BatchFinalized { status, placed, .. } => {
                    let line = format!("batch {}: {} file(s) placed", status, placed.len());
                    let line = match status {
                        BatchStatus::Success => style::success(&line),
                        BatchStatus::Cancelled => style::warn(&line),
                        _ => style::error(&line),
                    };
                    let _ = multi.println(line);
                }
            }
        }
    })
}
