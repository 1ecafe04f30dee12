//! camtex demo host: a synthetic camera streamed into textures and pulled by
//! a simulated engine render loop

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use camtex::capture::{SyntheticConfig, SyntheticDriver};
use camtex::host::ChannelMessenger;
use camtex::texture::{CpuTextureBackend, TextureBackend, WgpuTextureBackend};
use camtex::{Config, LifecycleController};
use color_eyre::{eyre::eyre, Result};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{info, warn};

const RUN_FOR: Duration = Duration::from_secs(5);
const PAUSE_AT: Duration = Duration::from_secs(2);
const RESUME_AT: Duration = Duration::from_secs(3);
const HOST_FRAME: Duration = Duration::from_micros(16_667);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter("camtex=debug")
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("camtex demo launching...");

    // Load configuration
    let path = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::load(path.as_deref())?;
    camtex::CONFIG.store(Arc::new(config.clone()));

    let backend: Arc<dyn TextureBackend> = match WgpuTextureBackend::headless().await {
        Ok(gpu) => Arc::new(gpu),
        Err(e) => {
            warn!("{e}, falling back to CPU textures");
            Arc::new(CpuTextureBackend::new())
        }
    };

    let (messenger, messages) = ChannelMessenger::new();
    let driver = SyntheticDriver::new(SyntheticConfig::default());
    let controller = LifecycleController::builder(Box::new(driver))
        .config(config)
        .backend(backend)
        .messenger(Arc::new(messenger))
        .build()?;

    let session = controller.start_default()?;
    info!("Session {} on {}", session.id, session.camera.name);
    let bridge = controller.bridge();

    // Simulated host render loop
    let mut ticker = interval(HOST_FRAME);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let started = Instant::now();
    let mut paused = false;
    let mut resumed = false;
    let mut handles_seen = 0u64;
    let mut last_handle = 0;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = &mut ctrl_c => {
                info!("Ctrl-C received");
                break;
            }
        }

        let elapsed = started.elapsed();
        if elapsed >= RUN_FOR {
            break;
        }
        if !paused && elapsed >= PAUSE_AT {
            controller.pause()?;
            paused = true;
        }
        if paused && !resumed && elapsed >= RESUME_AT {
            controller.resume()?;
            resumed = true;
        }

        let handle = bridge.get_current_texture_handle();
        if !handle.is_null() && handle.raw() != last_handle {
            handles_seen += 1;
            last_handle = handle.raw();
        }
        bridge.notify_host_frame_rendered();

        for message in messages.try_iter() {
            info!("host message: {message}");
        }
    }

    match bridge.snapshot_png() {
        Ok(Some(png)) => info!("Snapshot: {} PNG bytes", png.len()),
        Ok(None) => info!("No frame to snapshot"),
        Err(e) => info!("Snapshot unavailable: {e}"),
    }

    let stats = controller.stats();
    let report = controller.stop();
    for message in messages.try_iter() {
        info!("host message: {message}");
    }
    info!(
        "captured {} / published {} / dropped {} / gaps {} / rendered {}",
        stats.frames_captured,
        stats.frames_published,
        stats.frames_dropped,
        stats.sequence_gaps,
        stats.frames_rendered
    );
    info!(
        "convert avg {}us p99 {}us, {} handle switches, {} over budget",
        stats.convert_avg_us,
        stats.convert_p99_us,
        handles_seen,
        stats.over_budget
    );

    if report.forced {
        return Err(eyre!("session {:?} needed a forced teardown", report.session));
    }
    info!("camtex demo shutting down");
    Ok(())
}
