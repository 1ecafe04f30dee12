use std::sync::Once;

use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::capture::{CameraDescriptor, CameraDriver, Facing, SyntheticConfig, SyntheticDriver};
use crate::error::{BridgeError, Result};
use crate::CameraSelector;

/// Resolve a selector to a concrete camera. Facing selectors take the first
/// device facing that way.
///
/// `Back` and `Front` fall back to the first device when none reports that
/// facing, as on desktops and boards where every camera is external. `Id`
/// and `External` must match exactly.
pub fn select_camera(
    selector: &CameraSelector,
    cameras: &[CameraDescriptor],
) -> Result<CameraDescriptor> {
    let facing = match selector {
        CameraSelector::Back => Some(Facing::Back),
        CameraSelector::Front => Some(Facing::Front),
        CameraSelector::External => Some(Facing::External),
        CameraSelector::Id(_) => None,
    };

    let found = cameras.iter().find(|camera| match (selector, facing) {
        (CameraSelector::Id(id), _) => &camera.id == id,
        (_, Some(facing)) => camera.facing == facing,
        _ => false,
    });

    let fallback = || match selector {
        CameraSelector::Back | CameraSelector::Front => {
            let camera = cameras.first()?;
            warn!(
                "No {selector:?} camera among {} device(s), using {} ({:?})",
                cameras.len(),
                camera.id,
                camera.facing
            );
            Some(camera)
        }
        _ => None,
    };

    match found.or_else(fallback) {
        Some(camera) => {
            info!("Selected camera {} ({})", camera.id, camera.name);
            Ok(camera.clone())
        }
        None => Err(BridgeError::DeviceUnavailable(format!(
            "no camera matches {selector:?} among {} device(s)",
            cameras.len()
        ))),
    }
}

/// The platform camera stack: V4L2 when built with it, else the test pattern.
pub fn default_driver() -> Box<dyn CameraDriver> {
    #[cfg(all(feature = "v4l2", target_os = "linux"))]
    {
        let driver = crate::capture::V4l2Driver::default();
        if !driver.enumerate().is_empty() {
            return Box::new(driver);
        }
    }
    warn!("No platform camera found, streaming the synthetic test pattern");
    Box::new(SyntheticDriver::new(SyntheticConfig::default()))
}

/// Installs the global subscriber once. Hosts that already installed their
/// own keep it.
///
/// Filter comes from `RUST_LOG`, defaulting to `camtex=info`.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("camtex=info"));
        let fmt = tracing_subscriber::fmt::layer()
            .with_timer(tracing_subscriber::fmt::time::uptime());
        let registry = tracing_subscriber::registry().with(filter).with(fmt);

        #[cfg(feature = "profiling")]
        let registry = registry.with(tracing_tracy::TracyLayer::default());

        if registry.try_init().is_ok() {
            info!("camtex tracing initialized");
        }
    });
}
