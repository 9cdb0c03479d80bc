//! Minimap Localization Library
//!
//! Locates a player on pre-rendered zone maps by matching a small
//! circular minimap crop against the map with masked normalized
//! cross-correlation. Tracking mode searches a velocity-predicted
//! window around the last fix; when tracking breaks, a multi-scale
//! global search gated by an ONNX zone classifier takes over.
//!
//! Two matching strategies exist: plain intensity matching, and a
//! road-color heatmap (with chamfer edge verification) for maps whose
//! texture is dominated by the path network.

// Matching core
pub mod image_ops;
pub mod strategy;

// State and orchestration
pub mod engine;
pub mod motion_tracker;
pub mod zone_store;

// Zone classification
pub mod classifier;

// Core modules
pub mod error;
pub mod ffi; // host-framework integration
pub mod locator;
pub mod types;

pub use classifier::ZoneClassifier;
pub use error::{LocatorError, Result};
pub use image_ops::{core_match, generate_minimap_mask, infer_yellow_arrow_rotation, MatchResultRaw};
pub use locator::{global_locator, init_global_locator, MapLocator};
pub use motion_tracker::MotionTracker;
pub use strategy::{MatchFeature, MatchMode, MatchStrategy};
pub use types::{
    ImageProcessingConfig, LocateOptions, LocateResult, LocateStatus, LocatorConfig, MapPosition,
    MatchConfig, TrackingConfig,
};
pub use zone_store::ZoneMapStore;

/// Initialize the library (logging hook point for hosts).
pub fn init() -> Result<()> {
    log::info!("Minimap localization library initialized");
    Ok(())
}

/// Get library version information
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
