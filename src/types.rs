//! Type definitions for minimap localization

use serde::{Deserialize, Serialize};

/// Minimap ROI inside the captured frame (externalizable defaults).
pub const MINIMAP_ROI_ORIGIN_X: i32 = 49;
pub const MINIMAP_ROI_ORIGIN_Y: i32 = 51;
pub const MINIMAP_ROI_WIDTH: i32 = 118;
pub const MINIMAP_ROI_HEIGHT: i32 = 120;

/// Lost-frame budget before the tracker is considered lost.
pub const MAX_LOST_TRACKING_COUNT: i32 = 3;

/// Base half-side of the tracking search window, before the template
/// extent is added.
pub const MOBILE_SEARCH_RADIUS: f64 = 50.0;

/// A resolved player position in haystack (zone map) coordinates.
///
/// `x`/`y` are sub-pixel and point at the player, i.e. the template
/// center. `heading` is degrees clockwise from north in `[0, 360)`, or
/// `-1.0` when the arrow could not be read.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MapPosition {
    pub zone_id: String,
    pub x: f64,
    pub y: f64,
    pub score: f64,
    pub slice_index: i32,
    pub scale: f64,
    pub heading: f64,
    pub latency_ms: i64,
}

/// Outcome taxonomy for a single `locate()` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocateStatus {
    Success,
    /// Tracking lost and global search failed too.
    TrackingLost,
    /// The frame is dominated by UI occlusion.
    ScreenBlocked,
    /// Implied speed exceeded the teleport limit.
    Teleported,
    /// The zone classifier produced no usable zone.
    YoloFailed,
    NotInitialized,
}

impl LocateStatus {
    /// Stable numeric code used by the host-callback detail JSON.
    pub fn code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::TrackingLost => 1,
            Self::ScreenBlocked => 2,
            Self::Teleported => 3,
            Self::YoloFailed => 4,
            Self::NotInitialized => 5,
        }
    }
}

/// Result of one `locate()` call.
#[derive(Debug, Clone)]
pub struct LocateResult {
    pub status: LocateStatus,
    pub position: Option<MapPosition>,
    pub message: String,
}

impl LocateResult {
    pub fn failure<S: Into<String>>(status: LocateStatus, message: S) -> Self {
        Self {
            status,
            position: None,
            message: message.into(),
        }
    }
}

/// Per-call options, deserializable from the host's `param_json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocateOptions {
    /// Global-search pass line; tolerates UI occlusion and lighting.
    #[serde(rename = "loc_threshold")]
    pub min_score_threshold: f64,

    #[serde(rename = "yolo_threshold")]
    pub yolo_conf_threshold: f64,

    /// Abandon the current track and run a full-map search.
    #[serde(rename = "force_global_search")]
    pub force_global_search: bool,

    /// Prior knowledge of the current zone, skips the classifier.
    #[serde(rename = "expected_zone")]
    pub expected_zone_id: String,

    #[serde(rename = "max_lost_frames")]
    pub max_lost_frames: i32,
}

impl Default for LocateOptions {
    fn default() -> Self {
        Self {
            min_score_threshold: 0.55,
            yolo_conf_threshold: 0.70,
            force_global_search: false,
            expected_zone_id: String::new(),
            max_lost_frames: MAX_LOST_TRACKING_COUNT,
        }
    }
}

/// Motion-tracking thresholds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TrackingConfig {
    /// px/s
    pub max_normal_speed: f64,
    /// NCC below this means the screen is blocked.
    pub screen_blocked_threshold: f64,
    pub edge_snap_margin: i32,
    pub velocity_smoothing_alpha: f64,
    /// Beyond this dt the velocity prediction is not trusted.
    pub max_dt_for_prediction: f64,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            max_normal_speed: 40.0,
            screen_blocked_threshold: 0.4,
            edge_snap_margin: 1,
            velocity_smoothing_alpha: 0.5,
            max_dt_for_prediction: 5.0,
        }
    }
}

/// Template-matching parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MatchConfig {
    pub blur_size: i32,
    pub coarse_scale: f64,
    /// Fine-search half-margin around a coarse candidate (px).
    pub fine_search_radius: i32,
    pub pass_threshold: f64,
    pub yolo_conf_threshold: f64,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            blur_size: 7,
            coarse_scale: 0.5,
            fine_search_radius: 40,
            pass_threshold: 0.55,
            yolo_conf_threshold: 0.60,
        }
    }
}

/// Minimap mask-generation parameters. Two presets exist: one for the
/// open-world `Base` maps and one for the tiered dungeon layers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ImageProcessingConfig {
    /// Yellow/cyan legend glyph color-distance cut.
    pub icon_diff_threshold: i32,
    /// Radius hiding the player arrow.
    pub center_mask_radius: i32,
    /// Grayscale level at or below which pixels are culled; negative
    /// disables the dark mask.
    pub minimap_dark_mask_threshold: i32,
    pub border_margin: i32,
    pub white_dilate: i32,
    pub color_dilate: i32,
    pub use_hsv_white_mask: bool,
}

impl ImageProcessingConfig {
    pub fn base_preset() -> Self {
        Self {
            icon_diff_threshold: 40,
            center_mask_radius: 18,
            minimap_dark_mask_threshold: 20,
            border_margin: 10,
            white_dilate: 11,
            color_dilate: 3,
            use_hsv_white_mask: true,
        }
    }

    pub fn tier_preset() -> Self {
        Self {
            icon_diff_threshold: 40,
            center_mask_radius: 8,
            minimap_dark_mask_threshold: 15,
            border_margin: 8,
            white_dilate: 9,
            color_dilate: 3,
            use_hsv_white_mask: false,
        }
    }
}

/// Initialization parameters for the locator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocatorConfig {
    /// Root of the zone map directory tree.
    pub map_resource_dir: String,
    /// ONNX classifier model; empty disables the classifier.
    pub model_path: String,
}
