//! Matching strategies: plain intensity matching for textured maps and
//! a road-color heatmap for maps dominated by the path network.

use crate::error::Result;
use crate::image_ops::{generate_minimap_mask, to_bgr, to_gray, MatchResultRaw};
use crate::types::{ImageProcessingConfig, MapPosition, MatchConfig, TrackingConfig};
use opencv::{
    core::{self, Mat, Rect, Scalar, Size, Vec3b, Vec4b, CV_8UC1},
    imgproc,
    prelude::*,
};
use std::time::Duration;

/// Preprocessed template for one match attempt.
pub struct MatchFeature {
    /// What is actually fed into the matcher (grayscale or heatmap).
    pub image: Mat,
    /// Per-pixel weight mask, same dimensions as `image`.
    pub mask: Mat,
    /// Untouched BGR template, kept for the classifier and for chamfer
    /// edge extraction.
    pub templ_raw: Mat,
}

/// Verdict of a tracking-mode match.
#[derive(Debug, Clone, Copy)]
pub struct TrackingValidation {
    pub is_valid: bool,
    pub is_edge_snapped: bool,
    pub is_teleported: bool,
    pub is_screen_blocked: bool,
    pub abs_x: f64,
    pub abs_y: f64,
}

/// Strategy selection override for dual-mode verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    Auto,
    ForceStandard,
    ForcePathHeatmap,
}

#[derive(Debug, Clone)]
struct StrategyContext {
    is_base: bool,
    tracking_cfg: TrackingConfig,
    match_cfg: MatchConfig,
    base_cfg: ImageProcessingConfig,
    tier_cfg: ImageProcessingConfig,
}

impl StrategyContext {
    fn img_cfg(&self) -> &ImageProcessingConfig {
        if self.is_base {
            &self.base_cfg
        } else {
            &self.tier_cfg
        }
    }
}

/// Two-variant polymorphic matcher; created per call, borrows nothing.
pub enum MatchStrategy {
    Standard(StrategyContextBox),
    PathHeatmap(StrategyContextBox),
}

// Keeps the variant payload private while the enum stays matchable.
pub struct StrategyContextBox(StrategyContext);

impl MatchStrategy {
    /// Pick the native strategy for a zone, unless `mode` forces one.
    /// Zones carrying the `OMVBase` token are path-heatmap zones.
    pub fn for_zone(
        zone_id: &str,
        tracking_cfg: &TrackingConfig,
        match_cfg: &MatchConfig,
        base_cfg: &ImageProcessingConfig,
        tier_cfg: &ImageProcessingConfig,
        mode: MatchMode,
    ) -> Self {
        let ctx = StrategyContext {
            is_base: zone_id.contains("Base"),
            tracking_cfg: *tracking_cfg,
            match_cfg: *match_cfg,
            base_cfg: *base_cfg,
            tier_cfg: *tier_cfg,
        };
        let use_path_heatmap = match mode {
            MatchMode::ForcePathHeatmap => true,
            MatchMode::ForceStandard => false,
            MatchMode::Auto => zone_id.contains("OMVBase"),
        };
        if use_path_heatmap {
            Self::PathHeatmap(StrategyContextBox(ctx))
        } else {
            Self::Standard(StrategyContextBox(ctx))
        }
    }

    fn ctx(&self) -> &StrategyContext {
        match self {
            Self::Standard(b) | Self::PathHeatmap(b) => &b.0,
        }
    }

    /// Path-heatmap matches may be rescued by chamfer verification.
    pub fn needs_chamfer_compensation(&self) -> bool {
        matches!(self, Self::PathHeatmap(_))
    }

    /// Preprocess the minimap into the template feature.
    pub fn extract_template_feature(&self, minimap: &Mat) -> Result<MatchFeature> {
        match self {
            Self::Standard(b) => standard_template_feature(minimap, &b.0),
            Self::PathHeatmap(b) => {
                let templ_raw = to_bgr(minimap)?;
                let image = extract_path_heatmap(minimap)?;

                let mut cfg = *b.0.img_cfg();
                // keep road pixels: no dark cull, no HSV white cut
                cfg.minimap_dark_mask_threshold = -1;
                cfg.use_hsv_white_mask = false;
                let mask = generate_minimap_mask(&templ_raw, &cfg, true, true)?;

                Ok(MatchFeature {
                    image,
                    mask,
                    templ_raw,
                })
            }
        }
    }

    /// Preprocess a haystack region into the search image.
    pub fn extract_search_feature(&self, map_roi: &Mat) -> Result<Mat> {
        match self {
            Self::Standard(_) => to_bgr(map_roi),
            Self::PathHeatmap(_) => extract_path_heatmap(map_roi),
        }
    }

    /// Validate one tracking-mode match result.
    pub fn validate_tracking(
        &self,
        res: &MatchResultRaw,
        dt: Duration,
        last_pos: Option<&MapPosition>,
        search_rect: Rect,
        templ_cols: i32,
        templ_rows: i32,
    ) -> TrackingValidation {
        let cfg = &self.ctx().tracking_cfg;

        let max_x = search_rect.width - templ_cols;
        let max_y = search_rect.height - templ_rows;
        let margin = cfg.edge_snap_margin;
        let hit_edge_x = res.loc.x <= margin || res.loc.x >= max_x - margin;
        let hit_edge_y = res.loc.y <= margin || res.loc.y >= max_y - margin;
        let is_edge_snapped = hit_edge_x || hit_edge_y;

        let abs_x = search_rect.x as f64 + res.loc.x as f64 + templ_cols as f64 / 2.0;
        let abs_y = search_rect.y as f64 + res.loc.y as f64 + templ_rows as f64 / 2.0;

        let mut speed = 0.0;
        if let Some(last) = last_pos {
            let moved = ((abs_x - last.x).powi(2) + (abs_y - last.y).powi(2)).sqrt();
            speed = moved / dt.as_secs_f64().max(0.001);
        }
        let is_teleported = speed > cfg.max_normal_speed;

        let (ambiguous, is_screen_blocked) = match self {
            Self::Standard(_) => {
                let low_score = res.score < 0.80;
                let ambiguous = low_score && (res.psr < 6.0 || res.delta < 0.02);
                (ambiguous, res.score < cfg.screen_blocked_threshold)
            }
            Self::PathHeatmap(_) => {
                let accept = path_heatmap_accept(res);
                let hold_worthy = res.score >= 0.35 && res.psr >= 4.0;
                (!accept, !accept && !hold_worthy)
            }
        };

        TrackingValidation {
            is_valid: !is_edge_snapped && !is_teleported && !is_screen_blocked && !ambiguous,
            is_edge_snapped,
            is_teleported,
            is_screen_blocked,
            abs_x,
            abs_y,
        }
    }

    /// Acceptance predicate for a fine global-search result; returns
    /// the final score when the match passes.
    pub fn validate_global_search(&self, res: &MatchResultRaw) -> Option<f64> {
        match self {
            Self::Standard(b) => {
                if res.score < b.0.match_cfg.pass_threshold {
                    None
                } else {
                    Some(res.score)
                }
            }
            Self::PathHeatmap(_) => {
                if path_heatmap_accept(res) {
                    Some(res.score)
                } else {
                    None
                }
            }
        }
    }
}

/// The three-rule acceptance disjunction shared by path-heatmap
/// tracking and global search.
fn path_heatmap_accept(res: &MatchResultRaw) -> bool {
    res.score >= 0.85
        || (res.score >= 0.42 && res.delta >= 0.04 && res.psr >= 3.8)
        || (res.score >= 0.40 && res.delta >= 0.05 && res.psr >= 3.8)
}

fn standard_template_feature(minimap: &Mat, ctx: &StrategyContext) -> Result<MatchFeature> {
    if minimap.channels() != 4 {
        let templ_raw = minimap.try_clone()?;
        let image = minimap.try_clone()?;
        let mask = generate_minimap_mask(minimap, ctx.img_cfg(), true, true)?;
        return Ok(MatchFeature {
            image,
            mask,
            templ_raw,
        });
    }

    let templ_raw = to_bgr(minimap)?;

    let mut channels = core::Vector::<Mat>::new();
    core::split(minimap, &mut channels)?;
    let alpha = channels.get(3)?;

    let mut valid_mask = Mat::default();
    core::compare(&alpha, &Scalar::all(220.0), &mut valid_mask, core::CMP_GE)?;
    // erode to stop the transparent halo from leaking into the edge
    let kernel = imgproc::get_structuring_element_def(imgproc::MORPH_ELLIPSE, Size::new(3, 3))?;
    let mut eroded = Mat::default();
    imgproc::erode_def(&valid_mask, &mut eroded, &kernel)?;

    // fill the transparent outside with the mean of the valid region so
    // the cross-correlation stays stable
    let templ_gray = to_gray(&templ_raw)?;
    let mean_v = core::mean(&templ_gray, &eroded)?[0];
    let mut invalid = Mat::default();
    core::bitwise_not_def(&eroded, &mut invalid)?;

    let mut filled = core::Vector::<Mat>::new();
    for i in 0..3 {
        let mut ch = channels.get(i)?.try_clone()?;
        ch.set_to(&Scalar::all(mean_v), &invalid)?;
        filled.push(ch);
    }
    let mut image = Mat::default();
    core::merge(&filled, &mut image)?;

    let generated = generate_minimap_mask(minimap, ctx.img_cfg(), true, true)?;
    let mut mask = Mat::default();
    core::bitwise_and_def(&generated, &eroded, &mut mask)?;

    Ok(MatchFeature {
        image,
        mask,
        templ_raw,
    })
}

// in-game road reference color, light gray leaning blue
const ROAD_B: i32 = 237;
const ROAD_G: i32 = 233;
const ROAD_R: i32 = 228;
const ROAD_COLOR_TOLERANCE: i32 = 60;
const ROAD_DIST_CUTOFF: i32 = ROAD_COLOR_TOLERANCE * 3;

#[inline]
fn heat_level(b: i32, g: i32, r: i32) -> u8 {
    let dist = (b - ROAD_B).abs() + (g - ROAD_G).abs() + (r - ROAD_R).abs();
    if dist < ROAD_DIST_CUTOFF {
        (255 - dist * 255 / ROAD_DIST_CUTOFF).max(0) as u8
    } else {
        0
    }
}

/// Map road-colored pixels to high intensity, everything else to zero,
/// then smooth so the correlation surface has a usable basin.
pub fn extract_path_heatmap(src: &Mat) -> Result<Mat> {
    let rows = src.rows();
    let cols = src.cols();
    let mut feature = Mat::zeros(rows, cols, CV_8UC1)?.to_mat()?;

    let has_alpha = src.channels() == 4;
    for y in 0..rows {
        let feat_row = feature.at_row_mut::<u8>(y)?;
        if has_alpha {
            let src_row = src.at_row::<Vec4b>(y)?;
            for x in 0..cols as usize {
                let px = src_row[x];
                if px[3] < 128 {
                    continue;
                }
                feat_row[x] = heat_level(px[0] as i32, px[1] as i32, px[2] as i32);
            }
        } else {
            let src_row = src.at_row::<Vec3b>(y)?;
            for x in 0..cols as usize {
                let px = src_row[x];
                feat_row[x] = heat_level(px[0] as i32, px[1] as i32, px[2] as i32);
            }
        }
    }

    let mut blurred = Mat::default();
    imgproc::gaussian_blur_def(&feature, &mut blurred, Size::new(5, 5), 0.0)?;
    Ok(blurred)
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencv::core::{Point, CV_8UC3, CV_8UC4};

    fn defaults() -> (
        TrackingConfig,
        MatchConfig,
        ImageProcessingConfig,
        ImageProcessingConfig,
    ) {
        (
            TrackingConfig::default(),
            MatchConfig::default(),
            ImageProcessingConfig::base_preset(),
            ImageProcessingConfig::tier_preset(),
        )
    }

    fn strategy(zone_id: &str, mode: MatchMode) -> MatchStrategy {
        let (t, m, b, tr) = defaults();
        MatchStrategy::for_zone(zone_id, &t, &m, &b, &tr, mode)
    }

    fn raw(score: f64, delta: f64, psr: f64, loc: Point) -> MatchResultRaw {
        MatchResultRaw {
            score,
            loc,
            second_score: score - delta,
            delta,
            psr,
        }
    }

    #[test]
    fn test_factory_selects_by_zone_token() {
        assert!(!strategy("Region2_Base", MatchMode::Auto).needs_chamfer_compensation());
        assert!(strategy("OMVBase_Base", MatchMode::Auto).needs_chamfer_compensation());
        assert!(strategy("Region2_Base", MatchMode::ForcePathHeatmap).needs_chamfer_compensation());
        assert!(!strategy("OMVBase_Base", MatchMode::ForceStandard).needs_chamfer_compensation());
    }

    #[test]
    fn test_standard_tracking_accepts_clean_match() {
        let s = strategy("Region2_L3_2", MatchMode::Auto);
        let rect = Rect::new(100, 100, 200, 200);
        let v = s.validate_tracking(
            &raw(0.9, 0.2, 12.0, Point::new(40, 40)),
            Duration::from_millis(100),
            None,
            rect,
            100,
            100,
        );
        assert!(v.is_valid);
        assert_eq!(v.abs_x, 190.0);
        assert_eq!(v.abs_y, 190.0);
    }

    #[test]
    fn test_standard_tracking_flags_edge_snap() {
        let s = strategy("Region2_L3_2", MatchMode::Auto);
        let rect = Rect::new(0, 0, 200, 200);
        let v = s.validate_tracking(
            &raw(0.9, 0.2, 12.0, Point::new(0, 40)),
            Duration::from_millis(100),
            None,
            rect,
            100,
            100,
        );
        assert!(v.is_edge_snapped);
        assert!(!v.is_valid);
    }

    #[test]
    fn test_standard_tracking_flags_teleport() {
        let s = strategy("Region2_L3_2", MatchMode::Auto);
        let rect = Rect::new(0, 0, 200, 200);
        let last = MapPosition {
            x: 550.0,
            y: 50.0,
            ..Default::default()
        };
        // 500 px in 100 ms is 5000 px/s, far over the 40 px/s limit
        let v = s.validate_tracking(
            &raw(0.9, 0.2, 12.0, Point::new(40, 40)),
            Duration::from_millis(100),
            Some(&last),
            rect,
            20,
            20,
        );
        assert!(v.is_teleported);
        assert!(!v.is_valid);
    }

    #[test]
    fn test_standard_tracking_flags_blocked_and_ambiguous() {
        let s = strategy("Region2_L3_2", MatchMode::Auto);
        let rect = Rect::new(0, 0, 200, 200);
        let blocked = s.validate_tracking(
            &raw(0.3, 0.2, 12.0, Point::new(40, 40)),
            Duration::from_millis(100),
            None,
            rect,
            20,
            20,
        );
        assert!(blocked.is_screen_blocked);

        let ambiguous = s.validate_tracking(
            &raw(0.6, 0.01, 3.0, Point::new(40, 40)),
            Duration::from_millis(100),
            None,
            rect,
            20,
            20,
        );
        assert!(!ambiguous.is_screen_blocked);
        assert!(!ambiguous.is_valid);
    }

    #[test]
    fn test_path_heatmap_acceptance_rules() {
        let s = strategy("OMVBase_Base", MatchMode::Auto);
        assert!(s
            .validate_global_search(&raw(0.86, 0.0, 0.0, Point::default()))
            .is_some());
        assert!(s
            .validate_global_search(&raw(0.43, 0.05, 4.0, Point::default()))
            .is_some());
        assert!(s
            .validate_global_search(&raw(0.41, 0.06, 4.0, Point::default()))
            .is_some());
        assert!(s
            .validate_global_search(&raw(0.41, 0.04, 4.0, Point::default()))
            .is_none());
        assert!(s
            .validate_global_search(&raw(0.30, 0.10, 9.0, Point::default()))
            .is_none());
    }

    #[test]
    fn test_path_heatmap_hold_vs_blocked() {
        let s = strategy("OMVBase_Base", MatchMode::Auto);
        let rect = Rect::new(0, 0, 200, 200);
        // hold-worthy: ambiguous but not contradicted
        let hold = s.validate_tracking(
            &raw(0.36, 0.01, 4.5, Point::new(40, 40)),
            Duration::from_millis(100),
            None,
            rect,
            20,
            20,
        );
        assert!(!hold.is_valid);
        assert!(!hold.is_screen_blocked);

        let blocked = s.validate_tracking(
            &raw(0.20, 0.01, 2.0, Point::new(40, 40)),
            Duration::from_millis(100),
            None,
            rect,
            20,
            20,
        );
        assert!(blocked.is_screen_blocked);
    }

    #[test]
    fn test_path_heatmap_highlights_road_color() {
        let mut img = Mat::new_rows_cols_with_default(
            40,
            40,
            CV_8UC3,
            Scalar::new(30.0, 80.0, 30.0, 0.0),
        )
        .unwrap();
        imgproc::rectangle(
            &mut img,
            Rect::new(10, 16, 20, 8),
            Scalar::new(237.0, 233.0, 228.0, 0.0),
            imgproc::FILLED,
            imgproc::LINE_8,
            0,
        )
        .unwrap();
        let heat = extract_path_heatmap(&img).unwrap();
        let on_road = *heat.at_2d::<u8>(20, 20).unwrap();
        let off_road = *heat.at_2d::<u8>(5, 5).unwrap();
        assert!(on_road > 200, "road pixel heat = {}", on_road);
        assert_eq!(off_road, 0);
    }

    #[test]
    fn test_path_heatmap_skips_transparent_pixels() {
        let img = Mat::new_rows_cols_with_default(
            20,
            20,
            CV_8UC4,
            Scalar::new(237.0, 233.0, 228.0, 0.0),
        )
        .unwrap();
        let heat = extract_path_heatmap(&img).unwrap();
        assert_eq!(opencv::core::count_non_zero(&heat).unwrap(), 0);
    }

    #[test]
    fn test_standard_template_feature_fills_transparent_region() {
        let mut img = Mat::new_rows_cols_with_default(
            118,
            118,
            CV_8UC4,
            Scalar::new(0.0, 0.0, 0.0, 0.0),
        )
        .unwrap();
        imgproc::circle(
            &mut img,
            Point::new(59, 59),
            55,
            Scalar::new(120.0, 120.0, 120.0, 255.0),
            imgproc::FILLED,
            imgproc::LINE_8,
            0,
        )
        .unwrap();
        let s = strategy("Region2_Base", MatchMode::Auto);
        let feat = s.extract_template_feature(&img).unwrap();
        assert_eq!(feat.image.channels(), 3);
        assert_eq!(feat.mask.size().unwrap(), feat.image.size().unwrap());
        // the transparent corner is filled with the valid-region mean
        let corner = *feat.image.at_2d::<Vec3b>(1, 1).unwrap();
        assert!((corner[0] as i32 - 120).abs() <= 2, "corner = {:?}", corner);
        // and masked out of the match
        assert_eq!(*feat.mask.at_2d::<u8>(1, 1).unwrap(), 0);
    }
}
