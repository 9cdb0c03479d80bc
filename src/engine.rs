//! Locator engine: orchestrates one `locate()` call end to end.
//! Async-classifier maintenance, the tracking attempt with chamfer
//! rescue and hold, dual-mode verification, and the multi-scale global
//! search fallback all live here.

use crate::classifier::ZoneClassifier;
use crate::error::Result;
use crate::image_ops::{
    clip_rect, core_match, infer_yellow_arrow_rotation, to_gray, MatchResultRaw,
};
use crate::motion_tracker::MotionTracker;
use crate::strategy::{MatchFeature, MatchMode, MatchStrategy};
use crate::types::{
    ImageProcessingConfig, LocateOptions, LocateResult, LocateStatus, LocatorConfig, MapPosition,
    MatchConfig, TrackingConfig,
};
use crate::zone_store::ZoneMapStore;
use crossbeam::channel::{bounded, Receiver, TryRecvError};
use log::{info, warn};
use opencv::{
    core::{self, Mat, Point, Rect, Scalar, Size},
    imgproc,
    prelude::*,
};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Lost-frame budget for path-heatmap zones, which tolerate longer
/// occlusions than the per-call option allows.
const PATH_HEATMAP_MAX_LOST: i32 = 10;

const CHAMFER_ACCEPT_DIST: f64 = 4.5;
const DUAL_MODE_TRACK_DIST: f64 = 2.0;
const DUAL_MODE_GLOBAL_DIST: f64 = 5.0;
const CLASSIFIER_RESUBMIT_SECS: u64 = 3;

struct AsyncZoneTask {
    rx: Receiver<String>,
    handle: JoinHandle<()>,
}

/// Result of one tracking attempt: the accepted (or held) position,
/// the raw best-match coordinates regardless of validation, and the
/// screen-blocked bit for status mapping.
#[derive(Default)]
struct TrackOutcome {
    accepted: Option<MapPosition>,
    raw: MapPosition,
    screen_blocked: bool,
}

#[derive(Debug, Clone, Copy)]
struct CoarseCandidate {
    scale: f64,
    score: f64,
    loc: Point,
}

struct FineResult {
    score: f64,
    scale: f64,
    res: MatchResultRaw,
    rect: Rect,
    templ_cols: i32,
    templ_rows: i32,
}

pub struct LocatorEngine {
    zones: ZoneMapStore,
    current_zone_id: String,
    tracker: MotionTracker,
    classifier: Option<Arc<Mutex<ZoneClassifier>>>,
    async_task: Option<AsyncZoneTask>,
    last_classifier_submit: Option<Instant>,
    tracking_cfg: TrackingConfig,
    match_cfg: MatchConfig,
    base_img_cfg: ImageProcessingConfig,
    tier_img_cfg: ImageProcessingConfig,
}

fn lock_classifier(c: &Arc<Mutex<ZoneClassifier>>) -> MutexGuard<'_, ZoneClassifier> {
    c.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl LocatorEngine {
    pub fn new(config: &LocatorConfig) -> Result<Self> {
        let zones = ZoneMapStore::load(Path::new(&config.map_resource_dir))?;
        info!("Zone store ready: {} maps", zones.len());

        let tracking_cfg = TrackingConfig::default();
        let match_cfg = MatchConfig::default();

        let classifier = if config.model_path.is_empty() {
            None
        } else {
            match ZoneClassifier::new(Path::new(&config.model_path), match_cfg.yolo_conf_threshold)
            {
                Ok(c) => Some(Arc::new(Mutex::new(c))),
                Err(e) => {
                    warn!("Zone classifier disabled: {}", e);
                    None
                }
            }
        };

        Ok(Self {
            zones,
            current_zone_id: String::new(),
            tracker: MotionTracker::new(tracking_cfg),
            classifier,
            async_task: None,
            last_classifier_submit: None,
            tracking_cfg,
            match_cfg,
            base_img_cfg: ImageProcessingConfig::base_preset(),
            tier_img_cfg: ImageProcessingConfig::tier_preset(),
        })
    }

    pub fn locate(&mut self, minimap: &Mat, options: &LocateOptions) -> LocateResult {
        let now = Instant::now();
        match self.locate_inner(minimap, options, now) {
            Ok(result) => result,
            Err(e) => LocateResult::failure(
                LocateStatus::TrackingLost,
                format!("Internal error: {}", e),
            ),
        }
    }

    pub fn reset_tracking_state(&mut self) {
        self.tracker.force_lost();
        self.current_zone_id.clear();
    }

    pub fn last_known_pos(&self) -> Option<MapPosition> {
        self.tracker.last_pos().cloned()
    }

    pub fn current_zone_id(&self) -> &str {
        &self.current_zone_id
    }

    pub fn velocity(&self) -> (f64, f64) {
        (self.tracker.velocity_x(), self.tracker.velocity_y())
    }

    fn make_strategy(&self, zone_id: &str, mode: MatchMode) -> MatchStrategy {
        MatchStrategy::for_zone(
            zone_id,
            &self.tracking_cfg,
            &self.match_cfg,
            &self.base_img_cfg,
            &self.tier_img_cfg,
            mode,
        )
    }

    fn locate_inner(
        &mut self,
        minimap: &Mat,
        options: &LocateOptions,
        now: Instant,
    ) -> Result<LocateResult> {
        self.match_cfg.pass_threshold = options.min_score_threshold;
        self.match_cfg.yolo_conf_threshold = options.yolo_conf_threshold;
        if let Some(c) = &self.classifier {
            lock_classifier(c).set_conf_threshold(options.yolo_conf_threshold);
        }

        let mut tracking_screen_blocked = false;

        if !options.force_global_search {
            self.poll_async_classifier();
            self.maybe_submit_async_classifier(minimap, now);

            let is_native_path_heatmap =
                !self.current_zone_id.is_empty() && self.current_zone_id.contains("OMVBase");

            if !self.current_zone_id.is_empty() {
                let zone_id = self.current_zone_id.clone();
                let strategy = self.make_strategy(&zone_id, MatchMode::Auto);
                let tmpl_feat = strategy.extract_template_feature(minimap)?;
                let outcome = self.try_tracking(&tmpl_feat, &strategy, now, options)?;

                if let Some(mut pos) = outcome.accepted {
                    pos.heading = infer_yellow_arrow_rotation(minimap).unwrap_or(-1.0);
                    return Ok(LocateResult {
                        status: LocateStatus::Success,
                        position: Some(pos),
                        message: "Tracking Success".to_string(),
                    });
                }
                tracking_screen_blocked = outcome.screen_blocked;

                if !is_native_path_heatmap && outcome.raw.score > 0.1 {
                    let fb_strategy = self.make_strategy(&zone_id, MatchMode::ForcePathHeatmap);
                    let fb_tmpl = fb_strategy.extract_template_feature(minimap)?;
                    let fb_outcome = self.try_tracking(&fb_tmpl, &fb_strategy, now, options)?;

                    let dist = ((outcome.raw.x - fb_outcome.raw.x).powi(2)
                        + (outcome.raw.y - fb_outcome.raw.y).powi(2))
                    .sqrt();

                    if fb_outcome.raw.score > 0.1 && dist <= DUAL_MODE_TRACK_DIST {
                        info!("Dual-mode tracking verified, coords matched, dist {:.2}", dist);
                        let mut verified = outcome.raw.clone();
                        verified.score = outcome.raw.score.max(fb_outcome.raw.score);
                        self.tracker.update(verified.clone(), now);
                        verified.heading = infer_yellow_arrow_rotation(minimap).unwrap_or(-1.0);
                        return Ok(LocateResult {
                            status: LocateStatus::Success,
                            position: Some(verified),
                            message: "Dual-Mode Tracking Success".to_string(),
                        });
                    }
                }
            }
        }

        // Global search. Prior knowledge wins over the classifier.
        let mut target_zone_id = options.expected_zone_id.clone();
        if target_zone_id.is_empty() {
            target_zone_id = match &self.classifier {
                Some(c) => lock_classifier(c).predict_zone(minimap),
                None => String::new(),
            };
        }

        if target_zone_id.is_empty() {
            return Ok(LocateResult::failure(
                LocateStatus::YoloFailed,
                "YOLO inference failed or no result.",
            ));
        }
        if target_zone_id == "None" {
            info!("Classifier identified 'None', assuming UI occlusion");
            if let Some(last) = self.tracker.last_pos().cloned() {
                self.tracker.hold(last, now);
            }
            let none_pos = MapPosition {
                zone_id: "None".to_string(),
                score: 1.0,
                ..Default::default()
            };
            return Ok(LocateResult {
                status: LocateStatus::Success,
                position: Some(none_pos),
                message: "Occluded by UI (None)".to_string(),
            });
        }

        let is_native_path_heatmap = target_zone_id.contains("OMVBase");
        let strategy = self.make_strategy(&target_zone_id, MatchMode::Auto);
        let tmpl_feat = strategy.extract_template_feature(minimap)?;

        let (mut global_result, raw_primary) =
            self.try_global_search(&tmpl_feat, &strategy, &target_zone_id)?;

        if global_result.is_none() && !is_native_path_heatmap && raw_primary.score > 0.1 {
            let fb_strategy = self.make_strategy(&target_zone_id, MatchMode::ForcePathHeatmap);
            let fb_tmpl = fb_strategy.extract_template_feature(minimap)?;
            let (_, raw_fallback) =
                self.try_global_search(&fb_tmpl, &fb_strategy, &target_zone_id)?;

            let dist = ((raw_primary.x - raw_fallback.x).powi(2)
                + (raw_primary.y - raw_fallback.y).powi(2))
            .sqrt();
            if raw_fallback.score > 0.1 && dist <= DUAL_MODE_GLOBAL_DIST {
                info!("Dual-mode global search verified, dist {:.2}", dist);
                let mut verified = raw_primary.clone();
                verified.score = raw_primary.score.max(raw_fallback.score);
                global_result = Some(verified);
            }
        }

        let max_allowed_lost = if target_zone_id.contains("OMVBase") {
            PATH_HEATMAP_MAX_LOST
        } else {
            options.max_lost_frames
        };

        let Some(mut global_pos) = global_result else {
            self.tracker.mark_lost();
            if self.tracker.lost_count() > max_allowed_lost {
                self.tracker.force_lost();
            }
            return Ok(if tracking_screen_blocked {
                LocateResult::failure(
                    LocateStatus::ScreenBlocked,
                    "Screen blocked and global search failed.",
                )
            } else {
                LocateResult::failure(LocateStatus::TrackingLost, "Global search failed.")
            });
        };

        if self.current_zone_id != global_pos.zone_id {
            self.tracker.clear_velocity();
        }
        self.current_zone_id = global_pos.zone_id.clone();
        global_pos.heading = infer_yellow_arrow_rotation(minimap).unwrap_or(-1.0);
        self.tracker.update(global_pos.clone(), now);

        Ok(LocateResult {
            status: LocateStatus::Success,
            position: Some(global_pos),
            message: "Global Search Success".to_string(),
        })
    }

    /// One constrained match inside the predicted search window.
    fn try_tracking(
        &mut self,
        tmpl: &MatchFeature,
        strategy: &MatchStrategy,
        now: Instant,
        options: &LocateOptions,
    ) -> Result<TrackOutcome> {
        let mut outcome = TrackOutcome::default();

        let max_allowed_lost = if self.current_zone_id.contains("OMVBase") {
            PATH_HEATMAP_MAX_LOST
        } else {
            options.max_lost_frames
        };
        if self.current_zone_id.is_empty() || !self.tracker.is_tracking(max_allowed_lost) {
            return Ok(outcome);
        }
        let Some(zone_map) = self.zones.get(&self.current_zone_id) else {
            return Ok(outcome);
        };

        let dt = now.duration_since(self.tracker.last_time());
        let mut track_scale = self.tracker.last_pos().map_or(1.0, |p| p.scale);
        if track_scale <= 0.0 {
            track_scale = 1.0;
        }

        let search_rect = self.tracker.predict_next_search_rect(
            track_scale,
            tmpl.image.cols(),
            tmpl.image.rows(),
            now,
        );

        // carve the haystack, zero-padding whatever falls off the map
        let mut search_roi = Mat::new_rows_cols_with_default(
            search_rect.height,
            search_rect.width,
            zone_map.typ(),
            Scalar::all(0.0),
        )?;
        let map_bounds = Rect::new(0, 0, zone_map.cols(), zone_map.rows());
        let valid = clip_rect(search_rect, map_bounds);
        if valid.width > 0 && valid.height > 0 {
            let src = Mat::roi(zone_map, valid)?;
            let dst_rect = Rect::new(
                valid.x - search_rect.x,
                valid.y - search_rect.y,
                valid.width,
                valid.height,
            );
            let mut dst = Mat::roi_mut(&mut search_roi, dst_rect)?;
            src.copy_to(&mut dst)?;
        }

        let search_feature = strategy.extract_search_feature(&search_roi)?;
        let (scaled_templ, scaled_mask) = scale_feature(&tmpl.image, &tmpl.mask, track_scale)?;

        let Some(mut track_result) = core_match(
            &search_feature,
            &scaled_templ,
            &scaled_mask,
            self.match_cfg.blur_size,
        )?
        else {
            info!("try_tracking: core match produced no result");
            return Ok(outcome);
        };

        info!(
            "try_tracking NCC={:.4} PSR={:.2} delta={:.4} second={:.4} scale={:.2}",
            track_result.score,
            track_result.psr,
            track_result.delta,
            track_result.second_score,
            track_scale
        );

        let mut validation = strategy.validate_tracking(
            &track_result,
            dt,
            self.tracker.last_pos(),
            search_rect,
            scaled_templ.cols(),
            scaled_templ.rows(),
        );

        outcome.raw = MapPosition {
            zone_id: self.current_zone_id.clone(),
            x: validation.abs_x,
            y: validation.abs_y,
            score: track_result.score,
            scale: track_scale,
            ..Default::default()
        };

        let mut only_ambiguous = !validation.is_screen_blocked
            && !validation.is_edge_snapped
            && !validation.is_teleported;

        if !validation.is_valid && strategy.needs_chamfer_compensation() {
            let mean_dist = chamfer_mean_distance(
                &tmpl.templ_raw,
                &scaled_mask,
                &search_roi,
                track_result.loc,
                track_scale,
            )?;
            info!("Chamfer mean distance: {:.2}", mean_dist);
            if mean_dist < CHAMFER_ACCEPT_DIST {
                validation.is_valid = true;
                validation.is_screen_blocked = false;
                only_ambiguous = false;
                track_result.score = track_result.score.max(0.43);
            }
        }

        if only_ambiguous && self.tracker.is_tracking(max_allowed_lost) && !validation.is_valid {
            if let Some(mut hold) = self.tracker.last_pos().cloned() {
                hold.score = track_result.score;
                hold.scale = track_scale;
                self.tracker.hold(hold.clone(), now);
                info!(
                    "Tracking ambiguous -> hold last pos. NCC={:.4} PSR={:.2} delta={:.4}",
                    track_result.score, track_result.psr, track_result.delta
                );
                outcome.accepted = Some(hold);
                return Ok(outcome);
            }
        }

        if !validation.is_valid {
            outcome.screen_blocked = validation.is_screen_blocked;
            return Ok(outcome);
        }

        let pos = MapPosition {
            zone_id: self.current_zone_id.clone(),
            x: validation.abs_x,
            y: validation.abs_y,
            score: track_result.score,
            scale: track_scale,
            ..Default::default()
        };
        self.tracker.update(pos.clone(), now);
        outcome.accepted = Some(pos);
        Ok(outcome)
    }

    /// Multi-scale coarse/fine search across the whole haystack.
    fn try_global_search(
        &mut self,
        tmpl: &MatchFeature,
        strategy: &MatchStrategy,
        target_zone_id: &str,
    ) -> Result<(Option<MapPosition>, MapPosition)> {
        let mut raw = MapPosition::default();

        if target_zone_id.is_empty() {
            info!("Global search aborted: no target zone");
            return Ok((None, raw));
        }
        let Some(big_map) = self.zones.get(target_zone_id) else {
            info!(
                "Global search aborted: predicted zone '{}' is not loaded",
                target_zone_id
            );
            return Ok((None, raw));
        };

        let coarse_scale = self.match_cfg.coarse_scale;
        let mut small_map = Mat::default();
        imgproc::resize(
            big_map,
            &mut small_map,
            Size::new(0, 0),
            coarse_scale,
            coarse_scale,
            imgproc::INTER_AREA,
        )?;

        let coarse_feat = strategy.extract_search_feature(&small_map)?;
        let mut map_to_use = to_gray(&coarse_feat)?;
        if self.match_cfg.blur_size > 0 && !strategy.needs_chamfer_compensation() {
            let mut blurred = Mat::default();
            imgproc::gaussian_blur_def(
                &map_to_use,
                &mut blurred,
                Size::new(self.match_cfg.blur_size, self.match_cfg.blur_size),
                0.0,
            )?;
            map_to_use = blurred;
        }
        let templ_gray = to_gray(&tmpl.image)?;

        const TOP_K: usize = 8;
        let mut cands = Vec::new();
        for i in 0..11 {
            let s = 0.90 + 0.02 * i as f64;
            cands.extend(coarse_candidates_at_scale(
                &map_to_use,
                &templ_gray,
                &tmpl.mask,
                coarse_scale,
                s,
            )?);
        }
        if cands.is_empty() {
            return Ok((None, raw));
        }
        cands.sort_by(|a, b| b.score.total_cmp(&a.score));
        cands.truncate(TOP_K);

        let mut best: Option<FineResult> = None;
        let mut fallback: Option<FineResult> = None;
        let search_radius = self.match_cfg.fine_search_radius;
        let map_bounds = Rect::new(0, 0, big_map.cols(), big_map.rows());

        for cand in &cands {
            let coarse_x = (cand.loc.x as f64 / coarse_scale) as i32;
            let coarse_y = (cand.loc.y as f64 / coarse_scale) as i32;

            let (scaled_templ, scaled_mask) = scale_feature(&tmpl.image, &tmpl.mask, cand.scale)?;
            let fine_rect = Rect::new(
                coarse_x - search_radius,
                coarse_y - search_radius,
                scaled_templ.cols() + search_radius * 2,
                scaled_templ.rows() + search_radius * 2,
            );
            let valid_fine = clip_rect(fine_rect, map_bounds);
            if valid_fine.width == 0 || valid_fine.height == 0 {
                continue;
            }

            let fine_map = Mat::roi(big_map, valid_fine)?;
            let fine_feat = strategy.extract_search_feature(&fine_map)?;
            let Some(fine_res) = core_match(
                &fine_feat,
                &scaled_templ,
                &scaled_mask,
                self.match_cfg.blur_size,
            )?
            else {
                continue;
            };

            if fine_res.score > fallback.as_ref().map_or(-1.0, |f| f.score) {
                fallback = Some(FineResult {
                    score: fine_res.score,
                    scale: cand.scale,
                    res: fine_res.clone(),
                    rect: valid_fine,
                    templ_cols: scaled_templ.cols(),
                    templ_rows: scaled_templ.rows(),
                });
            }

            let ambiguous = if strategy.needs_chamfer_compensation() {
                let weak = fine_res.psr < 6.0 || fine_res.delta < 0.04;
                fine_res.score < 0.45 && weak
            } else {
                let low_score_cut = if target_zone_id.contains("Base") {
                    0.85
                } else {
                    0.75
                };
                fine_res.score < low_score_cut && (fine_res.psr < 6.0 || fine_res.delta < 0.02)
            };
            if ambiguous {
                continue;
            }

            if fine_res.score > best.as_ref().map_or(-1.0, |b| b.score) {
                best = Some(FineResult {
                    score: fine_res.score,
                    scale: cand.scale,
                    res: fine_res,
                    rect: valid_fine,
                    templ_cols: scaled_templ.cols(),
                    templ_rows: scaled_templ.rows(),
                });
            }
        }

        let chosen = match best {
            Some(b) => b,
            None => match fallback {
                Some(f) => {
                    info!(
                        "Global search: all candidates ambiguous, using fallback (score {:.3})",
                        f.score
                    );
                    f
                }
                None => return Ok((None, raw)),
            },
        };

        let abs_left = chosen.rect.x as f64 + chosen.res.loc.x as f64;
        let abs_top = chosen.rect.y as f64 + chosen.res.loc.y as f64;
        raw = MapPosition {
            zone_id: target_zone_id.to_string(),
            x: abs_left + chosen.templ_cols as f64 / 2.0,
            y: abs_top + chosen.templ_rows as f64 / 2.0,
            score: chosen.score,
            scale: chosen.scale,
            ..Default::default()
        };

        let Some(final_score) = strategy.validate_global_search(&chosen.res) else {
            info!(
                "Global rejected. Score too low: s={:.3} d={:.3} p={:.2}",
                chosen.res.score, chosen.res.delta, chosen.res.psr
            );
            return Ok((None, raw));
        };

        let pos = MapPosition {
            zone_id: target_zone_id.to_string(),
            x: abs_left + chosen.templ_cols as f64 / 2.0,
            y: abs_top + chosen.templ_rows as f64 / 2.0,
            score: final_score,
            scale: chosen.scale,
            ..Default::default()
        };
        Ok((Some(pos), raw))
    }

    /// Consume a finished async classifier task; a zone change detected
    /// mid-tracking force-loses the tracker.
    fn poll_async_classifier(&mut self) {
        let Some(task) = &self.async_task else {
            return;
        };
        match task.rx.try_recv() {
            Ok(predicted) => {
                if let Some(done) = self.async_task.take() {
                    let _ = done.handle.join();
                }
                if !predicted.is_empty()
                    && !self.current_zone_id.is_empty()
                    && predicted != self.current_zone_id
                {
                    info!(
                        "Async classifier detected zone change: {} -> {}",
                        self.current_zone_id, predicted
                    );
                    self.tracker.force_lost();
                }
            }
            Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Disconnected) => {
                if let Some(dead) = self.async_task.take() {
                    let _ = dead.handle.join();
                }
            }
        }
    }

    /// Submit a new background prediction, at most one in flight and at
    /// most once per three seconds. The task owns a deep snapshot so
    /// the caller may reuse its buffer.
    fn maybe_submit_async_classifier(&mut self, minimap: &Mat, now: Instant) {
        if self.async_task.is_some() {
            return;
        }
        let ready = self
            .last_classifier_submit
            .map_or(true, |t| now.duration_since(t) >= Duration::from_secs(CLASSIFIER_RESUBMIT_SECS));
        if !ready {
            return;
        }
        let Some(classifier) = &self.classifier else {
            return;
        };
        let Ok(snapshot) = minimap.try_clone() else {
            return;
        };

        self.last_classifier_submit = Some(now);
        let (tx, rx) = bounded(1);
        let classifier = Arc::clone(classifier);
        let handle = std::thread::spawn(move || {
            let zone = lock_classifier(&classifier).predict_zone(&snapshot);
            let _ = tx.send(zone);
        });
        self.async_task = Some(AsyncZoneTask { rx, handle });
    }
}

impl Drop for LocatorEngine {
    fn drop(&mut self) {
        if let Some(task) = self.async_task.take() {
            let _ = task.handle.join();
        }
    }
}

fn scale_feature(image: &Mat, mask: &Mat, scale: f64) -> Result<(Mat, Mat)> {
    if (scale - 1.0).abs() <= 0.001 {
        return Ok((image.try_clone()?, mask.try_clone()?));
    }
    let mut scaled_image = Mat::default();
    imgproc::resize(
        image,
        &mut scaled_image,
        Size::new(0, 0),
        scale,
        scale,
        imgproc::INTER_LINEAR,
    )?;
    let mut scaled_mask = Mat::default();
    imgproc::resize(
        mask,
        &mut scaled_mask,
        Size::new(0, 0),
        scale,
        scale,
        imgproc::INTER_NEAREST,
    )?;
    Ok((scaled_image, scaled_mask))
}

/// Top-3 non-overlapping coarse peaks for one template scale.
fn coarse_candidates_at_scale(
    map_to_use: &Mat,
    templ_gray: &Mat,
    templ_mask: &Mat,
    coarse_scale: f64,
    s: f64,
) -> Result<Vec<CoarseCandidate>> {
    const TOP_N_PER_SCALE: usize = 3;
    const COARSE_MIN: f64 = 0.20;

    let current_scale = coarse_scale * s;
    let mut small_templ = Mat::default();
    imgproc::resize(
        templ_gray,
        &mut small_templ,
        Size::new(0, 0),
        current_scale,
        current_scale,
        imgproc::INTER_LINEAR,
    )?;
    let mut small_mask = Mat::default();
    imgproc::resize(
        templ_mask,
        &mut small_mask,
        Size::new(0, 0),
        current_scale,
        current_scale,
        imgproc::INTER_NEAREST,
    )?;

    if core::count_non_zero(&small_mask)? < 5 {
        return Ok(Vec::new());
    }
    if map_to_use.rows() < small_templ.rows() || map_to_use.cols() < small_templ.cols() {
        return Ok(Vec::new());
    }

    let mut response = Mat::default();
    if imgproc::match_template(
        map_to_use,
        &small_templ,
        &mut response,
        imgproc::TM_CCOEFF_NORMED,
        &small_mask,
    )
    .is_err()
    {
        return Ok(Vec::new());
    }
    {
        let data = response.data_typed_mut::<f32>()?;
        for v in data.iter_mut() {
            if !v.is_finite() {
                *v = -1.0;
            }
        }
    }

    let sr = 4.max(small_templ.cols().min(small_templ.rows()) / 2);
    let bounds = Rect::new(0, 0, response.cols(), response.rows());
    let mut cands = Vec::new();

    for _ in 0..TOP_N_PER_SCALE {
        let mut max_val = 0.0f64;
        let mut max_loc = Point::default();
        core::min_max_loc(
            &response,
            None,
            Some(&mut max_val),
            None,
            Some(&mut max_loc),
            &core::no_array(),
        )?;
        if !max_val.is_finite() || max_val < COARSE_MIN {
            break;
        }
        cands.push(CoarseCandidate {
            scale: s,
            score: max_val,
            loc: max_loc,
        });

        let sup = clip_rect(
            Rect::new(max_loc.x - sr, max_loc.y - sr, sr * 2 + 1, sr * 2 + 1),
            bounds,
        );
        let mut suppressed = Mat::roi_mut(&mut response, sup)?;
        suppressed.set_to(&Scalar::all(-2.0), &core::no_array())?;
    }

    Ok(cands)
}

/// Mean of the patch's edge distance transform sampled under the
/// template's edges; small means the road skeletons line up even when
/// the NCC score collapsed.
fn chamfer_mean_distance(
    templ_raw: &Mat,
    scaled_mask: &Mat,
    search_roi: &Mat,
    loc: Point,
    track_scale: f64,
) -> Result<f64> {
    let bgr_templ = if (track_scale - 1.0).abs() > 0.001 {
        let mut scaled = Mat::default();
        imgproc::resize(
            templ_raw,
            &mut scaled,
            Size::new(0, 0),
            track_scale,
            track_scale,
            imgproc::INTER_LINEAR,
        )?;
        scaled
    } else {
        templ_raw.try_clone()?
    };

    let templ_gray = to_gray(&bgr_templ)?;
    let mut templ_edge = Mat::default();
    imgproc::canny(&templ_gray, &mut templ_edge, 100.0, 200.0, 3, false)?;
    let mut masked_edge = Mat::default();
    core::bitwise_and_def(&templ_edge, scaled_mask, &mut masked_edge)?;

    let matched_rect = clip_rect(
        Rect::new(loc.x, loc.y, bgr_templ.cols(), bgr_templ.rows()),
        Rect::new(0, 0, search_roi.cols(), search_roi.rows()),
    );
    if matched_rect.width == 0 || matched_rect.height == 0 {
        return Ok(f64::MAX);
    }

    let patch = Mat::roi(search_roi, matched_rect)?;
    let patch_gray = to_gray(&patch)?;
    let mut patch_edge = Mat::default();
    imgproc::canny(&patch_gray, &mut patch_edge, 100.0, 200.0, 3, false)?;

    let mut patch_edge_inv = Mat::default();
    core::bitwise_not_def(&patch_edge, &mut patch_edge_inv)?;
    let mut dist = Mat::default();
    imgproc::distance_transform(
        &patch_edge_inv,
        &mut dist,
        imgproc::DIST_L2,
        3,
        core::CV_32F,
    )?;

    let edge_window = Mat::roi(
        &masked_edge,
        Rect::new(0, 0, matched_rect.width, matched_rect.height),
    )?;
    Ok(core::mean(&dist, &edge_window)?[0])
}
