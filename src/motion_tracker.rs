//! Motion tracker: last known position, EMA-smoothed velocity, lost
//! frame counting, and the velocity-predicted search window.

use crate::types::{MapPosition, TrackingConfig, MAX_LOST_TRACKING_COUNT, MOBILE_SEARCH_RADIUS};
use opencv::core::Rect;
use std::time::Instant;

pub struct MotionTracker {
    cfg: TrackingConfig,
    last_known_pos: Option<MapPosition>,
    lost_count: i32,
    velocity_x: f64,
    velocity_y: f64,
    last_time: Instant,
}

impl MotionTracker {
    pub fn new(cfg: TrackingConfig) -> Self {
        Self {
            cfg,
            last_known_pos: None,
            // born lost
            lost_count: MAX_LOST_TRACKING_COUNT + 1,
            velocity_x: 0.0,
            velocity_y: 0.0,
            last_time: Instant::now(),
        }
    }

    /// Accept a confirmed position. Velocity is re-estimated only when
    /// the previous frame was also live and the interval is a plausible
    /// frame gap, rejecting frame-rate outliers.
    pub fn update(&mut self, new_pos: MapPosition, now: Instant) {
        if let Some(last) = &self.last_known_pos {
            if self.lost_count == 0 {
                let dt_sec = now.duration_since(self.last_time).as_secs_f64();
                if dt_sec > 0.016 && dt_sec < self.cfg.max_dt_for_prediction {
                    let raw_vx = (new_pos.x - last.x) / dt_sec;
                    let raw_vy = (new_pos.y - last.y) / dt_sec;
                    let alpha = self.cfg.velocity_smoothing_alpha;
                    self.velocity_x = self.velocity_x * (1.0 - alpha) + raw_vx * alpha;
                    self.velocity_y = self.velocity_y * (1.0 - alpha) + raw_vy * alpha;
                }
            }
        }
        self.last_known_pos = Some(new_pos);
        self.last_time = now;
        self.lost_count = 0;
    }

    /// Keep the previous position across an ambiguous frame.
    pub fn hold(&mut self, old_pos: MapPosition, now: Instant) {
        self.last_known_pos = Some(old_pos);
        self.last_time = now;
        self.lost_count += 1;
    }

    pub fn mark_lost(&mut self) {
        self.lost_count += 1;
    }

    /// Drop the position entirely; used on zone change and reset.
    pub fn force_lost(&mut self) {
        self.lost_count = MAX_LOST_TRACKING_COUNT + 100;
        self.last_known_pos = None;
    }

    pub fn is_tracking(&self, max_allowed_lost: i32) -> bool {
        self.last_known_pos.is_some() && self.lost_count <= max_allowed_lost
    }

    pub fn last_pos(&self) -> Option<&MapPosition> {
        self.last_known_pos.as_ref()
    }

    pub fn lost_count(&self) -> i32 {
        self.lost_count
    }

    pub fn last_time(&self) -> Instant {
        self.last_time
    }

    pub fn velocity_x(&self) -> f64 {
        self.velocity_x
    }

    pub fn velocity_y(&self) -> f64 {
        self.velocity_y
    }

    /// Cold-restart the motion model without dropping the position.
    pub fn clear_velocity(&mut self) {
        self.velocity_x = 0.0;
        self.velocity_y = 0.0;
    }

    pub fn predicted_x(&self, now: Instant) -> f64 {
        let Some(last) = &self.last_known_pos else {
            return 0.0;
        };
        let dt_sec = now.duration_since(self.last_time).as_secs_f64();
        if dt_sec > self.cfg.max_dt_for_prediction {
            return last.x;
        }
        last.x + self.velocity_x * dt_sec
    }

    pub fn predicted_y(&self, now: Instant) -> f64 {
        let Some(last) = &self.last_known_pos else {
            return 0.0;
        };
        let dt_sec = now.duration_since(self.last_time).as_secs_f64();
        if dt_sec > self.cfg.max_dt_for_prediction {
            return last.y;
        }
        last.y + self.velocity_y * dt_sec
    }

    /// Square search window centered on the velocity-predicted position.
    pub fn predict_next_search_rect(
        &self,
        track_scale: f64,
        templ_cols: i32,
        templ_rows: i32,
        now: Instant,
    ) -> Rect {
        let pred_x = self.predicted_x(now);
        let pred_y = self.predicted_y(now);
        let pad =
            (MOBILE_SEARCH_RADIUS + templ_cols.max(templ_rows) as f64 * track_scale / 2.0) as i32;
        Rect::new(pred_x as i32 - pad, pred_y as i32 - pad, pad * 2, pad * 2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::time::Duration;

    fn pos(x: f64, y: f64) -> MapPosition {
        MapPosition {
            zone_id: "Region2_Base".to_string(),
            x,
            y,
            score: 0.9,
            scale: 1.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_starts_lost() {
        let tracker = MotionTracker::new(TrackingConfig::default());
        assert!(!tracker.is_tracking(MAX_LOST_TRACKING_COUNT));
        assert!(tracker.last_pos().is_none());
    }

    #[test]
    fn test_update_resets_lost_count_and_smooths_velocity() {
        let mut tracker = MotionTracker::new(TrackingConfig::default());
        let t0 = Instant::now();
        tracker.update(pos(100.0, 100.0), t0);
        assert!(tracker.is_tracking(3));
        assert_eq!(tracker.lost_count(), 0);
        // first update never produces velocity
        assert_eq!(tracker.velocity_x(), 0.0);

        let t1 = t0 + Duration::from_millis(100);
        tracker.update(pos(103.0, 100.0), t1);
        // raw vx = 30 px/s, EMA alpha 0.5 from 0
        assert_abs_diff_eq!(tracker.velocity_x(), 15.0, epsilon = 1e-6);
        assert_abs_diff_eq!(tracker.velocity_y(), 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_velocity_rejects_outlier_intervals() {
        let mut tracker = MotionTracker::new(TrackingConfig::default());
        let t0 = Instant::now();
        tracker.update(pos(100.0, 100.0), t0);
        // 10 ms gap is below the trusted frame interval
        tracker.update(pos(101.0, 100.0), t0 + Duration::from_millis(10));
        assert_eq!(tracker.velocity_x(), 0.0);
        // 6 s gap exceeds max_dt_for_prediction
        tracker.update(pos(110.0, 100.0), t0 + Duration::from_secs(6));
        assert_eq!(tracker.velocity_x(), 0.0);
    }

    #[test]
    fn test_hold_preserves_position_and_counts_lost() {
        let mut tracker = MotionTracker::new(TrackingConfig::default());
        let t0 = Instant::now();
        tracker.update(pos(100.0, 100.0), t0);
        tracker.hold(pos(100.0, 100.0), t0 + Duration::from_millis(100));
        assert_eq!(tracker.lost_count(), 1);
        assert!(tracker.is_tracking(3));
        tracker.hold(pos(100.0, 100.0), t0 + Duration::from_millis(200));
        tracker.hold(pos(100.0, 100.0), t0 + Duration::from_millis(300));
        tracker.hold(pos(100.0, 100.0), t0 + Duration::from_millis(400));
        assert!(!tracker.is_tracking(3));
        assert!(tracker.last_pos().is_some());
    }

    #[test]
    fn test_force_lost_drops_position() {
        let mut tracker = MotionTracker::new(TrackingConfig::default());
        tracker.update(pos(100.0, 100.0), Instant::now());
        tracker.force_lost();
        assert!(!tracker.is_tracking(100));
        assert!(tracker.last_pos().is_none());
    }

    #[test]
    fn test_prediction_extrapolates_with_velocity() {
        let mut tracker = MotionTracker::new(TrackingConfig::default());
        let t0 = Instant::now();
        tracker.update(pos(100.0, 200.0), t0);
        let t1 = t0 + Duration::from_millis(100);
        tracker.update(pos(102.0, 200.0), t1);
        // velocity is now (10, 0) px/s
        let t2 = t1 + Duration::from_millis(500);
        assert_abs_diff_eq!(tracker.predicted_x(t2), 107.0, epsilon = 1e-6);
        assert_abs_diff_eq!(tracker.predicted_y(t2), 200.0, epsilon = 1e-6);
    }

    #[test]
    fn test_prediction_ignores_velocity_after_long_gap() {
        let mut tracker = MotionTracker::new(TrackingConfig::default());
        let t0 = Instant::now();
        tracker.update(pos(100.0, 200.0), t0);
        tracker.update(pos(102.0, 200.0), t0 + Duration::from_millis(100));
        let late = t0 + Duration::from_secs(10);
        assert_eq!(tracker.predicted_x(late), 102.0);
    }

    #[test]
    fn test_search_rect_geometry() {
        let mut tracker = MotionTracker::new(TrackingConfig::default());
        let t0 = Instant::now();
        tracker.update(pos(300.0, 400.0), t0);
        let rect = tracker.predict_next_search_rect(1.0, 118, 120, t0);
        // pad = 50 + 120/2 = 110
        assert_eq!(rect, Rect::new(190, 290, 220, 220));
    }
}
