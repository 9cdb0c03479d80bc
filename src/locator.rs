//! Public locator handle and the process-wide shared instance.

use crate::engine::LocatorEngine;
use crate::error::Result;
use crate::types::{LocateOptions, LocateResult, LocateStatus, LocatorConfig, MapPosition};
use log::info;
use opencv::core::Mat;
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

/// Thin handle over an owned engine instance.
///
/// Not safe for concurrent `locate()` calls; callers serialize.
pub struct MapLocator {
    engine: Option<LocatorEngine>,
}

impl MapLocator {
    pub fn new() -> Self {
        Self { engine: None }
    }

    /// Load maps and the classifier. Idempotent: a second call on an
    /// initialized locator is a no-op.
    pub fn initialize(&mut self, config: &LocatorConfig) -> Result<()> {
        if self.engine.is_some() {
            return Ok(());
        }
        self.engine = Some(LocatorEngine::new(config)?);
        info!("MapLocator initialized (maps: {})", config.map_resource_dir);
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.engine.is_some()
    }

    /// Locate the player on the known zone maps; stamps the wall-clock
    /// latency into the returned position.
    pub fn locate(&mut self, minimap: &Mat, options: &LocateOptions) -> LocateResult {
        let start = Instant::now();
        let mut result = match &mut self.engine {
            Some(engine) => engine.locate(minimap, options),
            None => LocateResult::failure(
                LocateStatus::NotInitialized,
                "MapLocator not initialized.",
            ),
        };
        if let Some(pos) = &mut result.position {
            pos.latency_ms = start.elapsed().as_millis() as i64;
        }
        result
    }

    /// Force the tracker lost and forget the current zone.
    pub fn reset_tracking_state(&mut self) {
        if let Some(engine) = &mut self.engine {
            engine.reset_tracking_state();
        }
    }

    pub fn get_last_known_pos(&self) -> Option<MapPosition> {
        self.engine.as_ref().and_then(|e| e.last_known_pos())
    }

    pub fn current_zone_id(&self) -> &str {
        self.engine.as_ref().map_or("", |e| e.current_zone_id())
    }

    /// Smoothed tracker velocity, px/s.
    pub fn velocity(&self) -> (f64, f64) {
        self.engine.as_ref().map_or((0.0, 0.0), |e| e.velocity())
    }
}

impl Default for MapLocator {
    fn default() -> Self {
        Self::new()
    }
}

static GLOBAL_LOCATOR: OnceLock<Mutex<MapLocator>> = OnceLock::new();

/// Initialize the process-wide shared locator. Must be called before
/// the recognition callback runs; nothing is constructed lazily on the
/// hot path.
pub fn init_global_locator(config: &LocatorConfig) -> Result<()> {
    let cell = GLOBAL_LOCATOR.get_or_init(|| Mutex::new(MapLocator::new()));
    let mut guard = cell.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    guard.initialize(config)
}

/// The shared locator, if `init_global_locator` created it.
pub fn global_locator() -> &'static Mutex<MapLocator> {
    GLOBAL_LOCATOR.get_or_init(|| Mutex::new(MapLocator::new()))
}
