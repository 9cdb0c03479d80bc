//! ONNX zone classifier with a JSON sidecar describing tensor names,
//! the ordered class list, and the class-prefix to region mapping.

use crate::error::{LocatorError, Result};
use crate::image_ops::to_bgr;
use log::{error, info};
use ndarray::Array4;
use opencv::{
    core::{self, Mat, Point, Rect, Scalar, Vec3b, CV_8UC1, CV_8UC3},
    imgproc,
    prelude::*,
};
use ort::{
    session::{builder::GraphOptimizationLevel, Session},
    value::TensorRef,
};
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

const INPUT_SIZE: i32 = 128;
/// Diameter of the minimap's live viewport inside the input canvas.
const MASK_DIAMETER: i32 = 106;

/// Sidecar metadata next to the model file (`<model>.json`).
#[derive(Debug, Deserialize)]
struct ModelMetadata {
    input_name: String,
    output_name: String,
    classes: Vec<String>,
    #[serde(default)]
    region_mapping: HashMap<String, String>,
}

/// Single-image zone classifier.
///
/// Inference is single-threaded; the engine wraps the classifier in a
/// mutex so synchronous and asynchronous callers serialize.
pub struct ZoneClassifier {
    session: Session,
    input_name: String,
    output_name: String,
    class_names: Vec<String>,
    region_mapping: HashMap<String, String>,
    conf_threshold: f64,
    layer_class_re: Regex,
}

impl ZoneClassifier {
    /// Load the model and its sidecar. A missing or malformed sidecar
    /// is an error; the caller treats it as "classifier disabled".
    pub fn new(model_path: &Path, conf_threshold: f64) -> Result<Self> {
        let session = Session::builder()
            .map_err(|e| LocatorError::model_load(e.to_string()))?
            .with_optimization_level(GraphOptimizationLevel::Level1)
            .map_err(|e| LocatorError::model_load(e.to_string()))?
            .with_intra_threads(1)
            .map_err(|e| LocatorError::model_load(e.to_string()))?
            .commit_from_file(model_path)
            .map_err(|e| LocatorError::model_load(format!("Failed to load model: {}", e)))?;

        let sidecar_path = model_path.with_extension("json");
        let sidecar = std::fs::read_to_string(&sidecar_path).map_err(|e| {
            LocatorError::config(format!("sidecar {} unreadable: {}", sidecar_path.display(), e))
        })?;
        let meta: ModelMetadata = serde_json::from_str(&sidecar)?;
        if meta.classes.is_empty() {
            return Err(LocatorError::config("sidecar lists no classes"));
        }

        info!(
            "Zone classifier loaded: {} classes, {} region mappings",
            meta.classes.len(),
            meta.region_mapping.len()
        );

        Ok(Self {
            session,
            input_name: meta.input_name,
            output_name: meta.output_name,
            class_names: meta.classes,
            region_mapping: meta.region_mapping,
            conf_threshold,
            layer_class_re: Regex::new(r"(Map\d+)Lv0*(\d+)Tier0*(\d+)").expect("class regex"),
        })
    }

    pub fn set_conf_threshold(&mut self, threshold: f64) {
        self.conf_threshold = threshold;
    }

    /// Predict the zone id for a minimap crop.
    ///
    /// Returns `"None"` when the classifier explicitly recognizes UI
    /// occlusion, the empty string on low confidence or any inference
    /// failure, and a translated zone id otherwise.
    pub fn predict_zone(&mut self, minimap: &Mat) -> String {
        match self.predict_zone_inner(minimap) {
            Ok(zone) => zone,
            Err(e) => {
                error!("Zone classifier inference failed: {}", e);
                String::new()
            }
        }
    }

    fn predict_zone_inner(&mut self, minimap: &Mat) -> Result<String> {
        if minimap.empty() {
            error!("Zone classifier: input minimap is empty");
            return Ok(String::new());
        }

        let input = preprocess(minimap)?.into_dyn();
        let tensor = TensorRef::from_array_view(&input)
            .map_err(|e| LocatorError::inference(e.to_string()))?;
        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => tensor])
            .map_err(|e| LocatorError::inference(e.to_string()))?;
        let output = outputs.get(self.output_name.as_str()).ok_or_else(|| {
            LocatorError::inference(format!("model output '{}' missing", self.output_name))
        })?;
        let scores = output
            .try_extract_array::<f32>()
            .map_err(|e| LocatorError::inference(e.to_string()))?;

        let mut max_idx = usize::MAX;
        let mut max_conf = f32::MIN;
        for (i, &v) in scores.iter().enumerate() {
            if v > max_conf {
                max_conf = v;
                max_idx = i;
            }
        }

        let predicted = self
            .class_names
            .get(max_idx)
            .map(String::as_str)
            .unwrap_or("Unknown");
        info!(
            "Classifier raw: class={} ({}), conf={:.3}",
            predicted, max_idx, max_conf
        );

        if predicted == "None" {
            info!("Classifier predicted 'None', assuming UI occlusion");
            return Ok("None".to_string());
        }

        if max_conf as f64 > self.conf_threshold && max_idx < self.class_names.len() {
            let zone_id =
                translate_class_name(predicted, &self.region_mapping, &self.layer_class_re);
            info!(
                "Classifier: {} -> zone {} (conf {:.1}%)",
                predicted,
                zone_id,
                max_conf * 100.0
            );
            return Ok(zone_id);
        }

        info!(
            "Classifier rejected: conf {:.3} <= {:.3}",
            max_conf, self.conf_threshold
        );
        Ok(String::new())
    }
}

/// Build the 1x3x128x128 RGB tensor: center-paste onto a black canvas,
/// keep only the viewport disc, scale to `[0, 1]`.
fn preprocess(minimap: &Mat) -> Result<Array4<f32>> {
    let img = to_bgr(minimap)?;
    let w = img.cols();
    let h = img.rows();

    let mut canvas = Mat::new_rows_cols_with_default(
        INPUT_SIZE,
        INPUT_SIZE,
        CV_8UC3,
        Scalar::all(0.0),
    )?;
    let crop_w = w.min(INPUT_SIZE);
    let crop_h = h.min(INPUT_SIZE);
    let canvas_roi = Rect::new(
        ((INPUT_SIZE - w) / 2).max(0),
        ((INPUT_SIZE - h) / 2).max(0),
        crop_w,
        crop_h,
    );
    let img_roi = Rect::new((w - crop_w) / 2, (h - crop_h) / 2, crop_w, crop_h);
    let src = Mat::roi(&img, img_roi)?;
    let mut dst = Mat::roi_mut(&mut canvas, canvas_roi)?;
    src.copy_to(&mut dst)?;
    drop(dst);

    let mut disc = Mat::new_rows_cols_with_default(INPUT_SIZE, INPUT_SIZE, CV_8UC1, Scalar::all(0.0))?;
    imgproc::circle(
        &mut disc,
        Point::new(INPUT_SIZE / 2, INPUT_SIZE / 2),
        MASK_DIAMETER / 2,
        Scalar::all(255.0),
        imgproc::FILLED,
        imgproc::LINE_8,
        0,
    )?;
    let mut masked = Mat::default();
    core::bitwise_and(&canvas, &canvas, &mut masked, &disc)?;

    let size = INPUT_SIZE as usize;
    let mut input = Array4::<f32>::zeros((1, 3, size, size));
    for y in 0..INPUT_SIZE {
        let row = masked.at_row::<Vec3b>(y)?;
        for x in 0..size {
            let px = row[x];
            input[[0, 0, y as usize, x]] = px[2] as f32 / 255.0;
            input[[0, 1, y as usize, x]] = px[1] as f32 / 255.0;
            input[[0, 2, y as usize, x]] = px[0] as f32 / 255.0;
        }
    }
    Ok(input)
}

/// Translate a classifier class name into a zone id.
///
/// Total and deterministic; names that match neither scheme (including
/// already-translated ids) pass through unchanged.
fn translate_class_name(
    name: &str,
    region_mapping: &HashMap<String, String>,
    layer_re: &Regex,
) -> String {
    let prefix = if name.len() >= 5 { &name[..5] } else { name };
    if let Some(region) = region_mapping.get(prefix) {
        if name.contains("Base") && name.contains("Map") {
            return format!("{}_Base", region);
        }
        if let Some(caps) = layer_re.captures(name) {
            return format!("{}_L{}_{}", region, &caps[2], &caps[3]);
        }
    }
    name.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping() -> HashMap<String, String> {
        let mut m = HashMap::new();
        m.insert("Map02".to_string(), "Region2".to_string());
        m.insert("Map11".to_string(), "OMV".to_string());
        m
    }

    fn layer_re() -> Regex {
        Regex::new(r"(Map\d+)Lv0*(\d+)Tier0*(\d+)").unwrap()
    }

    #[test]
    fn test_translate_base_class() {
        assert_eq!(
            translate_class_name("Map02Base", &mapping(), &layer_re()),
            "Region2_Base"
        );
        assert_eq!(
            translate_class_name("Map11BaseOMV", &mapping(), &layer_re()),
            "OMV_Base"
        );
    }

    #[test]
    fn test_translate_layer_class_strips_zeros() {
        assert_eq!(
            translate_class_name("Map02Lv003Tier002", &mapping(), &layer_re()),
            "Region2_L3_2"
        );
        assert_eq!(
            translate_class_name("Map02Lv010Tier001", &mapping(), &layer_re()),
            "Region2_L10_1"
        );
    }

    #[test]
    fn test_translate_unknown_prefix_passes_through() {
        assert_eq!(
            translate_class_name("Map99Lv001Tier001", &mapping(), &layer_re()),
            "Map99Lv001Tier001"
        );
        assert_eq!(translate_class_name("Maze", &mapping(), &layer_re()), "Maze");
    }

    #[test]
    fn test_translate_is_identity_on_translated_ids() {
        // translating twice equals translating once
        let once = translate_class_name("Map02Lv003Tier002", &mapping(), &layer_re());
        let twice = translate_class_name(&once, &mapping(), &layer_re());
        assert_eq!(once, twice);
    }
}
