//! Zone map store: loads the big-map directory once at initialization
//! and serves decoded haystacks keyed by zone id.

use crate::error::Result;
use log::{info, warn};
use opencv::{
    core::{Mat, Scalar, Vec4b, CV_8UC4},
    prelude::*,
};
use rayon::prelude::*;
use regex::Regex;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Immutable mapping from zone id to decoded BGRA haystack.
pub struct ZoneMapStore {
    zones: HashMap<String, Mat>,
}

impl ZoneMapStore {
    /// Walk `root` recursively and decode every image file found.
    ///
    /// Files that fail to decode are skipped with a warning. A missing
    /// root yields an empty store.
    pub fn load(root: &Path) -> Result<Self> {
        let mut zones = HashMap::new();
        if !root.exists() {
            warn!("Map resource dir does not exist: {}", root.display());
            return Ok(Self { zones });
        }

        let layer_re = Regex::new(r"(?i)Lv(\d+)Tier(\d+)\.(png|jpg|webp)$").expect("layer regex");

        let mut files = Vec::new();
        collect_files(root, &mut files)?;
        files.sort();

        // decode in parallel, insert in path order so duplicate keys
        // resolve deterministically
        let decoded: Vec<(String, PathBuf, Result<Mat>)> = files
            .into_par_iter()
            .map(|path| {
                let key = zone_id_from_path(&path, &layer_re);
                let img = load_image_bgra(&path);
                (key, path, img)
            })
            .collect();

        for (key, path, img) in decoded {
            match img {
                Ok(img) => {
                    info!("Loaded Map: {}", key);
                    zones.insert(key, img);
                }
                Err(e) => {
                    warn!("Failed to load map {}: {}", path.display(), e);
                }
            }
        }

        Ok(Self { zones })
    }

    pub fn get(&self, zone_id: &str) -> Option<&Mat> {
        self.zones.get(zone_id)
    }

    pub fn contains(&self, zone_id: &str) -> bool {
        self.zones.contains_key(zone_id)
    }

    pub fn len(&self) -> usize {
        self.zones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }

    pub fn zone_ids(&self) -> impl Iterator<Item = &str> {
        self.zones.keys().map(String::as_str)
    }
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            collect_files(&path, out)?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}

/// Derive the zone id from a map file path.
///
/// `<Region>/base.png` becomes `<Region>_Base`, a layer file
/// `LvNNNTierMMM.<ext>` becomes `<Region>_L<level>_<tier>` with leading
/// zeros stripped, anything else falls back to the file stem.
pub fn zone_id_from_path(path: &Path, layer_re: &Regex) -> String {
    let filename = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    let parent = path
        .parent()
        .and_then(Path::file_name)
        .and_then(|n| n.to_str())
        .unwrap_or_default();

    if filename.eq_ignore_ascii_case("base.png") {
        return format!("{}_Base", parent);
    }
    if let Some(caps) = layer_re.captures(filename) {
        let level = strip_leading_zeros(&caps[1]);
        let tier = strip_leading_zeros(&caps[2]);
        return format!("{}_L{}_{}", parent, level, tier);
    }
    path.file_stem()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_string()
}

fn strip_leading_zeros(s: &str) -> &str {
    let trimmed = s.trim_start_matches('0');
    if trimmed.is_empty() {
        "0"
    } else {
        trimmed
    }
}

/// Decode an image preserving alpha; three-channel inputs are promoted
/// to four-channel BGRA.
fn load_image_bgra(path: &Path) -> Result<Mat> {
    let decoded = image::open(path)?;
    let rgba = decoded.to_rgba8();
    let (w, h) = rgba.dimensions();
    let mut mat = Mat::new_rows_cols_with_default(h as i32, w as i32, CV_8UC4, Scalar::all(0.0))?;
    let data = mat.data_typed_mut::<Vec4b>()?;
    for (i, px) in rgba.pixels().enumerate() {
        data[i] = Vec4b::from([px[2], px[1], px[0], px[3]]);
    }
    Ok(mat)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer_re() -> Regex {
        Regex::new(r"(?i)Lv(\d+)Tier(\d+)\.(png|jpg|webp)$").unwrap()
    }

    #[test]
    fn test_zone_id_for_base_map() {
        let re = layer_re();
        assert_eq!(
            zone_id_from_path(Path::new("maps/OMVBase/base.png"), &re),
            "OMVBase_Base"
        );
        assert_eq!(
            zone_id_from_path(Path::new("maps/Region2/Base.PNG"), &re),
            "Region2_Base"
        );
    }

    #[test]
    fn test_zone_id_for_layer_maps() {
        let re = layer_re();
        assert_eq!(
            zone_id_from_path(Path::new("maps/Region2/Lv003Tier002.png"), &re),
            "Region2_L3_2"
        );
        assert_eq!(
            zone_id_from_path(Path::new("maps/Region2/lv10tier1.webp"), &re),
            "Region2_L10_1"
        );
        assert_eq!(
            zone_id_from_path(Path::new("maps/Region2/Lv000Tier000.jpg"), &re),
            "Region2_L0_0"
        );
    }

    #[test]
    fn test_zone_id_fallback_is_stem() {
        let re = layer_re();
        assert_eq!(
            zone_id_from_path(Path::new("maps/Region2/overview.png"), &re),
            "overview"
        );
    }

    #[test]
    fn test_zone_id_derivation_is_deterministic() {
        let re = layer_re();
        let p = Path::new("maps/Region9/Lv02Tier07.png");
        assert_eq!(zone_id_from_path(p, &re), zone_id_from_path(p, &re));
    }

    #[test]
    fn test_store_load_promotes_to_bgra() {
        let dir = std::env::temp_dir().join(format!("mml_store_test_{}", std::process::id()));
        let region = dir.join("Region7");
        fs::create_dir_all(&region).unwrap();

        // three-channel source, must come back four-channel
        let rgb = image::RgbImage::from_fn(32, 24, |x, y| image::Rgb([x as u8, y as u8, 128]));
        rgb.save(region.join("base.png")).unwrap();
        let rgba =
            image::RgbaImage::from_fn(16, 16, |x, y| image::Rgba([x as u8, y as u8, 0, 200]));
        rgba.save(region.join("Lv001Tier002.png")).unwrap();
        // undecodable file is skipped with a warning
        fs::write(region.join("notes.txt"), b"not an image").unwrap();

        let store = ZoneMapStore::load(&dir).unwrap();
        assert_eq!(store.len(), 2);
        let base = store.get("Region7_Base").unwrap();
        assert_eq!(base.channels(), 4);
        assert_eq!((base.cols(), base.rows()), (32, 24));
        assert!(store.contains("Region7_L1_2"));
        assert!(!store.contains("notes"));

        let _ = fs::remove_dir_all(&dir);
    }
}
