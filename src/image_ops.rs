//! Image primitives: color conversion, minimap mask generation, the
//! masked-NCC matching core, and the yellow-arrow heading estimator.

use crate::error::Result;
use crate::types::ImageProcessingConfig;
use log::error;
use opencv::{
    core::{self, Mat, Point, Point2f, Rect, Scalar, Size, Vec3b, Vector, CV_8UC1},
    imgproc,
    prelude::*,
};

/// Convert any 1/3/4-channel image to single-channel grayscale.
pub fn to_gray(src: &Mat) -> Result<Mat> {
    match src.channels() {
        4 => {
            let mut gray = Mat::default();
            imgproc::cvt_color_def(src, &mut gray, imgproc::COLOR_BGRA2GRAY)?;
            Ok(gray)
        }
        3 => {
            let mut gray = Mat::default();
            imgproc::cvt_color_def(src, &mut gray, imgproc::COLOR_BGR2GRAY)?;
            Ok(gray)
        }
        _ => Ok(src.try_clone()?),
    }
}

/// Strip alpha if present, otherwise pass through.
pub fn to_bgr(src: &Mat) -> Result<Mat> {
    if src.channels() == 4 {
        let mut bgr = Mat::default();
        imgproc::cvt_color_def(src, &mut bgr, imgproc::COLOR_BGRA2BGR)?;
        Ok(bgr)
    } else {
        Ok(src.try_clone()?)
    }
}

/// Intersection of two rectangles; empty (0-sized) when disjoint.
pub fn clip_rect(r: Rect, bounds: Rect) -> Rect {
    let x1 = r.x.max(bounds.x);
    let y1 = r.y.max(bounds.y);
    let x2 = (r.x + r.width).min(bounds.x + bounds.width);
    let y2 = (r.y + r.height).min(bounds.y + bounds.height);
    if x2 <= x1 || y2 <= y1 {
        Rect::new(0, 0, 0, 0)
    } else {
        Rect::new(x1, y1, x2 - x1, y2 - y1)
    }
}

/// Build the per-pixel weight mask for a minimap crop.
///
/// Starts from a filled disc shrunk by `border_margin`, then subtracts
/// white UI icons (optionally HSV-assisted), saturated yellow/cyan
/// legend glyphs, the center arrow disc, and near-black void pixels.
/// A negative `minimap_dark_mask_threshold` skips the dark-pixel cull.
pub fn generate_minimap_mask(
    minimap: &Mat,
    cfg: &ImageProcessingConfig,
    with_ui_mask: bool,
    with_center_mask: bool,
) -> Result<Mat> {
    let w = minimap.cols();
    let h = minimap.rows();
    let center = Point::new(w / 2, h / 2);
    let radius = (w.min(h) / 2 - cfg.border_margin).max(0);

    let mut base = Mat::zeros(h, w, CV_8UC1)?.to_mat()?;
    imgproc::circle(
        &mut base,
        center,
        radius,
        Scalar::all(255.0),
        imgproc::FILLED,
        imgproc::LINE_8,
        0,
    )?;

    let work = to_bgr(minimap)?;

    if with_ui_mask {
        let mut white_mask = Mat::default();
        core::in_range(
            &work,
            &Scalar::new(255.0, 255.0, 255.0, 0.0),
            &Scalar::new(255.0, 255.0, 255.0, 0.0),
            &mut white_mask,
        )?;

        if cfg.use_hsv_white_mask {
            let mut hsv = Mat::default();
            imgproc::cvt_color_def(&work, &mut hsv, imgproc::COLOR_BGR2HSV)?;
            let mut hsv_white = Mat::default();
            core::in_range(
                &hsv,
                &Scalar::new(0.0, 0.0, 200.0, 0.0),
                &Scalar::new(180.0, 60.0, 255.0, 0.0),
                &mut hsv_white,
            )?;
            let mut merged = Mat::default();
            core::bitwise_or_def(&white_mask, &hsv_white, &mut merged)?;
            white_mask = merged;
        }

        let mut color_icon_mask = Mat::zeros(h, w, CV_8UC1)?.to_mat()?;
        for y in 0..h {
            let img_row = work.at_row::<Vec3b>(y)?;
            let base_vals: Vec<u8> = base.at_row::<u8>(y)?.to_vec();
            let color_row = color_icon_mask.at_row_mut::<u8>(y)?;
            for x in 0..w as usize {
                if base_vals[x] == 0 {
                    continue;
                }
                let b = img_row[x][0] as i32;
                let g = img_row[x][1] as i32;
                let r = img_row[x][2] as i32;
                if (r > 100 && g > 100 && r.min(g) - b > cfg.icon_diff_threshold)
                    || (b > 140 && b > r + 50)
                {
                    color_row[x] = 255;
                }
            }
        }

        let cd = cfg.color_dilate.max(1);
        let kernel = imgproc::get_structuring_element_def(imgproc::MORPH_ELLIPSE, Size::new(cd, cd))?;
        let mut color_dilated = Mat::default();
        imgproc::dilate_def(&color_icon_mask, &mut color_dilated, &kernel)?;
        base.set_to(&Scalar::all(0.0), &color_dilated)?;

        let wd = cfg.white_dilate.max(1);
        let kernel = imgproc::get_structuring_element_def(imgproc::MORPH_ELLIPSE, Size::new(wd, wd))?;
        let mut white_dilated = Mat::default();
        imgproc::dilate_def(&white_mask, &mut white_dilated, &kernel)?;
        base.set_to(&Scalar::all(0.0), &white_dilated)?;
    }

    if with_center_mask {
        imgproc::circle(
            &mut base,
            center,
            cfg.center_mask_radius,
            Scalar::all(0.0),
            imgproc::FILLED,
            imgproc::LINE_8,
            0,
        )?;
    }

    if cfg.minimap_dark_mask_threshold >= 0 {
        let gray = to_gray(minimap)?;
        let mut dark_mask = Mat::default();
        imgproc::threshold(
            &gray,
            &mut dark_mask,
            cfg.minimap_dark_mask_threshold as f64,
            255.0,
            imgproc::THRESH_BINARY_INV,
        )?;
        base.set_to(&Scalar::all(0.0), &dark_mask)?;
    }

    Ok(base)
}

/// Raw output of one masked template match.
#[derive(Debug, Clone, Default)]
pub struct MatchResultRaw {
    pub score: f64,
    pub loc: Point,
    pub second_score: f64,
    /// Margin over the second-best peak.
    pub delta: f64,
    /// Peak-to-sidelobe ratio over the correlation surface.
    pub psr: f64,
}

/// Masked normalized-cross-correlation match with confidence signals.
///
/// The search image alone is blurred with a `blur_size` Gaussian kernel
/// when `blur_size > 0`. Returns `None` when the template does not fit
/// in the search image, the mask has fewer than five live pixels, or
/// the correlation itself fails.
pub fn core_match(
    search_raw: &Mat,
    templ_raw: &Mat,
    weight_mask: &Mat,
    blur_size: i32,
) -> Result<Option<MatchResultRaw>> {
    if search_raw.rows() < templ_raw.rows() || search_raw.cols() < templ_raw.cols() {
        return Ok(None);
    }
    if core::count_non_zero(weight_mask)? < 5 {
        return Ok(None);
    }

    let mut search = to_gray(search_raw)?;
    let templ = to_gray(templ_raw)?;

    if blur_size > 0 {
        let mut blurred = Mat::default();
        imgproc::gaussian_blur_def(&search, &mut blurred, Size::new(blur_size, blur_size), 0.0)?;
        search = blurred;
    }

    let mut response = Mat::default();
    if let Err(e) = imgproc::match_template(
        &search,
        &templ,
        &mut response,
        imgproc::TM_CCOEFF_NORMED,
        weight_mask,
    ) {
        error!("core_match: matchTemplate failed: {}", e);
        return Ok(None);
    }

    let rows = response.rows();
    let cols = response.cols();

    // Masked NCC emits NaN/inf where the windowed variance degenerates.
    {
        let data = response.data_typed_mut::<f32>()?;
        for v in data.iter_mut() {
            if !v.is_finite() {
                *v = -1.0;
            }
        }
    }

    let data = response.data_typed::<f32>()?;
    let mut score = f64::MIN;
    let mut loc = Point::new(0, 0);
    for y in 0..rows {
        for x in 0..cols {
            let v = data[(y * cols + x) as usize] as f64;
            if v > score {
                score = v;
                loc = Point::new(x, y);
            }
        }
    }

    let ex = 3.max(templ.cols().min(templ.rows()) / 10);
    let sup = clip_rect(
        Rect::new(loc.x - ex, loc.y - ex, ex * 2 + 1, ex * 2 + 1),
        Rect::new(0, 0, cols, rows),
    );

    // Second peak and sidelobe statistics, both excluding the
    // suppression rectangle around the peak.
    let mut second = -2.0f64;
    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    let mut n = 0u64;
    for y in 0..rows {
        for x in 0..cols {
            let inside = x >= sup.x && x < sup.x + sup.width && y >= sup.y && y < sup.y + sup.height;
            if inside {
                continue;
            }
            let v = data[(y * cols + x) as usize] as f64;
            if v > second {
                second = v;
            }
            sum += v;
            sum_sq += v * v;
            n += 1;
        }
    }
    let (mean, stddev) = if n > 0 {
        let m = sum / n as f64;
        (m, (sum_sq / n as f64 - m * m).max(0.0).sqrt())
    } else {
        (0.0, 0.0)
    };
    let psr = (score - mean) / (stddev + 1e-6);

    Ok(Some(MatchResultRaw {
        score,
        loc,
        second_score: second,
        delta: score - second,
        psr,
    }))
}

/// Estimate the player-arrow heading from the minimap center patch.
///
/// Degrees clockwise from north in `[0, 360)`; `-1.0` when the arrow
/// cannot be isolated.
pub fn infer_yellow_arrow_rotation(minimap: &Mat) -> Result<f64> {
    if minimap.empty() {
        return Ok(-1.0);
    }

    let cx = minimap.cols() / 2;
    let cy = minimap.rows() / 2;
    let radius = 12;
    if cx - radius < 0 || cy - radius < 0 || cx + radius > minimap.cols() || cy + radius > minimap.rows()
    {
        return Ok(-1.0);
    }

    let roi = Rect::new(cx - radius, cy - radius, radius * 2, radius * 2);
    let patch = Mat::roi(minimap, roi)?;
    let patch_bgr = to_bgr(&patch)?;

    let mut white_mask = Mat::default();
    core::in_range(
        &patch_bgr,
        &Scalar::new(220.0, 220.0, 220.0, 0.0),
        &Scalar::new(255.0, 255.0, 255.0, 0.0),
        &mut white_mask,
    )?;

    let mut contours = Vector::<Vector<Point>>::new();
    imgproc::find_contours_def(
        &white_mask,
        &mut contours,
        imgproc::RETR_EXTERNAL,
        imgproc::CHAIN_APPROX_SIMPLE,
    )?;
    if contours.is_empty() {
        return Ok(-1.0);
    }

    // The arrow is the contour whose centroid sits closest to the
    // patch center.
    let center = Point2f::new(radius as f32, radius as f32);
    let mut best_idx: Option<usize> = None;
    let mut min_dist_sq = f64::MAX;
    for (i, contour) in contours.iter().enumerate() {
        let mu = imgproc::moments_def(&contour)?;
        let c = if mu.m00 > 0.0 {
            Point2f::new((mu.m10 / mu.m00) as f32, (mu.m01 / mu.m00) as f32)
        } else {
            let p = contour.get(0)?;
            Point2f::new(p.x as f32, p.y as f32)
        };
        let d_sq = ((c.x - center.x) as f64).powi(2) + ((c.y - center.y) as f64).powi(2);
        if d_sq < min_dist_sq {
            min_dist_sq = d_sq;
            best_idx = Some(i);
        }
    }
    let best_idx = match best_idx {
        Some(i) if min_dist_sq <= 25.0 => i,
        _ => return Ok(-1.0),
    };

    let mut isolated = Mat::zeros(white_mask.rows(), white_mask.cols(), CV_8UC1)?.to_mat()?;
    imgproc::draw_contours(
        &mut isolated,
        &contours,
        best_idx as i32,
        Scalar::all(255.0),
        imgproc::FILLED,
        imgproc::LINE_8,
        &core::no_array(),
        i32::MAX,
        Point::new(0, 0),
    )?;

    // Upsample the silhouette so the triangle fit is not dominated by
    // aliasing on a 24 px patch.
    let mut high_res = Mat::default();
    imgproc::resize(
        &isolated,
        &mut high_res,
        Size::new(0, 0),
        16.0,
        16.0,
        imgproc::INTER_CUBIC,
    )?;
    let mut binary = Mat::default();
    imgproc::threshold(&high_res, &mut binary, 127.0, 255.0, imgproc::THRESH_BINARY)?;

    let mut hr_contours = Vector::<Vector<Point>>::new();
    imgproc::find_contours_def(
        &binary,
        &mut hr_contours,
        imgproc::RETR_EXTERNAL,
        imgproc::CHAIN_APPROX_SIMPLE,
    )?;
    if hr_contours.is_empty() {
        return Ok(-1.0);
    }

    let mut hr_best = 0usize;
    let mut max_area = 0.0f64;
    for (i, contour) in hr_contours.iter().enumerate() {
        let area = imgproc::contour_area_def(&contour)?;
        if area > max_area {
            max_area = area;
            hr_best = i;
        }
    }
    let contour = hr_contours.get(hr_best)?;

    let mu = imgproc::moments_def(&contour)?;
    if mu.m00 <= 0.0 {
        return Ok(-1.0);
    }
    let centroid = Point2f::new((mu.m10 / mu.m00) as f32, (mu.m01 / mu.m00) as f32);

    let mut triangle = Vector::<Point2f>::new();
    imgproc::min_enclosing_triangle(&contour, &mut triangle)?;
    if triangle.len() != 3 {
        return Ok(-1.0);
    }

    // The tip is the vertex farthest from the centroid.
    let mut tip = triangle.get(0)?;
    let mut max_dist_sq = -1.0f64;
    for vertex in triangle.iter() {
        let d_sq =
            ((vertex.x - centroid.x) as f64).powi(2) + ((vertex.y - centroid.y) as f64).powi(2);
        if d_sq > max_dist_sq {
            max_dist_sq = d_sq;
            tip = vertex;
        }
    }

    let dx = (tip.x - centroid.x) as f64;
    let dy = (tip.y - centroid.y) as f64;
    let mut angle_deg = dx.atan2(-dy).to_degrees();
    if angle_deg < 0.0 {
        angle_deg += 360.0;
    }
    Ok(angle_deg)
}
