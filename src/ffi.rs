//! C FFI bindings for host-framework integration
//!
//! Exposes the recognition callback shape the host expects: parse the
//! per-call options from JSON, crop the minimap ROI out of the frame,
//! run the shared locator, and report `(box, detail_json)` back.

use crate::locator::{global_locator, init_global_locator};
use crate::types::{
    LocateOptions, LocateStatus, LocatorConfig, MINIMAP_ROI_HEIGHT, MINIMAP_ROI_ORIGIN_X,
    MINIMAP_ROI_ORIGIN_Y, MINIMAP_ROI_WIDTH,
};
use crate::image_ops::clip_rect;
use log::{error, warn};
use opencv::core::{Mat, Rect};
use opencv::prelude::*;
use serde::Serialize;
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int, c_void};
use std::slice;

/// Image buffer handed over by the host (tightly packed BGR or BGRA).
#[repr(C)]
pub struct MmlImageBuffer {
    pub data: *const u8,
    pub width: i32,
    pub height: i32,
    pub channels: i32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct MmlRect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

#[derive(Serialize)]
struct LocateDetail {
    status: i32,
    message: String,
    #[serde(rename = "mapName", skip_serializing_if = "Option::is_none")]
    map_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    x: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    y: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rot: Option<f64>,
    #[serde(rename = "locConf", skip_serializing_if = "Option::is_none")]
    loc_conf: Option<f64>,
    #[serde(rename = "latencyMs", skip_serializing_if = "Option::is_none")]
    latency_ms: Option<i64>,
}

/// Initialize the process-wide locator. Returns 0 on success.
#[no_mangle]
pub extern "C" fn mml_init(map_root: *const c_char, model_path: *const c_char) -> c_int {
    let Some(map_root) = cstr_to_string(map_root) else {
        return -1;
    };
    let model_path = cstr_to_string(model_path).unwrap_or_default();

    let config = LocatorConfig {
        map_resource_dir: map_root,
        model_path,
    };
    match init_global_locator(&config) {
        Ok(()) => 0,
        Err(e) => {
            error!("mml_init failed: {}", e);
            -1
        }
    }
}

/// Force the shared locator's tracker lost. Returns 0 on success.
#[no_mangle]
pub extern "C" fn mml_reset_tracking() -> c_int {
    let mut guard = global_locator()
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    guard.reset_tracking_state();
    0
}

/// Recognition callback: locate the player from a full frame.
///
/// `param_json` is parsed as `LocateOptions`. On success, `out_box`
/// receives `(x, y, 1, 1)` and the function returns 1; on any failure
/// it returns 0, with `out_detail` still populated when provided.
/// Strings written to `out_detail` must be released with
/// `mml_free_string`.
#[no_mangle]
pub extern "C" fn mml_locate_recognition(
    _context: *mut c_void,
    _task_id: i64,
    _node_name: *const c_char,
    param_json: *const c_char,
    image: *const MmlImageBuffer,
    _roi: *const MmlRect,
    out_box: *mut MmlRect,
    out_detail: *mut *mut c_char,
) -> c_int {
    let options = match cstr_to_string(param_json) {
        Some(json) if !json.is_empty() => serde_json::from_str(&json).unwrap_or_else(|e| {
            warn!("mml_locate_recognition: bad param json ({}), using defaults", e);
            LocateOptions::default()
        }),
        _ => LocateOptions::default(),
    };

    let Some(frame) = (unsafe { image_buffer_to_mat(image) }) else {
        error!("mml_locate_recognition: invalid image buffer");
        return 0;
    };

    let roi = clip_rect(
        Rect::new(
            MINIMAP_ROI_ORIGIN_X,
            MINIMAP_ROI_ORIGIN_Y,
            MINIMAP_ROI_WIDTH,
            MINIMAP_ROI_HEIGHT,
        ),
        Rect::new(0, 0, frame.cols(), frame.rows()),
    );
    if roi.width == 0 || roi.height == 0 {
        error!("mml_locate_recognition: minimap ROI empty");
        return 0;
    }
    let minimap = match Mat::roi(&frame, roi) {
        Ok(sub) => sub,
        Err(e) => {
            error!("mml_locate_recognition: ROI crop failed: {}", e);
            return 0;
        }
    };

    let result = {
        let mut guard = global_locator()
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.locate(&minimap, &options)
    };

    if !out_detail.is_null() {
        let mut detail = LocateDetail {
            status: result.status.code(),
            message: result.message.clone(),
            map_name: None,
            x: None,
            y: None,
            rot: None,
            loc_conf: None,
            latency_ms: None,
        };
        if let Some(pos) = &result.position {
            detail.map_name = Some(pos.zone_id.clone());
            detail.x = Some(pos.x as i32);
            detail.y = Some(pos.y as i32);
            detail.rot = Some(pos.heading);
            detail.loc_conf = Some(pos.score);
            detail.latency_ms = Some(pos.latency_ms);
        }
        if let Ok(json) = serde_json::to_string(&detail) {
            if let Ok(cstring) = CString::new(json) {
                unsafe { *out_detail = cstring.into_raw() };
            }
        }
    }

    match result.status {
        LocateStatus::Success => {
            if let Some(pos) = &result.position {
                if !out_box.is_null() {
                    unsafe {
                        *out_box = MmlRect {
                            x: pos.x as i32,
                            y: pos.y as i32,
                            width: 1,
                            height: 1,
                        };
                    }
                }
            }
            1
        }
        LocateStatus::ScreenBlocked => {
            warn!("mml_locate_recognition: screen blocked");
            0
        }
        _ => {
            warn!("mml_locate_recognition failed: {}", result.message);
            0
        }
    }
}

/// Free a string returned through `out_detail`.
#[no_mangle]
pub extern "C" fn mml_free_string(ptr: *mut c_char) {
    if !ptr.is_null() {
        unsafe {
            let _ = CString::from_raw(ptr);
        }
    }
}

fn cstr_to_string(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    unsafe { CStr::from_ptr(ptr) }
        .to_str()
        .ok()
        .map(str::to_string)
}

/// Wrap the host's pixel buffer in an owned BGR/BGRA `Mat`.
///
/// # Safety
/// `image.data` must point at `width * height * channels` readable
/// bytes for the duration of the call.
unsafe fn image_buffer_to_mat(image: *const MmlImageBuffer) -> Option<Mat> {
    if image.is_null() {
        return None;
    }
    let buf = &*image;
    if buf.data.is_null() || buf.width <= 0 || buf.height <= 0 {
        return None;
    }
    if buf.channels != 3 && buf.channels != 4 {
        return None;
    }

    let total = (buf.width as usize) * (buf.height as usize) * (buf.channels as usize);
    let bytes = slice::from_raw_parts(buf.data, total);
    let flat = Mat::from_slice(bytes).ok()?;
    let reshaped = flat.reshape(buf.channels, buf.height).ok()?;
    reshaped.try_clone().ok()
}
