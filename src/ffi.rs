// FFI bindings for C/C++/C#
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int};
use std::slice;

use crate::engine::RegistrationError;
use crate::image_impl::Frame;
use crate::pipeline::RegistrationPipeline;
use crate::template::parse_template;
use crate::types::RegistrationConfig;

/// Opaque handle to a registration pipeline
pub struct SregHandle {
    inner: RegistrationPipeline,
}

unsafe fn str_arg<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok()
}

/// Create a new pipeline from a JSON configuration. A null pointer selects the
/// default configuration.
///
/// # Safety
/// config_json must be null or a valid null-terminated UTF-8 string
#[no_mangle]
pub unsafe extern "C" fn sreg_new(config_json: *const c_char) -> *mut SregHandle {
    let config = if config_json.is_null() {
        RegistrationConfig::default()
    } else {
        let Some(json) = str_arg(config_json) else {
            return std::ptr::null_mut();
        };
        match RegistrationConfig::from_json_str(json) {
            Ok(c) => c,
            Err(_) => return std::ptr::null_mut(),
        }
    };

    match RegistrationPipeline::new(config) {
        Ok(pipeline) => Box::into_raw(Box::new(SregHandle { inner: pipeline })),
        Err(_) => std::ptr::null_mut(),
    }
}

/// Evaluate one packed BGR frame against a JSON template.
///
/// On success `*json_out` receives a JSON evaluation summary that must be
/// freed with `sreg_free_string`.
///
/// Returns 0 on success, -1 for null arguments, -2 for an unreadable template,
/// -3 when `data_len` is not `width * height * 3`, -4 if the summary cannot be
/// encoded.
///
/// # Safety
/// - handle must be a valid pointer returned from sreg_new
/// - bgr_data must point to data_len readable bytes
/// - template_json must be a valid null-terminated UTF-8 string
#[no_mangle]
pub unsafe extern "C" fn sreg_evaluate_bgr(
    handle: *const SregHandle,
    bgr_data: *const u8,
    data_len: usize,
    width: u32,
    height: u32,
    template_json: *const c_char,
    json_out: *mut *mut c_char,
) -> c_int {
    if handle.is_null() || bgr_data.is_null() || template_json.is_null() || json_out.is_null() {
        return -1;
    }

    let pipeline = &(*handle).inner;

    let boxes = match str_arg(template_json).map(parse_template) {
        Some(Ok(b)) => b,
        _ => return -2,
    };

    let data = slice::from_raw_parts(bgr_data, data_len);
    let frame = match Frame::from_bgr8(width, height, data.to_vec()) {
        Ok(f) => f,
        Err(_) => return -3,
    };

    let summary = pipeline.evaluate_capture(&frame, &boxes).summary();
    match to_c_string(&summary) {
        Ok(s) => {
            *json_out = s.into_raw();
            0
        }
        Err(_) => -4,
    }
}

/// Free a string returned by this library
///
/// # Safety
/// s must be null or a pointer returned from sreg_evaluate_bgr
#[no_mangle]
pub unsafe extern "C" fn sreg_free_string(s: *mut c_char) {
    if !s.is_null() {
        drop(CString::from_raw(s));
    }
}

/// Free a pipeline handle
///
/// # Safety
/// handle must be a valid pointer returned from sreg_new
#[no_mangle]
pub unsafe extern "C" fn sreg_free(handle: *mut SregHandle) {
    if !handle.is_null() {
        drop(Box::from_raw(handle));
    }
}

/// Get library version
#[no_mangle]
pub extern "C" fn sreg_version() -> *const c_char {
    static VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "\0");
    VERSION.as_ptr() as *const c_char
}

fn to_c_string<T: serde::Serialize>(value: &T) -> Result<CString, RegistrationError> {
    let json = serde_json::to_string(value)?;
    CString::new(json).map_err(|e| RegistrationError::ImageError(e.to_string()))
}
