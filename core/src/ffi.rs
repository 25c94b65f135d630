//! `capi` feature: a small C ABI over the programmatic surface of spec.md
//! §6, for embedding applications that sit on the other side of an FFI
//! boundary from a managed runtime (the filtered `original_source` this
//! crate was reworked from is a Dart project). Grounded in
//! `rhythmcache-pravaha`'s `ffi.rs`: an opaque handle type, thread-local
//! last-error storage instead of panicking across the boundary, and a
//! `cbindgen` build script (see `build.rs`) gated behind this feature so
//! the default build needs no C toolchain.
//!
//! Every call is synchronous from the caller's point of view: `CacheHandle`
//! owns a dedicated multi-thread `tokio::runtime::Runtime` and blocks it
//! for the duration of each async operation, since a C ABI has no other
//! way to hand back a result.

use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_double, c_int};
use std::path::PathBuf;
use std::ptr;
use std::sync::Arc;

use common::{CacheConfig, CacheError};
use tokio::runtime::Runtime;

use crate::manager::Manager;

thread_local! {
    static LAST_ERROR: std::cell::RefCell<Option<CString>> = const { std::cell::RefCell::new(None) };
}

fn set_last_error(msg: impl std::fmt::Display) {
    let msg = CString::new(msg.to_string()).unwrap_or_else(|_| CString::new("non-utf8 error message").unwrap());
    LAST_ERROR.with(|e| *e.borrow_mut() = Some(msg));
}

fn clear_last_error() {
    LAST_ERROR.with(|e| *e.borrow_mut() = None);
}

/// Opaque handle returned by `cache_core_init`.
pub struct CacheHandle {
    runtime: Runtime,
    manager: Arc<Manager>,
}

/// Gets the last error message set on this thread, or NULL if the
/// previous call succeeded. Valid only until the next `cache_core_*` call
/// on the same thread.
#[unsafe(no_mangle)]
pub extern "C" fn cache_core_last_error() -> *const c_char {
    LAST_ERROR.with(|e| e.borrow().as_ref().map(|s| s.as_ptr()).unwrap_or(ptr::null()))
}

fn read_str<'a>(s: *const c_char) -> Result<&'a str, CacheError> {
    if s.is_null() {
        return Err(CacheError::BadArgument("null string argument".into()));
    }
    unsafe { CStr::from_ptr(s) }
        .to_str()
        .map_err(|_| CacheError::BadArgument("argument is not valid utf-8".into()))
}

/// Creates the storage directory, runs startup validation, and binds the
/// loopback HTTP server on `port`. Returns NULL on failure (check
/// `cache_core_last_error`).
///
/// # Safety
/// `storage_dir` must be a valid null-terminated UTF-8 C string;
/// `user_agent` may be NULL. Caller must free the result with
/// `cache_core_dispose`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cache_core_init(
    storage_dir: *const c_char,
    port: u16,
    user_agent: *const c_char,
) -> *mut CacheHandle {
    clear_last_error();

    let storage_dir = match read_str(storage_dir) {
        Ok(s) => PathBuf::from(s),
        Err(e) => {
            set_last_error(e);
            return ptr::null_mut();
        }
    };

    let user_agent = if user_agent.is_null() {
        None
    } else {
        match read_str(user_agent) {
            Ok(s) => Some(s.to_string()),
            Err(e) => {
                set_last_error(e);
                return ptr::null_mut();
            }
        }
    };

    let runtime = match Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            set_last_error(format!("failed to start tokio runtime: {e}"));
            return ptr::null_mut();
        }
    };

    let mut config = CacheConfig::new(storage_dir).with_port(port);
    if let Some(ua) = user_agent {
        config = config.with_user_agent(ua);
    }

    let manager = match runtime.block_on(Manager::init(config)) {
        Ok(m) => m,
        Err(e) => {
            set_last_error(e);
            return ptr::null_mut();
        }
    };

    Box::into_raw(Box::new(CacheHandle { runtime, manager }))
}

/// Returns the local loopback URL a player should request instead of
/// `url`. Caller must free the result with `cache_core_free_string`.
///
/// # Safety
/// `handle` must come from `cache_core_init`; `url` must be a valid
/// null-terminated UTF-8 C string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cache_core_proxy_url_for(handle: *const CacheHandle, url: *const c_char) -> *mut c_char {
    clear_last_error();
    let Some(handle) = (unsafe { handle.as_ref() }) else {
        set_last_error("handle is null");
        return ptr::null_mut();
    };
    let url = match read_str(url) {
        Ok(u) => u,
        Err(e) => {
            set_last_error(e);
            return ptr::null_mut();
        }
    };

    let proxy = handle.manager.proxy_url_for(url);
    CString::new(proxy).map(CString::into_raw).unwrap_or(ptr::null_mut())
}

/// Returns progress in `[0.0, 100.0]`, or a negative value if `url` is
/// unknown to the cache.
///
/// # Safety
/// `handle` must come from `cache_core_init`; `url` must be a valid
/// null-terminated UTF-8 C string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cache_core_progress_for(handle: *const CacheHandle, url: *const c_char) -> c_double {
    clear_last_error();
    let Some(handle) = (unsafe { handle.as_ref() }) else {
        set_last_error("handle is null");
        return -1.0;
    };
    let url = match read_str(url) {
        Ok(u) => u,
        Err(e) => {
            set_last_error(e);
            return -1.0;
        }
    };

    match handle.runtime.block_on(handle.manager.progress_for(url)) {
        Ok(p) => p,
        Err(e) => {
            set_last_error(e);
            -1.0
        }
    }
}

/// Returns a JSON array of the `DownloadInfo` records behind
/// `Manager::list_all`. Caller must free with `cache_core_free_string`.
///
/// # Safety
/// `handle` must come from `cache_core_init`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cache_core_list_all_json(handle: *const CacheHandle) -> *mut c_char {
    clear_last_error();
    let Some(handle) = (unsafe { handle.as_ref() }) else {
        set_last_error("handle is null");
        return ptr::null_mut();
    };

    let list = handle.runtime.block_on(handle.manager.list_all());
    match serde_json::to_string(&list) {
        Ok(json) => CString::new(json).map(CString::into_raw).unwrap_or(ptr::null_mut()),
        Err(e) => {
            set_last_error(e);
            ptr::null_mut()
        }
    }
}

macro_rules! url_action {
    ($name:ident, $method:ident, $doc:literal) => {
        #[doc = $doc]
        ///
        /// # Safety
        /// `handle` must come from `cache_core_init`; `url` must be a
        /// valid null-terminated UTF-8 C string.
        #[unsafe(no_mangle)]
        pub unsafe extern "C" fn $name(handle: *const CacheHandle, url: *const c_char) -> c_int {
            clear_last_error();
            let Some(handle) = (unsafe { handle.as_ref() }) else {
                set_last_error("handle is null");
                return -1;
            };
            let url = match read_str(url) {
                Ok(u) => u,
                Err(e) => {
                    set_last_error(e);
                    return -1;
                }
            };
            handle.manager.$method(url);
            0
        }
    };
}

url_action!(cache_core_start_background, start_background, "Enqueues the background completer for `url`.");
url_action!(cache_core_stop_background, stop_background, "Stops the background completer for `url`, if running.");
url_action!(cache_core_cancel, cancel, "Cancels the completer and any in-flight origin fetch for `url`.");

/// Starts a completer for every known resource that isn't complete.
///
/// # Safety
/// `handle` must come from `cache_core_init`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cache_core_resume_all(handle: *const CacheHandle) {
    clear_last_error();
    match unsafe { handle.as_ref() } {
        Some(handle) => handle.runtime.block_on(handle.manager.resume_all()),
        None => set_last_error("handle is null"),
    }
}

/// Removes a resource: stops its completer, cancels its origin, deletes
/// its on-disk files. Returns 0 on success, -1 on error.
///
/// # Safety
/// `handle` must come from `cache_core_init`; `url` must be a valid
/// null-terminated UTF-8 C string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cache_core_remove_by_url(handle: *const CacheHandle, url: *const c_char) -> c_int {
    clear_last_error();
    let Some(handle) = (unsafe { handle.as_ref() }) else {
        set_last_error("handle is null");
        return -1;
    };
    let url = match read_str(url) {
        Ok(u) => u,
        Err(e) => {
            set_last_error(e);
            return -1;
        }
    };
    match handle.runtime.block_on(handle.manager.remove_by_url(url)) {
        Ok(()) => 0,
        Err(e) => {
            set_last_error(e);
            -1
        }
    }
}

/// Removes every resource and clears the storage directory entirely.
/// Returns 0 on success, -1 on error.
///
/// # Safety
/// `handle` must come from `cache_core_init`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cache_core_clear_all(handle: *const CacheHandle) -> c_int {
    clear_last_error();
    let Some(handle) = (unsafe { handle.as_ref() }) else {
        set_last_error("handle is null");
        return -1;
    };
    match handle.runtime.block_on(handle.manager.clear_all()) {
        Ok(()) => 0,
        Err(e) => {
            set_last_error(e);
            -1
        }
    }
}

/// Frees a string returned by any `cache_core_*` function that documents
/// itself as allocating one.
///
/// # Safety
/// `s` must be a pointer previously returned by this crate's FFI surface,
/// or NULL, and must not be used again after this call.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cache_core_free_string(s: *mut c_char) {
    if !s.is_null() {
        let _ = unsafe { CString::from_raw(s) };
    }
}

/// Stops every completer, flushes pending saves, closes the HTTP
/// listener, and frees the handle. Must not be used afterwards.
///
/// # Safety
/// `handle` must come from `cache_core_init`, or NULL.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cache_core_dispose(handle: *mut CacheHandle) {
    if handle.is_null() {
        return;
    }
    let handle = unsafe { Box::from_raw(handle) };
    handle.runtime.block_on(handle.manager.dispose());
}
