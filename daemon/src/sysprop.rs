//! Android system property and clock access.
use nix::time::{clock_gettime, ClockId};

/// `Build.VERSION_CODES.UPSIDE_DOWN_CAKE`.
pub const SDK_UPSIDE_DOWN_CAKE: u32 = 34;

#[cfg(target_os = "android")]
mod imp {
    use std::ffi::{c_char, CStr, CString};

    extern "C" {
        fn __system_property_get(name: *const c_char, value: *mut c_char) -> i32;
    }

    // PROP_VALUE_MAX
    const VALUE_MAX: usize = 92;

    pub fn get(name: &str) -> Option<String> {
        let name = CString::new(name).ok()?;
        let mut buffer = [0u8; VALUE_MAX];
        let len = unsafe { __system_property_get(name.as_ptr(), buffer.as_mut_ptr() as _) };
        if len <= 0 {
            return None;
        }
        let value = CStr::from_bytes_until_nul(&buffer).ok()?;
        Some(value.to_string_lossy().into_owned())
    }
}

#[cfg(not(target_os = "android"))]
mod imp {
    pub fn get(_name: &str) -> Option<String> {
        None
    }
}

pub fn get(name: &str) -> Option<String> {
    imp::get(name)
}

/// `ro.build.version.sdk`, or `None` off-device.
pub fn sdk_int() -> Option<u32> {
    parse_sdk(&get("ro.build.version.sdk")?)
}

fn parse_sdk(value: &str) -> Option<u32> {
    value.trim().parse().ok()
}

/// `SystemClock.elapsedRealtime()`: milliseconds since boot, including
/// time spent in deep sleep.
pub fn elapsed_realtime_ms() -> i64 {
    match clock_gettime(ClockId::CLOCK_BOOTTIME) {
        Ok(ts) => i64::from(ts.tv_sec()) * 1000 + i64::from(ts.tv_nsec()) / 1_000_000,
        Err(e) => {
            log::warn!("CLOCK_BOOTTIME unavailable: {e}");
            0
        }
    }
}
