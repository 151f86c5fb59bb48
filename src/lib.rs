//! Native crash capture.
//!
//! [`init`] points the in-process minidump handler at a dump directory;
//! when native code faults, the dump is written synchronously on the
//! faulting thread and a notice is queued for the host to pick up with
//! [`pending_dump`] at its next safe point. Dumps that were never picked
//! up (the usual case, since the process dies) are found on the next run
//! via [`stale_dumps`].

macro_rules! debug_print {
    ($($arg:tt)*) => {
        #[cfg(feature = "debug-logs")]
        {
            eprintln!("[cc] {}", format_args!($($arg)*));
        }
        #[cfg(not(feature = "debug-logs"))]
        {
            let _ = format_args!($($arg)*);
        }
    }
}

mod capture;
mod config;
mod error;

pub use capture::{init, pending_dump, stale_dumps, try_init, CrashMetadata, DumpNotice};
pub use config::{checksum, version};
pub use error::Error;
pub use minidump_handler::{is_installed, simulate_signal};

/// Crashes the current process with a real segfault, so the whole capture
/// pipeline can be exercised end to end. Never call this outside of
/// integration testing, which is why it hides behind a feature.
#[cfg(feature = "test-crash")]
pub fn test_crash() -> ! {
    unsafe {
        let ptr: *mut u32 = std::ptr::null_mut();
        ptr.write_volatile(42);
    }

    // The write faults before we get here
    std::process::abort()
}
