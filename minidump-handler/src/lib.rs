//! In-process crash capture for Linux and Android.
//!
//! [`attach`] installs handlers for the fatal signals and, when one fires,
//! writes a minidump of the process to a pre-chosen path before the signal
//! is re-delivered to whatever handler was there before. Everything on the
//! fault path sticks to async-signal-safe operations: raw syscalls, inline
//! buffers, and a single atomic for coordination.

mod error;
mod linux;
pub mod minidump;
pub mod utils;

pub use error::Error;
pub use minidump::MinidumpDescriptor;

use std::sync::atomic::{AtomicU8, Ordering};

/// Completion callback, invoked on the faulting thread once the capture
/// attempt has finished.
///
/// `succeeded` tells whether the dump file was fully written; the return
/// value replaces it as the overall outcome, so a callback that only
/// observes should pass it through unchanged.
///
/// This runs in a compromised context. Implementations must not allocate,
/// lock, or otherwise rely on process state that a fault may have taken
/// down.
pub trait CrashEvent: Sync + Send {
    fn on_crash(&self, minidump: &MinidumpDescriptor, succeeded: bool) -> bool;
}

impl<F> CrashEvent for F
where
    F: Fn(&MinidumpDescriptor, bool) -> bool + Send + Sync,
{
    fn on_crash(&self, minidump: &MinidumpDescriptor, succeeded: bool) -> bool {
        self(minidump, succeeded)
    }
}

const UNINITIALIZED: u8 = 0;
const REGISTERING: u8 = 1;
const INSTALLED: u8 = 2;

/// Registration state. Exactly one thread ever wins the transition out of
/// `UNINITIALIZED`; everyone else observes either the transition or the
/// final state.
static STATE: AtomicU8 = AtomicU8::new(UNINITIALIZED);

/// Installs the crash handler, writing dumps into `dump_dir`.
///
/// Only one registration is allowed for the life of the process; later
/// calls fail with [`Error::HandlerAlreadyRegistered`] and leave the
/// original registration untouched. There is no detach: the installed
/// handler stays in place until the process exits.
pub fn attach<P: AsRef<std::path::Path>>(
    dump_dir: P,
    on_crash: Option<Box<dyn CrashEvent>>,
) -> Result<(), Error> {
    let dump_dir = dump_dir.as_ref().to_str().ok_or(Error::InvalidDumpPath)?;

    if STATE
        .compare_exchange(
            UNINITIALIZED,
            REGISTERING,
            Ordering::SeqCst,
            Ordering::SeqCst,
        )
        .is_err()
    {
        return Err(Error::HandlerAlreadyRegistered);
    }

    let result = (|| {
        // Catch a bad directory now, while the error can still go somewhere
        let meta = std::fs::metadata(dump_dir).map_err(Error::Os)?;
        if !meta.is_dir() {
            return Err(Error::InvalidDumpPath);
        }

        // Probe writability as well; a read-only directory would otherwise
        // only surface once the dump open fails at fault time
        let dir_c = std::ffi::CString::new(dump_dir).map_err(|_| Error::InvalidDumpPath)?;
        if unsafe { libc::access(dir_c.as_ptr(), libc::W_OK) } != 0 {
            return Err(Error::InvalidDumpPath);
        }

        // The dump file name is baked here so the fault path never has to
        // generate one
        let output = MinidumpDescriptor::new(dump_dir, uuid::Uuid::new_v4())
            .ok_or(Error::DumpPathTooLong)?;

        linux::handler::install(output, on_crash)
    })();

    match result {
        Ok(()) => {
            STATE.store(INSTALLED, Ordering::SeqCst);
            Ok(())
        }
        Err(err) => {
            STATE.store(UNINITIALIZED, Ordering::SeqCst);
            Err(err)
        }
    }
}

#[inline]
pub fn is_installed() -> bool {
    STATE.load(Ordering::SeqCst) == INSTALLED
}

/// Runs the capture pipeline for the calling thread as if `signal` had
/// been delivered, without the kernel being involved. The process keeps
/// running; the dump, the callback, and the returned outcome are the same
/// as for a real fault.
///
/// Returns `false` when no handler is installed or a capture is already in
/// flight.
pub fn simulate_signal(signal: i32) -> bool {
    if !is_installed() {
        return false;
    }

    linux::handler::simulate_signal(signal)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn rejects_unwritable_directory() {
        // Root bypasses permission checks entirely
        if unsafe { libc::geteuid() } == 0 {
            return;
        }

        let dir = std::env::temp_dir().join(format!("mdh-ro-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o555)).unwrap();

        assert!(matches!(attach(&dir, None), Err(Error::InvalidDumpPath)));
        assert!(!is_installed());

        std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o755)).unwrap();
        std::fs::remove_dir_all(dir).unwrap();
    }
}
