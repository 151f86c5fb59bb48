use crate::Error;
use crossbeam::queue::ArrayQueue;
use minidump_handler::{minidump::DUMP_PATH_CAP, utils::FixedStr, MinidumpDescriptor};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

/// Capacity of the completed-dump queue. One registration produces at most
/// one dump, the headroom is for defensive slack only.
const PENDING_CAP: usize = 4;

/// What the fault handler is allowed to record: a fixed copy of the path
/// and the outcome. Everything else about the crash lives in the dump
/// itself.
struct DumpEvent {
    path: FixedStr<DUMP_PATH_CAP>,
    succeeded: bool,
}

/// Queue handed to the crash callback at registration. The callback side
/// holds its own `Arc` and pushes lock-free; this mutex only guards the
/// host side.
static PENDING: parking_lot::Mutex<Option<Arc<ArrayQueue<DumpEvent>>>> =
    parking_lot::const_mutex(None);

/// A dump observed at a safe point, after the fault.
#[derive(Debug)]
pub struct DumpNotice {
    pub path: PathBuf,
    pub succeeded: bool,
}

/// Sidecar written next to each dump so the uploader knows which build
/// produced it.
#[derive(serde::Serialize, serde::Deserialize)]
pub struct CrashMetadata {
    pub version: String,
    pub checksum: String,
    /// Seconds since the unix epoch at the time the dump was observed
    pub timestamp: u64,
}

impl CrashMetadata {
    fn current() -> Self {
        Self {
            version: crate::version().to_owned(),
            checksum: crate::checksum().to_owned(),
            timestamp: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        }
    }
}

/// Installs crash capture, writing dumps into `dump_dir`.
///
/// The directory is created if missing. Only the first registration in a
/// process can succeed; later calls fail without disturbing it.
pub fn try_init<P: AsRef<Path>>(dump_dir: P) -> Result<(), Error> {
    let dump_dir = dump_dir.as_ref();

    // The handler validates the directory too, but creating it is host
    // work, not fault-path work
    std::fs::create_dir_all(dump_dir)?;

    let queue = Arc::new(ArrayQueue::new(PENDING_CAP));
    let crash_queue = queue.clone();

    minidump_handler::attach(
        dump_dir,
        Some(Box::new(
            move |dump: &MinidumpDescriptor, succeeded: bool| {
                // Compromised context: copy the path into inline storage
                // and push lock-free, nothing here may allocate
                if let Some(path) = FixedStr::from_slice(dump.path_str().as_bytes()) {
                    let _ = crash_queue.push(DumpEvent { path, succeeded });
                }

                succeeded
            },
        )),
    )?;

    *PENDING.lock() = Some(queue);

    debug_print!("crash capture installed, dumps go to {}", dump_dir.display());

    Ok(())
}

/// [`try_init`] with the original boolean convention: `true` on success,
/// `false` when the handler could not be installed (including when one
/// already was).
pub fn init<P: AsRef<Path>>(dump_dir: P) -> bool {
    match try_init(dump_dir) {
        Ok(()) => true,
        Err(err) => {
            debug_print!("crash capture init failed: {}", err);
            false
        }
    }
}

/// Drains one completed capture, if any.
///
/// Call from a safe point, for instance at the top of an event loop tick.
/// For a successful dump the metadata sidecar is written here, where
/// allocation is fine again; a failed capture has its partial file cleaned
/// up instead.
pub fn pending_dump() -> Option<DumpNotice> {
    let guard = PENDING.lock();
    let event = guard.as_ref()?.pop()?;

    let notice = DumpNotice {
        path: PathBuf::from(event.path.as_ref()),
        succeeded: event.succeeded,
    };

    if notice.succeeded {
        if let Err(err) = write_metadata(&notice.path) {
            debug_print!(
                "failed to write metadata next to '{}': {}",
                notice.path.display(),
                err
            );
        }
    } else {
        // An aborted write can leave a truncated file behind
        let _ = std::fs::remove_file(&notice.path);
    }

    Some(notice)
}

fn write_metadata(dump_path: &Path) -> Result<(), Error> {
    let meta = serde_json::to_vec(&CrashMetadata::current()).map_err(std::io::Error::from)?;

    std::fs::write(dump_path.with_extension("metadata"), meta)?;

    Ok(())
}

/// Dumps left over from previous runs of the process, ready to be handed
/// to an uploader. The current run's dumps only show up here after they
/// were observed via [`pending_dump`].
pub fn stale_dumps<P: AsRef<Path>>(dump_dir: P) -> Result<Vec<PathBuf>, Error> {
    let mut dumps = Vec::new();

    for entry in std::fs::read_dir(dump_dir)?.filter_map(|e| e.ok()) {
        let path = entry.path();

        if path.extension().map_or(false, |ext| ext == "dmp") {
            dumps.push(path);
        }
    }

    dumps.sort();

    Ok(dumps)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn metadata_round_trip() {
        let meta = CrashMetadata::current();

        let json = serde_json::to_string(&meta).unwrap();
        let back: CrashMetadata = serde_json::from_str(&json).unwrap();

        assert_eq!(back.version, crate::version());
        assert_eq!(back.checksum, crate::checksum());
        assert_eq!(back.timestamp, meta.timestamp);
    }

    #[test]
    fn stale_dumps_only_sees_dumps() {
        let dir = std::env::temp_dir().join(format!("cc-stale-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        std::fs::write(dir.join("a.dmp"), b"x").unwrap();
        std::fs::write(dir.join("a.metadata"), b"x").unwrap();
        std::fs::write(dir.join("notes.txt"), b"x").unwrap();
        std::fs::write(dir.join("b.dmp"), b"x").unwrap();

        let dumps = stale_dumps(&dir).unwrap();
        assert_eq!(dumps, vec![dir.join("a.dmp"), dir.join("b.dmp")]);

        std::fs::remove_dir_all(dir).unwrap();
    }
}
