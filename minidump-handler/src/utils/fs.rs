#![cfg(any(target_os = "linux", target_os = "android"))]

use std::{ffi::CStr, fs, io, os::unix::io::FromRawFd};

#[derive(Copy, Clone, Debug)]
pub struct OpenOptions {
    read: bool,
    write: bool,
    create_new: bool,
    mode: libc::mode_t,
}

impl OpenOptions {
    pub fn new() -> Self {
        Self {
            read: false,
            write: false,
            create_new: false,
            mode: 0o666,
        }
    }

    #[inline]
    pub fn read(&mut self, read: bool) -> &mut Self {
        self.read = read;
        self
    }

    #[inline]
    pub fn write(&mut self, write: bool) -> &mut Self {
        self.write = write;
        self
    }

    /// `O_CREAT | O_EXCL`
    #[inline]
    pub fn create_new(&mut self, create_new: bool) -> &mut Self {
        self.create_new = create_new;
        self
    }

    #[inline]
    pub fn mode(&mut self, mode: u32) -> &mut Self {
        self.mode = mode as libc::mode_t;
        self
    }

    fn flags(&self) -> io::Result<libc::c_int> {
        let access = match (self.read, self.write) {
            (true, false) => libc::O_RDONLY,
            (false, true) => libc::O_WRONLY,
            (true, true) => libc::O_RDWR,
            (false, false) => return Err(io::Error::from_raw_os_error(libc::EINVAL)),
        };

        let creation = if self.create_new {
            if !self.write {
                return Err(io::Error::from_raw_os_error(libc::EINVAL));
            }
            libc::O_CREAT | libc::O_EXCL
        } else {
            0
        };

        Ok(libc::O_CLOEXEC | access | creation)
    }
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// [`File::open`](std::fs::File::open) and friends heap allocate the path
/// buffer before making the syscall, so in the fault handler we have to make
/// the `open(2)` call ourselves from an already nul terminated path.
pub fn open(path: &impl AsRef<CStr>, opts: OpenOptions) -> io::Result<fs::File> {
    let flags = opts.flags()?;

    // `mode_t` can be 16 bits, but the vararg is integer promoted to c_int
    unsafe {
        let fd = libc::open(path.as_ref().as_ptr(), flags, opts.mode as libc::c_int);

        if fd == -1 {
            return Err(io::Error::last_os_error());
        }

        Ok(fs::File::from_raw_fd(fd))
    }
}

// `linux_dirent64` from getdents64(2): d_ino u64, d_off i64, d_reclen u16,
// d_type u8, then the nul terminated name inline. The record is unpadded and
// the buffer we read into carries no alignment, so the fields are picked out
// by byte offset.
const DIRENT_RECLEN_OFFSET: usize = 8 + 8;
const DIRENT_NAME_OFFSET: usize = 8 + 8 + 2 + 1;

/// Walks a directory with the raw `getdents64` syscall into a stack buffer.
///
/// `std::fs::read_dir` (and even libc's `opendir`) allocate, which we can't
/// afford when enumerating `/proc/self/task` with a possibly corrupt heap.
/// `f` is invoked with the bare name bytes of every entry except `.`/`..`.
pub fn for_each_entry(
    root: &impl AsRef<CStr>,
    mut f: impl FnMut(&[u8]),
) -> io::Result<()> {
    unsafe {
        let fd = libc::open(
            root.as_ref().as_ptr(),
            libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC,
        );
        if fd == -1 {
            return Err(io::Error::last_os_error());
        }

        let mut buf = [0u8; 1024];

        let res = loop {
            let nread = libc::syscall(
                libc::SYS_getdents64,
                fd,
                buf.as_mut_ptr().cast::<libc::c_void>(),
                buf.len(),
            );

            if nread == -1 {
                break Err(io::Error::last_os_error());
            } else if nread == 0 {
                break Ok(());
            }

            let mut offset = 0usize;
            while offset < nread as usize {
                let reclen = u16::from_ne_bytes([
                    buf[offset + DIRENT_RECLEN_OFFSET],
                    buf[offset + DIRENT_RECLEN_OFFSET + 1],
                ]) as usize;

                let name_ptr = buf.as_ptr().add(offset + DIRENT_NAME_OFFSET);
                let name = CStr::from_ptr(name_ptr.cast()).to_bytes();

                if name != b"." && name != b".." {
                    f(name);
                }

                offset += reclen;
            }
        };

        libc::close(fd);
        res
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::fmt::Write;

    #[test]
    fn walks_proc_task() {
        let mut path = crate::utils::FixedCStr::<32>::new();
        write!(&mut path, "/proc/{}/task", std::process::id()).unwrap();

        let mut found_self = false;
        for_each_entry(&path, |name| {
            let name = std::str::from_utf8(name).unwrap();
            // every entry is a numeric tid
            let tid: u32 = name.parse().unwrap();
            if tid == unsafe { libc::syscall(libc::SYS_gettid) } as u32 {
                found_self = true;
            }
        })
        .unwrap();

        assert!(found_self);
    }

    #[test]
    fn open_excl_refuses_existing() {
        let mut path = crate::utils::FixedCStr::<128>::new();
        write!(
            &mut path,
            "{}/mdh-fs-test-{}",
            std::env::temp_dir().display(),
            std::process::id()
        )
        .unwrap();

        let mut oo = OpenOptions::new();
        oo.write(true).create_new(true).mode(0o600);

        let _first = open(&path, oo).unwrap();
        assert!(open(&path, oo).is_err());

        std::fs::remove_file(path.as_str()).unwrap();
    }
}
