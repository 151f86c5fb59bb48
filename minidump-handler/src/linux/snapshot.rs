use crate::utils::{self, fs, FixedCStr, FixedStr};
use std::{
    fmt::{self, Write},
    io::Read,
};

// When we find the VDSO mapping in our address space, this is the name we
// use for it when writing it to the minidump. It doesn't show up with a
// filename in the maps list, but it can be located via the AT_SYSINFO_EHDR
// aux vector entry.
const LINUX_GATE_LIBRARY_NAME: &str = "linux-gate.so";

/// Entry address of the executable, auxv kind 9
const AT_ENTRY: usize = 9;
/// Base address of the vDSO, auxv kind 33
const AT_SYSINFO_EHDR: usize = 33;

/// Capacity of the thread table. Enumeration past this many threads stops
/// rather than failing, the dump just loses the tail.
pub const MAX_THREADS: usize = 256;
/// Capacity of the mapping table
pub const MAX_MAPPINGS: usize = 512;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Format(#[from] fmt::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("a mapping entry is invalid")]
    InvalidMapping,
    #[error("no threads were found")]
    NoThreads,
}

#[cfg_attr(test, derive(PartialEq, Debug))]
pub struct MappingInfo {
    pub start_addr: usize,
    pub size: usize,
    pub offset: usize,
    /// true if the mapping has the execute bit set.
    pub has_exec: bool,
    pub name: FixedStr<255>,
}

impl MappingInfo {
    const EMPTY: Self = Self {
        start_addr: 0,
        size: 0,
        offset: 0,
        has_exec: false,
        name: FixedStr::new(),
    };

    #[inline]
    pub fn contains_address(&self, address: usize) -> bool {
        self.start_addr <= address && address - self.start_addr < self.size
    }

    /// Whether this mapping should be reported as a loaded module. The
    /// first mapped segment of a library has file offset zero; later
    /// segments of the same library were already merged into it.
    #[inline]
    pub fn is_module(&self) -> bool {
        !self.name.is_empty() && self.offset == 0 && self.has_exec && self.size >= 4 * 1024
    }
}

impl std::str::FromStr for MappingInfo {
    type Err = Error;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        // start       - end         permissions offset   dev   inode       pathname
        // 7feca168a000-7feca1699000 rwxp        00007000 fd:00 1705088     /usr/lib64/libpthread-2.33.so
        fn do_parse(line: &str) -> Option<MappingInfo> {
            let dash_ind = line.find('-')?;
            let start_addr = usize::from_str_radix(&line[..dash_ind], 16).ok()?;

            let end = line[dash_ind + 1..].find(' ')? + dash_ind + 1;
            let end_addr = usize::from_str_radix(&line[dash_ind + 1..end], 16).ok()?;

            if end_addr < start_addr {
                return None;
            }

            let has_exec = line.get(end + 1..end + 5)?.contains('x');

            let offset_start = end + 6;
            let offset_end = line[offset_start..].find(' ')? + offset_start;
            let offset = usize::from_str_radix(&line[offset_start..offset_end], 16).ok()?;

            let mut name = FixedStr::<255>::new();

            // Take the path, special entries like [vdso] are fixed up later
            if let Some(path_start) = line[offset_end..].find('/') {
                name.write_str(line[offset_end + path_start..].trim_end())
                    .ok()?;
            }

            Some(MappingInfo {
                start_addr,
                size: end_addr - start_addr,
                offset,
                has_exec,
                name,
            })
        }

        do_parse(line).ok_or(Error::InvalidMapping)
    }
}

/// A capture of the process's own threads and memory mappings, filled in
/// from `/proc/self` on the faulting thread.
///
/// All storage is inline so that [`capture`](Self::capture) performs no
/// heap allocation; the snapshot itself is reserved when the handler is
/// installed, while the process is still healthy.
pub struct ProcessSnapshot {
    pub pid: u32,
    threads: [u32; MAX_THREADS],
    num_threads: usize,
    mappings: [MappingInfo; MAX_MAPPINGS],
    num_mappings: usize,
    /// `AT_ENTRY`, used to identify the main executable's mapping
    entry_point: Option<usize>,
    /// `AT_SYSINFO_EHDR`, the vDSO base
    linux_gate: Option<usize>,
}

impl ProcessSnapshot {
    pub const fn new() -> Self {
        Self {
            pid: 0,
            threads: [0; MAX_THREADS],
            num_threads: 0,
            mappings: [MappingInfo::EMPTY; MAX_MAPPINGS],
            num_mappings: 0,
            entry_point: None,
            linux_gate: None,
        }
    }

    /// Fills the snapshot from `/proc/self`. Safe to call from a signal
    /// handler, everything it reads goes through raw syscalls into inline
    /// buffers.
    pub fn capture(&mut self) -> Result<(), Error> {
        self.pid = unsafe { libc::getpid() as u32 };
        self.num_threads = 0;
        self.num_mappings = 0;

        self.read_auxv()?;
        self.enumerate_threads()?;
        self.enumerate_mappings()?;

        Ok(())
    }

    #[inline]
    pub fn threads(&self) -> &[u32] {
        &self.threads[..self.num_threads]
    }

    #[inline]
    pub fn mappings(&self) -> &[MappingInfo] {
        &self.mappings[..self.num_mappings]
    }

    /// Find the mapping the given address falls in.
    #[inline]
    pub fn find_mapping(&self, address: usize) -> Option<&MappingInfo> {
        self.mappings()
            .iter()
            .find(|mapping| mapping.contains_address(address))
    }

    /// Get the block of stack memory to record, given the stack pointer. We
    /// don't try to walk the stack since we might not have the information
    /// needed to unwind, so we just grab, up to, 32k of stack.
    ///
    /// # Safety
    ///
    /// The returned slice aliases whatever the containing mapping holds and
    /// is only valid while that mapping stays mapped.
    pub unsafe fn get_stack_info(&self, stack_pointer: usize) -> Option<&'_ [u8]> {
        // Move the stack pointer to the bottom of the page that it's in.
        let page_size = utils::page_size();
        let stack_ptr = stack_pointer & !(page_size - 1);

        self.mappings().iter().find_map(|mapping| {
            if mapping.contains_address(stack_ptr) {
                let len = std::cmp::min(mapping.size - (stack_ptr - mapping.start_addr), 32 * 1024);

                Some(std::slice::from_raw_parts(stack_ptr as *const u8, len))
            } else {
                None
            }
        })
    }

    /// Reads `/proc/self/auxv` for the two entries the writer cares about,
    /// the executable's entry point and the vDSO base.
    fn read_auxv(&mut self) -> Result<(), Error> {
        self.entry_point = None;
        self.linux_gate = None;

        let mut path = FixedCStr::<32>::new();
        write!(&mut path, "/proc/self/auxv")?;

        let mut oo = fs::OpenOptions::new();
        oo.read(true);
        let mut auxv = fs::open(&path, oo)?;

        use std::convert::TryInto;

        // Each entry is a (kind, value) pair of native words
        const WORD: usize = std::mem::size_of::<usize>();
        let mut entry = [0u8; WORD * 2];

        while let Ok(read) = auxv.read(&mut entry) {
            if read < entry.len() {
                break;
            }

            let kind = usize::from_ne_bytes(entry[..WORD].try_into().unwrap());
            let val = usize::from_ne_bytes(entry[WORD..].try_into().unwrap());

            match kind {
                AT_ENTRY => self.entry_point = Some(val),
                AT_SYSINFO_EHDR => self.linux_gate = Some(val),
                _ => {}
            }
        }

        Ok(())
    }

    fn enumerate_threads(&mut self) -> Result<(), Error> {
        let mut path = FixedCStr::<32>::new();
        write!(&mut path, "/proc/self/task")?;

        // /proc/self/task contains a subdirectory for each thread in the
        // process, named with its numerical thread id. The directory may
        // contain duplicate entries which we filter by assuming that they
        // are consecutive.
        let mut last_tid = None;

        let threads = &mut self.threads;
        let num_threads = &mut self.num_threads;

        fs::for_each_entry(&path, |name| {
            let tid = match std::str::from_utf8(name).ok().and_then(|n| n.parse().ok()) {
                Some(tid) => tid,
                None => return,
            };

            if Some(tid) != last_tid && *num_threads < MAX_THREADS {
                last_tid = Some(tid);
                threads[*num_threads] = tid;
                *num_threads += 1;
            }
        })?;

        if *num_threads > 0 {
            Ok(())
        } else {
            Err(Error::NoThreads)
        }
    }

    fn enumerate_mappings(&mut self) -> Result<(), Error> {
        let mut path = FixedCStr::<32>::new();
        write!(&mut path, "/proc/self/maps")?;

        let mut oo = fs::OpenOptions::new();
        oo.read(true);
        let mfile = fs::open(&path, oo)?;

        let line_reader = utils::LineReader::<_, 512>::new(mfile);

        for line in line_reader {
            let line = line.as_ref();

            let mut info = match line.parse::<MappingInfo>() {
                Ok(info) => info,
                Err(_) => continue,
            };

            if Some(info.start_addr) == self.linux_gate {
                info.name.clear();
                info.name.write_str(LINUX_GATE_LIBRARY_NAME).ok();
                info.offset = 0;
            }

            // Merge adjacent mappings into one module, assuming they're a
            // single library mapped by the dynamic linker. Do this only if
            // their name matches and either they have the same +x protection
            // flag, or if the previous mapping is not executable and the new
            // one is, to handle lld's output.
            if let Some(last) = self.mappings[..self.num_mappings].last_mut() {
                if info.start_addr == last.start_addr + last.size
                    && info.name.as_ref() == last.name.as_ref()
                    && (info.has_exec == last.has_exec || !last.has_exec && info.has_exec)
                {
                    last.size += info.size;
                    last.has_exec |= info.has_exec;
                    continue;
                }
            }

            if self.num_mappings < MAX_MAPPINGS {
                self.mappings[self.num_mappings] = info;
                self.num_mappings += 1;
            }
        }

        // The minidump format assumes the first module is the main
        // executable. It usually owns the first mapping, but that's not
        // guaranteed, so locate it by the actual entry point and move it
        // to the front if needed.
        if let Some(ep) = self.entry_point {
            if let Some(entry_pos) = self.mappings[..self.num_mappings]
                .iter()
                .position(|mapping| mapping.contains_address(ep))
            {
                if entry_pos != 0 {
                    self.mappings[..=entry_pos].rotate_right(1);
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rstest::rstest;

    fn fixed(s: &str) -> FixedStr<255> {
        let mut f = FixedStr::new();
        f.write_str(s).unwrap();
        f
    }

    #[rstest]
    #[case::anonymous(
        "57942200000-57942300000 rw-p 00000000 00:00 0",
        MappingInfo {
            start_addr: 0x57942200000,
            size: 0x100000,
            offset: 0,
            has_exec: false,
            name: FixedStr::new(),
        }
    )]
    #[case::library(
        "7feca169f000-7feca16a0000 rw-p 0001b000 fd:00 1705088                    /usr/lib64/libpthread-2.33.so",
        MappingInfo {
            start_addr: 0x7feca169f000,
            size: 0x1000,
            offset: 0x1b000,
            has_exec: false,
            name: fixed("/usr/lib64/libpthread-2.33.so"),
        }
    )]
    #[case::vdso(
        "7fff249fc000-7fff249fe000 r-xp 00000000 00:00 0                          [vdso]",
        MappingInfo {
            start_addr: 0x7fff249fc000,
            size: 0x2000,
            offset: 0,
            has_exec: true,
            name: FixedStr::new(),
        }
    )]
    fn parses_maps(#[case] line: &str, #[case] expected: MappingInfo) {
        let parsed: MappingInfo = line.parse().unwrap();
        assert_eq!(parsed, expected);
    }

    #[test]
    fn rejects_garbage() {
        assert!("".parse::<MappingInfo>().is_err());
        assert!("7fff249fc000 r-xp".parse::<MappingInfo>().is_err());
    }

    #[test]
    fn captures_own_process() {
        let mut snapshot = Box::new(ProcessSnapshot::new());
        snapshot.capture().unwrap();

        assert_eq!(snapshot.pid, std::process::id());

        let tid = unsafe { libc::syscall(libc::SYS_gettid) } as u32;
        assert!(snapshot.threads().contains(&tid));

        // The code of this test lives in an executable mapping
        let code_addr = captures_own_process as usize;
        let code = snapshot.find_mapping(code_addr).unwrap();
        assert!(code.has_exec);

        // At least the executable and libc should qualify as modules
        assert!(snapshot.mappings().iter().any(|m| m.is_module()));

        // A local lives in a mapped stack
        let local = 0u64;
        let stack = unsafe { snapshot.get_stack_info(&local as *const _ as usize) }.unwrap();
        assert!(!stack.is_empty());
        assert!(stack.len() <= 32 * 1024);
    }
}
