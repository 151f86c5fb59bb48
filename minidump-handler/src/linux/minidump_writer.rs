use super::{
    cpu_context::RawContextCpu,
    elf::ElfId,
    file_writer::FileWriter,
    handler::CrashContext,
    snapshot::ProcessSnapshot,
};
use crate::minidump::*;
use std::{ffi::CStr, fmt::Write as _, mem, ptr};

#[derive(thiserror::Error, Debug)]
pub enum WriterError {
    #[error(transparent)]
    Snapshot(#[from] super::snapshot::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The memory list carries the crashing thread's stack plus the window
/// around its instruction pointer
const MAX_MEMORY_BLOCKS: usize = 2;

/// Bytes of context kept around the crashing instruction pointer
const IP_MEM_SIZE: usize = 256;

// Writes a minidump to an already opened file. None of this mallocs or
// calls libc functions which may, so it can run while the state of the
// heap is corrupt.
struct MinidumpWriter<'crash> {
    crash_context: &'crash CrashContext,
    snapshot: &'crash ProcessSnapshot,
    crashing_thread_context: Location,
    memory_blocks: [MemoryDescriptor; MAX_MEMORY_BLOCKS],
    num_memory_blocks: usize,
}

impl<'crash> MinidumpWriter<'crash> {
    fn dump(mut self, file: &mut std::fs::File) -> Result<(), WriterError> {
        // A minidump file contains a number of tagged streams. This is the
        // number of streams which we write.
        const NUM_STREAMS: u32 = 6;

        let mut fw = FileWriter::new(file);

        // Flush the header on its own first. If a nested fault occurs
        // somewhere below, at least the header will be intact.
        {
            let item = fw.reserve::<Header>()?;
            item.write(
                Header {
                    signature: format::MINIDUMP_SIGNATURE,
                    version: format::MINIDUMP_VERSION,
                    stream_count: NUM_STREAMS,
                    stream_directory_rva: mem::size_of::<Header>() as u32,
                    checksum: 0,
                    time_date_stamp: unsafe { libc::time(ptr::null_mut()) as u32 },
                    flags: 0,
                },
                &mut fw,
            )?;

            fw.flush()?;
        }

        let dir = fw.reserve_array::<Directory>(NUM_STREAMS as usize)?;
        let mut dir_index = 0;

        dir.write(dir_index, self.write_system_info(&mut fw)?, &mut fw)?;
        dir_index += 1;

        dir.write(dir_index, self.write_misc_info(&mut fw)?, &mut fw)?;
        dir_index += 1;

        dir.write(dir_index, self.write_thread_list(&mut fw)?, &mut fw)?;
        dir_index += 1;

        // Depends on the crashing thread's context location, so the thread
        // list must come first
        dir.write(dir_index, self.write_exception(&mut fw)?, &mut fw)?;
        dir_index += 1;

        dir.write(dir_index, self.write_module_list(&mut fw)?, &mut fw)?;
        dir_index += 1;

        dir.write(dir_index, self.write_memory_list(&mut fw)?, &mut fw)?;

        fw.finalize()?;

        Ok(())
    }

    fn write_system_info(&mut self, fw: &mut FileWriter<'_>) -> Result<Directory, WriterError> {
        let mut uts: libc::utsname = unsafe { mem::zeroed() };
        unsafe { libc::uname(&mut uts) };

        // "Linux 5.15.0 #1 SMP ... x86_64" style version string, assembled
        // inline
        let mut os_version = crate::utils::FixedStr::<512>::new();
        for (i, field) in [
            uts.sysname.as_ptr(),
            uts.release.as_ptr(),
            uts.version.as_ptr(),
            uts.machine.as_ptr(),
        ]
        .iter()
        .enumerate()
        {
            let field = unsafe { CStr::from_ptr(*field) }.to_str().unwrap_or("");
            if i > 0 {
                os_version.write_str(" ").ok();
            }
            os_version.write_str(field).ok();
        }

        let csd_loc = fw.write_string(os_version.as_ref())?;

        let num_cpus = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
        let number_of_processors = if (1..=255).contains(&num_cpus) {
            num_cpus as u8
        } else {
            1
        };

        cfg_if::cfg_if! {
            if #[cfg(target_arch = "x86_64")] {
                let processor_architecture = PROCESSOR_ARCHITECTURE_AMD64;
            } else if #[cfg(target_arch = "aarch64")] {
                let processor_architecture = PROCESSOR_ARCHITECTURE_ARM64;
            } else {
                compile_error!("unsupported target architecture");
            }
        }

        #[cfg(target_os = "android")]
        let platform_id = OS_ANDROID;
        #[cfg(not(target_os = "android"))]
        let platform_id = OS_LINUX;

        let (processor_level, processor_revision, cpu) = cpu_info();

        let item = fw.reserve::<SystemInfo>()?;
        let dir_ent = Directory {
            stream_type: StreamType::SystemInfoStream as u32,
            location: item.location(),
        };

        item.write(
            SystemInfo {
                processor_architecture,
                processor_level,
                processor_revision,
                number_of_processors,
                product_type: 0,
                major_version: 0,
                minor_version: 0,
                build_number: 0,
                platform_id,
                csd_version_rva: csd_loc.rva,
                suite_mask: 0,
                reserved2: 0,
                cpu,
            },
            fw,
        )?;

        Ok(dir_ent)
    }

    fn write_misc_info(&mut self, fw: &mut FileWriter<'_>) -> Result<Directory, WriterError> {
        let item = fw.reserve::<MiscInfo>()?;
        let dir_ent = Directory {
            stream_type: StreamType::MiscInfoStream as u32,
            location: item.location(),
        };

        item.write(
            MiscInfo {
                size_of_info: mem::size_of::<MiscInfo>() as u32,
                flags1: MISC1_PROCESS_ID,
                process_id: self.snapshot.pid,
                process_create_time: 0,
                process_user_time: 0,
                process_kernel_time: 0,
            },
            fw,
        )?;

        Ok(dir_ent)
    }

    fn write_thread_list(&mut self, fw: &mut FileWriter<'_>) -> Result<Directory, WriterError> {
        let threads = self.snapshot.threads();

        let tlist = fw.reserve_header_array::<u32, Thread>(threads.len())?;
        tlist.write_header(threads.len() as u32, fw)?;

        let dir_ent = Directory {
            stream_type: StreamType::ThreadListStream as u32,
            location: tlist.location(),
        };

        // Only the faulting thread carries real registers; we never stop
        // the other threads, so their contexts would be whatever they
        // raced to at capture time anyway. They all share one empty record.
        let shared_ctx = fw.reserve::<RawContextCpu>()?;
        let shared_ctx_loc = shared_ctx.location();
        shared_ctx.write(RawContextCpu::zeroed(), fw)?;

        for (counter, tid) in threads.iter().enumerate() {
            let mut thread: Thread = unsafe { mem::zeroed() };
            thread.thread_id = *tid;

            if *tid as libc::pid_t == self.crash_context.tid {
                // The interesting context of the faulting thread comes from
                // the signal frame, anything read live would just point to
                // our own handler
                let uctx = &self.crash_context.ucontext;

                let stack_pointer = uctx.stack_pointer();
                thread.stack.start_of_memory_range = stack_pointer as u64;

                if let Some(stack) = unsafe { self.snapshot.get_stack_info(stack_pointer) } {
                    thread.stack.start_of_memory_range = stack.as_ptr() as u64;
                    thread.stack.memory = fw.write_bytes(stack)?;

                    self.push_memory_block(thread.stack);
                }

                // Keep some bytes of context around the crashing IP so the
                // faulting instruction can be disassembled offline
                let ip = uctx.instruction_pointer();
                if let Some(mapping) = self.snapshot.find_mapping(ip) {
                    let start = std::cmp::max(mapping.start_addr, ip.saturating_sub(IP_MEM_SIZE / 2));
                    let end = std::cmp::min(mapping.start_addr + mapping.size, ip + IP_MEM_SIZE / 2);

                    let window = unsafe {
                        std::slice::from_raw_parts(start as *const u8, end - start)
                    };
                    let window_loc = fw.write_bytes(window)?;

                    self.push_memory_block(MemoryDescriptor {
                        start_of_memory_range: start as u64,
                        memory: window_loc,
                    });
                }

                let mut cpu = RawContextCpu::zeroed();
                #[cfg(target_arch = "x86_64")]
                uctx.fill_cpu_context(self.crash_context.float_state.as_ref(), &mut cpu);
                #[cfg(not(target_arch = "x86_64"))]
                uctx.fill_cpu_context(&mut cpu);

                let md_cpu = fw.reserve::<RawContextCpu>()?;
                thread.thread_context = md_cpu.location();
                self.crashing_thread_context = md_cpu.location();
                md_cpu.write(cpu, fw)?;
            } else {
                thread.thread_context = shared_ctx_loc;
            }

            tlist.write(counter, thread, fw)?;
        }

        Ok(dir_ent)
    }

    fn write_exception(&mut self, fw: &mut FileWriter<'_>) -> Result<Directory, WriterError> {
        let item = fw.reserve::<ExceptionStream>()?;
        let dir_ent = Directory {
            stream_type: StreamType::ExceptionStream as u32,
            location: item.location(),
        };

        let siginfo = &self.crash_context.siginfo;

        let mut exception_record: Exception = unsafe { mem::zeroed() };
        exception_record.exception_code = siginfo.si_signo as u32;
        exception_record.exception_flags = siginfo.si_code as u32;
        exception_record.exception_address = unsafe { siginfo.si_addr() } as u64;

        item.write(
            ExceptionStream {
                thread_id: self.crash_context.tid as u32,
                __align: 0,
                exception_record,
                thread_context: self.crashing_thread_context,
            },
            fw,
        )?;

        Ok(dir_ent)
    }

    fn write_module_list(&mut self, fw: &mut FileWriter<'_>) -> Result<Directory, WriterError> {
        let modules = || self.snapshot.mappings().iter().filter(|m| m.is_module());

        let num_modules = modules().count();

        let mlist = fw.reserve_header_array::<u32, Module>(num_modules)?;
        mlist.write_header(num_modules as u32, fw)?;

        let dir_ent = Directory {
            stream_type: StreamType::ModuleListStream as u32,
            location: mlist.location(),
        };

        for (i, mapping) in modules().enumerate() {
            let name_loc = fw.write_string(mapping.name.as_ref())?;

            // CodeView record carrying the image's build id, the link the
            // offline symbolizer uses to find matching debug info
            let mapped = unsafe {
                std::slice::from_raw_parts(mapping.start_addr as *const u8, mapping.size)
            };

            let cv_record = match ElfId::from_mapped_image(mapped) {
                Some(id) => {
                    let id = id.as_ref();

                    let mut cv = [0u8; 4 + 64];
                    cv[..4].copy_from_slice(&CV_SIGNATURE_ELF.to_le_bytes());
                    cv[4..4 + id.len()].copy_from_slice(id);

                    fw.write_bytes(&cv[..4 + id.len()])?
                }
                None => Location {
                    data_size: 0,
                    rva: 0,
                },
            };

            let mut module: Module = unsafe { mem::zeroed() };
            module.base_of_image = mapping.start_addr as u64;
            module.size_of_image = mapping.size as u32;
            module.module_name_rva = name_loc.rva;
            module.cv_record = cv_record;

            mlist.write(i, module, fw)?;
        }

        Ok(dir_ent)
    }

    fn write_memory_list(&mut self, fw: &mut FileWriter<'_>) -> Result<Directory, WriterError> {
        let blocks = &self.memory_blocks[..self.num_memory_blocks];

        let mlist = fw.reserve_header_array::<u32, MemoryDescriptor>(blocks.len())?;
        mlist.write_header(blocks.len() as u32, fw)?;

        let dir_ent = Directory {
            stream_type: StreamType::MemoryListStream as u32,
            location: mlist.location(),
        };

        for (i, block) in blocks.iter().enumerate() {
            mlist.write(i, *block, fw)?;
        }

        Ok(dir_ent)
    }

    fn push_memory_block(&mut self, block: MemoryDescriptor) {
        if self.num_memory_blocks < MAX_MEMORY_BLOCKS {
            self.memory_blocks[self.num_memory_blocks] = block;
            self.num_memory_blocks += 1;
        }
    }
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
fn cpu_info() -> (u16, u16, CpuInfo) {
    let vendor = raw_cpuid::cpuid!(0);
    let version = raw_cpuid::cpuid!(1);
    let extended = raw_cpuid::cpuid!(0x8000_0001u32);

    let family = (version.eax >> 8) & 0xf;
    let model = (version.eax >> 4) & 0xf;
    let stepping = version.eax & 0xf;

    (
        family as u16,
        ((model << 8) | stepping) as u16,
        CpuInfo {
            data: [
                vendor.ebx,
                vendor.edx,
                vendor.ecx,
                version.eax,
                version.edx,
                extended.ecx,
            ],
        },
    )
}

#[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
fn cpu_info() -> (u16, u16, CpuInfo) {
    (0, 0, CpuInfo { data: [0; 6] })
}

/// Writes the six streams of the dump to `file`.
///
/// `snapshot` must already be captured; the split keeps the process
/// enumeration reusable while this stays a single pass over it.
pub(crate) fn write_minidump(
    file: &mut std::fs::File,
    context: &CrashContext,
    snapshot: &ProcessSnapshot,
) -> Result<(), WriterError> {
    let writer = MinidumpWriter {
        crash_context: context,
        snapshot,
        crashing_thread_context: Location {
            data_size: 0,
            rva: 0,
        },
        memory_blocks: [MemoryDescriptor {
            start_of_memory_range: 0,
            memory: Location {
                data_size: 0,
                rva: 0,
            },
        }; MAX_MEMORY_BLOCKS],
        num_memory_blocks: 0,
    };

    writer.dump(file)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::{
        convert::TryInto,
        io::{Read, Seek, SeekFrom},
    };

    fn read_u32(bytes: &[u8], offset: usize) -> u32 {
        u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap())
    }

    #[test]
    fn writes_all_streams() {
        let mut snapshot = Box::new(ProcessSnapshot::new());
        snapshot.capture().unwrap();

        let context = CrashContext::for_current_thread(unsafe { mem::zeroed() });

        let path = std::env::temp_dir().join(format!("mdh-writer-{}.dmp", std::process::id()));
        let mut file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .unwrap();

        write_minidump(&mut file, &context, &snapshot).unwrap();

        let mut contents = Vec::new();
        file.seek(SeekFrom::Start(0)).unwrap();
        file.read_to_end(&mut contents).unwrap();

        // Header
        assert_eq!(read_u32(&contents, 0), format::MINIDUMP_SIGNATURE);
        assert_eq!(read_u32(&contents, 4), format::MINIDUMP_VERSION);
        let stream_count = read_u32(&contents, 8);
        assert_eq!(stream_count, 6);
        let dir_rva = read_u32(&contents, 12) as usize;

        // Each directory entry points inside the file at a non-empty stream
        let mut seen = Vec::new();
        for i in 0..stream_count as usize {
            let entry = dir_rva + i * mem::size_of::<Directory>();
            let stream_type = read_u32(&contents, entry);
            let size = read_u32(&contents, entry + 4) as usize;
            let rva = read_u32(&contents, entry + 8) as usize;

            assert!(rva + size <= contents.len());
            seen.push(stream_type);

            if stream_type == StreamType::MiscInfoStream as u32 {
                // flags1 marks the pid as valid and it is ours
                assert_eq!(read_u32(&contents, rva + 4), MISC1_PROCESS_ID);
                assert_eq!(read_u32(&contents, rva + 8), std::process::id());
            }

            if stream_type == StreamType::ThreadListStream as u32 {
                let num_threads = read_u32(&contents, rva);
                assert!(num_threads >= 1);
            }

            if stream_type == StreamType::ExceptionStream as u32 {
                let tid = read_u32(&contents, rva);
                assert_eq!(tid as i64, unsafe { libc::syscall(libc::SYS_gettid) });
            }
        }

        for expected in [
            StreamType::SystemInfoStream,
            StreamType::MiscInfoStream,
            StreamType::ThreadListStream,
            StreamType::ExceptionStream,
            StreamType::ModuleListStream,
            StreamType::MemoryListStream,
        ] {
            assert!(seen.contains(&(expected as u32)));
        }

        std::fs::remove_file(path).unwrap();
    }
}
