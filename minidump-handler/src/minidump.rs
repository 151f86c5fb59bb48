//! The on-disk minidump layout.
//!
//! The structs here are the exact bytes that land in the dump file, so they
//! are all `repr(C, packed(4))` like the reference headers; stream type
//! numbers and the file signature come from [`minidump_common`]. The layout
//! is the standard one, so any offline minidump consumer can symbolicate
//! the artifacts.

use crate::utils::FixedCStr;
use std::fmt::Write;

pub use minidump_common::format;
pub use minidump_common::format::MINIDUMP_STREAM_TYPE as StreamType;

/// CodeView signature used for ELF build ids, `'BpEL'`
pub const CV_SIGNATURE_ELF: u32 = 0x4270_454c;

pub const PROCESSOR_ARCHITECTURE_INTEL: u16 = 0;
pub const PROCESSOR_ARCHITECTURE_AMD64: u16 = 9;
pub const PROCESSOR_ARCHITECTURE_ARM64: u16 = 12;

pub const OS_LINUX: u32 = 0x8201;
pub const OS_ANDROID: u32 = 0x8203;

/// `flags1` bit marking `MiscInfo::process_id` as valid
pub const MISC1_PROCESS_ID: u32 = 0x1;

/// Maximum length of a dump path, including the nul terminator
pub const DUMP_PATH_CAP: usize = 512;

/// Identifies the single capture artifact of a fault.
///
/// The path is baked when the handler is attached: generating the random
/// file name costs an allocation-free `write!` here rather than work inside
/// the fault handler. The descriptor is transient, once the completion
/// callback has observed it only the file remains.
pub struct MinidumpDescriptor {
    path: FixedCStr<DUMP_PATH_CAP>,
}

impl MinidumpDescriptor {
    /// `<dump_dir>/<uuid>.dmp`. Fails if the assembled path doesn't fit
    /// [`DUMP_PATH_CAP`].
    pub fn new(dump_dir: &str, id: uuid::Uuid) -> Option<Self> {
        let mut path = FixedCStr::new();

        let dir = dump_dir.strip_suffix('/').unwrap_or(dump_dir);
        write!(&mut path, "{}/{}.dmp", dir, id.to_simple()).ok()?;

        Some(Self { path })
    }

    #[inline]
    pub fn path(&self) -> &std::ffi::CStr {
        self.path.as_ref()
    }

    #[inline]
    pub fn path_str(&self) -> &str {
        self.path.as_str()
    }
}

#[derive(Copy, Clone)]
#[repr(C, packed(4))]
pub struct Location {
    pub data_size: u32,
    pub rva: u32,
}

#[derive(Copy, Clone)]
#[repr(C, packed(4))]
pub struct Header {
    pub signature: u32,
    pub version: u32,
    pub stream_count: u32,
    pub stream_directory_rva: u32,
    pub checksum: u32,
    pub time_date_stamp: u32,
    pub flags: u64,
}

#[derive(Copy, Clone)]
#[repr(C, packed(4))]
pub struct Directory {
    pub stream_type: u32,
    pub location: Location,
}

#[derive(Copy, Clone)]
#[repr(C, packed(4))]
pub struct MemoryDescriptor {
    pub start_of_memory_range: u64,
    pub memory: Location,
}

#[derive(Copy, Clone)]
#[repr(C, packed(4))]
pub struct Thread {
    pub thread_id: u32,
    pub suspend_count: u32,
    pub priority_class: u32,
    pub priority: u32,
    pub teb: u64,
    pub stack: MemoryDescriptor,
    pub thread_context: Location,
}

#[derive(Copy, Clone)]
#[repr(C, packed(4))]
pub struct VsFixedFileInfo {
    pub signature: u32,
    pub struct_version: u32,
    pub file_version_hi: u32,
    pub file_version_lo: u32,
    pub product_version_hi: u32,
    pub product_version_lo: u32,
    pub file_flags_mask: u32,
    pub file_flags: u32,
    pub file_os: u32,
    pub file_type: u32,
    pub file_subtype: u32,
    pub file_date_hi: u32,
    pub file_date_lo: u32,
}

#[derive(Copy, Clone)]
#[repr(C, packed(4))]
pub struct Module {
    pub base_of_image: u64,
    pub size_of_image: u32,
    pub checksum: u32,
    pub time_date_stamp: u32,
    pub module_name_rva: u32,
    pub version_info: VsFixedFileInfo,
    pub cv_record: Location,
    pub misc_record: Location,
    pub reserved0: u64,
    pub reserved1: u64,
}

/// The `cpu` union of [`SystemInfo`]; on x86 the words are
/// `vendor_id[3]`, `version_information`, `feature_information` and
/// `amd_extended_cpu_features`
#[derive(Copy, Clone)]
#[repr(C, packed(4))]
pub struct CpuInfo {
    pub data: [u32; 6],
}

#[derive(Copy, Clone)]
#[repr(C, packed(4))]
pub struct SystemInfo {
    pub processor_architecture: u16,
    pub processor_level: u16,
    pub processor_revision: u16,
    pub number_of_processors: u8,
    pub product_type: u8,
    pub major_version: u32,
    pub minor_version: u32,
    pub build_number: u32,
    pub platform_id: u32,
    pub csd_version_rva: u32,
    pub suite_mask: u16,
    pub reserved2: u16,
    pub cpu: CpuInfo,
}

#[derive(Copy, Clone)]
#[repr(C, packed(4))]
pub struct MiscInfo {
    pub size_of_info: u32,
    pub flags1: u32,
    pub process_id: u32,
    pub process_create_time: u32,
    pub process_user_time: u32,
    pub process_kernel_time: u32,
}

#[derive(Copy, Clone)]
#[repr(C, packed(4))]
pub struct Exception {
    pub exception_code: u32,
    pub exception_flags: u32,
    pub exception_record: u64,
    pub exception_address: u64,
    pub number_parameters: u32,
    pub __align: u32,
    pub exception_information: [u64; 15],
}

#[derive(Copy, Clone)]
#[repr(C, packed(4))]
pub struct ExceptionStream {
    pub thread_id: u32,
    pub __align: u32,
    pub exception_record: Exception,
    pub thread_context: Location,
}

#[cfg(test)]
mod test {
    use super::*;
    use std::mem::size_of;

    /// Offline consumers read these structs at their canonical sizes, so a
    /// stray padding byte would corrupt every record that follows.
    #[test]
    fn canonical_sizes() {
        assert_eq!(size_of::<Header>(), 32);
        assert_eq!(size_of::<Location>(), 8);
        assert_eq!(size_of::<Directory>(), 12);
        assert_eq!(size_of::<MemoryDescriptor>(), 16);
        assert_eq!(size_of::<Thread>(), 48);
        assert_eq!(size_of::<VsFixedFileInfo>(), 52);
        assert_eq!(size_of::<Module>(), 108);
        assert_eq!(size_of::<SystemInfo>(), 56);
        assert_eq!(size_of::<MiscInfo>(), 24);
        assert_eq!(size_of::<Exception>(), 152);
        assert_eq!(size_of::<ExceptionStream>(), 168);
    }

    #[test]
    fn descriptor_naming() {
        let id = uuid::Uuid::new_v4();

        let desc = MinidumpDescriptor::new("/tmp/dumps", id).unwrap();
        assert_eq!(
            desc.path_str(),
            format!("/tmp/dumps/{}.dmp", id.to_simple())
        );

        // trailing slash doesn't double up
        let desc = MinidumpDescriptor::new("/tmp/dumps/", id).unwrap();
        assert_eq!(
            desc.path_str(),
            format!("/tmp/dumps/{}.dmp", id.to_simple())
        );

        // an over-long directory is rejected, not truncated
        let long = "x".repeat(DUMP_PATH_CAP);
        assert!(MinidumpDescriptor::new(&long, id).is_none());
    }
}
