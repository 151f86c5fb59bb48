mod fixed_str;
pub mod fs;
mod line_reader;

pub use fixed_str::{FixedCStr, FixedStr};
pub use line_reader::LineReader;

#[inline]
pub fn to_byte_array<T: Sized>(item: &T) -> &[u8] {
    unsafe { std::slice::from_raw_parts((item as *const T).cast::<u8>(), std::mem::size_of::<T>()) }
}

/// Cached `sysconf(_SC_PAGESIZE)`. The syscall is made exactly once, so
/// reading this from the fault handler is just a load.
#[inline]
pub fn page_size() -> usize {
    static mut PAGE_SIZE: usize = 0;
    static INIT_PAGE_SIZE: parking_lot::Once = parking_lot::Once::new();

    unsafe {
        INIT_PAGE_SIZE.call_once(|| {
            PAGE_SIZE = libc::sysconf(libc::_SC_PAGESIZE) as usize;
        });
        PAGE_SIZE
    }
}
