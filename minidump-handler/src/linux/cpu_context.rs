//! Raw CPU context records in the dump's wire layout.
//!
//! `u128` is avoided on purpose: its 16 byte alignment would introduce
//! padding the format doesn't have, so 128-bit registers are two `u64`s.

#[derive(Copy, Clone)]
#[repr(C, packed(4))]
pub struct Uint128 {
    pub low: u64,
    pub high: u64,
}

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub type RawContextCpu = ContextAmd64;

        pub const CONTEXT_CPU_FLAGS: u32 = ContextAmd64::AMD64
            | ContextAmd64::CONTROL
            | ContextAmd64::INTEGER
            | ContextAmd64::SEGMENTS
            | ContextAmd64::FLOATING_POINT;
    } else if #[cfg(target_arch = "aarch64")] {
        pub type RawContextCpu = ContextArm64;

        pub const CONTEXT_CPU_FLAGS: u32 = ContextArm64::ARM64
            | ContextArm64::CONTROL
            | ContextArm64::INTEGER;
    } else {
        compile_error!("unsupported target architecture");
    }
}

#[cfg(target_arch = "x86_64")]
#[derive(Copy, Clone)]
#[repr(C, packed(4))]
pub struct ContextAmd64 {
    pub p1_home: u64,
    pub p2_home: u64,
    pub p3_home: u64,
    pub p4_home: u64,
    pub p5_home: u64,
    pub p6_home: u64,
    pub context_flags: u32,
    pub mx_csr: u32,
    pub cs: u16,
    pub ds: u16,
    pub es: u16,
    pub fs: u16,
    pub gs: u16,
    pub ss: u16,
    pub eflags: u32,
    pub dr0: u64,
    pub dr1: u64,
    pub dr2: u64,
    pub dr3: u64,
    pub dr6: u64,
    pub dr7: u64,
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbx: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    /// `XSAVE_FORMAT`, copied verbatim from the kernel's fpstate
    pub float_save: [u8; 512],
    pub vector_register: [Uint128; 26],
    pub vector_control: u64,
    pub debug_control: u64,
    pub last_branch_to_rip: u64,
    pub last_branch_from_rip: u64,
    pub last_exception_to_rip: u64,
    pub last_exception_from_rip: u64,
}

#[cfg(target_arch = "x86_64")]
impl ContextAmd64 {
    pub const AMD64: u32 = 0x0010_0000;
    pub const CONTROL: u32 = 0x1;
    pub const INTEGER: u32 = 0x2;
    pub const SEGMENTS: u32 = 0x4;
    pub const FLOATING_POINT: u32 = 0x8;

    #[inline]
    pub fn zeroed() -> Self {
        // An all-zero context is a valid (if empty) record
        unsafe { std::mem::zeroed() }
    }
}

#[cfg(target_arch = "aarch64")]
#[derive(Copy, Clone)]
#[repr(C, packed(4))]
pub struct ContextArm64 {
    pub context_flags: u32,
    pub cpsr: u32,
    /// x0-x28, fp, lr
    pub regs: [u64; 31],
    pub sp: u64,
    pub pc: u64,
    pub float_regs: [Uint128; 32],
    pub fpcr: u32,
    pub fpsr: u32,
    pub bcr: [u32; 8],
    pub bvr: [u64; 8],
    pub wcr: [u32; 2],
    pub wvr: [u64; 2],
}

#[cfg(target_arch = "aarch64")]
impl ContextArm64 {
    pub const ARM64: u32 = 0x0040_0000;
    pub const CONTROL: u32 = 0x1;
    pub const INTEGER: u32 = 0x2;
    pub const FLOATING_POINT: u32 = 0x4;

    #[inline]
    pub fn zeroed() -> Self {
        unsafe { std::mem::zeroed() }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn canonical_size() {
        #[cfg(target_arch = "x86_64")]
        assert_eq!(std::mem::size_of::<ContextAmd64>(), 1232);
        #[cfg(target_arch = "aarch64")]
        assert_eq!(std::mem::size_of::<ContextArm64>(), 912);
    }
}
