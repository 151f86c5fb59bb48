use super::cpu_context::{RawContextCpu, CONTEXT_CPU_FLAGS};

/// Wrapper around the [`libc::ucontext_t`] snapshotted when the fault was
/// delivered
pub(crate) struct UContext {
    pub inner: libc::ucontext_t,
}

impl UContext {
    #[inline]
    pub fn stack_pointer(&self) -> usize {
        #[cfg(target_arch = "x86_64")]
        {
            self.inner.uc_mcontext.gregs[libc::REG_RSP as usize] as usize
        }
        #[cfg(target_arch = "aarch64")]
        {
            self.inner.uc_mcontext.sp as usize
        }
    }

    #[inline]
    pub fn instruction_pointer(&self) -> usize {
        #[cfg(target_arch = "x86_64")]
        {
            self.inner.uc_mcontext.gregs[libc::REG_RIP as usize] as usize
        }
        #[cfg(target_arch = "aarch64")]
        {
            self.inner.uc_mcontext.pc as usize
        }
    }

    /// Converts the kernel-provided machine context into the dump's CPU
    /// context record. `float_state` is the fpstate captured alongside the
    /// ucontext, where the architecture has one.
    pub fn fill_cpu_context(
        &self,
        #[cfg(target_arch = "x86_64")] float_state: Option<&libc::_libc_fpstate>,
        out: &mut RawContextCpu,
    ) {
        *out = RawContextCpu::zeroed();
        out.context_flags = CONTEXT_CPU_FLAGS;

        #[cfg(target_arch = "x86_64")]
        {
            let gregs = &self.inner.uc_mcontext.gregs;

            // csgsfs packs the selectors into one register
            out.cs = (gregs[libc::REG_CSGSFS as usize] & 0xffff) as u16;
            out.gs = ((gregs[libc::REG_CSGSFS as usize] >> 16) & 0xffff) as u16;
            out.fs = ((gregs[libc::REG_CSGSFS as usize] >> 32) & 0xffff) as u16;

            out.eflags = gregs[libc::REG_EFL as usize] as u32;

            out.rax = gregs[libc::REG_RAX as usize] as u64;
            out.rcx = gregs[libc::REG_RCX as usize] as u64;
            out.rdx = gregs[libc::REG_RDX as usize] as u64;
            out.rbx = gregs[libc::REG_RBX as usize] as u64;
            out.rsp = gregs[libc::REG_RSP as usize] as u64;
            out.rbp = gregs[libc::REG_RBP as usize] as u64;
            out.rsi = gregs[libc::REG_RSI as usize] as u64;
            out.rdi = gregs[libc::REG_RDI as usize] as u64;
            out.r8 = gregs[libc::REG_R8 as usize] as u64;
            out.r9 = gregs[libc::REG_R9 as usize] as u64;
            out.r10 = gregs[libc::REG_R10 as usize] as u64;
            out.r11 = gregs[libc::REG_R11 as usize] as u64;
            out.r12 = gregs[libc::REG_R12 as usize] as u64;
            out.r13 = gregs[libc::REG_R13 as usize] as u64;
            out.r14 = gregs[libc::REG_R14 as usize] as u64;
            out.r15 = gregs[libc::REG_R15 as usize] as u64;
            out.rip = gregs[libc::REG_RIP as usize] as u64;

            if let Some(fp) = float_state {
                // The kernel's fpstate is already in XSAVE layout
                let src = crate::utils::to_byte_array(fp);
                let len = std::cmp::min(src.len(), 512);
                out.float_save[..len].copy_from_slice(&src[..len]);
            } else {
                out.context_flags &= !super::cpu_context::ContextAmd64::FLOATING_POINT;
            }
        }

        #[cfg(target_arch = "aarch64")]
        {
            let mctx = &self.inner.uc_mcontext;

            out.cpsr = mctx.pstate as u32;
            // Element writes, a slice copy would take an unaligned
            // reference into the packed record
            for i in 0..31 {
                out.regs[i] = mctx.regs[i];
            }
            out.sp = mctx.sp;
            out.pc = mctx.pc;
        }
    }
}
