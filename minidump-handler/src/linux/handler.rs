use super::{minidump_writer, snapshot::ProcessSnapshot, ucontext::UContext};
use crate::{minidump::MinidumpDescriptor, utils::fs, CrashEvent, Error};
use std::{
    cell::UnsafeCell,
    mem, ptr,
    sync::atomic::{AtomicBool, AtomicPtr, Ordering},
};

const MIN_STACK_SIZE: usize = 64 * 1024;
/// kill
const SI_USER: i32 = 0;
/// tkill, tgkill
const SI_TKILL: i32 = -6;

/// The various signals we attempt to handle
pub(crate) const EXCEPTION_SIGNALS: [libc::c_int; 6] = [
    libc::SIGSEGV,
    libc::SIGABRT,
    libc::SIGFPE,
    libc::SIGILL,
    libc::SIGBUS,
    libc::SIGTRAP,
];

/// The registered handler. Written exactly once, while registration holds
/// the state machine in its transitional state, and only read afterwards.
static HANDLER: AtomicPtr<HandlerInner> = AtomicPtr::new(ptr::null_mut());

/// Taken by the first faulting thread. A thread that faults while another
/// one is already dumping just falls through to the default disposition.
static DUMPING: AtomicBool = AtomicBool::new(false);

struct OldHandlers(UnsafeCell<Option<[libc::sigaction; 6]>>);

// Written during registration only, the fault path just reads
unsafe impl Sync for OldHandlers {}

static OLD_HANDLERS: OldHandlers = OldHandlers(UnsafeCell::new(None));

struct ContextSlot(UnsafeCell<mem::MaybeUninit<CrashContext>>);

unsafe impl Sync for ContextSlot {}

/// `CrashContext` is too big for the alternate stack, so the faulting
/// thread fills this .bss slot instead. Guarded by [`DUMPING`].
static CRASH_CONTEXT: ContextSlot = ContextSlot(UnsafeCell::new(mem::MaybeUninit::uninit()));

/// Create an alternative stack to run the signal handlers on. This is done
/// since the signal might have been caused by a stack overflow.
unsafe fn install_sigaltstack() -> Result<(), Error> {
    // Check to see if the existing sigaltstack, if it exists, is big
    // enough. If so we don't need to allocate our own.
    let mut old_stack = mem::zeroed();
    if libc::sigaltstack(ptr::null(), &mut old_stack) != 0 {
        return Err(Error::Os(std::io::Error::last_os_error()));
    }

    if old_stack.ss_flags & libc::SS_DISABLE == 0 && old_stack.ss_size >= MIN_STACK_SIZE {
        return Ok(());
    }

    // ... but failing that we need to allocate our own, with a guard page
    // below it so that runaway recursion faults cleanly.
    let page_size = crate::utils::page_size();
    let guard_size = page_size;
    let alloc_size = guard_size + MIN_STACK_SIZE;

    let alloc = libc::mmap(
        ptr::null_mut(),
        alloc_size,
        libc::PROT_NONE,
        libc::MAP_PRIVATE | libc::MAP_ANON,
        -1,
        0,
    );
    if alloc == libc::MAP_FAILED {
        return Err(Error::Os(std::io::Error::last_os_error()));
    }

    let stack_ptr = (alloc as usize + guard_size) as *mut libc::c_void;
    if libc::mprotect(
        stack_ptr,
        MIN_STACK_SIZE,
        libc::PROT_READ | libc::PROT_WRITE,
    ) != 0
    {
        return Err(Error::Os(std::io::Error::last_os_error()));
    }

    let new_stack = libc::stack_t {
        ss_sp: stack_ptr,
        ss_flags: 0,
        ss_size: MIN_STACK_SIZE,
    };
    if libc::sigaltstack(&new_stack, ptr::null_mut()) != 0 {
        return Err(Error::Os(std::io::Error::last_os_error()));
    }

    Ok(())
}

/// Restores the signal handler for the specified signal back to the
/// default handler
unsafe fn install_default_handler(sig: libc::c_int) {
    // Android L+ expose signal and sigaction symbols that override the
    // system ones. There is a bug in these functions where a request to set
    // the handler to SIG_DFL is ignored. In that case, an infinite loop is
    // entered as the signal is repeatedly sent to this signal handler.
    // To work around this, directly call the system's sigaction.

    if cfg!(target_os = "android") {
        let mut sa: libc::sigaction = mem::zeroed();
        libc::sigemptyset(&mut sa.sa_mask);
        sa.sa_sigaction = libc::SIG_DFL;
        sa.sa_flags = libc::SA_RESTART;
        libc::syscall(
            libc::SYS_rt_sigaction,
            sig,
            &sa,
            ptr::null::<libc::sigaction>(),
            mem::size_of::<libc::sigset_t>(),
        );
    } else {
        libc::signal(sig, libc::SIG_DFL);
    }
}

/// Restores all of the signal handlers back to their previous values, or
/// the default if the previous value cannot be restored
unsafe fn restore_handlers() {
    if let Some(old) = &*OLD_HANDLERS.0.get() {
        for (sig, action) in EXCEPTION_SIGNALS.iter().copied().zip(old.iter()) {
            if libc::sigaction(sig, action, ptr::null_mut()) == -1 {
                install_default_handler(sig);
            }
        }
    }
}

unsafe fn install_handlers() -> Result<(), Error> {
    // Store all of the current handlers so we can restore them later
    let mut old_handlers: [libc::sigaction; 6] = mem::zeroed();

    for (sig, handler) in EXCEPTION_SIGNALS
        .iter()
        .copied()
        .zip(old_handlers.iter_mut())
    {
        let mut old = mem::zeroed();
        if libc::sigaction(sig, ptr::null(), &mut old) == -1 {
            return Err(Error::Os(std::io::Error::last_os_error()));
        }
        *handler = old;
    }

    *OLD_HANDLERS.0.get() = Some(old_handlers);

    let mut sa: libc::sigaction = mem::zeroed();
    libc::sigemptyset(&mut sa.sa_mask);

    // Mask all exception signals when we're handling one of them
    for sig in EXCEPTION_SIGNALS {
        libc::sigaddset(&mut sa.sa_mask, sig);
    }

    sa.sa_sigaction = signal_handler as usize;
    sa.sa_flags = libc::SA_ONSTACK | libc::SA_SIGINFO;

    for sig in EXCEPTION_SIGNALS {
        // At this point it is impractical to back out changes, and so
        // failure to install a signal is intentionally ignored
        libc::sigaction(sig, &sa, ptr::null_mut());
    }

    Ok(())
}

unsafe extern "C" fn signal_handler(
    sig: libc::c_int,
    info: *mut libc::siginfo_t,
    uc: *mut libc::c_void,
) {
    let info = &mut *info;
    let uc = &mut *uc;

    // Sometimes we run inside a process where some other buggy code saves
    // and restores signal handlers temporarily with 'signal' instead of
    // 'sigaction'. This loses the SA_SIGINFO flag associated with this
    // function. As a consequence, the values of 'info' and 'uc' become
    // totally bogus, generally inducing a crash.
    //
    // The following code tries to detect this case. When it does, it
    // resets the signal handlers with sigaction + SA_SIGINFO and returns.
    // This forces the signal to be thrown again, but this time the kernel
    // will call the function with the right arguments.
    {
        let mut cur_handler = mem::zeroed();
        if libc::sigaction(sig, ptr::null_mut(), &mut cur_handler) == 0
            && cur_handler.sa_sigaction == signal_handler as usize
            && cur_handler.sa_flags & libc::SA_SIGINFO == 0
        {
            // Reset signal handler with the correct flags.
            libc::sigemptyset(&mut cur_handler.sa_mask);
            libc::sigaddset(&mut cur_handler.sa_mask, sig);

            cur_handler.sa_sigaction = signal_handler as usize;
            cur_handler.sa_flags = libc::SA_ONSTACK | libc::SA_SIGINFO;

            if libc::sigaction(sig, &cur_handler, ptr::null_mut()) == -1 {
                // When resetting the handler fails, try to reset the
                // default one to avoid an infinite loop here.
                install_default_handler(sig);
            }

            // exit the handler as we should be called again soon
            return;
        }
    }

    let handled = if DUMPING
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
    {
        let handler = HANDLER.load(Ordering::SeqCst);

        let handled = if handler.is_null() {
            false
        } else {
            (*handler).handle_signal(info, uc)
        };

        DUMPING.store(false, Ordering::SeqCst);
        handled
    } else {
        // Another thread faulted first and owns the dump, or the dump
        // itself faulted. Either way the process is going down, don't make
        // it worse.
        false
    };

    // Upon returning from this signal handler, sig will become unmasked
    // and then it will be retriggered. If the dump was written, restore the
    // default handler. Otherwise, restore the previously installed handler.
    // Then, when the signal is retriggered, it will be delivered to the
    // appropriate handler.
    if handled {
        install_default_handler(sig);
    } else {
        restore_handlers();
    }

    if info.si_code <= 0 || sig == libc::SIGABRT {
        // This signal was triggered by somebody sending us the signal with
        // kill(). In order to retrigger it, we have to queue a new signal
        // by calling kill() ourselves. The special case (si_pid == 0 &&
        // sig == SIGABRT) is due to the kernel sending a SIGABRT from a
        // user request via SysRQ.
        let tid = libc::syscall(libc::SYS_gettid) as libc::pid_t;
        if libc::syscall(libc::SYS_tgkill, libc::getpid(), tid, sig) < 0 {
            // If we failed to kill ourselves (e.g. because a sandbox
            // disallows us to do so), we instead resort to terminating our
            // process. This will result in an incorrect exit code.
            libc::_exit(1);
        }
    } else {
        // This was a synchronous signal triggered by a hard fault
        // (e.g. SIGSEGV). No need to reissue the signal. It will
        // automatically trigger again, when we return from the signal
        // handler.
    }
}

pub(crate) struct CrashContext {
    /// The signal info for the crash
    pub siginfo: libc::siginfo_t,
    /// The faulting thread
    pub tid: libc::pid_t,
    /// Machine context from the signal frame
    pub ucontext: UContext,
    /// Float state from the signal frame. On aarch64 this lives inside
    /// `uc_mcontext` already
    #[cfg(target_arch = "x86_64")]
    pub float_state: Option<libc::_libc_fpstate>,
}

impl CrashContext {
    /// Context describing the calling thread, used when a capture is
    /// requested without a real fault.
    pub(crate) fn for_current_thread(siginfo: libc::siginfo_t) -> Self {
        let mut uctx: libc::ucontext_t = unsafe { mem::zeroed() };

        // bionic never implemented getcontext; a zeroed context still lets
        // the rest of the dump be written
        #[cfg(target_env = "gnu")]
        unsafe {
            libc::getcontext(&mut uctx);
        }

        Self {
            siginfo,
            tid: unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t },
            ucontext: UContext { inner: uctx },
            #[cfg(target_arch = "x86_64")]
            float_state: None,
        }
    }
}

pub(crate) struct HandlerInner {
    output: MinidumpDescriptor,
    on_crash: Option<Box<dyn CrashEvent>>,
    /// Reserved while the process is healthy so that capture at fault time
    /// only fills it in
    snapshot: UnsafeCell<ProcessSnapshot>,
}

// The snapshot cell is only touched under DUMPING
unsafe impl Sync for HandlerInner {}

impl HandlerInner {
    unsafe fn handle_signal(&self, info: &mut libc::siginfo_t, uc: &mut libc::c_void) -> bool {
        // Allow ourselves to be dumped if the signal is trusted, which is
        // any kernel raised signal or one we sent to ourselves
        if info.si_code > 0
            || ((info.si_code == SI_USER || info.si_code == SI_TKILL)
                && info.si_pid() == libc::getpid())
        {
            libc::syscall(libc::SYS_prctl, libc::PR_SET_DUMPABLE, 1, 0, 0, 0);
        }

        let crash_ctx = CRASH_CONTEXT.0.get();

        *crash_ctx = mem::MaybeUninit::zeroed();
        let cc = (*crash_ctx).as_mut_ptr();

        ptr::copy_nonoverlapping(info as *const libc::siginfo_t, &mut (*cc).siginfo, 1);

        let uc_ptr = &*(uc as *const libc::c_void).cast::<libc::ucontext_t>();
        ptr::copy_nonoverlapping(uc_ptr, &mut (*cc).ucontext.inner, 1);

        #[cfg(target_arch = "x86_64")]
        {
            (*cc).float_state = if uc_ptr.uc_mcontext.fpregs.is_null() {
                None
            } else {
                Some(*uc_ptr.uc_mcontext.fpregs)
            };
        }

        (*cc).tid = libc::syscall(libc::SYS_gettid) as libc::pid_t;

        self.generate_dump(&*(*crash_ctx).as_ptr())
    }

    /// Captures the process and writes the dump, then hands the outcome to
    /// the completion callback. Runs on the faulting thread.
    pub(crate) unsafe fn generate_dump(&self, ctx: &CrashContext) -> bool {
        let mut succeeded = self.write_dump(ctx);

        if let Some(on_crash) = &self.on_crash {
            succeeded = on_crash.on_crash(&self.output, succeeded);
        }

        succeeded
    }

    unsafe fn write_dump(&self, ctx: &CrashContext) -> bool {
        let snapshot = &mut *self.snapshot.get();
        if snapshot.capture().is_err() {
            return false;
        }

        // O_EXCL, the unique name was baked at registration and nothing
        // must already sit at that path
        let mut oo = fs::OpenOptions::new();
        oo.write(true).create_new(true).mode(0o600);

        let mut file = match fs::open(&self.output.path(), oo) {
            Ok(file) => file,
            Err(_) => return false,
        };

        minidump_writer::write_minidump(&mut file, ctx, snapshot).is_ok()
    }
}

/// Installs the alternate stack and the signal handlers, then publishes
/// the handler for the fault path.
///
/// The handler is deliberately leaked: signals keep arriving for the life
/// of the process, so there is never a point where tearing it down is
/// sound.
pub(crate) fn install(
    output: MinidumpDescriptor,
    on_crash: Option<Box<dyn CrashEvent>>,
) -> Result<(), Error> {
    unsafe {
        install_sigaltstack()?;
        install_handlers()?;
    }

    let inner = Box::new(HandlerInner {
        output,
        on_crash,
        snapshot: UnsafeCell::new(ProcessSnapshot::new()),
    });

    HANDLER.store(Box::into_raw(inner), Ordering::SeqCst);

    Ok(())
}

/// Runs the whole capture pipeline for the calling thread as if `signal`
/// had been delivered to it, without going through the kernel.
pub(crate) fn simulate_signal(signal: i32) -> bool {
    let handler = HANDLER.load(Ordering::SeqCst);
    if handler.is_null() {
        return false;
    }

    if DUMPING
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return false;
    }

    let mut siginfo: libc::siginfo_t = unsafe { mem::zeroed() };
    siginfo.si_signo = signal;
    siginfo.si_code = SI_USER;

    let ctx = CrashContext::for_current_thread(siginfo);
    let succeeded = unsafe { (*handler).generate_dump(&ctx) };

    DUMPING.store(false, Ordering::SeqCst);

    succeeded
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn current_thread_context() {
        let ctx = CrashContext::for_current_thread(unsafe { mem::zeroed() });

        assert_eq!(ctx.tid as i64, unsafe {
            libc::syscall(libc::SYS_gettid)
        });
    }
}
