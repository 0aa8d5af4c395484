//! Interrupt (SIGINT / Ctrl-C) handling.
//!
//! The first interrupt marks the process as interrupted.  The running build
//! takes the interrupt and cancels itself: no new tasks start and the build
//! winds down.  Until then the handler restores the default action, so a
//! second interrupt kills the process outright.

use std::sync::atomic::{AtomicBool, Ordering};

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

pub fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

/// Consume a pending interrupt, returning whether there was one.  The
/// handler is re-armed, so a later build can be interrupted again.
pub fn take_interrupt() -> bool {
    let taken = INTERRUPTED.swap(false, Ordering::SeqCst);
    #[cfg(unix)]
    if taken {
        register_sigint();
    }
    taken
}

#[cfg(unix)]
mod unix {
    use super::INTERRUPTED;
    use std::sync::atomic::Ordering;

    fn sigint_action(handler: libc::sighandler_t) {
        // Safety: registering a signal handler is libc unsafe code.
        unsafe {
            let mut sa: libc::sigaction = std::mem::zeroed();
            sa.sa_sigaction = handler;
            libc::sigaction(libc::SIGINT, &sa, std::ptr::null_mut());
        }
    }

    extern "C" fn sigint_handler(_sig: libc::c_int) {
        // Only async-signal-safe work here: an atomic store and sigaction.
        INTERRUPTED.store(true, Ordering::SeqCst);
        sigint_action(libc::SIG_DFL);
    }

    pub fn register_sigint() {
        sigint_action(sigint_handler as extern "C" fn(libc::c_int) as libc::sighandler_t);
    }
}

#[cfg(unix)]
pub use unix::register_sigint;

#[cfg(windows)]
mod windows {
    use super::INTERRUPTED;
    use std::sync::atomic::Ordering;
    use windows_sys::Win32::Foundation::BOOL;
    use windows_sys::Win32::System::Console::{SetConsoleCtrlHandler, CTRL_C_EVENT};

    unsafe extern "system" fn ctrl_handler(ctrl_type: u32) -> BOOL {
        if ctrl_type == CTRL_C_EVENT && !INTERRUPTED.swap(true, Ordering::SeqCst) {
            // Handled; the next Ctrl-C falls through to the default handler.
            return 1;
        }
        0
    }

    pub fn register_sigint() {
        // Safety: installing a console control handler.
        unsafe {
            SetConsoleCtrlHandler(Some(ctrl_handler), 1);
        }
    }
}

#[cfg(windows)]
pub use windows::register_sigint;

#[cfg(not(any(unix, windows)))]
pub fn register_sigint() {}
