//! Process signals, recorded by async-signal-safe handlers and picked up by
//! the supervisor loop between event-loop iterations.
//!
//! Handlers are installed without `SA_RESTART`, so a pending `poll(2)`
//! returns early with `EINTR` and the request is seen promptly.

use std::sync::atomic::{AtomicBool, Ordering};

static SHUTDOWN: AtomicBool = AtomicBool::new(false);
static TOGGLE_SUSPEND: AtomicBool = AtomicBool::new(false);
static CYCLE_CONNECTIVITY: AtomicBool = AtomicBool::new(false);

extern "C" fn on_shutdown(_: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

extern "C" fn on_usr1(_: libc::c_int) {
    TOGGLE_SUSPEND.store(true, Ordering::SeqCst);
}

extern "C" fn on_usr2(_: libc::c_int) {
    CYCLE_CONNECTIVITY.store(true, Ordering::SeqCst);
}

fn install(signal: libc::c_int, handler: extern "C" fn(libc::c_int)) -> std::io::Result<()> {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handler as usize;
        action.sa_flags = 0;

        if libc::sigaction(signal, &action, std::ptr::null_mut()) < 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

/// SIGINT and SIGTERM request a stop, SIGUSR1 toggles suspend/resume and
/// SIGUSR2 steps the desired connectivity.
pub fn setup() -> std::io::Result<()> {
    install(libc::SIGINT, on_shutdown)?;
    install(libc::SIGTERM, on_shutdown)?;
    install(libc::SIGUSR1, on_usr1)?;
    install(libc::SIGUSR2, on_usr2)?;
    Ok(())
}

pub fn take_shutdown() -> bool {
    SHUTDOWN.swap(false, Ordering::SeqCst)
}

pub fn take_toggle_suspend() -> bool {
    TOGGLE_SUSPEND.swap(false, Ordering::SeqCst)
}

pub fn take_cycle_connectivity() -> bool {
    CYCLE_CONNECTIVITY.swap(false, Ordering::SeqCst)
}
