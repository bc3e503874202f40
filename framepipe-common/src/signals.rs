// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fatal signal handling. Graceful shutdown on SIGINT/SIGTERM is handled by
//! the event loops in the binaries; this module only covers the signals that
//! indicate the process is beyond recovery.

use std::backtrace::Backtrace;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};

static HANDLER_INSTALLED: AtomicBool = AtomicBool::new(false);

const FATAL_SIGNALS: &[libc::c_int] = &[
    libc::SIGSEGV,
    libc::SIGBUS,
    libc::SIGABRT,
    libc::SIGILL,
    libc::SIGFPE,
    libc::SIGPIPE,
];

/// Install handlers for the fatal signal set. On receipt a backtrace is
/// printed to stderr and the process exits with the signal number.
pub fn install_fatal_handlers() {
    if HANDLER_INSTALLED.swap(true, Ordering::SeqCst) {
        return;
    }
    for &signum in FATAL_SIGNALS {
        // SAFETY: handler address is valid for the process lifetime and the
        // registration itself has no other preconditions.
        unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = fatal_handler as usize;
            action.sa_flags = libc::SA_SIGINFO;
            libc::sigaction(signum, &action, std::ptr::null_mut());
        }
    }
}

extern "C" fn fatal_handler(signum: libc::c_int, _: *mut libc::siginfo_t, _: *mut libc::c_void) {
    // Restore default disposition first so a second fault cannot recurse.
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = libc::SIG_DFL;
        libc::sigaction(signum, &action, std::ptr::null_mut());
    }

    let mut stderr = std::io::stderr().lock();
    let _ = writeln!(stderr, "caught fatal signal {signum}, backtrace follows");
    let _ = writeln!(stderr, "{}", Backtrace::force_capture());
    let _ = stderr.flush();

    // Exit code convention: the signal number itself.
    unsafe { libc::_exit(signum) };
}
