//! Shutdown signal handling.
//!
//! Condition variables are not async-signal-safe, so `stop()` cannot run
//! inside a signal handler. Instead SIGINT and SIGTERM are blocked on
//! the starting thread before any worker spawns (children inherit the
//! mask), and one dedicated thread `sigwait`s on the set and drives the
//! normal stop path when a signal arrives.

use crate::context::ContextInner;
use std::sync::{Mutex, Once, OnceLock, Weak};

static REGISTRY: OnceLock<Mutex<Vec<Weak<ContextInner>>>> = OnceLock::new();
static SPAWN_WAITER: Once = Once::new();

/// Block SIGINT/SIGTERM on the calling thread. Threads spawned afterwards
/// inherit the mask.
pub(crate) fn block_shutdown_signals() {
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, libc::SIGINT);
        libc::sigaddset(&mut set, libc::SIGTERM);
        let rc = libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut());
        if rc != 0 {
            tracing::warn!(rc, "pthread_sigmask failed; shutdown signals stay default");
        }
    }
}

/// Register a context to be stopped when a shutdown signal arrives. The
/// waiter thread is spawned once per process.
pub(crate) fn register_for_shutdown(context: Weak<ContextInner>) {
    let registry = REGISTRY.get_or_init(|| Mutex::new(Vec::new()));
    SPAWN_WAITER.call_once(|| {
        std::thread::Builder::new()
            .name("netagg-signals".to_string())
            .spawn(signal_wait_loop)
            .expect("spawning signal thread");
    });
    let mut contexts = registry.lock().expect("signal registry poisoned");
    contexts.retain(|weak| weak.strong_count() > 0);
    contexts.push(context);
}

fn signal_wait_loop() {
    // The set must also be blocked on this thread for sigwait to claim
    // delivery.
    block_shutdown_signals();
    loop {
        let sig = unsafe {
            let mut set: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut set);
            libc::sigaddset(&mut set, libc::SIGINT);
            libc::sigaddset(&mut set, libc::SIGTERM);
            let mut sig: libc::c_int = 0;
            if libc::sigwait(&set, &mut sig) != 0 {
                tracing::warn!("sigwait failed; signal thread exiting");
                return;
            }
            sig
        };
        tracing::info!(signal = sig, "shutdown signal received, stopping contexts");
        let contexts: Vec<Weak<ContextInner>> = {
            let registry = REGISTRY.get().expect("registry initialized");
            registry
                .lock()
                .expect("signal registry poisoned")
                .drain(..)
                .collect()
        };
        for weak in contexts {
            if let Some(ctx) = weak.upgrade() {
                ctx.stop();
            }
        }
    }
}
