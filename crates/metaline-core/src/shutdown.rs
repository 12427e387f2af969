//! Graceful shutdown support via atomic flag.

use std::sync::atomic::{AtomicBool, Ordering};

/// Global shutdown flag, set by the interrupt handler.
pub fn shutdown_flag() -> &'static AtomicBool {
    static FLAG: AtomicBool = AtomicBool::new(false);
    &FLAG
}

/// Check if shutdown was requested.
pub fn is_shutdown_requested() -> bool {
    shutdown_flag().load(Ordering::Relaxed)
}

/// Request shutdown.
pub fn request_shutdown() {
    shutdown_flag().store(true, Ordering::Relaxed);
}

/// Set the flag on the first Ctrl-C.
pub fn install_interrupt_handler() {
    crate::fetch::SHARED_RUNTIME.handle().spawn(async {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("interrupt received, stopping after the current page");
            request_shutdown();
        }
    });
}
