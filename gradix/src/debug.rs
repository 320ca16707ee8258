//! Env-gated debug logging for the scheduler.

fn enabled() -> bool {
    std::env::var("GRADIX_DEBUG_SCHED").is_ok()
}

/// Log a scheduler message when `GRADIX_DEBUG_SCHED` is set.
#[allow(clippy::print_stderr)]
pub(crate) fn log_sched(msg: &str) {
    if enabled() {
        eprintln!("[gradix:sched] {}", msg);
    }
}
