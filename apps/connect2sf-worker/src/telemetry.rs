use std::any::Any;

use tracing::error;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Installs the global fmt subscriber. `rust_log` accepts a bare level
/// (`debug`) or full filter directives; anything unparsable falls back to
/// `info`.
pub fn setup_logging(rust_log: &str) -> Result<(), tracing::subscriber::SetGlobalDefaultError> {
    let filter = EnvFilter::try_new(rust_log.to_lowercase()).unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
}

pub fn setup_panic_handler() {
    std::panic::set_hook(Box::new(|panic_info| {
        let message = panic_message(panic_info.payload());
        let location = panic_info
            .location()
            .map(|loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column()))
            .unwrap_or_else(|| "unknown location".to_string());
        let thread = std::thread::current()
            .name()
            .unwrap_or("unnamed")
            .to_string();

        error!(payload = message, location = %location, thread = %thread, "PANIC");
        eprintln!("PANIC: {} at {} (thread {})", message, location, thread);
    }));
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "Unknown panic payload"
    }
}
