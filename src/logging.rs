//! Log macros that prefix every line with the call site.
//!
//! Format: `[file:line] message`
//!
//! ```ignore
//! info!("ota::orchestrator: staging {} bytes", size);
//! // [src/ota/orchestrator.rs:120] ota::orchestrator: staging 4096 bytes
//! ```

#[doc(hidden)]
#[macro_export]
macro_rules! __log_at {
    ($level:expr, $($arg:tt)*) => {
        ::log::log!(
            $level,
            "{} {}",
            concat!("[", file!(), ":", line!(), "]"),
            format_args!($($arg)*)
        )
    };
}

#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => { $crate::__log_at!(::log::Level::Error, $($arg)*) };
}

#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => { $crate::__log_at!(::log::Level::Warn, $($arg)*) };
}

#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => { $crate::__log_at!(::log::Level::Info, $($arg)*) };
}

#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => { $crate::__log_at!(::log::Level::Debug, $($arg)*) };
}

#[macro_export]
macro_rules! trace {
    ($($arg:tt)*) => { $crate::__log_at!(::log::Level::Trace, $($arg)*) };
}

/// Install the `env_logger` backend. `RUST_LOG` wins over `default_filter`.
///
/// Calling it twice is harmless, the second call is ignored.
pub fn init(default_filter: &str) {
    let env = env_logger::Env::default().default_filter_or(default_filter);
    let _ = env_logger::Builder::from_env(env)
        .format_timestamp_millis()
        .try_init();
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_init_twice() {
        super::init("debug");
        super::init("info");
        info!("logging: initialised twice");
    }
}
