use log::SetLoggerError;

/// The environment variable holding the log filter, in `env_logger` syntax.
pub const LOG_FILTER_ENV: &str = "GCHANDLES_LOG";

/// Install the built-in `env_logger`, filtered by [`LOG_FILTER_ENV`] at level
/// `info` unless set. Fails if the process already has a logger, which is
/// expected when the runtime installs its own.
/// Does nothing if the "builtin_env_logger" feature is disabled.
pub fn try_init() -> Result<(), SetLoggerError> {
    cfg_if::cfg_if! {
        if #[cfg(feature = "builtin_env_logger")] {
            env_logger::Builder::from_env(env_logger::Env::default().filter_or(LOG_FILTER_ENV, "info"))
                .format_timestamp_micros()
                .try_init()
        } else {
            Ok(())
        }
    }
}
