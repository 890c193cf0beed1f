use crate::config::Config;
use log::LevelFilter;
use simplelog::{self, ConfigBuilder, ThreadLogMode};

/// Dependencies whose records are dropped unless running at Trace level.
const FILTERED_MODULES: &[&str] = &["mio", "tokio", "hyper", "eventsource_client"];

pub struct Logger {}

impl Logger {
    /// Installs the process-wide console logger described by `config`.
    ///
    /// Library crates only log through the `log` facade; this is the one
    /// place a concrete logger is chosen. Every record is tagged with the
    /// name of the emitting thread, so reactor output is easy to tell apart
    /// from the SSE bridge and the main thread.
    ///
    /// Fails if a logger has already been installed.
    pub fn init_logger(config: &Config) -> Result<(), log::SetLoggerError> {
        let level = Self::convert_level_filter(config.log_level_filter);
        let log_config =
            Self::build_log_config(Self::should_filter_dependencies(config.log_level_filter));

        simplelog::TermLogger::init(
            level,
            log_config,
            simplelog::TerminalMode::Mixed,
            simplelog::ColorChoice::Auto,
        )
    }

    fn convert_level_filter(level: LevelFilter) -> simplelog::LevelFilter {
        match level {
            LevelFilter::Off => simplelog::LevelFilter::Off,
            LevelFilter::Error => simplelog::LevelFilter::Error,
            LevelFilter::Warn => simplelog::LevelFilter::Warn,
            LevelFilter::Info => simplelog::LevelFilter::Info,
            LevelFilter::Debug => simplelog::LevelFilter::Debug,
            LevelFilter::Trace => simplelog::LevelFilter::Trace,
        }
    }

    /// Trace shows everything, including dependency internals.
    fn should_filter_dependencies(level: LevelFilter) -> bool {
        level != LevelFilter::Trace
    }

    fn build_log_config(apply_filters: bool) -> simplelog::Config {
        let mut builder = ConfigBuilder::new();
        builder
            .set_time_format_rfc3339()
            .set_thread_level(simplelog::LevelFilter::Error)
            .set_thread_mode(ThreadLogMode::Names);

        if apply_filters {
            for module in FILTERED_MODULES {
                builder.add_filter_ignore_str(module);
            }
        }

        builder.build()
    }
}
