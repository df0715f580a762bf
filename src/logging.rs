use log::LevelFilter;

use crate::config::LoggingConfig;

/// Installs the colored terminal logger at `level`. Returns `false` when a
/// global logger was already installed, which leaves that logger in place.
pub fn init_logging(level: LevelFilter) -> bool {
    let mut clog = colog::default_builder();
    clog.filter(None, level);
    clog.try_init().is_ok()
}

/// Installs the logger at the level named by the `[logging]` config section.
pub fn init_logging_from_config(config: &LoggingConfig) -> bool {
    init_logging(config.level_filter())
}
