use log::info;

/// Server behavior toggles, read from the environment once at startup.
#[derive(Debug, Clone, Copy, Default)]
pub struct ServerConfig {
    /// `ENABLE_LEMETHOD`: turn on push-based model distribution. Only
    /// dense requests are accepted and the distribution pool gets one
    /// thread.
    pub le_method: bool,
    /// `ENABLE_TSENGINE`: acknowledge pushes before applying the update
    /// and answer through the version-carrying update channel.
    pub ts_engine: bool,
    /// `PS_ROW_SPARSE_VERBOSE`: verbose logging of row-sparse traffic.
    pub log_verbose: bool,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let config = Self {
            le_method: env_flag("ENABLE_LEMETHOD"),
            ts_engine: env_flag("ENABLE_TSENGINE"),
            log_verbose: env_flag("PS_ROW_SPARSE_VERBOSE"),
        };

        info!(
            le_method = config.le_method,
            ts_engine = config.ts_engine;
            "server configuration loaded"
        );
        config
    }
}

fn env_flag(name: &str) -> bool {
    flag_value(std::env::var(name).ok().as_deref())
}

fn flag_value(val: Option<&str>) -> bool {
    matches!(val, Some("1" | "true" | "TRUE" | "yes"))
}
