use tracing::Level;
use tracing_subscriber::EnvFilter;

use crate::config::{self, EnvKind};

/// Noisy targets that drown application logs at debug level
const QUIET_TARGETS: &[&str] = &["hyper", "mio", "reqwest", "sqlx", "html5ever"];

pub fn init_tracer() {
    let debug: config::Debug = config::CONFIG.get_value();
    let env: config::Environment = config::CONFIG.get_value();
    let max_level = if debug.0 || env.0 == EnvKind::Development {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let mut filter = EnvFilter::builder()
        .with_default_directive(max_level.into())
        .from_env_lossy();
    for target in QUIET_TARGETS {
        filter = filter.add_directive(format!("{target}=warn").parse().unwrap());
    }

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match env.0 {
        EnvKind::Development => builder.pretty().init(),
        EnvKind::Production => builder.compact().init(),
    }
}
