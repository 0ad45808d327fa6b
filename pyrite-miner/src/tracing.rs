//! Tracing setup for this crate.
//!
//! Call [`init_journald_or_stdout`] once at startup to install a
//! subscriber. Everywhere else, `use crate::tracing::prelude::*;` brings
//! the level macros into scope.

use std::env;

use tracing_subscriber::{
    filter::{EnvFilter, LevelFilter},
    fmt::time::LocalTime,
    prelude::*,
};

pub mod prelude {
    #[allow(unused_imports)]
    pub use tracing::{debug, error, info, trace, warn};
}

use prelude::*;

/// Install a tracing subscriber: journald when running under systemd,
/// stdout otherwise.
pub fn init_journald_or_stdout() {
    if env::var("JOURNAL_STREAM").is_ok() {
        match tracing_journald::layer() {
            Ok(layer) => tracing_subscriber::registry().with(layer).init(),
            Err(_) => {
                init_stdout();
                error!("Failed to connect to journald, logging to stdout.");
            }
        }
    } else {
        init_stdout();
    }
}

/// Install a stdout subscriber, filtered by `RUST_LOG` with a default
/// level of INFO.
pub fn init_stdout() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var("RUST_LOG")
        .from_env_lossy();

    let timer = LocalTime::new(time::macros::format_description!(
        "[hour]:[minute]:[second].[subsecond digits:3]"
    ));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_timer(timer)
                .with_target(true),
        )
        .init();
}
