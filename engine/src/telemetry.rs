//! Engine logging
//!
//! Operation progress (links applied and finished, facts learned, state
//! changes) is logged through `tracing`. Output goes to stderr so the JSON
//! report `sortie run --json` prints on stdout is never interleaved with logs.
//!
//! Debug builds log pretty-printed lines. Release builds log JSON with the
//! current span, so every record from `sortie run` carries the `operation`
//! span's id and name.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter directives for `log_level`
///
/// sqlx logs every statement at info, which drowns out link progress during a
/// run, so it is held at warn unless the level asks for more detail.
pub fn filter_directives(log_level: &str) -> String {
    let sqlx_level = match log_level {
        "debug" | "trace" => log_level,
        _ => "warn",
    };
    format!("{},sortie_engine={},sqlx={}", log_level, log_level, sqlx_level)
}

/// Install the global subscriber
///
/// `RUST_LOG` replaces the directives built from `log_level` when set.
/// Calling this twice is harmless; the first subscriber stays installed.
pub fn init_telemetry_with_level(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directives(log_level)));

    #[cfg(debug_assertions)]
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().pretty().with_target(false).with_writer(std::io::stderr))
            .try_init()
            .ok();
    }

    #[cfg(not(debug_assertions))]
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().with_current_span(true).with_writer(std::io::stderr))
            .try_init()
            .ok();
    }
}
