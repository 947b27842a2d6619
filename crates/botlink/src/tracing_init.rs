use std::{fs::OpenOptions, path::Path};

use tracing_subscriber::{
    EnvFilter, layer::SubscriberExt, util::SubscriberInitExt,
};

/// Install the global subscriber for one process role. Logs go to
/// `log_path` (appended, so worker restarts share a file) or to stderr.
pub fn init_tracing(log_path: Option<&Path>) -> std::io::Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let writer = match log_path {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            tracing_subscriber::fmt::writer::BoxMakeWriter::new(file)
        }
        None => tracing_subscriber::fmt::writer::BoxMakeWriter::new(
            std::io::stderr,
        ),
    };

    #[cfg(tokio_unstable)]
    {
        // needs a running runtime; reads TOKIO_CONSOLE_*
        let console_layer = console_subscriber::ConsoleLayer::builder()
            .with_default_env()
            .spawn();

        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_ansi(log_path.is_none()),
            )
            .init();
    }

    #[cfg(not(tokio_unstable))]
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_ansi(log_path.is_none()),
            )
            .init();
    }

    Ok(())
}
