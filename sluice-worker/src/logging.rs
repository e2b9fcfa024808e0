use sluice_types::config::{LogFormat, LoggingConfig};
use std::fs;
use std::path::Path;
use tracing::metadata::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Layer, Registry};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn level(config: &LoggingConfig) -> LevelFilter {
    config.level.parse().unwrap_or_else(|_| {
        eprintln!("Unknown log level {:?}; using info", config.level);
        LevelFilter::INFO
    })
}

fn format_layer<W>(format: LogFormat, level: LevelFilter, writer: W) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    match format {
        LogFormat::Text => tracing_subscriber::fmt::layer()
            .with_thread_names(true)
            .with_writer(writer)
            .with_filter(filter)
            .boxed(),
        LogFormat::Logfmt => tracing_subscriber::fmt::layer()
            .event_format(tracing_logfmt::EventsFormatter::default())
            .fmt_fields(tracing_logfmt::FieldsFormatter::default())
            .with_writer(writer)
            .with_filter(filter)
            .boxed(),
    }
}

/// Daily rolling file layer writing `<dir>/<name>.<date>`. Files are always logfmt.
fn file_layer(name: &str, dir: &Path, level: LevelFilter) -> Option<(BoxedLayer, WorkerGuard)> {
    if let Err(e) = fs::create_dir_all(dir) {
        eprintln!(
            "Unable to create log directory {}: {e}; logging to stdout only",
            dir.display()
        );
        return None;
    }

    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, name));
    Some((format_layer(LogFormat::Logfmt, level, writer), guard))
}

/// Installs the global subscriber for the `[logging]` section of the configuration. The
/// returned guard flushes the log file and must outlive the worker.
pub fn init_logging(name: &str, config: &LoggingConfig) -> Option<WorkerGuard> {
    let level = level(config);
    let mut layers = vec![format_layer(config.format, level, std::io::stdout)];

    let mut guard = None;
    if let Some((layer, g)) = config
        .dir
        .as_deref()
        .and_then(|dir| file_layer(name, dir, level))
    {
        layers.push(layer);
        guard = Some(g);
    }

    if tracing::subscriber::set_global_default(Registry::default().with(layers)).is_err() {
        eprintln!("A global tracing subscriber is already installed");
        return guard;
    }

    std::panic::set_hook(Box::new(|panic| {
        if let Some(location) = panic.location() {
            tracing::error!(
                message = %panic,
                panic.file = location.file(),
                panic.line = location.line(),
                panic.column = location.column(),
            );
        } else {
            tracing::error!(message = %panic);
        }
    }));

    guard
}
