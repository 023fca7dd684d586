//! Telemetry bootstrap: sinks, filters and the global subscriber

use crate::{
    filters::transport_filter,
    formatter::RedactingFormatter,
    layer::RedactingLayer,
    shipping::ShippingSummary,
    writer::RotatingLogWriter,
    Error, Result,
};
use skiff_core::{AppSettings, LogSettings, SkiffConfig, Sink};
use std::sync::Arc;
use tracing::{Level, Subscriber};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

/// Entry point wiring the pipeline into `tracing`
pub struct TelemetrySystem;

/// Keeps the segment writer reachable until shutdown
pub struct TelemetryGuard {
    app: Arc<AppSettings>,
    writer: Option<RotatingLogWriter>,
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

impl TelemetrySystem {
    /// Install the pipeline as the global subscriber.
    ///
    /// Errors leave the host free to continue without file logging.
    pub fn init(config: &SkiffConfig) -> Result<TelemetryGuard> {
        let (subscriber, guard) = Self::build(config)?;

        subscriber.try_init().map_err(|e| Error::System {
            message: format!("Failed to initialize tracing subscriber: {}", e),
        })?;

        tracing::info!(
            telemetry.event = "system_initialized",
            telemetry.version = env!("CARGO_PKG_VERSION"),
            shipping = guard.shipping_enabled(),
            "Telemetry system initialized"
        );

        Ok(guard)
    }

    /// Build the subscriber without installing it
    pub fn build(config: &SkiffConfig) -> Result<(impl Subscriber + Send + Sync + 'static, TelemetryGuard)> {
        config.validate()?;

        let app = Arc::new(config.app_settings()?);
        let formatter = RedactingFormatter::new(app.clone(), config.logging.root_marker.as_deref())?;

        let writer = if config.logging.has_sink(Sink::File) {
            Some(RotatingLogWriter::new(
                app.clone(),
                &config.logging,
                &config.shipping,
            )?)
        } else {
            None
        };

        let layers = Self::build_sink_layers(&config.logging, &formatter, writer.as_ref());
        let subscriber = Registry::default()
            .with(layers)
            .with(Self::build_env_filter(&config.logging)?);

        Ok((subscriber, TelemetryGuard { app, writer }))
    }

    /// Verbosity threshold, overridable with `RUST_LOG`
    pub fn build_env_filter(logging: &LogSettings) -> Result<EnvFilter> {
        if let Ok(directives) = std::env::var("RUST_LOG") {
            return EnvFilter::try_new(&directives).map_err(|e| Error::Config {
                message: format!("Invalid RUST_LOG '{}': {}", directives, e),
            });
        }

        let level: Level = logging.verbosity.into();
        EnvFilter::try_new(level.to_string()).map_err(|e| Error::Config {
            message: format!("Invalid verbosity '{}': {}", level, e),
        })
    }

    fn build_sink_layers(
        logging: &LogSettings,
        formatter: &RedactingFormatter,
        writer: Option<&RotatingLogWriter>,
    ) -> Vec<BoxedLayer> {
        let mut layers: Vec<BoxedLayer> = Vec::new();

        for sink in &logging.sinks {
            match sink {
                Sink::File => {
                    if let Some(writer) = writer {
                        layers.push(
                            RedactingLayer::new(formatter.clone(), writer.clone())
                                .with_filter(transport_filter())
                                .boxed(),
                        );
                    }
                }
                Sink::Stdout => layers.push(
                    RedactingLayer::new(formatter.clone(), std::io::stdout)
                        .with_filter(transport_filter())
                        .boxed(),
                ),
                Sink::Stderr => layers.push(
                    RedactingLayer::new(formatter.clone(), std::io::stderr)
                        .with_filter(transport_filter())
                        .boxed(),
                ),
                Sink::Noop => {}
            }
        }

        layers
    }
}

impl TelemetryGuard {
    pub fn app(&self) -> &AppSettings {
        &self.app
    }

    pub fn writer(&self) -> Option<&RotatingLogWriter> {
        self.writer.as_ref()
    }

    pub fn shipping_enabled(&self) -> bool {
        self.writer
            .as_ref()
            .map(|writer| writer.shipping_enabled())
            .unwrap_or(false)
    }

    /// Close the segment writer, waiting at most the configured close timeout
    pub async fn shutdown(self) -> Option<ShippingSummary> {
        tracing::info!(
            telemetry.event = "system_shutdown",
            "Telemetry system shutting down"
        );

        match self.writer {
            Some(writer) => writer.close().await,
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(root: &std::path::Path, sinks: Vec<Sink>) -> SkiffConfig {
        let mut config = SkiffConfig::default();
        config.logging.directory = root.to_path_buf();
        config.logging.sinks = sinks;
        config
    }

    #[tokio::test]
    async fn test_file_sink_writes_segment() {
        let temp_dir = TempDir::new().unwrap();
        let (subscriber, guard) = TelemetrySystem::build(&config(temp_dir.path(), vec![Sink::File])).unwrap();
        let active = guard.writer().unwrap().layout().active_segment();

        {
            let _default = tracing::subscriber::set_default(subscriber);
            tracing::info!("menu opened");
            tracing::debug!("below threshold");
            tracing::info!(target: "hyper::proto", "transport noise");
        }

        let content = std::fs::read_to_string(&active).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("I|skiff|"));
        assert!(lines[0].ends_with("|menu opened"));

        assert!(guard.shutdown().await.is_some());
    }

    #[tokio::test]
    async fn test_console_only_has_no_writer() {
        let temp_dir = TempDir::new().unwrap();
        let (_subscriber, guard) =
            TelemetrySystem::build(&config(temp_dir.path(), vec![Sink::Stderr, Sink::Noop])).unwrap();

        assert!(guard.writer().is_none());
        assert!(!guard.shipping_enabled());
        assert!(guard.shutdown().await.is_none());
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = config(temp_dir.path(), vec![Sink::File]);
        config.shipping.enabled = true;

        assert!(TelemetrySystem::build(&config).is_err());
    }
}
