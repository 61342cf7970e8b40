use anyhow::Context;
use capture::{
    CancellationFlag, FileSink, FrameSink, ProgressSink, V4l2Backend,
    config::{Cli, Environment},
    lifecycle,
};
use clap::Parser;
use common::{TelemetryGuard, setup_logging};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let environment = Environment::from_env();

    // The OTLP exporters need a Tokio runtime that outlives the guard.
    let (_telemetry, _runtime) = if let Some(endpoint) = cli.otel_endpoint.as_ref() {
        let rt = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
        let guard = rt.block_on(async { TelemetryGuard::init("capture", endpoint, environment) })?;
        (Some(guard), Some(rt))
    } else {
        setup_logging(environment);
        (None, None)
    };

    let config = cli.capture_config();
    tracing::info!("Capture starting with config: {:?}", config);

    let cancel = CancellationFlag::new();
    cancel
        .register_interrupt()
        .context("Failed to register SIGINT handler")?;

    let mut sink: Box<dyn FrameSink> = match cli.output.as_ref() {
        Some(path) => Box::new(
            FileSink::create(path)
                .with_context(|| format!("Failed to open output file {}", path.display()))?,
        ),
        None => Box::new(ProgressSink::stderr()),
    };

    match lifecycle::run(&V4l2Backend, &config, &mut sink, &cancel) {
        Ok(stats) => {
            tracing::info!(
                "Capture stopped: {} frames, {} dropped",
                stats.frames,
                stats.dropped()
            );
            Ok(())
        }
        Err(e) => {
            let stage = e.stage();
            tracing::error!("Capture failed during {}: {}", stage, e);
            Err(e).with_context(|| format!("Capture failed during {}", stage))
        }
    }
}
