//! Telemetry bootstrap for the weft binary.
//!
//! Installs the global tracing subscriber: a compact fmt layer filtered by
//! `RUST_LOG` (or the caller's default directives), optionally bridged to
//! an OpenTelemetry stdout exporter so engine spans can be inspected
//! locally. The returned [`Telemetry`] guard flushes buffered spans at
//! shutdown.
//!
//! ```no_run
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let telemetry = weft_observe::telemetry::init("info,weft=debug", false)?;
//! // consumers run...
//! telemetry.shutdown();
//! # Ok(())
//! # }
//! ```

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Handle over the installed telemetry pipeline.
///
/// Holds the OTel tracer provider (when trace export is on) so the final
/// spans can be flushed before the process exits.
pub struct Telemetry {
    provider: Option<SdkTracerProvider>,
}

impl Telemetry {
    /// Flush pending spans and shut the export pipeline down. A no-op when
    /// trace export was not enabled.
    pub fn shutdown(self) {
        if let Some(provider) = self.provider {
            if let Err(err) = provider.shutdown() {
                tracing::warn!(error = %err, "trace exporter shutdown failed");
            }
        }
    }
}

/// Install the global subscriber and return the shutdown guard.
///
/// `default_directives` applies when `RUST_LOG` is unset. The queue poll
/// loop would otherwise drown the output in per-statement sqlx logging, so
/// sqlx is capped at `warn` unless the environment overrides the filter
/// entirely.
///
/// # Errors
///
/// Fails if a global subscriber is already installed.
pub fn init(
    default_directives: &str,
    export_traces: bool,
) -> Result<Telemetry, Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{default_directives},sqlx=warn")));

    let fmt_layer = tracing_subscriber::fmt::layer().compact();
    let registry = tracing_subscriber::registry().with(filter).with(fmt_layer);

    if !export_traces {
        registry.try_init()?;
        return Ok(Telemetry { provider: None });
    }

    // Stdout exporter for local inspection; a deployment that ships traces
    // swaps this for OTLP.
    let provider = SdkTracerProvider::builder()
        .with_simple_exporter(opentelemetry_stdout::SpanExporter::default())
        .build();
    let tracer = provider.tracer("weft-engine");
    opentelemetry::global::set_tracer_provider(provider.clone());

    registry
        .with(tracing_opentelemetry::layer().with_tracer(tracer))
        .try_init()?;

    Ok(Telemetry {
        provider: Some(provider),
    })
}
