use indicatif::ProgressStyle;
use tracing::Span;
use tracing_indicatif::span_ext::IndicatifSpanExt;

/// Turns `span` into a progress bar of `len` steps.
///
/// Bars are only drawn when an `IndicatifLayer` is installed, e.g. by
/// [`init_logging`].
pub(crate) fn progress_start(span: &Span, len: usize, enabled: bool) {
    if !enabled {
        return;
    }

    if let Ok(style) = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
    {
        span.pb_set_style(&style.progress_chars("=>-"));
    }

    span.pb_set_length(len as u64);
}

pub(crate) fn progress_inc(span: &Span) {
    span.pb_inc(1);
}

/// Installs a global subscriber printing events to stderr and drawing
/// progress bars for sweep spans.
///
/// The filter is read from `RUST_LOG`, falling back to `level` for this
/// crate and `warn` for everything else.
#[cfg(feature = "logging")]
pub fn init_logging(level: &str) -> Result<(), tracing_subscriber::util::TryInitError> {
    use tracing_indicatif::IndicatifLayer;
    use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

    let default_filter = format!("warn,parasweep={level}");
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&default_filter));

    let indicatif = IndicatifLayer::new();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(indicatif.get_stderr_writer()))
        .with(indicatif)
        .try_init()?;

    tracing::debug!("parasweep logging initialized");
    Ok(())
}
