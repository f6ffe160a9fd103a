//! Tracing setup. Console output is always on; passing a log-file path
//! adds a second sink whose file is truncated at every start, so
//! `application.log` only ever holds the current run.

use eyre::WrapErr;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter applied when `RUST_LOG` is unset: pipeline crates at info,
/// everything else at warn.
const DEFAULT_FILTER: &str = "facegate=info,warn";

/// Install the global subscriber.
pub fn init<P: AsRef<std::path::Path>>(log_file: Option<P>) -> eyre::Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    // Stamp records in the timezone the process started in.
    let offset_secs = chrono::Local::now().offset().local_minus_utc();
    let stamps = fmt::time::OffsetTime::new(
        time::UtcOffset::from_whole_seconds(offset_secs)?,
        time::format_description::well_known::Iso8601::DEFAULT,
    );

    let console = fmt::layer().with_timer(stamps.clone());

    let mirror = match &log_file {
        Some(path) => {
            let path = path.as_ref();
            let log = std::fs::File::create(path)
                .wrap_err_with(|| format!("creating log file {}", path.display()))?;
            Some(
                fmt::layer()
                    .with_writer(std::sync::Mutex::new(log))
                    .with_timer(stamps)
                    .with_ansi(false),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(mirror)
        .try_init()
        .wrap_err("installing the global tracing subscriber")?;

    if let Some(path) = log_file {
        tracing::debug!("mirroring log output to \"{}\"", path.as_ref().display());
    }
    Ok(())
}
