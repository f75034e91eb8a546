use std::sync::OnceLock;

use anyhow::anyhow;
use tracing_subscriber::{
    filter::LevelFilter,
    fmt::{
        MakeWriter, SubscriberBuilder, TestWriter,
        format::{Format, Json, JsonFields},
    },
};

use crate::config::{Config, LogFormat};

const DEFAULT_LOG_LEVEL: &str = "info";

static TEST_PROCESS_LOGGING: OnceLock<Result<(), String>> = OnceLock::new();

pub fn init(config: &Config, level_override: Option<&str>) -> anyhow::Result<()> {
    let log_level = resolve_log_level(config, level_override)?;

    match resolve_log_format(config) {
        LogFormat::Json => json_subscriber(log_level, TestWriter::new()).try_init(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_max_level(log_level)
            .with_target(true)
            .with_test_writer()
            .pretty()
            .try_init(),
    }
    .map_err(|err| anyhow!("initialize logging subscriber: {err}"))?;

    Ok(())
}

/// Initializes logging at most once per test process. Every caller sees the
/// outcome of the first attempt.
pub fn init_once(config: &Config) -> anyhow::Result<()> {
    TEST_PROCESS_LOGGING
        .get_or_init(|| init(config, None).map_err(|err| format!("{err:#}")))
        .clone()
        .map_err(|err| anyhow!(err))
}

/// Session events as one JSON object per line, fields nested under `fields`.
fn json_subscriber<W>(
    level: LevelFilter,
    writer: W,
) -> SubscriberBuilder<JsonFields, Format<Json>, LevelFilter, W>
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(true)
        .json()
        .with_writer(writer)
}

fn resolve_log_level(
    config: &Config,
    level_override: Option<&str>,
) -> anyhow::Result<LevelFilter> {
    let raw_level = level_override
        .or_else(|| {
            config
                .logging
                .as_ref()
                .and_then(|logging| logging.level.as_deref())
        })
        .unwrap_or(DEFAULT_LOG_LEVEL);
    let normalized = raw_level.trim().to_ascii_lowercase();

    normalized.parse::<LevelFilter>().map_err(|_| {
        anyhow!(
            "invalid log level `{raw_level}`; expected one of trace, debug, info, warn, error, off"
        )
    })
}

fn resolve_log_format(config: &Config) -> LogFormat {
    config
        .logging
        .as_ref()
        .and_then(|logging| logging.format)
        .unwrap_or(LogFormat::Json)
}
