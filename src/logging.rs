use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use flexi_logger::{Cleanup, Criterion, DeferredNow, Duplicate, FileSpec, Naming, WriteMode};
use log::LevelFilter;

use crate::config::Logger;

/// Initializes the process-wide logger: stderr by default, a rotating log
/// file when `logger.path` is set. `-v` overrides the configured level.
pub fn init(config: &Logger, verbose: bool) -> Result<()> {
    let level = if verbose {
        LevelFilter::Debug
    } else {
        config.level.parse().unwrap_or(LevelFilter::Info)
    };

    let builder = flexi_logger::Logger::try_with_str(level.as_str())
        .context("init logger")?
        .format(render);

    let builder = if config.path.trim().is_empty() {
        builder.log_to_stderr()
    } else {
        let spec = FileSpec::try_from(Path::new(&config.path)).context("log file path")?;
        let mut builder = builder
            .log_to_file(spec)
            .duplicate_to_stderr(Duplicate::Warn)
            .write_mode(WriteMode::BufferAndFlush);
        if let Some((criterion, naming, cleanup)) = rotation(config) {
            builder = builder.rotate(criterion, naming, cleanup);
        }
        builder
    };

    builder.start().context("start logger")?;
    Ok(())
}

fn rotation(config: &Logger) -> Option<(Criterion, Naming, Cleanup)> {
    if config.max_size == 0 {
        return None;
    }
    let cleanup = match config.max_backups {
        0 => Cleanup::Never,
        n => Cleanup::KeepLogFiles(n as usize),
    };
    Some((
        Criterion::Size(config.max_size * 1024 * 1024),
        Naming::Timestamps,
        cleanup,
    ))
}

/// One line per record: UTC timestamp, level, module target, message. The
/// target distinguishes handler traffic from producer uploads in mixed
/// output.
fn render(w: &mut dyn Write, now: &mut DeferredNow, record: &log::Record) -> std::io::Result<()> {
    writeln!(
        w,
        "{} {:<5} {} {}",
        now.now_utc_owned().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
        record.level(),
        record.target(),
        record.args()
    )
}
