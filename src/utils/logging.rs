use anyhow::Context;
use chrono::Local;
use fern::Dispatch;
use log::LevelFilter;
use std::path::PathBuf;

pub struct Logger;

impl Logger {
    /// Installs the process-wide logger. Fails if one is already installed.
    pub fn init(level: LevelFilter, log_file: Option<PathBuf>) -> Result<(), anyhow::Error> {
        let mut dispatcher = Dispatch::new()
            .format(|out, message, record| {
                out.finish(format_args!(
                    "[{}][{}][{}] {}",
                    Local::now().format("%Y-%m-%d %H:%M:%S"),
                    record.level(),
                    record.target(),
                    message
                ))
            })
            .level(level)
            .chain(std::io::stderr());

        if let Some(path) = &log_file {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            dispatcher = dispatcher.chain(
                fern::log_file(path).with_context(|| format!("cannot create log file {:?}", path))?,
            );
        }

        dispatcher.apply()?;
        log::info!("logging initialized at {}", level);
        Ok(())
    }

    pub fn level_filter(level: &str) -> LevelFilter {
        match level.to_uppercase().as_str() {
            "OFF" => LevelFilter::Off,
            "TRACE" => LevelFilter::Trace,
            "DEBUG" => LevelFilter::Debug,
            "INFO" => LevelFilter::Info,
            "WARN" => LevelFilter::Warn,
            "ERROR" => LevelFilter::Error,
            _ => LevelFilter::Info,
        }
    }
}
