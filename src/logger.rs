//! Wires the `log` facade to simplelog.
//!
//! Log output goes to stderr so that stdout carries nothing but samples.

use std::fs::File;
use std::path::Path;

use log::LevelFilter;
use simplelog::{
    ColorChoice, CombinedLogger, ConfigBuilder, SharedLogger, TermLogger, TerminalMode, WriteLogger,
};

use crate::common::FatalKind;

#[derive(thiserror::Error, Debug)]
pub enum LoggerError {
    #[error("Could not create log file: {0}")]
    CreateFile(#[from] std::io::Error),
    #[error("A logger is already installed: {0}")]
    AlreadyInitialized(#[from] log::SetLoggerError),
}

impl LoggerError {
    pub fn kind(&self) -> FatalKind {
        match self {
            LoggerError::CreateFile(_) => FatalKind::Configuration,
            LoggerError::AlreadyInitialized(_) => FatalKind::Protocol,
        }
    }
}

/// Warn by default, one level chattier per `-v`.
pub fn level_for_verbosity(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

pub fn init_logger(verbosity: u8, log_file: Option<&Path>) -> Result<(), LoggerError> {
    let level = level_for_verbosity(verbosity);

    let mut log_config_builder = ConfigBuilder::default();
    log_config_builder.set_target_level(LevelFilter::Error);
    let log_config = log_config_builder.build();

    let mut loggers: Vec<Box<dyn SharedLogger>> = Vec::new();
    loggers.push(TermLogger::new(
        level,
        log_config.clone(),
        TerminalMode::Stderr,
        ColorChoice::Auto,
    ));
    if let Some(path) = log_file {
        loggers.push(WriteLogger::new(level, log_config, File::create(path)?));
    }

    CombinedLogger::init(loggers)?;
    Ok(())
}
