use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Mutex, OnceLock};

use anyhow::{Context, Result};
use chrono::SecondsFormat;

static LOGGER: OnceLock<Logger> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Error,
    Warning,
    Info,
    Debug,
}

impl Level {
    pub fn parse(raw: &str) -> Option<Level> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "ERROR" => Some(Level::Error),
            "WARNING" | "WARN" => Some(Level::Warning),
            "INFO" => Some(Level::Info),
            "DEBUG" => Some(Level::Debug),
            _ => None,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Level::Error => "ERROR",
            Level::Warning => "WARNING",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
        }
    }
}

pub fn init_log_file(path: &Path, level: Level, mirror_to_stdout: bool) -> Result<()> {
    if LOGGER.get().is_some() {
        return Ok(());
    }
    let logger = Logger::new(path, level, mirror_to_stdout)?;
    let _ = LOGGER.set(logger);
    Ok(())
}

pub fn error(msg: impl AsRef<str>) {
    log_kv(Level::Error, msg.as_ref(), &[]);
}

pub fn warning(msg: impl AsRef<str>) {
    log_kv(Level::Warning, msg.as_ref(), &[]);
}

pub fn info(msg: impl AsRef<str>) {
    log_kv(Level::Info, msg.as_ref(), &[]);
}

pub fn debug(msg: impl AsRef<str>) {
    log_kv(Level::Debug, msg.as_ref(), &[]);
}

pub fn info_kv(msg: &str, kv: &[(&str, &str)]) {
    log_kv(Level::Info, msg, kv);
}

fn log_kv(level: Level, msg: &str, kv: &[(&str, &str)]) {
    if let Some(logger) = LOGGER.get() {
        logger.write_kv(level, msg, kv);
    }
}

struct Logger {
    file: Mutex<File>,
    max_level: Level,
    mirror_to_stdout: bool,
}

impl Logger {
    fn new(path: &Path, max_level: Level, mirror_to_stdout: bool) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        // New log file per mount (truncate).
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(path)
            .with_context(|| format!("open {}", path.display()))?;
        Ok(Self {
            file: Mutex::new(file),
            max_level,
            mirror_to_stdout,
        })
    }

    fn write_kv(&self, level: Level, msg: &str, kv: &[(&str, &str)]) {
        if level > self.max_level {
            return;
        }
        let ts = chrono::Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);

        let mut line = format!(
            "time={ts} level={} msg=\"{}\"",
            level.as_str(),
            escape_value(msg)
        );
        for (k, v) in kv {
            line.push(' ');
            line.push_str(k);
            line.push('=');
            line.push_str(v);
        }
        line.push('\n');

        if let Ok(mut f) = self.file.lock() {
            let _ = f.write_all(line.as_bytes());
            let _ = f.flush();
        }
        if self.mirror_to_stdout {
            let mut out = std::io::stdout();
            let _ = out.write_all(line.as_bytes());
            let _ = out.flush();
        }
    }
}

fn escape_value(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ => out.push(c),
        }
    }
    out
}
