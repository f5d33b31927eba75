//! Tracing subscriber initialisation.
//!
//! Environment:
//! - `RUST_LOG`: full filter directives; wins over `RPOD_LOG_LEVEL`.
//! - `RPOD_LOG_LEVEL`: default level, `info` when unset.
//! - `RPOD_LOG_FORMAT`: `human` (default) or `json`.
//! - `RPOD_LOG_FILE`: also write to this file, rotated daily.

use std::{
    env,
    io::{self, Write},
    path::{Path, PathBuf},
};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt::MakeWriter, prelude::*, registry, EnvFilter};

// --- Tee writer: stdout plus the file sink ---
struct Tee<A, B> {
    a: A,
    b: B,
}

impl<A, B> Write for Tee<A, B>
where
    A: Write,
    B: Write,
{
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let res_a = self.a.write_all(buf).map(|_| buf.len());
        let res_b = self.b.write_all(buf).map(|_| buf.len());
        res_a.or(res_b)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.a.flush()?;
        self.b.flush()
    }
}

#[derive(Clone)]
struct MakeTee<A, B> {
    make_a: A,
    make_b: B,
}

impl<'a, A, B, W1, W2> MakeWriter<'a> for MakeTee<A, B>
where
    A: MakeWriter<'a, Writer = W1>,
    B: MakeWriter<'a, Writer = W2>,
    W1: Write + 'a,
    W2: Write + 'a,
{
    type Writer = Tee<W1, W2>;
    fn make_writer(&'a self) -> Self::Writer {
        Tee {
            a: self.make_a.make_writer(),
            b: self.make_b.make_writer(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Human,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub level: String,
    pub format: LogFormat,
    pub file: Option<PathBuf>,
}

impl LogSettings {
    pub fn from_env() -> Self {
        let level = env::var("RPOD_LOG_LEVEL")
            .ok()
            .filter(|l| !l.trim().is_empty())
            .unwrap_or_else(|| "info".to_string());
        let format = match env::var("RPOD_LOG_FORMAT").as_deref() {
            Ok("json") => LogFormat::Json,
            _ => LogFormat::Human,
        };
        let file = env::var_os("RPOD_LOG_FILE")
            .filter(|f| !f.is_empty())
            .map(PathBuf::from);
        Self {
            level,
            format,
            file,
        }
    }

    fn filter(&self) -> EnvFilter {
        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&self.level))
            .unwrap_or_else(|_| EnvFilter::new("info"));
        ["tokio=warn", "hyper=warn"]
            .into_iter()
            .filter_map(|d| d.parse().ok())
            .fold(filter, |f, directive| f.add_directive(directive))
    }
}

/// Install the global subscriber. Keep the returned guard alive for the
/// life of the process when a log file is configured, or buffered lines are
/// lost on exit.
pub fn init_subscriber() -> Option<WorkerGuard> {
    init_with(&LogSettings::from_env())
}

pub fn init_with(settings: &LogSettings) -> Option<WorkerGuard> {
    let subscriber = registry().with(settings.filter());
    let is_json = settings.format == LogFormat::Json;

    match &settings.file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let name = path
                .file_name()
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("rpod.log"));
            let file_appender = tracing_appender::rolling::daily(dir, name);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

            let tee_writer = MakeTee {
                make_a: std::io::stdout,
                make_b: non_blocking,
            };
            let fmt_layer = tracing_subscriber::fmt::layer().with_writer(tee_writer);
            if is_json {
                subscriber.with(fmt_layer.json()).init();
            } else {
                subscriber.with(fmt_layer.with_ansi(false)).init();
            }
            Some(guard)
        }
        None => {
            let fmt_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stdout);
            if is_json {
                subscriber.with(fmt_layer.json()).init();
            } else {
                subscriber.with(fmt_layer).init();
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear() {
        for key in ["RPOD_LOG_LEVEL", "RPOD_LOG_FORMAT", "RPOD_LOG_FILE"] {
            env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn test_settings_defaults() {
        clear();
        let settings = LogSettings::from_env();
        assert_eq!(settings.level, "info");
        assert_eq!(settings.format, LogFormat::Human);
        assert_eq!(settings.file, None);
    }

    #[test]
    #[serial]
    fn test_settings_from_env() {
        clear();
        env::set_var("RPOD_LOG_LEVEL", "debug");
        env::set_var("RPOD_LOG_FORMAT", "json");
        env::set_var("RPOD_LOG_FILE", "/var/log/rpod/api.log");

        let settings = LogSettings::from_env();
        assert_eq!(settings.level, "debug");
        assert_eq!(settings.format, LogFormat::Json);
        assert_eq!(settings.file, Some(PathBuf::from("/var/log/rpod/api.log")));
        clear();
    }

    #[test]
    fn test_tee_writes_both_sinks() {
        let mut tee = Tee {
            a: Vec::new(),
            b: Vec::new(),
        };
        tee.write_all(b"hello").unwrap();
        tee.flush().unwrap();
        assert_eq!(tee.a, b"hello");
        assert_eq!(tee.b, b"hello");
    }
}
