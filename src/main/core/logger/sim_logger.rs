use std::io::Write;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};
use once_cell::sync::{Lazy, OnceCell};

use crate::core::logger::{log_host, log_time};
use crate::core::support::emulated_time::EmulatedTime;
use crate::utility::time::TimeParts;

static SIM_LOGGER: Lazy<SimLogger> = Lazy::new(SimLogger::new);

/// Install the simulation logger as the `log` backend.
pub fn init(max_log_level: LevelFilter, log_errors_to_stderr: bool) -> Result<(), SetLoggerError> {
    SIM_LOGGER.set_max_level(max_log_level);
    SIM_LOGGER.set_log_errors_to_stderr(log_errors_to_stderr);

    log::set_logger(&*SIM_LOGGER)?;
    log::set_max_level(max_log_level);

    // flush anything buffered before the default handler prints the panic
    let default_panic_handler = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        SIM_LOGGER.flush();
        default_panic_handler(panic_info);
    }));

    Ok(())
}

/// A logger that stamps every record with the simulated time and the host whose code emitted it.
///
/// Records are written to stdout through a buffer that's flushed at least once per
/// `FLUSH_INTERVAL` and whenever an error is logged.
pub struct SimLogger {
    start: Instant,
    stdout: Mutex<StdoutBuffer>,
    max_log_level: OnceCell<LevelFilter>,
    log_errors_to_stderr: OnceCell<bool>,
}

struct StdoutBuffer {
    writer: std::io::BufWriter<std::io::Stdout>,
    last_flush: Instant,
}

const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

impl SimLogger {
    fn new() -> Self {
        Self {
            start: Instant::now(),
            stdout: Mutex::new(StdoutBuffer {
                writer: std::io::BufWriter::new(std::io::stdout()),
                last_flush: Instant::now(),
            }),
            max_log_level: OnceCell::new(),
            log_errors_to_stderr: OnceCell::new(),
        }
    }

    /// If the maximum log level has not yet been set, returns `LevelFilter::Trace`.
    pub fn max_level(&self) -> LevelFilter {
        self.max_log_level
            .get()
            .copied()
            .unwrap_or(LevelFilter::Trace)
    }

    fn set_max_level(&self, level: LevelFilter) {
        if self.max_log_level.set(level).is_err() {
            eprintln!("WARNING: the simulation logger's level was already set");
        }
    }

    fn set_log_errors_to_stderr(&self, val: bool) {
        // only the first initialization counts
        let _ = self.log_errors_to_stderr.set(val);
    }

    fn write_line(&self, line: &str, level: Level) -> std::io::Result<()> {
        let Ok(mut stdout) = self.stdout.lock() else {
            // a thread panicked mid-write; write directly rather than lose the record
            print!("{line}");
            return Ok(());
        };
        stdout.writer.write_all(line.as_bytes())?;

        let to_stderr = level <= Level::Error && self.log_errors_to_stderr.get() == Some(&true);
        if to_stderr {
            std::io::stderr().write_all(line.as_bytes())?;
        }
        if level <= Level::Error || stdout.last_flush.elapsed() >= FLUSH_INTERVAL {
            stdout.writer.flush()?;
            stdout.last_flush = Instant::now();
        }
        Ok(())
    }
}

impl Log for SimLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let record = SimLogRecord {
            level: record.level(),
            file: record.file(),
            module_path: record.module_path(),
            line: record.line(),
            message: std::fmt::format(*record.args()),
            wall_time: self.start.elapsed(),
            sim_time: log_time(),
            thread_name: std::thread::current().name().map(str::to_string),
            host: log_host(),
        };

        if let Err(e) = self.write_line(&record.to_string(), record.level) {
            eprintln!("WARNING: couldn't write a log record: {e}");
        }
    }

    fn flush(&self) {
        if let Ok(mut stdout) = self.stdout.lock() {
            let _ = stdout.writer.flush();
            stdout.last_flush = Instant::now();
        }
    }
}

struct SimLogRecord<'a> {
    level: Level,
    file: Option<&'a str>,
    module_path: Option<&'a str>,
    line: Option<u32>,
    message: String,
    wall_time: Duration,
    sim_time: Option<EmulatedTime>,
    thread_name: Option<String>,
    host: Option<String>,
}

impl std::fmt::Display for SimLogRecord<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        {
            let parts = TimeParts::from_nanos(self.wall_time.as_nanos());
            write!(
                f,
                "{:02}:{:02}:{:02}.{:06}",
                parts.hours,
                parts.mins,
                parts.secs,
                parts.nanos / 1000
            )?;
        }
        write!(f, " [{}]", self.thread_name.as_deref().unwrap_or("n/a"))?;
        match self.sim_time {
            Some(t) => write!(f, " {}", TimeParts::from_nanos(t.to_abs_simtime().as_nanos().into()))?,
            None => write!(f, " n/a")?,
        }
        write!(f, " [{}]", self.level)?;
        write!(f, " [{}]", self.host.as_deref().unwrap_or("n/a"))?;

        let file = self
            .file
            .map(|f| f.rsplit('/').next().unwrap_or(f))
            .unwrap_or("n/a");
        write!(f, " [{file}:")?;
        match self.line {
            Some(line) => write!(f, "{line}")?,
            None => write!(f, "n/a")?,
        }
        writeln!(
            f,
            "] [{module}] {msg}",
            module = self.module_path.unwrap_or("n/a"),
            msg = self.message
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::support::simulation_time::SimulationTime;

    #[test]
    fn test_record_format() {
        let record = SimLogRecord {
            level: Level::Info,
            file: Some("src/main/host/services/hsrp.rs"),
            module_path: Some("netsim::host::services::hsrp"),
            line: Some(42),
            message: "Group 1 Standby -> Active".to_string(),
            wall_time: Duration::from_millis(1500),
            sim_time: Some(EmulatedTime::from_abs_simtime(SimulationTime::from_secs(61))),
            thread_name: Some("main".to_string()),
            host: Some("r1".to_string()),
        };
        assert_eq!(
            record.to_string(),
            "00:00:01.500000 [main] 00:01:01.000000000 [INFO] [r1] [hsrp.rs:42] \
            [netsim::host::services::hsrp] Group 1 Standby -> Active\n"
        );
    }

    #[test]
    fn test_record_without_context() {
        let record = SimLogRecord {
            level: Level::Warn,
            file: None,
            module_path: None,
            line: None,
            message: "hello".to_string(),
            wall_time: Duration::ZERO,
            sim_time: None,
            thread_name: None,
            host: None,
        };
        assert_eq!(
            record.to_string(),
            "00:00:00.000000 [n/a] n/a [WARN] [n/a] [n/a:n/a] [n/a] hello\n"
        );
    }
}
