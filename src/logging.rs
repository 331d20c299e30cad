use chrono::Local;
use env_filter::Filter;
use log::{Log, Metadata, Record};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Mutex;

pub const LOG_FILENAME: &str = "captioncast.log";

/// A formatted log line, or `None` as the distribution shutdown sentinel.
pub type LogLine = Option<String>;

/// Handle to the logger's output: every formatted line is appended to the
/// log file and mirrored into this channel so the broadcast layer can
/// republish it as the `log` category.
pub struct LogTap {
    pub lines: Receiver<LogLine>,
    pub sender: Sender<LogLine>,
    pub file_path: PathBuf,
}

impl LogTap {
    /// A tap with no logger attached. Used by tests that need a
    /// `QueueManager` without installing the global logger.
    pub fn detached(file_path: PathBuf) -> Self {
        let (sender, lines) = channel();
        LogTap {
            lines,
            sender,
            file_path,
        }
    }
}

struct FileLogger {
    filter: Filter,
    file: Mutex<File>,
    tap: Sender<LogLine>,
}

impl Log for FileLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.filter.enabled(metadata)
    }

    fn log(&self, record: &Record) {
        if !self.filter.matches(record) {
            return;
        }

        let line = format!(
            "{} - {:<5} :: {} :: {}",
            Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            record.level(),
            record.target(),
            record.args()
        );

        if let Ok(mut file) = self.file.lock() {
            let _ = writeln!(file, "{}", line);
        }
        let _ = self.tap.send(Some(line));
    }

    fn flush(&self) {
        if let Ok(mut file) = self.file.lock() {
            let _ = file.flush();
        }
    }
}

/// Install the process-wide logger, writing to `<logs_folder>/captioncast.log`
/// and feeding the returned tap. Level selection follows `RUST_LOG`
/// (default `info`). Can only be called once per process.
pub fn init(logs_folder: &Path) -> anyhow::Result<LogTap> {
    fs::create_dir_all(logs_folder)?;
    let file_path = logs_folder.join(LOG_FILENAME);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&file_path)?;

    let mut builder = env_filter::Builder::new();
    match std::env::var("RUST_LOG") {
        Ok(spec) => {
            builder.parse(&spec);
        }
        Err(_) => {
            builder.parse("info");
        }
    }
    let filter = builder.build();

    let (sender, lines) = channel();
    let logger = FileLogger {
        filter,
        file: Mutex::new(file),
        tap: sender.clone(),
    };

    log::set_max_level(log::LevelFilter::Trace);
    log::set_boxed_logger(Box::new(logger))
        .map_err(|e| anyhow::anyhow!("logger already installed: {}", e))?;

    Ok(LogTap {
        lines,
        sender,
        file_path,
    })
}
