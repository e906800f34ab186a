use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    fs::{self, File, OpenOptions},
    io::{self, BufRead, BufReader, Write},
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::Level;
use tracing_subscriber::EnvFilter;

static TRACING_INIT: OnceCell<()> = OnceCell::new();

pub fn init_tracing() {
    TRACING_INIT.get_or_init(|| {
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy()
        });

        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_writer(io::stderr)
            .finish();

        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}

/// Durable copy of the managed server's output. Every line goes to the output
/// log; stderr lines are additionally appended to the error log.
#[derive(Debug, Clone)]
pub struct ServerLog {
    inner: Arc<Mutex<LoggerInner>>,
}

impl ServerLog {
    pub fn open(output_path: &Path, error_path: &Path) -> Result<Self> {
        let inner = LoggerInner::new(output_path, error_path)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(inner)),
        })
    }

    pub fn log(&self, event: LogEvent) -> Result<()> {
        let mut guard = self.inner.lock();
        guard.write_event(event)
    }

    pub fn flush(&self) -> Result<()> {
        let mut guard = self.inner.lock();
        guard.flush()
    }
}

#[derive(Debug, Clone)]
pub struct LogEvent {
    pub stream: LogStream,
    pub message: Option<String>,
}

impl LogEvent {
    pub fn new(stream: LogStream) -> Self {
        Self {
            stream,
            message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    fn format_line(&self, timestamp: &str) -> String {
        let message = self
            .message
            .as_deref()
            .map(sanitize_message)
            .unwrap_or_else(String::new);

        format!(
            "{timestamp} | {stream:<7} | {message}\n",
            timestamp = timestamp,
            stream = self.stream.label(),
            message = message
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Started,
    Stdout,
    Stderr,
    Exited,
}

impl LogStream {
    pub fn label(self) -> &'static str {
        match self {
            LogStream::Started => "STARTED",
            LogStream::Stdout => "STDOUT",
            LogStream::Stderr => "STDERR",
            LogStream::Exited => "EXITED",
        }
    }
}

#[derive(Debug)]
struct LoggerInner {
    output: File,
    output_path: PathBuf,
    errors: File,
    error_path: PathBuf,
}

impl LoggerInner {
    fn new(output_path: &Path, error_path: &Path) -> Result<Self> {
        Ok(Self {
            output: open_append(output_path)?,
            output_path: output_path.to_path_buf(),
            errors: open_append(error_path)?,
            error_path: error_path.to_path_buf(),
        })
    }

    fn write_event(&mut self, event: LogEvent) -> Result<()> {
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let line = event.format_line(&timestamp);
        self.output
            .write_all(line.as_bytes())
            .with_context(|| format!("writing to {}", self.output_path.display()))?;
        if event.stream == LogStream::Stderr {
            self.errors
                .write_all(line.as_bytes())
                .with_context(|| format!("writing to {}", self.error_path.display()))?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.output.flush().context("flushing output log")?;
        self.errors.flush().context("flushing error log")?;
        Ok(())
    }
}

fn open_append(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating log directory {}", parent.display()))?;
        }
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("opening log file {}", path.display()))
}

fn sanitize_message(message: &str) -> String {
    message
        .chars()
        .map(|ch| if ch == '\n' || ch == '\r' { ' ' } else { ch })
        .collect()
}

/// Returns the last `lines` lines of a file, truncated to at most `max_chars`
/// characters (keeping the most recent text).
pub fn tail_lines(path: &Path, lines: usize, max_chars: usize) -> io::Result<String> {
    let reader = BufReader::new(File::open(path)?);
    let mut window = VecDeque::with_capacity(lines);
    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(error) if error.kind() == io::ErrorKind::InvalidData => continue,
            Err(error) => return Err(error),
        };
        if window.len() == lines {
            window.pop_front();
        }
        window.push_back(line);
    }
    let joined = window.into_iter().collect::<Vec<_>>().join("\n");
    Ok(keep_last_chars(&joined, max_chars))
}

fn keep_last_chars(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    text.chars().skip(count - max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn stderr_lines_land_in_both_logs() -> Result<()> {
        let dir = tempdir()?;
        let output = dir.path().join("logs").join("server.log");
        let errors = dir.path().join("logs").join("server-error.log");
        let log = ServerLog::open(&output, &errors)?;

        log.log(LogEvent::new(LogStream::Stdout).with_message("listening on 4124"))?;
        log.log(LogEvent::new(LogStream::Stderr).with_message("segfault\nin handler"))?;
        log.flush()?;

        let output_contents = fs::read_to_string(&output)?;
        let error_contents = fs::read_to_string(&errors)?;
        assert_eq!(output_contents.lines().count(), 2);
        assert!(output_contents.contains("| STDOUT  | listening on 4124"));
        assert_eq!(error_contents.lines().count(), 1);
        assert!(error_contents.contains("| STDERR  | segfault in handler"));
        Ok(())
    }

    #[test]
    fn tail_returns_last_lines_bounded_by_chars() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("err.log");
        let body: String = (1..=30).map(|i| format!("line {i}\n")).collect();
        fs::write(&path, body)?;

        let tail = tail_lines(&path, 3, 1_000)?;
        assert_eq!(tail, "line 28\nline 29\nline 30");

        let clipped = tail_lines(&path, 3, 7)?;
        assert_eq!(clipped, "line 30");
        Ok(())
    }

    #[test]
    fn tail_of_missing_file_is_an_error() {
        let error = tail_lines(Path::new("/nonexistent/err.log"), 5, 100).unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::NotFound);
    }
}
