use std::{
    fs::OpenOptions,
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

type SharedFile = Arc<Mutex<std::fs::File>>;

/// Keeps the log file handle alive for the life of the process.
pub struct LogGuard {
    file: Option<SharedFile>,
    path: Option<PathBuf>,
}

impl LogGuard {
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

/// Level resolution: `--debug`, then `CTXLINK_LOG_LEVEL`, then `info`.
/// `RUST_LOG` overrides all of them.
pub fn resolve_level(debug: bool) -> String {
    if debug || env_true("CTXLINK_DEBUG") {
        return "debug".to_string();
    }
    match std::env::var("CTXLINK_LOG_LEVEL") {
        Ok(level) if !level.trim().is_empty() => level,
        _ => "info".to_string(),
    }
}

/// Install the global subscriber. Logs go to stderr (stdout carries the
/// machine-readable handshake) and are teed to `<log_dir>/ctxlink-<pid>.log`.
pub fn init_logging(debug: bool, log_dir: Option<&Path>) -> Option<LogGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(resolve_level(debug)));
    let guard = match log_dir {
        Some(dir) => open_log_file(dir, std::process::id()).unwrap_or_else(|err| {
            eprintln!("log_file_error: {err}");
            LogGuard {
                file: None,
                path: None,
            }
        }),
        None => LogGuard {
            file: None,
            path: None,
        },
    };
    let file = guard.file.clone();
    let make_writer = BoxMakeWriter::new(move || MultiWriter::new(file.clone()));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .with_ansi(false)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(guard)
}

struct MultiWriter {
    stderr: io::Stderr,
    file: Option<SharedFile>,
}

impl MultiWriter {
    fn new(file: Option<SharedFile>) -> Self {
        Self {
            stderr: io::stderr(),
            file,
        }
    }
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.stderr.write_all(buf);
        if let Some(file) = &self.file {
            let mut file = file.lock().unwrap_or_else(PoisonError::into_inner);
            let _ = file.write_all(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = self.stderr.flush();
        if let Some(file) = &self.file {
            let mut file = file.lock().unwrap_or_else(PoisonError::into_inner);
            let _ = file.flush();
        }
        Ok(())
    }
}

fn open_log_file(dir: &Path, pid: u32) -> io::Result<LogGuard> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("ctxlink-{pid}.log"));
    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    Ok(LogGuard {
        file: Some(Arc::new(Mutex::new(file))),
        path: Some(path),
    })
}

pub fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}
