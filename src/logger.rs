use chrono::Utc;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;

use crate::error::Result;
use crate::protocol::{Command, Response};

/// Diagnostic output on stderr. `RUST_LOG` wins over `default`.
pub fn init_tracing(default: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

/// Session audit trail, one line per protocol milestone
pub trait Logger: Send + Sync {
    fn start(&self, _peer: &str, _cmd: &Command, _data_port: u16) {}
    fn response(&self, _peer: &str, _response: &Response) {}
    fn saved(&self, _path: &Path, _bytes: u64) {}
    fn warning(&self, _msg: &str) {}
    fn error(&self, _context: &str, _msg: &str) {}
    fn done(&self, _bytes: u64, _seconds: f64) {}
}

pub struct NoopLogger;
impl Logger for NoopLogger {}

pub struct TextLogger {
    file: Mutex<File>,
}

impl TextLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(f),
        })
    }

    fn line(&self, s: &str) {
        if let Ok(mut f) = self.file.lock() {
            let _ = writeln!(f, "[{}] {}", Utc::now().to_rfc3339(), s);
        }
    }
}

impl Logger for TextLogger {
    fn start(&self, peer: &str, cmd: &Command, data_port: u16) {
        self.line(&format!("START peer={} cmd={} data_port={}", peer, cmd, data_port));
    }
    fn response(&self, peer: &str, response: &Response) {
        match response {
            Response::Size(n) => self.line(&format!("SIZE peer={} bytes={}", peer, n)),
            Response::Error(msg) => self.line(&format!("REFUSED peer={} msg={}", peer, msg)),
        }
    }
    fn saved(&self, path: &Path, bytes: u64) {
        self.line(&format!("SAVED path={} bytes={}", path.display(), bytes));
    }
    fn warning(&self, msg: &str) {
        self.line(&format!("WARN msg={}", msg));
    }
    fn error(&self, context: &str, msg: &str) {
        self.line(&format!("ERROR ctx={} msg={}", context, msg));
    }
    fn done(&self, bytes: u64, seconds: f64) {
        self.line(&format!("DONE bytes={bytes} seconds={seconds:.3}"));
    }
}
