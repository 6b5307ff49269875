//! Clap definitions for ftclient and ftserve

use clap::{ArgGroup, Parser};
use std::path::PathBuf;

use crate::config::ClientConfig;
use crate::protocol::Command;

/// Request a listing, a file, or a directory change from an ftserve peer
#[derive(Clone, Debug, Parser)]
#[command(
    name = "ftclient",
    version,
    group(ArgGroup::new("command").required(true).multiple(false).args(["list", "get", "cd"]))
)]
pub struct ClientOpts {
    /// Host running ftserve
    pub server_host: String,

    /// Control port ftserve listens on
    pub server_port: u16,

    /// List files in the server's directory
    #[arg(short = 'l', long)]
    pub list: bool,

    /// Download FILENAME into the output directory
    #[arg(short = 'g', long, value_name = "FILENAME")]
    pub get: Option<String>,

    /// Change the server's working directory
    #[arg(short = 'c', long = "cd", value_name = "DIRNAME")]
    pub cd: Option<String>,

    /// Local port the server connects back to
    #[arg(value_parser = clap::value_parser!(u16).range(1..))]
    pub data_port: u16,

    /// Config file (default: ~/.config/ftlink/ftclient.toml if present)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Seconds to wait for the connect-back (0 = forever)
    #[arg(long)]
    pub accept_timeout: Option<u64>,

    /// Directory GET writes into
    #[arg(short = 'o', long)]
    pub output_dir: Option<PathBuf>,

    /// Show a progress bar while receiving a file
    #[arg(short, long)]
    pub progress: bool,

    /// Log protocol steps to stderr
    #[arg(short, long)]
    pub verbose: bool,

    /// Append a session record to this file
    #[arg(long = "log-file")]
    pub log_file: Option<PathBuf>,
}

impl ClientOpts {
    pub fn command(&self) -> Command {
        if let Some(name) = &self.get {
            Command::Get(name.clone())
        } else if let Some(dir) = &self.cd {
            Command::Cd(dir.clone())
        } else {
            Command::List
        }
    }

    /// Command-line values win over the config file
    pub fn apply(&self, cfg: &mut ClientConfig) {
        if let Some(secs) = self.accept_timeout {
            cfg.accept_timeout_secs = secs;
        }
        if let Some(dir) = &self.output_dir {
            cfg.output_dir = dir.clone();
        }
        if self.progress {
            cfg.progress = true;
        }
    }
}

/// Serve the current directory to ftclient
#[derive(Clone, Debug, Parser)]
#[command(name = "ftserve", version)]
pub struct ServeOpts {
    /// Control port to listen on
    pub port: u16,

    /// Address to bind
    #[arg(long, default_value = "0.0.0.0")]
    pub bind: String,

    /// Starting directory
    #[arg(long, default_value = ".")]
    pub dir: PathBuf,

    /// More detailed logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl ServeOpts {
    pub fn bind_addr(&self) -> String {
        if self.bind.contains(':') {
            format!("[{}]:{}", self.bind, self.port)
        } else {
            format!("{}:{}", self.bind, self.port)
        }
    }
}
