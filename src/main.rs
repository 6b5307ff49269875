//! ftclient - ask an ftserve peer for a listing, a file, or a directory change
//!
//!   ftclient <server_host> <server_port> (-l | -g FILENAME | -c DIRNAME) <data_port>

use anyhow::{Context, Result};
use clap::Parser;
use std::io::Write;
use std::sync::Arc;

use ftlink::cli::ClientOpts;
use ftlink::logger::{init_tracing, Logger, NoopLogger, TextLogger};
use ftlink::{CancelFlag, ClientConfig, Outcome, SessionOptions, TransferError, TransferSession};

fn main() {
    let opts = ClientOpts::parse();
    init_tracing(if opts.verbose { "info,ftlink=debug" } else { "warn" });

    match run(&opts) {
        Ok(()) => {}
        Err(e) => {
            eprintln!("{:#}", e);
            let code = e
                .downcast_ref::<TransferError>()
                .map(TransferError::exit_code)
                .unwrap_or(1);
            std::process::exit(code);
        }
    }
}

fn run(opts: &ClientOpts) -> Result<()> {
    let mut cfg = ClientConfig::load(opts.config.as_deref())?;
    opts.apply(&mut cfg);
    if !cfg.output_dir.is_dir() {
        anyhow::bail!("output directory does not exist: {}", cfg.output_dir.display());
    }

    let cancel = CancelFlag::new();
    cancel
        .install_ctrlc()
        .context("Error setting Ctrl-C handler")?;

    // Choose logger once; NoopLogger unless a log file was requested
    let logger: Arc<dyn Logger + Send + Sync> = match opts.log_file {
        Some(ref p) => match TextLogger::new(p) {
            Ok(l) => Arc::new(l),
            Err(_) => Arc::new(NoopLogger),
        },
        None => Arc::new(NoopLogger),
    };

    let report = TransferSession::new(&opts.server_host, opts.server_port, opts.command(), opts.data_port)
        .with_options(SessionOptions::from(&cfg))
        .with_cancel(cancel)
        .with_logger(logger)
        .run()?;

    for w in &report.warnings {
        eprintln!("warning: {}", w);
    }
    let mut out = std::io::stdout().lock();
    match &report.outcome {
        Outcome::Listing(text) => {
            out.write_all(text.as_bytes())?;
            if !text.is_empty() && !text.ends_with('\n') {
                writeln!(out)?;
            }
        }
        other => writeln!(out, "{}", other)?,
    }
    out.flush()?;
    Ok(())
}
