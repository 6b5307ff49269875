use anyhow::{Context, Result};
use clap::Parser;

use ftlink::cli::ServeOpts;
use ftlink::logger::init_tracing;

fn main() -> Result<()> {
    let opts = ServeOpts::parse();
    init_tracing(if opts.verbose { "debug" } else { "info" });

    if !opts.dir.is_dir() {
        anyhow::bail!("Error: directory does not exist: {}", opts.dir.display());
    }
    let bind = opts.bind_addr();
    println!("Server open on {}", bind);
    ftlink::serve::serve(&bind, &opts.dir).with_context(|| format!("serve {}", bind))
}
