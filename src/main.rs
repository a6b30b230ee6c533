use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod case;
mod cli;
mod compile;
mod driver;
mod error;
mod peer;
mod port;
mod process;
mod runner;
mod stats;
mod validate;

use runner::{Runner, Verdict};

fn init_logging(debug: bool) -> Result<()> {
    let default = if debug { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_env("NETLAB_LOG")
        .or_else(|_| EnvFilter::try_new(default))
        .context("invalid log filter")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("{e}"))
        .context("logging already initialised")
}

fn main() -> Result<()> {
    let args = cli::Cli::parse();
    let opts = args.cmd.opts();
    init_logging(opts.debug)?;

    let verdict = match case::load_scenario(&opts.tests, opts.index) {
        Err(e) => Verdict::from(e),
        Ok(scenario) => {
            let mut runner = Runner::new(opts.cc.gcc());
            runner.work_dir = opts.work_dir.clone();
            match &args.cmd {
                cli::Cmd::Client(_) => runner.evaluate_client(&opts.source, &scenario),
                cli::Cmd::Server(_) => runner.evaluate_server(&opts.source, &scenario),
            }
        }
    };

    println!("{verdict}");
    std::process::exit(verdict.exit_code());
}
