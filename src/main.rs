use anyhow::Result;
use clap::Parser;

mod cli;
mod config;
mod datalog;
mod fleet;
mod frame;
mod lindy;
mod logging;
mod monitor;
mod port;
mod power;
mod reassembler;
mod rx;
mod schema;
mod stats;
mod supervisor;
mod tx;

fn main() -> Result<()> {
    let args = cli::Cli::parse();
    logging::init(args.verbose, args.log_format)?;
    match args.cmd {
        cli::Cmd::Run(opts) => fleet::run(opts),
        cli::Cmd::List(opts) => fleet::list(opts),
        cli::Cmd::Cycle(opts) => fleet::cycle(opts),
        cli::Cmd::Watch(opts) => rx::run(opts),
        cli::Cmd::Emit(opts) => tx::run(opts),
    }
}
