use clap::Parser;
use tenant_operator::{cli, logging};

fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();
    logging::init(cli.verbosity());
    cli.run()
}
