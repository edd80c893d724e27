use clap::Parser;

use clipsearch::Opts;
use clipsearch::cli::SubCommandExtend;
use clipsearch::config::SubCommand;
use clipsearch::metrics;

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let opts = Opts::parse();

    match &opts.subcmd {
        SubCommand::Index(config) => config.run(&opts).await?,
        SubCommand::Search(config) => config.run(&opts).await?,
        SubCommand::Clean(config) => config.run(&opts).await?,
        SubCommand::Models(config) => config.run(&opts).await?,
    }

    if opts.metrics {
        print!("{}", metrics::gather_text());
    }

    Ok(())
}
