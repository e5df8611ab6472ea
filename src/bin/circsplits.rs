use anyhow::anyhow;
use clap::{Parser, crate_name, crate_version};

use circsplits::{
    cli::{ProgramArgs, ProgramSubcommand},
    network::runner::NetworkRunner,
    set_log_level,
};
use log::{error, info};

fn main() {
    let app = ProgramArgs::parse();

    set_log_level(&app, true, crate_name!(), crate_version!());
    if let Err(err) = rayon::ThreadPoolBuilder::new()
        .num_threads(app.threads)
        .build_global()
    {
        error!("{:#}", anyhow!(err).context("configuring the rayon thread pool"));
        std::process::exit(1);
    }
    info!("Rayon threads: {}", rayon::current_num_threads());

    // Dispatch subcommands
    let result = match app.subcommand {
        ProgramSubcommand::Network(args) => NetworkRunner::new(app.output_directory, args).run(),
    };

    if let Err(err) = result {
        error!("{:#}", err);
        std::process::exit(1);
    }
}
