mod cli;
mod nfqueue;
mod packets;

use std::process::exit;

use clap::Parser;

use crate::cli::Cli;

fn main() {
    pretty_env_logger::formatted_builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let cli = Cli::parse();

    if let Err(err) = nfqueue::listen(&cli) {
        log::error!("Queue {} listener exited with error: {err:#} (permission issue ?)", cli.queue);
        exit(1);
    }
}
