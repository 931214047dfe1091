use std::path::PathBuf;

use clap::Parser;

/// Starts debug targets stopped inside this terminal on behalf of gdbfront
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// FIFO this helper writes to
    read_fifo: PathBuf,

    /// FIFO this helper reads requests from
    write_fifo: PathBuf,
}

fn main() {
    let args = Args::parse();

    simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Info)
        .init()
        .unwrap();

    if let Err(e) = gdbadapter::spawner::run(&args.read_fifo, &args.write_fifo) {
        log::error!("Spawner failed: {}", e);
        std::process::exit(1);
    }
}
