use clap::Parser;
use singlefile_bt::driver::Driver;
use singlefile_bt::utils;
use std::path::PathBuf;

/// Single-file BitTorrent v1 client: downloads one file from the peers a
/// tracker hands back, then keeps serving verified pieces to anyone else
/// who asks.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Path to the .torrent file to download.
    torrent: PathBuf,

    /// TCP port to listen for incoming peer connections on and to announce
    /// to the tracker.
    listen_port: u16,

    /// Where to write the downloaded file. Defaults to the torrent's name.
    #[arg(short, long)]
    out: Option<PathBuf>,

    /// Raise the log level (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() {
    let args = Cli::parse();

    let default_filter = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter)).init();

    let peer_id = utils::generate_peer_id();

    if let Err(e) = Driver::run(&args.torrent, args.out.as_deref(), args.listen_port, peer_id) {
        log::error!("{e:#}");
        std::process::exit(1);
    }
}
