//! Wires a parsed torrent file into a running `Session` + `EventLoop`: loads
//! metadata, opens and resume-scans the data file, binds the listener, and
//! hands control to the event loop until it returns (completion or SIGINT).

use crate::event_loop::EventLoop;
use crate::metainfo::MetaInfo;
use crate::piece_store::PieceStore;
use crate::session::Session;
use crate::torrent::Torrent;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;

pub struct Driver;

impl Driver {
    /// Loads `torrent_path`, opens `output_path` (or, if unset, a file named
    /// after the torrent's own `info.name`) for the downloaded data, binds a
    /// listener on `listen_port`, and runs the engine to completion or until
    /// asked to stop. Returns the `Sender` a signal handler should use to
    /// request a graceful shutdown.
    pub fn run(torrent_path: &Path, output_path: Option<&Path>, listen_port: u16, peer_id: [u8; 20]) -> Result<()> {
        let torrent = Torrent::from_path(torrent_path)
            .with_context(|| format!("loading torrent file {}", torrent_path.display()))?;
        let meta = MetaInfo::load(&torrent, peer_id, listen_port)?;

        log::info!(
            "loaded '{}': {} bytes in {} pieces, {} tracker(s)",
            meta.name,
            meta.length,
            meta.num_pieces(),
            meta.trackers.len()
        );

        let default_output = PathBuf::from(&meta.name);
        let output_path = output_path.unwrap_or(&default_output);

        let store = PieceStore::open(output_path, meta.clone())
            .with_context(|| format!("opening output file {}", output_path.display()))?;
        log::info!("resume scan: {}/{} bytes already verified", store.downloaded(), meta.length);

        let mut session = Session::new(meta, store);
        let listen_addr: SocketAddr = format!("0.0.0.0:{listen_port}").parse()?;
        let mut event_loop = EventLoop::bind(listen_addr)?;

        register_sigint(event_loop.shutdown_sender())?;

        event_loop.run(&mut session)
    }
}

/// Installs a SIGINT handler that only ever does the one thing a signal
/// handler may safely do: push a notification through a channel. All the
/// actual shutdown I/O (announcing `stopped` to trackers) happens on the
/// main loop after it observes the message, on its next poll iteration,
/// never inside the handler itself.
fn register_sigint(shutdown_tx: Sender<()>) -> Result<()> {
    let mut signals = signal_hook::iterator::Signals::new([signal_hook::consts::SIGINT])
        .context("registering SIGINT handler")?;
    std::thread::spawn(move || {
        for _ in signals.forever() {
            if shutdown_tx.send(()).is_err() {
                break;
            }
        }
    });
    Ok(())
}
