//! The root aggregate: every registry the event loop dispatches against,
//! plus the download/upload counters whose invariant (`downloaded + left ==
//! length`) every mutation must preserve.

use crate::bitfield::Bitfield;
use crate::metainfo::MetaInfo;
use crate::peer::connection::PeerSession;
use crate::piece_store::PieceStore;
use crate::scheduler::Scheduler;
use crate::tracker::http::TrackerClient;
use crate::waitpeer::WaitPeer;
use mio::net::TcpStream;
use mio::Token;
use std::collections::HashMap;
use std::net::SocketAddr;

pub struct Session {
    pub meta: MetaInfo,
    pub store: PieceStore,
    pub scheduler: Scheduler,
    pub local_bitfield: Bitfield,

    pub peers: HashMap<Token, PeerSession>,
    pub waitpeers: HashMap<Token, WaitPeer>,
    /// Sockets for not-yet-handshaked peers, kept out of `WaitPeer` itself so
    /// the event loop can borrow the stream and the handshake-progress state
    /// independently.
    pub waitpeer_streams: HashMap<Token, TcpStream>,
    pub trackers: HashMap<Token, TrackerClient>,

    pub uploaded: u64,

    /// Set once SIGINT has been observed; the event loop sends a `stopped`
    /// announce to every reachable tracker before exiting.
    pub shutting_down: bool,
}

impl Session {
    pub fn new(meta: MetaInfo, store: PieceStore) -> Session {
        let local_bitfield = store.verified_bitfield().clone();
        let scheduler = Scheduler::new(&meta.piece_hashes, |i| meta.num_sub_pieces(i));
        Session {
            meta,
            store,
            scheduler,
            local_bitfield,
            peers: HashMap::new(),
            waitpeers: HashMap::new(),
            waitpeer_streams: HashMap::new(),
            trackers: HashMap::new(),
            uploaded: 0,
            shutting_down: false,
        }
    }

    pub fn downloaded(&self) -> u64 {
        self.store.downloaded()
    }

    pub fn left(&self) -> u64 {
        self.store.left()
    }

    pub fn is_complete(&self) -> bool {
        self.store.is_complete()
    }

    /// True if we already have a handshaked or handshaking connection to
    /// this address — used to reject duplicate inbound connections and
    /// self-connects before a handshake is even attempted.
    pub fn already_connected(&self, addr: SocketAddr) -> bool {
        self.peers.values().any(|p| p.addr == addr) || self.waitpeers.values().any(|w| w.addr == addr)
    }

    /// Called when a piece finishes hashing successfully: updates the local
    /// bitfield and scheduler bookkeeping so HAVE gets broadcast and no
    /// further requests for it go out.
    pub fn on_piece_verified(&mut self, piece: usize) {
        self.local_bitfield.set(piece);
        self.scheduler.mark_verified(piece);
    }

    pub fn on_piece_mismatch(&mut self, piece: usize) {
        self.scheduler.mark_mismatch(piece);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::{Info, Torrent};
    use serde_bytes::ByteBuf;
    use sha1::{Digest, Sha1};
    use tempfile::NamedTempFile;

    fn session_fixture() -> Session {
        let data = vec![0x55u8; 16384];
        let mut hasher = Sha1::new();
        hasher.update(&data);
        let digest: [u8; 20] = hasher.finalize().into();

        let info = Info {
            name: "f".to_string(),
            pieces: ByteBuf::from(digest.to_vec()),
            piece_length: 16384,
            md5sum: None,
            length: Some(16384),
            files: None,
            private: None,
            path: None,
            root_hash: None,
        };
        let torrent = Torrent {
            info,
            announce: Some("http://t.example/announce".to_string()),
            nodes: None,
            encoding: None,
            httpseeds: None,
            announce_list: None,
            creation_date: None,
            comment: None,
            created_by: None,
        };
        let meta = MetaInfo::load(&torrent, [9u8; 20], 6881).unwrap();
        let tmp = NamedTempFile::new().unwrap();
        let store = PieceStore::open(tmp.path(), meta.clone()).unwrap();
        Session::new(meta, store)
    }

    #[test]
    fn downloaded_and_left_sum_to_length() {
        let session = session_fixture();
        assert_eq!(session.downloaded() + session.left(), session.meta.length);
    }

    #[test]
    fn on_piece_verified_updates_local_bitfield_and_scheduler() {
        let mut session = session_fixture();
        assert!(!session.local_bitfield.is_set(0));
        session.on_piece_verified(0);
        assert!(session.local_bitfield.is_set(0));
        assert!(session.scheduler.piece(0).verified);
    }

    #[test]
    fn already_connected_detects_peer_and_waitpeer_addrs() {
        let mut session = session_fixture();
        let addr: SocketAddr = "1.2.3.4:6881".parse().unwrap();
        assert!(!session.already_connected(addr));
        session.waitpeers.insert(
            Token(5),
            WaitPeer::new(addr, crate::waitpeer::Direction::Inbound),
        );
        assert!(session.already_connected(addr));
    }
}
