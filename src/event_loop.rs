//! The single-threaded readiness-driven main loop: one `mio::Poll` shared by
//! the listener, every peer connection, every tracker connection, and the
//! DNS-worker handoff channel. Each iteration dispatches readiness events by
//! registry lookup, then runs exactly one scheduler pass.

use crate::peer::handshake::Handshake;
use crate::peer::message::Message;
use crate::scheduler::SubPieceRequest;
use crate::session::Session;
use crate::tracker::http::{resolve_and_connect, AnnounceEvent, ResolvedTracker, TrackerClient};
use crate::waitpeer::{Direction, WaitPeer};
use anyhow::{Context, Result};
use log::{debug, info, trace, warn};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use std::net::SocketAddr;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::time::{Duration, Instant};
use url::Url;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);
const POLL_TIMEOUT: Duration = Duration::from_millis(500);
const MAX_OUTSTANDING_REQUESTS: usize = 8;

/// Reserved tokens below `FIRST_DYNAMIC_TOKEN` never collide with a
/// peer/tracker/waitpeer token handed out by `next_token`.
const LISTENER_TOKEN: Token = Token(0);
const FIRST_DYNAMIC_TOKEN: usize = 2;

/// Per-tracker-URL bookkeeping that lives for the whole run, independent of
/// any single in-flight `TrackerClient` connection: each announce URL gets
/// its own reannounce timer and its own `started`/`completed` lifecycle.
struct TrackerState {
    url: Url,
    interval: Duration,
    last_announce: Instant,
    /// True once a response has been received from this tracker at least
    /// once this run — gates whether it is owed a `completed` event.
    contacted: bool,
}

impl TrackerState {
    fn new(url: Url) -> TrackerState {
        TrackerState {
            url,
            interval: Duration::from_secs(1800),
            last_announce: Instant::now(),
            contacted: false,
        }
    }
}

pub struct EventLoop {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    next_token: usize,
    last_keepalive: Instant,
    trackers: Vec<TrackerState>,
    /// Whether the download was already complete the last time we checked,
    /// so the completed→verified transition is only acted on once.
    was_complete: bool,
    dns_tx: Sender<ResolvedTracker>,
    dns_rx: Receiver<ResolvedTracker>,
    shutdown_tx: Sender<()>,
    shutdown_rx: Receiver<()>,
}

impl EventLoop {
    pub fn bind(listen_addr: SocketAddr) -> Result<EventLoop> {
        let poll = Poll::new().context("creating mio Poll")?;
        let mut listener = TcpListener::bind(listen_addr).context("binding listener")?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)
            .context("registering listener")?;

        let (dns_tx, dns_rx) = channel();
        let (shutdown_tx, shutdown_rx) = channel();

        Ok(EventLoop {
            poll,
            events: Events::with_capacity(1024),
            listener,
            next_token: FIRST_DYNAMIC_TOKEN,
            last_keepalive: Instant::now(),
            trackers: Vec::new(),
            was_complete: false,
            dns_tx,
            dns_rx,
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// A `Sender` a SIGINT handler can use to request a graceful shutdown
    /// without doing any I/O itself — it just wakes the next poll iteration.
    pub fn shutdown_sender(&self) -> Sender<()> {
        self.shutdown_tx.clone()
    }

    fn alloc_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    /// Starts a tracker announce on a worker thread: DNS resolution and the
    /// blocking connect happen there, and the connected socket comes back
    /// over `dns_tx` for the main loop to register — the main loop is the
    /// only thing that ever touches `Poll::registry()`.
    pub fn start_announce(&mut self, session: &Session, url: &Url, event: AnnounceEvent) {
        let token = self.alloc_token();
        let url = url.to_string();
        let info_hash = session.meta.info_hash;
        let peer_id = session.meta.peer_id;
        let port = session.meta.listen_port;
        let uploaded = session.uploaded;
        let downloaded = session.downloaded();
        let left = session.left();
        let tx = self.dns_tx.clone();

        std::thread::spawn(move || {
            let result = resolve_and_connect(
                token, &url, &info_hash, &peer_id, port, uploaded, downloaded, left, event,
            );
            match result {
                Ok(resolved) => {
                    let _ = tx.send(resolved);
                }
                Err(e) => warn!("tracker announce to {url} failed to connect: {e:#}"),
            }
        });
    }

    /// Runs forever until a SIGINT-driven shutdown completes. Performs
    /// exactly one scheduler pass (timeout sweep + new sub-piece requests)
    /// per iteration, matching the original's per-iteration dispatch loop.
    pub fn run(&mut self, session: &mut Session) -> Result<()> {
        self.trackers = session
            .meta
            .trackers
            .iter()
            .filter_map(|raw| match Url::parse(raw) {
                Ok(url) => Some(TrackerState::new(url)),
                Err(e) => {
                    warn!("skipping unparsable tracker URL {raw}: {e:#}");
                    None
                }
            })
            .collect();
        self.was_complete = session.is_complete();

        // "started" only on first contact with left != 0; an already-complete
        // resumed torrent announces with no special event.
        let initial_event = if session.left() != 0 { AnnounceEvent::Started } else { AnnounceEvent::None };
        for i in 0..self.trackers.len() {
            let url = self.trackers[i].url.clone();
            self.trackers[i].last_announce = Instant::now();
            self.start_announce(session, &url, initial_event);
        }

        loop {
            if self.maybe_begin_shutdown(session) {
                self.run_shutdown_drain(session)?;
                return Ok(());
            }

            self.poll.poll(&mut self.events, Some(POLL_TIMEOUT)).context("poll")?;

            let ready: Vec<(Token, bool, bool)> =
                self.events.iter().map(|e| (e.token(), e.is_readable(), e.is_writable())).collect();
            for (token, readable, writable) in ready {
                if let Err(e) = self.dispatch(session, token, readable, writable) {
                    warn!("error handling token {token:?}: {e:#}");
                }
            }

            self.drain_dns_channel(session)?;
            self.run_scheduler_pass(session)?;
            self.maybe_send_keepalives(session)?;
            self.maybe_reannounce(session);
            self.maybe_announce_completed(session);

            if session.is_complete() {
                debug!(
                    "download complete: {} peers connected, {} verified pieces",
                    session.peers.len(),
                    session.meta.num_pieces()
                );
            }
        }
    }

    fn maybe_begin_shutdown(&mut self, session: &mut Session) -> bool {
        if session.shutting_down {
            return true;
        }
        if self.shutdown_rx.try_recv().is_ok() {
            info!("SIGINT received, announcing stopped to trackers before exit");
            session.shutting_down = true;
            let urls: Vec<Url> = self.trackers.iter().map(|t| t.url.clone()).collect();
            for url in &urls {
                self.start_announce(session, url, AnnounceEvent::Stopped);
            }
            return true;
        }
        false
    }

    /// Gives already-in-flight `stopped` announces a bounded window to land
    /// before exiting, per the original's `exit_handler` behavior of trying
    /// every reachable tracker rather than blocking indefinitely.
    fn run_shutdown_drain(&mut self, session: &mut Session) -> Result<()> {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline && !session.trackers.is_empty() {
            self.poll.poll(&mut self.events, Some(Duration::from_millis(200)))?;
            let ready: Vec<(Token, bool, bool)> =
                self.events.iter().map(|e| (e.token(), e.is_readable(), e.is_writable())).collect();
            for (token, readable, writable) in ready {
                let _ = self.dispatch(session, token, readable, writable);
            }
            self.drain_dns_channel(session)?;
        }
        Ok(())
    }

    fn drain_dns_channel(&mut self, session: &mut Session) -> Result<()> {
        while let Ok(resolved) = self.dns_rx.try_recv() {
            let token = resolved.token;
            let mut client = TrackerClient::from_resolved(resolved)?;
            self.poll
                .registry()
                .register(client.stream_mut(), token, Interest::WRITABLE)
                .context("registering tracker socket")?;
            session.trackers.insert(token, client);
        }
        Ok(())
    }

    fn dispatch(&mut self, session: &mut Session, token: Token, readable: bool, writable: bool) -> Result<()> {
        if token == LISTENER_TOKEN {
            return self.accept_inbound(session);
        }
        if session.trackers.contains_key(&token) {
            return self.handle_tracker_event(session, token);
        }
        if session.waitpeers.contains_key(&token) {
            return self.handle_waitpeer_event(session, token, readable, writable);
        }
        if session.peers.contains_key(&token) {
            return self.handle_peer_event(session, token);
        }
        trace!("event for unknown token {token:?} (peer likely already closed)");
        Ok(())
    }

    fn accept_inbound(&mut self, session: &mut Session) -> Result<()> {
        loop {
            match self.listener.accept() {
                Ok((mut stream, addr)) => {
                    if session.already_connected(addr) {
                        debug!("rejecting duplicate inbound connection from {addr}");
                        continue;
                    }
                    let token = self.alloc_token();
                    self.poll
                        .registry()
                        .register(&mut stream, token, Interest::READABLE)
                        .context("registering inbound peer")?;
                    session.waitpeers.insert(token, WaitPeer::new(addr, Direction::Inbound));
                    session.waitpeer_streams.insert(token, stream);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn handle_waitpeer_event(&mut self, session: &mut Session, token: Token, readable: bool, writable: bool) -> Result<()> {
        let (direction, sent_handshake) = {
            let wp = session.waitpeers.get(&token).unwrap();
            (wp.direction, wp.sent_handshake)
        };
        if writable && direction == Direction::Outbound && !sent_handshake {
            self.write_outbound_handshake(session, token)?;
        }
        if !readable {
            return Ok(());
        }
        if !session.waitpeers.contains_key(&token) {
            return Ok(());
        }

        let wp = session.waitpeers.get_mut(&token).unwrap();
        let mut buf = [0u8; 256];
        use std::io::Read;
        let addr = wp.addr;

        // Reading happens directly against a scratch buffer; WaitPeer holds
        // only the accumulated handshake bytes, matching peer_get_packet's
        // two-phase resumable read rather than a blocking read_exact.
        let n = {
            let stream = self.waitpeer_stream(session, token)?;
            match stream.read(&mut buf) {
                Ok(0) => {
                    session.waitpeers.remove(&token);
                    return Ok(());
                }
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        };

        let wp = session.waitpeers.get_mut(&token).unwrap();
        if let Some((handshake_bytes, leftover)) = wp.feed(&buf[..n]) {
            let handshake = Handshake::from_bytes(&handshake_bytes)
                .context("parsing peer handshake")?;
            if let Err(e) = handshake.accept(&session.meta.info_hash, &session.meta.peer_id) {
                warn!("rejecting handshake from {addr}: {e}");
                session.waitpeers.remove(&token);
                return Ok(());
            }

            let wp = session.waitpeers.remove(&token).unwrap();
            self.finish_handshake(session, token, wp, handshake.peer_id, &leftover)?;
        }
        Ok(())
    }

    /// Writes out our own handshake on a dialed-out connection once it
    /// becomes writable. `WaitPeer::out_buf` holds whatever remains after a
    /// partial write, so a half-written handshake is retried on the next
    /// writable readiness instead of being dropped.
    fn write_outbound_handshake(&mut self, session: &mut Session, token: Token) -> Result<()> {
        use std::io::Write;
        let pending = {
            let wp = session.waitpeers.get_mut(&token).unwrap();
            std::mem::take(&mut wp.out_buf)
        };
        if pending.is_empty() {
            return Ok(());
        }

        let write_result = {
            let stream = self.waitpeer_stream(session, token)?;
            stream.write(&pending)
        };

        match write_result {
            Ok(n) if n == pending.len() => {
                {
                    let wp = session.waitpeers.get_mut(&token).unwrap();
                    wp.sent_handshake = true;
                }
                let stream = self.waitpeer_stream(session, token)?;
                self.poll
                    .registry()
                    .reregister(stream, token, Interest::READABLE)
                    .context("reregistering outbound peer after handshake sent")?;
            }
            Ok(n) => {
                let wp = session.waitpeers.get_mut(&token).unwrap();
                wp.out_buf = pending[n..].to_vec();
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                let wp = session.waitpeers.get_mut(&token).unwrap();
                wp.out_buf = pending;
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    fn waitpeer_stream<'a>(&self, session: &'a mut Session, token: Token) -> Result<&'a mut TcpStream> {
        // WaitPeer itself doesn't own the registered stream; the event loop
        // keeps it in a side map keyed by token to avoid borrowing Session
        // mutably twice. In this engine WaitPeer sockets live in
        // `session.waitpeer_streams`.
        session
            .waitpeer_streams
            .get_mut(&token)
            .ok_or_else(|| anyhow::anyhow!("no stream registered for waitpeer token {token:?}"))
    }

    fn finish_handshake(
        &mut self,
        session: &mut Session,
        token: Token,
        _wp: WaitPeer,
        peer_id: [u8; 20],
        leftover: &[u8],
    ) -> Result<()> {
        let mut stream = session
            .waitpeer_streams
            .remove(&token)
            .ok_or_else(|| anyhow::anyhow!("no stream for handshaked waitpeer"))?;
        let addr = stream.peer_addr().unwrap_or_else(|_| "0.0.0.0:0".parse().unwrap());

        self.poll
            .registry()
            .reregister(&mut stream, token, Interest::READABLE | Interest::WRITABLE)
            .context("reregistering handshaked peer")?;

        let mut session_peer = crate::peer::connection::PeerSession::new(
            token,
            stream,
            addr,
            peer_id,
            session.meta.num_pieces(),
        );

        session_peer.queue(&Message::Bitfield(session.local_bitfield.as_bytes().to_vec()));
        session_peer.queue(&Message::Unchoke);
        session_peer.queue(&Message::Interested);
        session_peer.am_interested = true;
        session_peer.am_choking = false;

        if !leftover.is_empty() {
            let _ = session_peer.feed(leftover)?;
        }

        session.peers.insert(token, session_peer);
        Ok(())
    }

    fn handle_peer_event(&mut self, session: &mut Session, token: Token) -> Result<()> {
        use std::io::Read;
        let mut buf = [0u8; 16 * 1024 + 64];

        let read_result = {
            let peer = session.peers.get_mut(&token).unwrap();
            peer.stream.read(&mut buf)
        };

        match read_result {
            Ok(0) => {
                self.drop_peer(session, token);
                return Ok(());
            }
            Ok(n) => {
                let feed_result = {
                    let peer = session.peers.get_mut(&token).unwrap();
                    peer.feed(&buf[..n])
                };
                let messages = match feed_result {
                    Ok(messages) => messages,
                    Err(e) => {
                        warn!("dropping peer {token:?} on malformed frame: {e:#}");
                        self.drop_peer(session, token);
                        return Ok(());
                    }
                };
                for message in messages {
                    self.handle_peer_message(session, token, message)?;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => {
                self.drop_peer(session, token);
                return Err(e.into());
            }
        }

        let peer = session.peers.get_mut(&token).unwrap();
        if peer.has_pending_write() {
            if let Err(e) = peer.flush() {
                warn!("dropping peer {token:?} on write error: {e:#}");
                self.drop_peer(session, token);
            }
        }
        Ok(())
    }

    fn handle_peer_message(&mut self, session: &mut Session, token: Token, message: Message) -> Result<()> {
        match message {
            Message::Have(index) => {
                session.scheduler.record_owner(index as usize);
            }
            Message::Bitfield(_) => {
                let pieces: Vec<usize> = session.peers[&token].bitfield.iterate_set().collect();
                for piece in pieces {
                    session.scheduler.record_owner(piece);
                }
            }
            Message::Request { index, begin, length } => {
                if length > MAX_OUTSTANDING_REQUESTS as u32 * crate::metainfo::BLOCK_LEN {
                    warn!("peer {token:?} requested an oversized block, ignoring");
                    return Ok(());
                }
                match session.store.read_sub_piece(index as usize, begin, length) {
                    Ok(block) => {
                        session.uploaded += block.len() as u64;
                        let peer = session.peers.get_mut(&token).unwrap();
                        peer.uploaded += block.len() as u64;
                        peer.queue(&Message::Piece { index, begin, block });
                    }
                    Err(e) => debug!("ignoring request for unverified piece: {e}"),
                }
            }
            Message::Piece { index, begin, block } => {
                self.handle_piece_arrival(session, token, index as usize, begin, block)?;
            }
            Message::Cancel { .. } => {}
            Message::KeepAlive | Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => {}
        }
        Ok(())
    }

    fn handle_piece_arrival(
        &mut self,
        session: &mut Session,
        token: Token,
        piece: usize,
        begin: u32,
        block: Vec<u8>,
    ) -> Result<()> {
        let sub_piece = begin / crate::metainfo::BLOCK_LEN;
        session.store.write_sub_piece(piece, begin, &block)?;
        session.scheduler.mark_sub_piece_done(piece, sub_piece);
        {
            let peer = session.peers.get_mut(&token).unwrap();
            peer.downloaded += block.len() as u64;
        }

        let fully_arrived = session.scheduler.piece(piece).sub_state.iter().all(|s| *s == crate::scheduler::SubPieceState::Done);
        if !fully_arrived {
            return Ok(());
        }

        if session.store.verify_piece(piece)? {
            session.on_piece_verified(piece);
            info!("piece {piece} verified ({}/{})", piece + 1, session.meta.num_pieces());
            self.broadcast_have(session, piece)?;
        } else {
            warn!("piece {piece} failed hash check, re-downloading");
            session.on_piece_mismatch(piece);
        }
        Ok(())
    }

    fn broadcast_have(&mut self, session: &mut Session, piece: usize) -> Result<()> {
        for peer in session.peers.values_mut() {
            if !peer.bitfield.is_set(piece) {
                peer.queue(&Message::Have(piece as u32));
            }
        }
        Ok(())
    }

    fn drop_peer(&mut self, session: &mut Session, token: Token) {
        session.scheduler.release_peer(token);
        if let Some(peer) = session.peers.remove(&token) {
            for piece in peer.bitfield.iterate_set() {
                session.scheduler.forget_owner(piece);
            }
        }
    }

    fn handle_tracker_event(&mut self, session: &mut Session, token: Token) -> Result<()> {
        let result = {
            let tracker = session.trackers.get_mut(&token).unwrap();
            tracker.on_writable().and_then(|sent| {
                if sent {
                    self.poll
                        .registry()
                        .reregister(tracker.stream_mut(), token, Interest::READABLE)?;
                }
                tracker.on_readable()
            })
        };

        match result {
            Ok(Some(response)) => {
                debug!("tracker announce interval {}, {} peers returned", response.interval, response.peers.len());
                let url = session.trackers[&token].url.clone();
                if let Some(state) = self.trackers.iter_mut().find(|t| t.url == url) {
                    state.interval = Duration::from_secs(response.interval.max(60));
                    state.contacted = true;
                }
                for addr in response.peers {
                    if !session.already_connected(addr) {
                        self.dial_peer(session, addr)?;
                    }
                }
                session.trackers.remove(&token);
            }
            Ok(None) => {}
            Err(e) => {
                warn!("tracker error: {e:#}");
                session.trackers.remove(&token);
            }
        }
        Ok(())
    }

    fn dial_peer(&mut self, session: &mut Session, addr: SocketAddr) -> Result<()> {
        let mut stream = TcpStream::connect(addr).context("connecting to peer")?;
        let token = self.alloc_token();
        self.poll
            .registry()
            .register(&mut stream, token, Interest::WRITABLE)
            .context("registering outbound peer")?;

        let handshake = Handshake::new(session.meta.info_hash, session.meta.peer_id);
        let mut wp = WaitPeer::new(addr, Direction::Outbound);
        wp.queue_outbound_handshake(handshake.to_bytes());
        session.waitpeers.insert(token, wp);
        session.waitpeer_streams.insert(token, stream);
        Ok(())
    }

    fn run_scheduler_pass(&mut self, session: &mut Session) -> Result<()> {
        let expired = session.scheduler.sweep_timeouts();
        if expired > 0 {
            debug!("{expired} sub-piece request(s) timed out and were released");
        }

        let tokens: Vec<Token> = session.peers.keys().copied().collect();
        for token in tokens {
            let (choking, has_piece_bits): (bool, Vec<bool>) = {
                let peer = &session.peers[&token];
                let bits = (0..session.meta.num_pieces()).map(|i| peer.bitfield.is_set(i)).collect();
                (peer.peer_choking, bits)
            };
            if choking {
                continue;
            }
            let piece_length = session.meta.piece_length;
            let total_length = session.meta.length;
            let num_pieces = session.meta.num_pieces();
            let picks: Vec<SubPieceRequest> = session.scheduler.pick(
                token,
                MAX_OUTSTANDING_REQUESTS,
                |i| has_piece_bits[i],
                |piece, sub| sub_piece_len_raw(piece, sub, piece_length, total_length, num_pieces),
            );
            if picks.is_empty() {
                continue;
            }
            let peer = session.peers.get_mut(&token).unwrap();
            for pick in picks {
                peer.queue(&Message::Request { index: pick.piece as u32, begin: pick.begin, length: pick.length });
            }
            if peer.has_pending_write() {
                peer.flush()?;
            }
        }
        Ok(())
    }

    fn maybe_send_keepalives(&mut self, session: &mut Session) -> Result<()> {
        if self.last_keepalive.elapsed() < KEEPALIVE_INTERVAL {
            return Ok(());
        }
        self.last_keepalive = Instant::now();
        for peer in session.peers.values_mut() {
            peer.queue(&Message::KeepAlive);
            peer.flush()?;
        }
        Ok(())
    }

    fn maybe_reannounce(&mut self, session: &mut Session) {
        let now = Instant::now();
        for i in 0..self.trackers.len() {
            if now.duration_since(self.trackers[i].last_announce) < self.trackers[i].interval {
                continue;
            }
            self.trackers[i].last_announce = now;
            let url = self.trackers[i].url.clone();
            self.start_announce(session, &url, AnnounceEvent::None);
        }
    }

    /// Sends `completed` to every tracker we've already contacted, exactly
    /// once, the first time `left` reaches 0 during this run.
    fn maybe_announce_completed(&mut self, session: &mut Session) {
        if self.was_complete || !session.is_complete() {
            return;
        }
        self.was_complete = true;
        info!("download complete, announcing completed to previously-contacted trackers");

        let urls: Vec<Url> = self.trackers.iter().filter(|t| t.contacted).map(|t| t.url.clone()).collect();
        for url in &urls {
            self.start_announce(session, url, AnnounceEvent::Completed);
        }
        let now = Instant::now();
        for state in self.trackers.iter_mut().filter(|t| t.contacted) {
            state.last_announce = now;
        }
    }
}

/// Mirrors `MetaInfo::sub_piece_len` without borrowing the whole struct, so
/// the per-peer scheduler pass doesn't need to clone `MetaInfo` (and its
/// `Vec<[u8; 20]>` piece hashes) on every iteration.
fn sub_piece_len_raw(piece: usize, sub_piece: u32, piece_length: u32, total_length: u64, num_pieces: usize) -> u32 {
    let piece_len = if piece + 1 == num_pieces {
        let remainder = total_length % piece_length as u64;
        if remainder == 0 { piece_length } else { remainder as u32 }
    } else {
        piece_length
    };
    let offset = sub_piece * crate::metainfo::BLOCK_LEN;
    piece_len.saturating_sub(offset).min(crate::metainfo::BLOCK_LEN)
}
