//! A handshaked peer connection, multiplexed on the shared event-loop
//! `Poll` rather than owning one of its own: `feed`/`send` are pure state
//! transitions driven by the `EventLoop`, matching the resumable-parser
//! redesign the rest of the engine follows.

use crate::bitfield::Bitfield;
use crate::peer::message::{FrameReader, Message};
use anyhow::Result;
use bytes::BytesMut;
use mio::net::TcpStream;
use mio::Token;
use std::net::SocketAddr;

pub struct PeerSession {
    pub token: Token,
    pub stream: TcpStream,
    pub addr: SocketAddr,
    pub peer_id: [u8; 20],

    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,

    pub bitfield: Bitfield,

    pub downloaded: u64,
    pub uploaded: u64,

    frames: FrameReader,
    /// Bytes queued to write but not yet accepted by the socket; non-empty
    /// means the token needs `Interest::WRITABLE` registered.
    out_buf: BytesMut,
}

impl PeerSession {
    pub fn new(token: Token, stream: TcpStream, addr: SocketAddr, peer_id: [u8; 20], num_pieces: usize) -> PeerSession {
        PeerSession {
            token,
            stream,
            addr,
            peer_id,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            bitfield: Bitfield::new(num_pieces),
            downloaded: 0,
            uploaded: 0,
            frames: FrameReader::new(),
            out_buf: BytesMut::new(),
        }
    }

    /// Feeds freshly-read bytes (possibly leftover bytes pipelined after the
    /// handshake) into the frame reader, applying every resulting message's
    /// state effect and returning the ones the caller (the scheduler) must
    /// act on: incoming `Have`/`Bitfield` are applied here directly, so
    /// only `Request`/`Piece`/`Cancel`/choke-state messages are returned.
    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<Message>> {
        let messages = self.frames.feed(data)?;
        let mut actionable = Vec::new();
        for message in messages {
            match message {
                Message::KeepAlive => {}
                Message::Choke => self.peer_choking = true,
                Message::Unchoke => self.peer_choking = false,
                Message::Interested => self.peer_interested = true,
                Message::NotInterested => self.peer_interested = false,
                Message::Have(index) => {
                    self.bitfield.set(index as usize);
                    actionable.push(Message::Have(index));
                }
                Message::Bitfield(ref bits) => {
                    self.bitfield = Bitfield::from_bytes(bits.clone(), self.bitfield.bits())?;
                    actionable.push(message);
                }
                Message::Request { .. } | Message::Piece { .. } | Message::Cancel { .. } => {
                    actionable.push(message);
                }
            }
        }
        Ok(actionable)
    }

    /// Queues a message for writing. The event loop flushes `out_buf` when
    /// the socket becomes writable.
    pub fn queue(&mut self, message: &Message) {
        self.out_buf.extend_from_slice(&message.encode());
    }

    pub fn has_pending_write(&self) -> bool {
        !self.out_buf.is_empty()
    }

    /// Writes as much of the queued buffer as the socket accepts right now.
    /// Returns `true` once the buffer has fully drained.
    pub fn flush(&mut self) -> Result<bool> {
        use std::io::Write;
        while !self.out_buf.is_empty() {
            match self.stream.write(&self.out_buf) {
                Ok(0) => anyhow::bail!("peer {} closed the connection mid-write", self.addr),
                Ok(n) => {
                    let _ = self.out_buf.split_to(n);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::net::TcpListener;

    fn loopback_pair() -> (TcpStream, std::net::TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        let (server, _) = loop {
            if let Ok(pair) = listener.accept() {
                break pair;
            }
        };
        (server, client)
    }

    #[test]
    fn feed_applies_choke_state_without_returning_it() {
        let (server, _client) = loopback_pair();
        let mut session = PeerSession::new(Token(1), server, "127.0.0.1:1".parse().unwrap(), [0; 20], 4);
        let bytes = Message::Unchoke.encode();
        let actionable = session.feed(&bytes).unwrap();
        assert!(actionable.is_empty());
        assert!(!session.peer_choking);
    }

    #[test]
    fn feed_applies_have_and_returns_it_for_the_scheduler() {
        let (server, _client) = loopback_pair();
        let mut session = PeerSession::new(Token(1), server, "127.0.0.1:1".parse().unwrap(), [0; 20], 4);
        let bytes = Message::Have(2).encode();
        let actionable = session.feed(&bytes).unwrap();
        assert_eq!(actionable, vec![Message::Have(2)]);
        assert!(session.bitfield.is_set(2));
    }

    #[test]
    fn queue_then_flush_writes_bytes_to_the_socket() {
        let (server, mut client) = loopback_pair();
        let mut session = PeerSession::new(Token(1), server, "127.0.0.1:1".parse().unwrap(), [0; 20], 4);
        session.queue(&Message::Interested);
        assert!(session.has_pending_write());
        let done = session.flush().unwrap();
        assert!(done);
        assert!(!session.has_pending_write());

        use std::io::Read;
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf[..], &Message::Interested.encode()[..]);
    }
}
