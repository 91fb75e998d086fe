//! A peer whose TCP connection is up but whose handshake hasn't completed
//! yet — either we dialed out and are waiting for their handshake back, or
//! they connected to our listener and haven't sent one at all.

use std::net::{IpAddr, SocketAddr};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

#[derive(Debug)]
pub struct WaitPeer {
    pub addr: SocketAddr,
    pub direction: Direction,
    /// Bytes of the 68-byte handshake received so far.
    pub handshake_buf: Vec<u8>,
    /// For an outbound connection, our own handshake bytes still waiting to
    /// be written out. Kept separate from `handshake_buf`, which only ever
    /// accumulates bytes read from the peer.
    pub out_buf: Vec<u8>,
    /// For an outbound connection, whether our handshake has already been
    /// written to the socket.
    pub sent_handshake: bool,
}

impl WaitPeer {
    pub fn new(addr: SocketAddr, direction: Direction) -> WaitPeer {
        WaitPeer {
            addr,
            direction,
            handshake_buf: Vec::with_capacity(68),
            out_buf: Vec::new(),
            sent_handshake: false,
        }
    }

    /// Queues our own handshake to be sent once the outbound socket becomes
    /// writable.
    pub fn queue_outbound_handshake(&mut self, bytes: [u8; crate::peer::handshake::HANDSHAKE_LEN]) {
        self.out_buf = bytes.to_vec();
    }

    pub fn ip(&self) -> IpAddr {
        self.addr.ip()
    }

    /// Appends freshly-read bytes to the partial handshake buffer. Returns
    /// `Some((handshake, leftover))` once a full 68-byte handshake has
    /// accumulated; `leftover` holds any bytes read past the handshake (a
    /// peer that pipelines its BITFIELD right after the handshake).
    pub fn feed(&mut self, data: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
        self.handshake_buf.extend_from_slice(data);
        let want = crate::peer::handshake::HANDSHAKE_LEN;
        if self.handshake_buf.len() >= want {
            let leftover = self.handshake_buf.split_off(want);
            let handshake = std::mem::take(&mut self.handshake_buf);
            Some((handshake, leftover))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_returns_none_until_full_handshake_arrives() {
        let mut wp = WaitPeer::new("127.0.0.1:6881".parse().unwrap(), Direction::Inbound);
        assert!(wp.feed(&[0u8; 40]).is_none());
        let (handshake, leftover) = wp.feed(&[0u8; 28]).unwrap();
        assert_eq!(handshake.len(), 68);
        assert!(leftover.is_empty());
    }

    #[test]
    fn feed_splits_off_bytes_pipelined_after_the_handshake() {
        let mut wp = WaitPeer::new("127.0.0.1:6881".parse().unwrap(), Direction::Inbound);
        let mut data = vec![0u8; 68];
        data.extend_from_slice(b"extra");
        let (handshake, leftover) = wp.feed(&data).unwrap();
        assert_eq!(handshake.len(), 68);
        assert_eq!(leftover, b"extra");
    }

    #[test]
    fn ip_matches_constructed_addr() {
        let addr: SocketAddr = "10.0.0.5:6881".parse().unwrap();
        let wp = WaitPeer::new(addr, Direction::Outbound);
        assert_eq!(wp.ip(), addr.ip());
    }
}
