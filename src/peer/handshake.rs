//! The fixed 68-byte handshake frame that precedes the peer message stream.

use std::io::{Error, ErrorKind};

pub const HANDSHAKE_LEN: usize = 68;
const PSTR: &[u8] = b"BitTorrent protocol";

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Handshake {
        Handshake {
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Handshake, Error> {
        if bytes.len() != HANDSHAKE_LEN {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("handshake should be {} bytes long, got {}", HANDSHAKE_LEN, bytes.len()),
            ));
        }
        if bytes[0] as usize != PSTR.len() {
            return Err(Error::new(ErrorKind::InvalidData, "handshake pstrlen must be 19"));
        }
        if &bytes[1..20] != PSTR {
            return Err(Error::new(
                ErrorKind::InvalidData,
                "handshake pstr must be \"BitTorrent protocol\"",
            ));
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&bytes[20..28]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&bytes[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&bytes[48..68]);

        Ok(Handshake {
            reserved,
            info_hash,
            peer_id,
        })
    }

    pub fn to_bytes(&self) -> [u8; HANDSHAKE_LEN] {
        let mut bytes = [0u8; HANDSHAKE_LEN];
        bytes[0] = PSTR.len() as u8;
        bytes[1..20].copy_from_slice(PSTR);
        bytes[20..28].copy_from_slice(&self.reserved);
        bytes[28..48].copy_from_slice(&self.info_hash);
        bytes[48..68].copy_from_slice(&self.peer_id);
        bytes
    }

    /// A handshake is acceptable if it carries the info-hash we expect and
    /// isn't from ourselves (peer-id equal to our own is a self-connect).
    pub fn accept(&self, expected_info_hash: &[u8; 20], our_peer_id: &[u8; 20]) -> Result<(), Error> {
        if &self.info_hash != expected_info_hash {
            return Err(Error::new(ErrorKind::InvalidData, "info_hash mismatch"));
        }
        if &self.peer_id == our_peer_id {
            return Err(Error::new(ErrorKind::InvalidData, "self-connect"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let hs = Handshake::new([1u8; 20], [2u8; 20]);
        let bytes = hs.to_bytes();
        assert_eq!(bytes.len(), HANDSHAKE_LEN);
        let hs2 = Handshake::from_bytes(&bytes).unwrap();
        assert_eq!(hs, hs2);
    }

    #[test]
    fn rejects_bad_pstr() {
        let mut bytes = Handshake::new([0; 20], [0; 20]).to_bytes();
        bytes[0] = 18;
        assert!(Handshake::from_bytes(&bytes).is_err());
    }

    #[test]
    fn rejects_short_buffer() {
        assert!(Handshake::from_bytes(&[0u8; 10]).is_err());
    }

    #[test]
    fn accept_checks_info_hash_and_self_connect() {
        let expected_hash = [7u8; 20];
        let our_id = [9u8; 20];
        let theirs = Handshake::new(expected_hash, [1u8; 20]);
        assert!(theirs.accept(&expected_hash, &our_id).is_ok());

        let wrong_hash = Handshake::new([8u8; 20], [1u8; 20]);
        assert!(wrong_hash.accept(&expected_hash, &our_id).is_err());

        let self_connect = Handshake::new(expected_hash, our_id);
        assert!(self_connect.accept(&expected_hash, &our_id).is_err());
    }
}
