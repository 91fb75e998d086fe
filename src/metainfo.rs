//! The runtime view of a torrent: everything the engine needs once the
//! `.torrent` file has been parsed and hashed, independent of the bencode
//! representation it came from.

use crate::torrent::Torrent;
use anyhow::{Context, Result};

/// Sub-pieces ("blocks" in BEP 3 terms) are requested in fixed 16 KiB units,
/// the de facto standard block size every mainline client uses.
pub const BLOCK_LEN: u32 = 16 * 1024;

#[derive(Debug, Clone)]
pub struct MetaInfo {
    pub info_hash: [u8; 20],
    pub name: String,
    pub length: u64,
    pub piece_length: u32,
    pub piece_hashes: Vec<[u8; 20]>,
    pub trackers: Vec<String>,
    pub peer_id: [u8; 20],
    pub listen_port: u16,
}

impl MetaInfo {
    pub fn load(torrent: &Torrent, peer_id: [u8; 20], listen_port: u16) -> Result<MetaInfo> {
        let length = torrent.length().context("reading single-file length")?;
        let piece_length = u32::try_from(torrent.piece_length())
            .context("piece length does not fit in u32")?;
        let piece_hashes = torrent.piece_hashes();
        let expected_pieces = (length as usize + piece_length as usize - 1) / piece_length as usize;
        if piece_hashes.len() != expected_pieces {
            anyhow::bail!(
                "torrent declares {} piece hashes but length/piece_length implies {}",
                piece_hashes.len(),
                expected_pieces
            );
        }

        Ok(MetaInfo {
            info_hash: torrent.info_hash(),
            name: torrent.name().to_string(),
            length,
            piece_length,
            piece_hashes,
            trackers: torrent.tracker_urls().context("reading tracker URLs")?,
            peer_id,
            listen_port,
        })
    }

    pub fn num_pieces(&self) -> usize {
        self.piece_hashes.len()
    }

    /// The exact byte length of `piece`, shorter than `piece_length` only for
    /// the final piece of the file.
    pub fn piece_len(&self, piece: usize) -> u32 {
        if piece + 1 == self.num_pieces() {
            let remainder = self.length % self.piece_length as u64;
            if remainder == 0 {
                self.piece_length
            } else {
                remainder as u32
            }
        } else {
            self.piece_length
        }
    }

    /// Number of 16 KiB sub-pieces in `piece`, including a short final one.
    pub fn num_sub_pieces(&self, piece: usize) -> u32 {
        let len = self.piece_len(piece);
        (len + BLOCK_LEN - 1) / BLOCK_LEN
    }

    pub fn sub_piece_len(&self, piece: usize, sub_piece: u32) -> u32 {
        let piece_len = self.piece_len(piece);
        let offset = sub_piece * BLOCK_LEN;
        piece_len.saturating_sub(offset).min(BLOCK_LEN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::{Info, Torrent};
    use serde_bytes::ByteBuf;

    fn torrent_with(length: u64, piece_length: u32, num_pieces: usize) -> Torrent {
        let info = Info {
            name: "file.bin".to_string(),
            pieces: ByteBuf::from(vec![7u8; 20 * num_pieces]),
            piece_length: piece_length as i64,
            md5sum: None,
            length: Some(length as i64),
            files: None,
            private: None,
            path: None,
            root_hash: None,
        };
        Torrent {
            info,
            announce: Some("http://tracker.example.com/announce".to_string()),
            nodes: None,
            encoding: None,
            httpseeds: None,
            announce_list: None,
            creation_date: None,
            comment: None,
            created_by: None,
        }
    }

    #[test]
    fn final_piece_is_short() {
        let torrent = torrent_with(32768 + 100, 16384, 3);
        let meta = MetaInfo::load(&torrent, [1u8; 20], 6881).unwrap();
        assert_eq!(meta.piece_len(0), 16384);
        assert_eq!(meta.piece_len(1), 16384);
        assert_eq!(meta.piece_len(2), 100);
    }

    #[test]
    fn sub_piece_counts_and_lengths() {
        let torrent = torrent_with(16384 + 20000, 32768, 1);
        let meta = MetaInfo::load(&torrent, [1u8; 20], 6881).unwrap();
        assert_eq!(meta.num_sub_pieces(0), 3);
        assert_eq!(meta.sub_piece_len(0, 0), BLOCK_LEN);
        assert_eq!(meta.sub_piece_len(0, 1), BLOCK_LEN);
        assert_eq!(meta.sub_piece_len(0, 2), 32768 - 2 * BLOCK_LEN);
    }

    #[test]
    fn rejects_mismatched_piece_hash_count() {
        let torrent = torrent_with(100000, 16384, 1);
        assert!(MetaInfo::load(&torrent, [1u8; 20], 6881).is_err());
    }
}
