//! On-disk piece storage: a single pre-allocated file accessed with
//! positional reads/writes so no shared file cursor needs coordinating
//! between the scheduler (writing arriving sub-pieces) and the upload path
//! (reading verified pieces back out for peers).

use crate::bitfield::Bitfield;
use crate::metainfo::MetaInfo;
use anyhow::{Context, Result};
use sha1::{Digest, Sha1};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

pub struct PieceStore {
    file: File,
    meta: MetaInfo,
    verified: Bitfield,
    downloaded: u64,
}

impl PieceStore {
    /// Opens (creating and pre-allocating if necessary) the data file and
    /// runs a resume scan: every piece whose on-disk bytes already hash-match
    /// is marked verified up front, matching a restart picking up where a
    /// prior run left off.
    pub fn open(path: &Path, meta: MetaInfo) -> Result<PieceStore> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .with_context(|| format!("opening data file {}", path.display()))?;
        file.set_len(meta.length)
            .context("pre-allocating data file")?;

        let verified = Bitfield::new(meta.num_pieces());
        let mut store = PieceStore { file, meta, verified, downloaded: 0 };
        store.resume_scan()?;
        Ok(store)
    }

    fn resume_scan(&mut self) -> Result<()> {
        for piece in 0..self.meta.num_pieces() {
            let len = self.meta.piece_len(piece) as usize;
            let mut buf = vec![0u8; len];
            self.file
                .read_exact_at(&mut buf, self.piece_offset(piece))
                .context("resume scan read")?;
            if Self::hash_matches(&buf, &self.meta.piece_hashes[piece]) {
                self.verified.set(piece);
                self.downloaded += len as u64;
            }
        }
        Ok(())
    }

    fn piece_offset(&self, piece: usize) -> u64 {
        piece as u64 * self.meta.piece_length as u64
    }

    fn hash_matches(data: &[u8], expected: &[u8; 20]) -> bool {
        let mut hasher = Sha1::new();
        hasher.update(data);
        let digest: [u8; 20] = hasher.finalize().into();
        &digest == expected
    }

    pub fn verified_bitfield(&self) -> &Bitfield {
        &self.verified
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded
    }

    pub fn left(&self) -> u64 {
        self.meta.length - self.downloaded
    }

    pub fn is_complete(&self) -> bool {
        self.verified.is_complete()
    }

    /// Reads `length` bytes of an already-verified piece starting at `begin`,
    /// for serving an upload request.
    pub fn read_sub_piece(&self, piece: usize, begin: u32, length: u32) -> Result<Vec<u8>> {
        anyhow::ensure!(self.verified.is_set(piece), "piece {piece} not yet verified");
        let mut buf = vec![0u8; length as usize];
        let offset = self.piece_offset(piece) + begin as u64;
        self.file
            .read_exact_at(&mut buf, offset)
            .with_context(|| format!("reading piece {piece} begin {begin}"))?;
        Ok(buf)
    }

    /// Writes an arrived sub-piece directly to its final position in the
    /// file. Durable on disk before the caller is told to hash-verify the
    /// whole piece, so a verified piece is never lost to a crash between
    /// the write and the verify.
    pub fn write_sub_piece(&mut self, piece: usize, begin: u32, block: &[u8]) -> Result<()> {
        let offset = self.piece_offset(piece) + begin as u64;
        self.file
            .write_all_at(block, offset)
            .with_context(|| format!("writing piece {piece} begin {begin}"))
    }

    /// Re-reads the whole piece from disk and hashes it against the expected
    /// digest. On success marks the piece verified and returns `true`; on
    /// mismatch the piece stays unverified (caller resets its sub-piece
    /// state and re-downloads) and returns `false`.
    pub fn verify_piece(&mut self, piece: usize) -> Result<bool> {
        let len = self.meta.piece_len(piece) as usize;
        let mut buf = vec![0u8; len];
        self.file
            .read_exact_at(&mut buf, self.piece_offset(piece))
            .with_context(|| format!("reading piece {piece} for verification"))?;

        if Self::hash_matches(&buf, &self.meta.piece_hashes[piece]) {
            if !self.verified.is_set(piece) {
                self.verified.set(piece);
                self.downloaded += len as u64;
            }
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::{Info, Torrent};
    use serde_bytes::ByteBuf;
    use tempfile::NamedTempFile;

    fn meta_for(data: &[u8], piece_length: u32) -> MetaInfo {
        let mut pieces = Vec::new();
        for chunk in data.chunks(piece_length as usize) {
            let mut hasher = Sha1::new();
            hasher.update(chunk);
            pieces.extend_from_slice(&hasher.finalize());
        }
        let info = Info {
            name: "f".to_string(),
            pieces: ByteBuf::from(pieces),
            piece_length: piece_length as i64,
            md5sum: None,
            length: Some(data.len() as i64),
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
        MetaInfo::load(&torrent, [1u8; 20], 6881).unwrap()
    }

    #[test]
    fn fresh_file_has_nothing_verified() {
        let data = vec![0xABu8; 32768];
        let meta = meta_for(&data, 16384);
        let tmp = NamedTempFile::new().unwrap();
        let store = PieceStore::open(tmp.path(), meta).unwrap();
        assert_eq!(store.downloaded(), 0);
        assert!(!store.is_complete());
    }

    #[test]
    fn write_then_verify_marks_piece_done() {
        let data = vec![0x42u8; 16384];
        let meta = meta_for(&data, 16384);
        let tmp = NamedTempFile::new().unwrap();
        let mut store = PieceStore::open(tmp.path(), meta).unwrap();

        store.write_sub_piece(0, 0, &data).unwrap();
        assert!(store.verify_piece(0).unwrap());
        assert!(store.verified_bitfield().is_set(0));
        assert_eq!(store.downloaded(), 16384);
        assert!(store.is_complete());
    }

    #[test]
    fn mismatched_hash_is_not_marked_verified() {
        let data = vec![0x42u8; 16384];
        let meta = meta_for(&data, 16384);
        let tmp = NamedTempFile::new().unwrap();
        let mut store = PieceStore::open(tmp.path(), meta).unwrap();

        store.write_sub_piece(0, 0, &vec![0xFFu8; 16384]).unwrap();
        assert!(!store.verify_piece(0).unwrap());
        assert!(!store.verified_bitfield().is_set(0));
        assert_eq!(store.downloaded(), 0);
    }

    #[test]
    fn resume_scan_finds_already_correct_data_on_reopen() {
        let data = vec![0x77u8; 32768];
        let meta = meta_for(&data, 16384);
        let tmp = NamedTempFile::new().unwrap();

        {
            let mut store = PieceStore::open(tmp.path(), meta.clone()).unwrap();
            store.write_sub_piece(0, 0, &data[0..16384]).unwrap();
            assert!(store.verify_piece(0).unwrap());
        }

        let store2 = PieceStore::open(tmp.path(), meta).unwrap();
        assert!(store2.verified_bitfield().is_set(0));
        assert!(!store2.verified_bitfield().is_set(1));
        assert_eq!(store2.downloaded(), 16384);
    }

    #[test]
    fn read_sub_piece_rejects_unverified_piece() {
        let data = vec![0x11u8; 16384];
        let meta = meta_for(&data, 16384);
        let tmp = NamedTempFile::new().unwrap();
        let store = PieceStore::open(tmp.path(), meta).unwrap();
        assert!(store.read_sub_piece(0, 0, 100).is_err());
    }
}
