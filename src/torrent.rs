//! Bencode torrent-file structures. Only the single-file form is served;
//! a multi-file `info` dict is accepted for parsing (so `info_hash()` still
//! matches what a real tracker expects) but rejected by `length()`.

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};
use serde_bencode::{from_bytes, to_bytes};
use serde_bytes::ByteBuf;
use sha1::{Digest, Sha1};
use std::io::Read;

#[derive(Debug, Deserialize, Serialize)]
pub struct Node(String, i64);

/// One entry of a multi-file `info.files` list. Parsed so `Info` round-trips
/// for info-hash purposes, but multi-file torrents are otherwise unsupported.
#[derive(Debug, Deserialize, Serialize)]
pub struct File {
    pub path: Vec<String>,
    pub length: i64,
    #[serde(default)]
    pub md5sum: Option<String>,
}

#[allow(dead_code)]
#[derive(Debug, Deserialize, Serialize)]
pub struct Info {
    pub name: String,
    /// string consisting of the concatenation of all 20-byte SHA1 hash values, one per piece (byte string, i.e. not urlencoded)
    pub pieces: ByteBuf,
    /// number of bytes in each piece (integer)
    #[serde(rename = "piece length")]
    pub piece_length: i64,
    #[serde(default)]
    pub md5sum: Option<String>,
    #[serde(default)]
    pub length: Option<i64>,
    #[serde(default)]
    pub files: Option<Vec<File>>,
    #[serde(default)]
    pub private: Option<u8>,
    #[serde(default)]
    pub path: Option<Vec<String>>,
    #[serde(default)]
    #[serde(rename = "root hash")]
    pub root_hash: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Torrent {
    pub info: Info,
    #[serde(default)]
    /// The announce URL of the tracker (string)
    announce: Option<String>,
    /// (optional) this is an extension to the official specification, offering backwards-compatibility. (list of lists of strings).
    #[serde(default)]
    nodes: Option<Vec<Node>>,
    #[serde(default)]
    encoding: Option<String>,
    /// (optional) the creation time of the torrent, in standard UNIX epoch format (integer, seconds since 1-Jan-1970 00:00:00 UTC)
    #[serde(default)]
    httpseeds: Option<Vec<String>>,
    /// (optional) free-form textual comments of the author (string)
    #[serde(default)]
    #[serde(rename = "announce-list")]
    announce_list: Option<Vec<Vec<String>>>,
    /// (optional) name and version of the program used to create the .torrent (string)
    #[serde(default)]
    #[serde(rename = "creation date")]
    creation_date: Option<i64>,
    /// (optional) the string encoding format used to generate the pieces part of the info dictionary in the .torrent metafile (string)
    #[serde(rename = "comment")]
    comment: Option<String>,
    #[serde(default)]
    #[serde(rename = "created by")]
    created_by: Option<String>,
}

impl Torrent {
    pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        from_bytes(bytes).context("failed to deserialize torrent")
    }

    pub fn from_path(path: &std::path::Path) -> anyhow::Result<Self> {
        let mut file = std::fs::File::open(path)?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        Self::from_bytes(&buf)
    }

    pub fn info_hash(&self) -> [u8; 20] {
        let bytes = to_bytes(&self.info).unwrap();
        let mut hasher = Sha1::new();
        hasher.update(bytes);
        hasher.finalize().into()
    }

    pub fn announce(&self) -> anyhow::Result<&str> {
        self.announce.as_deref().ok_or_else(|| anyhow!("torrent has no announce URL"))
    }

    /// BEP 12 `announce-list`: a list of tiers, each a list of tracker URLs.
    /// Only the first URL of each tier is used here (no tier fallback).
    pub fn announce_list(&self) -> Option<&Vec<Vec<String>>> {
        self.announce_list.as_ref()
    }

    /// Tracker URLs to announce to: the first URL of each `announce-list`
    /// tier if present, otherwise the single `announce` URL.
    pub fn tracker_urls(&self) -> anyhow::Result<Vec<String>> {
        if let Some(list) = self.announce_list() {
            let urls: Vec<String> = list
                .iter()
                .filter_map(|tier| tier.first())
                .filter(|url| !url.is_empty())
                .cloned()
                .collect();
            if !urls.is_empty() {
                return Ok(urls);
            }
        }
        Ok(vec![self.announce()?.to_string()])
    }

    /// The length of the single file this torrent describes. Errors if the
    /// `info` dict is the multi-file form (`files` present, `length` absent).
    pub fn length(&self) -> anyhow::Result<u64> {
        self.info
            .length
            .map(|l| l as u64)
            .ok_or_else(|| anyhow!("multi-file torrents are not supported"))
    }

    pub fn piece_length(&self) -> i64 {
        self.info.piece_length
    }

    pub fn piece_hashes(&self) -> Vec<[u8; 20]> {
        self.info
            .pieces
            .chunks(20)
            .map(|chunk| {
                let mut array = [0u8; 20];
                array.copy_from_slice(chunk);
                array
            })
            .collect()
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_file_bytes(name: &str, piece_length: i64, pieces: Vec<u8>, length: i64) -> Vec<u8> {
        let info = Info {
            name: name.to_string(),
            pieces: ByteBuf::from(pieces),
            piece_length,
            md5sum: None,
            length: Some(length),
            files: None,
            private: None,
            path: None,
            root_hash: None,
        };
        let torrent = Torrent {
            info,
            announce: Some("http://tracker.example.com:6969/announce".to_string()),
            nodes: None,
            encoding: None,
            httpseeds: None,
            announce_list: None,
            creation_date: None,
            comment: None,
            created_by: None,
        };
        to_bytes(&torrent).unwrap()
    }

    #[test]
    fn parses_announce_and_single_file_length() {
        let bytes = single_file_bytes("movie.mp4", 16384, vec![0u8; 20], 32768);
        let torrent = Torrent::from_bytes(&bytes).unwrap();
        assert_eq!(torrent.announce().unwrap(), "http://tracker.example.com:6969/announce");
        assert_eq!(torrent.length().unwrap(), 32768);
        assert_eq!(torrent.name(), "movie.mp4");
    }

    #[test]
    fn piece_hashes_splits_into_20_byte_chunks() {
        let mut pieces = vec![1u8; 20];
        pieces.extend(vec![2u8; 20]);
        let bytes = single_file_bytes("f", 16384, pieces, 16384 * 2);
        let torrent = Torrent::from_bytes(&bytes).unwrap();
        let hashes = torrent.piece_hashes();
        assert_eq!(hashes.len(), 2);
        assert_eq!(hashes[0], [1u8; 20]);
        assert_eq!(hashes[1], [2u8; 20]);
    }

    #[test]
    fn multi_file_torrent_rejected_by_length() {
        let info = Info {
            name: "dir".to_string(),
            pieces: ByteBuf::from(vec![0u8; 20]),
            piece_length: 16384,
            md5sum: None,
            length: None,
            files: Some(vec![File { path: vec!["a".into()], length: 10, md5sum: None }]),
            private: None,
            path: None,
            root_hash: None,
        };
        let torrent = Torrent {
            info,
            announce: Some("http://tracker.example.com/announce".to_string()),
            nodes: None,
            encoding: None,
            httpseeds: None,
            announce_list: None,
            creation_date: None,
            comment: None,
            created_by: None,
        };
        assert!(torrent.length().is_err());
    }

    #[test]
    fn tracker_urls_prefers_announce_list_tiers() {
        let info = Info {
            name: "f".to_string(),
            pieces: ByteBuf::from(vec![0u8; 20]),
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
            announce: Some("http://primary.example.com/announce".to_string()),
            nodes: None,
            encoding: None,
            httpseeds: None,
            announce_list: Some(vec![
                vec!["http://tier1a.example.com/announce".to_string(), "http://tier1b.example.com/announce".to_string()],
                vec!["http://tier2.example.com/announce".to_string()],
            ]),
            creation_date: None,
            comment: None,
            created_by: None,
        };
        let urls = torrent.tracker_urls().unwrap();
        assert_eq!(urls, vec!["http://tier1a.example.com/announce", "http://tier2.example.com/announce"]);
    }

    #[test]
    fn tracker_urls_falls_back_to_announce_without_list() {
        let bytes = single_file_bytes("f", 16384, vec![0u8; 20], 16384);
        let torrent = Torrent::from_bytes(&bytes).unwrap();
        assert_eq!(torrent.tracker_urls().unwrap(), vec!["http://tracker.example.com:6969/announce".to_string()]);
    }

    #[test]
    fn info_hash_is_stable_for_same_info() {
        let bytes = single_file_bytes("f", 16384, vec![3u8; 20], 16384);
        let a = Torrent::from_bytes(&bytes).unwrap();
        let b = Torrent::from_bytes(&bytes).unwrap();
        assert_eq!(a.info_hash(), b.info_hash());
    }
}
