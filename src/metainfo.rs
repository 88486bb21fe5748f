//! Metainfo and magnet link parsing.
//!
//! Builds the torrent's file tree, piece table and tracker list from a
//! bencoded metainfo document, and extracts info-hash/name/trackers from
//! `magnet:` URIs. The exact encoded bytes of the `info` dictionary are
//! what the info-hash is computed over, so the parser works from the raw
//! document rather than a re-serialization.

use crate::bencode::{self, Value};
use crate::error::{BtError, BtResult};
use std::fmt;

/// Piece lengths outside this range are rejected.
pub const MIN_PIECE_LENGTH: u32 = 1 << 16;
pub const MAX_PIECE_LENGTH: u32 = 1 << 23;

/// 20-byte SHA-1 info-hash, the torrent's durable identity.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct InfoHash(pub [u8; 20]);

impl InfoHash {
    pub fn from_hex(s: &str) -> BtResult<Self> {
        let bytes =
            hex::decode(s).map_err(|_| BtError::InvalidInfoHash(s.to_string()))?;
        let arr: [u8; 20] = bytes
            .try_into()
            .map_err(|_| BtError::InvalidInfoHash(s.to_string()))?;
        Ok(InfoHash(arr))
    }

    pub fn of(data: &[u8]) -> Self {
        let mut sha = sha1_smol::Sha1::new();
        sha.update(data);
        InfoHash(sha.digest().bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// One node in the torrent's file tree. Directory nodes have size 0 and a
/// non-empty child list; file nodes carry an offset into the torrent's
/// linear address space.
#[derive(Debug, Clone)]
pub struct FileNode {
    pub name: String,
    /// Slash-separated path from the torrent root.
    pub full_path: String,
    pub offset: u64,
    pub size: u64,
    /// Indices into `Metainfo::files` of the children, for directories.
    pub children: Vec<usize>,
}

impl FileNode {
    pub fn is_dir(&self) -> bool {
        self.size == 0
    }
}

/// Parsed metainfo: everything the engine needs to schedule, verify and
/// serve a torrent, plus the exact encoded bytes for the cache header and
/// for answering peer metadata requests.
#[derive(Debug, Clone)]
pub struct Metainfo {
    pub info_hash: InfoHash,
    pub name: String,
    pub piece_length: u32,
    /// Packed 20-byte SHA-1 digests, one per piece.
    pub piece_hashes: Vec<u8>,
    pub total_length: u64,
    /// All file tree nodes; directories included.
    pub files: Vec<FileNode>,
    /// Indices of the top-level nodes.
    pub root: Vec<usize>,
    pub trackers: Vec<String>,
    /// The exact bencoded metainfo document.
    pub raw: Vec<u8>,
    /// Byte range of the info dictionary within `raw`.
    info_start: usize,
    info_end: usize,
}

impl Metainfo {
    /// Parse a complete metainfo document (`.torrent` file contents).
    pub fn parse(data: &[u8]) -> BtResult<Self> {
        let doc = bencode::parse_document(data)?;
        let span = doc
            .info_span
            .clone()
            .ok_or_else(|| BtError::InvalidMetainfo("missing info dict".into()))?;
        let info = doc
            .root
            .get_dict("info")
            .ok_or_else(|| BtError::InvalidMetainfo("info is not a dict".into()))?;

        let mut trackers = Vec::new();
        if let Some(tiers) = doc.root.get_list("announce-list") {
            for tier in tiers {
                if let Some(urls) = tier.as_list() {
                    for url in urls {
                        if let Some(u) = url.as_str() {
                            push_unique(&mut trackers, u);
                        }
                    }
                }
            }
        } else if let Some(announce) = doc.root.get_str("announce") {
            push_unique(&mut trackers, announce);
        }

        let mut mi = Self::parse_info(info, data.to_vec(), span.start, span.end)?;
        mi.trackers = trackers;
        Ok(mi)
    }

    /// Build a metainfo from a bare info dictionary, as assembled over the
    /// extension protocol. The stored document becomes `d4:info<raw>e` so
    /// the cache header round-trips identically.
    pub fn from_info_dict(info_bytes: &[u8], trackers: Vec<String>) -> BtResult<Self> {
        let info = bencode::parse(info_bytes)?;
        let mut raw = Vec::with_capacity(info_bytes.len() + 8);
        raw.extend_from_slice(b"d4:info");
        let start = raw.len();
        raw.extend_from_slice(info_bytes);
        let end = raw.len();
        raw.push(b'e');

        let mut mi = Self::parse_info(&info, raw, start, end)?;
        mi.trackers = trackers;
        Ok(mi)
    }

    fn parse_info(
        info: &Value,
        raw: Vec<u8>,
        info_start: usize,
        info_end: usize,
    ) -> BtResult<Self> {
        let info_hash = InfoHash::of(&raw[info_start..info_end]);

        let name = info
            .get_str("name")
            .ok_or_else(|| BtError::InvalidMetainfo("missing file name".into()))?
            .to_string();

        let mut files: Vec<FileNode> = Vec::new();
        let mut root: Vec<usize> = Vec::new();
        let mut offset: u64 = 0;

        if let Some(list) = info.get_list("files") {
            // Multi file torrent: each entry carries a path component list.
            for entry in list {
                let length = entry
                    .get_int("length")
                    .ok_or_else(|| BtError::InvalidMetainfo("missing file length".into()))?;
                if length < 0 {
                    return Err(BtError::InvalidMetainfo("invalid file length".into()));
                }
                let path = entry
                    .get_list("path")
                    .ok_or_else(|| BtError::InvalidMetainfo("missing file path".into()))?;

                let mut parent: Option<usize> = None;
                let mut full_path = String::new();
                let mut node = None;
                for component in path {
                    let component = component.as_str().ok_or_else(|| {
                        BtError::InvalidMetainfo("path component is not a string".into())
                    })?;
                    if !full_path.is_empty() {
                        full_path.push('/');
                    }
                    full_path.push_str(component);

                    let siblings = match parent {
                        Some(idx) => &files[idx].children,
                        None => &root,
                    };
                    let existing = siblings
                        .iter()
                        .copied()
                        .find(|&i| files[i].name == component);
                    let idx = match existing {
                        Some(idx) => idx,
                        None => {
                            files.push(FileNode {
                                name: component.to_string(),
                                full_path: full_path.clone(),
                                offset: 0,
                                size: 0,
                                children: Vec::new(),
                            });
                            let idx = files.len() - 1;
                            match parent {
                                Some(p) => files[p].children.push(idx),
                                None => root.push(idx),
                            }
                            idx
                        }
                    };
                    parent = Some(idx);
                    node = Some(idx);
                }

                let idx = node
                    .ok_or_else(|| BtError::InvalidMetainfo("empty file path".into()))?;
                files[idx].offset = offset;
                files[idx].size = length as u64;
                offset += length as u64;
            }
        } else {
            // Single file torrent
            let length = info
                .get_int("length")
                .ok_or_else(|| BtError::InvalidMetainfo("missing file length".into()))?;
            if length < 0 {
                return Err(BtError::InvalidMetainfo("invalid file length".into()));
            }
            files.push(FileNode {
                name: name.clone(),
                full_path: name.clone(),
                offset: 0,
                size: length as u64,
                children: Vec::new(),
            });
            root.push(0);
            offset = length as u64;
        }

        let piece_length = info.get_int("piece length").unwrap_or(0);
        if piece_length < MIN_PIECE_LENGTH as i64 || piece_length > MAX_PIECE_LENGTH as i64 {
            return Err(BtError::InvalidMetainfo(format!(
                "invalid piece length: {piece_length}"
            )));
        }
        let piece_length = piece_length as u32;

        let piece_hashes = info
            .get_bytes("pieces")
            .ok_or_else(|| BtError::InvalidMetainfo("no hash list".into()))?
            .to_vec();
        if piece_hashes.is_empty() || piece_hashes.len() % 20 != 0 {
            return Err(BtError::InvalidMetainfo(format!(
                "invalid hash list size: {}",
                piece_hashes.len()
            )));
        }

        let num_pieces = (piece_hashes.len() / 20) as u64;
        let expect = (offset + piece_length as u64 - 1) / piece_length as u64;
        if offset > 0 && num_pieces != expect {
            return Err(BtError::InvalidMetainfo(format!(
                "hash list has {num_pieces} pieces, content needs {expect}"
            )));
        }

        Ok(Metainfo {
            info_hash,
            name,
            piece_length,
            piece_hashes,
            total_length: offset,
            files,
            root,
            trackers: Vec::new(),
            raw,
            info_start,
            info_end,
        })
    }

    pub fn num_pieces(&self) -> u32 {
        (self.piece_hashes.len() / 20) as u32
    }

    /// Length of one piece; the last piece is truncated to the remainder
    /// unless the total divides evenly.
    pub fn piece_len(&self, index: u32) -> u32 {
        if index + 1 == self.num_pieces() {
            let rem = self.total_length % self.piece_length as u64;
            if rem != 0 {
                return rem as u32;
            }
        }
        self.piece_length
    }

    pub fn piece_hash(&self, index: u32) -> &[u8] {
        let at = index as usize * 20;
        &self.piece_hashes[at..at + 20]
    }

    /// The exact encoded info dictionary, served to peers over the
    /// extension protocol.
    pub fn info_bytes(&self) -> &[u8] {
        &self.raw[self.info_start..self.info_end]
    }

    /// Find a file node by slash-separated path from the torrent root.
    pub fn find(&self, path: &str) -> Option<&FileNode> {
        self.files.iter().find(|f| f.full_path == path)
    }

    /// Index of the largest file, for "play the video in this torrent".
    pub fn largest_file(&self) -> Option<&FileNode> {
        self.files.iter().max_by_key(|f| f.size)
    }
}

fn push_unique(urls: &mut Vec<String>, url: &str) {
    if !urls.iter().any(|u| u == url) {
        urls.push(url.to_string());
    }
}

/// Parsed `magnet:?xt=urn:btih:...` link.
#[derive(Debug, Clone)]
pub struct MagnetLink {
    pub info_hash: InfoHash,
    pub name: Option<String>,
    pub trackers: Vec<String>,
}

impl MagnetLink {
    pub fn parse(url: &str) -> BtResult<Self> {
        let rest = url
            .strip_prefix("magnet:")
            .ok_or_else(|| BtError::InvalidUrl(url.to_string()))?;
        let rest = rest.strip_prefix('?').unwrap_or(rest);

        let mut info_hash = None;
        let mut name = None;
        let mut trackers = Vec::new();

        for pair in rest.split('&') {
            let (key, value) = match pair.split_once('=') {
                Some(kv) => kv,
                None => continue,
            };
            let value = percent_decode(value);
            match key {
                "xt" => {
                    let hash = value
                        .strip_prefix("urn:btih:")
                        .ok_or_else(|| BtError::InvalidUrl(format!("unknown hash scheme: {value}")))?;
                    info_hash = Some(InfoHash::from_hex(hash)?);
                }
                "dn" => name = Some(value),
                "tr" => push_unique(&mut trackers, &value),
                _ => {}
            }
        }

        Ok(MagnetLink {
            info_hash: info_hash
                .ok_or_else(|| BtError::InvalidUrl("no 'xt' in magnet link".into()))?,
            name,
            trackers,
        })
    }
}

/// Decode %XX escapes and '+' in a magnet query component.
fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                let hi = (bytes[i + 1] as char).to_digit(16);
                let lo = (bytes[i + 2] as char).to_digit(16);
                if let (Some(hi), Some(lo)) = (hi, lo) {
                    out.push((hi * 16 + lo) as u8);
                    i += 3;
                    continue;
                }
                out.push(b'%');
                i += 1;
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::{dict, Value};

    fn synthetic_metainfo(piece_length: u32, files: Vec<(&str, u64)>) -> Vec<u8> {
        let total: u64 = files.iter().map(|(_, s)| s).sum();
        let num_pieces = (total + piece_length as u64 - 1) / piece_length as u64;
        let hashes = vec![0u8; num_pieces as usize * 20];

        let file_list: Vec<Value> = files
            .iter()
            .map(|(path, size)| {
                let components: Vec<Value> = path
                    .split('/')
                    .map(|c| Value::Bytes(c.as_bytes().to_vec()))
                    .collect();
                dict(vec![
                    ("length", Value::Int(*size as i64)),
                    ("path", Value::List(components)),
                ])
            })
            .collect();

        let info = dict(vec![
            ("files", Value::List(file_list)),
            ("name", Value::Bytes(b"test".to_vec())),
            ("piece length", Value::Int(piece_length as i64)),
            ("pieces", Value::Bytes(hashes)),
        ]);
        dict(vec![
            ("announce", Value::Bytes(b"udp://tracker.test:80".to_vec())),
            ("info", info),
        ])
        .encode()
    }

    #[test]
    fn test_parse_multi_file_layout() {
        let data = synthetic_metainfo(65536, vec![("a.bin", 100_000), ("sub/b.bin", 50_000)]);
        let mi = Metainfo::parse(&data).unwrap();

        assert_eq!(mi.name, "test");
        assert_eq!(mi.total_length, 150_000);
        assert_eq!(mi.num_pieces(), 3);
        assert_eq!(mi.trackers, vec!["udp://tracker.test:80".to_string()]);

        let a = mi.find("a.bin").unwrap();
        assert_eq!((a.offset, a.size), (0, 100_000));
        let b = mi.find("sub/b.bin").unwrap();
        assert_eq!((b.offset, b.size), (100_000, 50_000));

        // "sub" is a directory node at the root
        let sub = mi.find("sub").unwrap();
        assert!(sub.is_dir());
        assert_eq!(sub.children.len(), 1);
        assert_eq!(mi.root.len(), 2);
    }

    #[test]
    fn test_last_piece_length() {
        let data = synthetic_metainfo(65536, vec![("a.bin", 100_000)]);
        let mi = Metainfo::parse(&data).unwrap();
        assert_eq!(mi.piece_len(0), 65536);
        assert_eq!(mi.piece_len(1), 100_000 - 65536);

        // Evenly divisible total keeps full length for the last piece
        let data = synthetic_metainfo(65536, vec![("a.bin", 131_072)]);
        let mi = Metainfo::parse(&data).unwrap();
        assert_eq!(mi.piece_len(1), 65536);
    }

    #[test]
    fn test_rejects_bad_piece_length() {
        let data = synthetic_metainfo(1024, vec![("a.bin", 4096)]);
        assert!(matches!(
            Metainfo::parse(&data),
            Err(BtError::InvalidMetainfo(_))
        ));
    }

    #[test]
    fn test_info_dict_roundtrip() {
        let data = synthetic_metainfo(65536, vec![("a.bin", 70_000)]);
        let mi = Metainfo::parse(&data).unwrap();

        // Rebuilding from the bare info dict must give the same hash.
        let rebuilt = Metainfo::from_info_dict(mi.info_bytes(), vec![]).unwrap();
        assert_eq!(rebuilt.info_hash, mi.info_hash);
        assert_eq!(rebuilt.total_length, mi.total_length);

        // And the stored document must parse back to the same info span.
        let again = Metainfo::parse(&rebuilt.raw).unwrap();
        assert_eq!(again.info_hash, mi.info_hash);
    }

    #[test]
    fn test_magnet_parse() {
        let link = MagnetLink::parse(
            "magnet:?xt=urn:btih:c12fe1c06bba254a9dc9f519b335aa7c1367a88a\
             &dn=Example+Name&tr=udp%3A%2F%2Ftracker.test%3A6969&tr=http%3A%2F%2Ft2%2Fannounce",
        )
        .unwrap();
        assert_eq!(
            link.info_hash.to_hex(),
            "c12fe1c06bba254a9dc9f519b335aa7c1367a88a"
        );
        assert_eq!(link.name.as_deref(), Some("Example Name"));
        assert_eq!(
            link.trackers,
            vec![
                "udp://tracker.test:6969".to_string(),
                "http://t2/announce".to_string()
            ]
        );
    }

    #[test]
    fn test_magnet_requires_xt() {
        assert!(MagnetLink::parse("magnet:?dn=foo").is_err());
        assert!(MagnetLink::parse("magnet:?xt=urn:sha256:abcd").is_err());
        assert!(MagnetLink::parse("http://x").is_err());
    }

    #[test]
    fn test_largest_file() {
        let data = synthetic_metainfo(65536, vec![("a.bin", 10), ("b.bin", 999_999)]);
        let mi = Metainfo::parse(&data).unwrap();
        assert_eq!(mi.largest_file().unwrap().full_path, "b.bin");
    }
}
