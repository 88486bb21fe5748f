//! Shared fixtures: a synthetic torrent builder, a scripted seed peer
//! speaking the real wire protocol over TCP, and a minimal BEP-15 UDP
//! tracker that hands out the seed's address.

use btstream::bencode::{dict, Value};
use btstream::metainfo::Metainfo;
use btstream::wire::{Handshake, HandshakeCodec, Message, PeerCodec};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, UdpSocket};
use tokio_util::codec::{Framed, FramedParts};

pub const PIECE_LEN: usize = 65536;

/// A fully materialised torrent: metainfo plus the content bytes every
/// test compares against.
pub struct SyntheticTorrent {
    pub metainfo_bytes: Vec<u8>,
    pub mi: Metainfo,
    pub content: Vec<u8>,
}

/// Byte `j` of file `idx` is `0x40 + idx` at offset zero, varying slowly
/// afterwards, so both identity and offset mistakes show up.
pub fn file_byte(file_idx: usize, j: usize) -> u8 {
    (0x40 + file_idx as u8).wrapping_add((j % 251) as u8)
}

pub fn synthetic(files: &[(&str, usize)]) -> SyntheticTorrent {
    let mut content = Vec::new();
    for (idx, (_, size)) in files.iter().enumerate() {
        content.extend((0..*size).map(|j| file_byte(idx, j)));
    }

    let num_pieces = (content.len() + PIECE_LEN - 1) / PIECE_LEN;
    let mut hashes = Vec::with_capacity(num_pieces * 20);
    for piece in content.chunks(PIECE_LEN) {
        let mut sha = sha1_smol::Sha1::new();
        sha.update(piece);
        hashes.extend_from_slice(&sha.digest().bytes());
    }

    let file_list: Vec<Value> = files
        .iter()
        .map(|(path, size)| {
            dict(vec![
                ("length", Value::Int(*size as i64)),
                (
                    "path",
                    Value::List(
                        path.split('/')
                            .map(|c| Value::Bytes(c.as_bytes().to_vec()))
                            .collect(),
                    ),
                ),
            ])
        })
        .collect();
    let info = dict(vec![
        ("files", Value::List(file_list)),
        ("name", Value::Bytes(b"synthetic".to_vec())),
        ("piece length", Value::Int(PIECE_LEN as i64)),
        ("pieces", Value::Bytes(hashes)),
    ]);
    let metainfo_bytes = dict(vec![("info", info)]).encode();
    let mi = Metainfo::parse(&metainfo_bytes).unwrap();

    SyntheticTorrent {
        metainfo_bytes,
        mi,
        content,
    }
}

#[derive(Clone)]
pub struct SeedOptions {
    /// Answer ut_metadata requests (magnet flows need this).
    pub serve_metadata: bool,
    /// Serve this piece with flipped bytes (correct framing, wrong data).
    pub corrupt_piece: Option<u32>,
    /// Added latency before each PIECE reply.
    pub piece_delay: Duration,
    /// How long to stay choking after INTERESTED arrives.
    pub unchoke_delay: Duration,
}

impl Default for SeedOptions {
    fn default() -> Self {
        SeedOptions {
            serve_metadata: true,
            corrupt_piece: None,
            piece_delay: Duration::ZERO,
            unchoke_delay: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedEventKind {
    HandshakeDone,
    Interested,
    UnchokeSent,
    RequestReceived { piece: u32, begin: u32 },
    PieceSent { piece: u32, begin: u32 },
    CancelReceived { piece: u32, begin: u32 },
}

#[derive(Debug, Clone, Copy)]
pub struct SeedEvent {
    pub at: Instant,
    pub kind: SeedEventKind,
}

pub type SeedLog = Arc<Mutex<Vec<SeedEvent>>>;

pub fn events_of(log: &SeedLog, pred: impl Fn(&SeedEventKind) -> bool) -> Vec<SeedEvent> {
    log.lock()
        .unwrap()
        .iter()
        .copied()
        .filter(|e| pred(&e.kind))
        .collect()
}

fn log_event(log: &SeedLog, kind: SeedEventKind) {
    log.lock().unwrap().push(SeedEvent {
        at: Instant::now(),
        kind,
    });
}

/// Start a seed serving `torrent` on a fresh local port. Accepts any
/// number of sequential connections.
pub async fn spawn_seed(torrent: Arc<SyntheticTorrent>, opts: SeedOptions) -> (SocketAddr, SeedLog) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let log: SeedLog = Arc::new(Mutex::new(Vec::new()));

    let conn_log = log.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let torrent = torrent.clone();
            let opts = opts.clone();
            let log = conn_log.clone();
            tokio::spawn(async move {
                let _ = serve_connection(stream, torrent, opts, log).await;
            });
        }
    });
    (addr, log)
}

async fn serve_connection(
    stream: tokio::net::TcpStream,
    torrent: Arc<SyntheticTorrent>,
    opts: SeedOptions,
    log: SeedLog,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut framed = Framed::new(stream, HandshakeCodec);
    let client_hs = framed.next().await.ok_or("no handshake")??;
    let mut seed_id = [0u8; 20];
    seed_id[..4].copy_from_slice(b"SEED");
    framed
        .send(Handshake::new(client_hs.info_hash, seed_id))
        .await?;
    log_event(&log, SeedEventKind::HandshakeDone);

    let parts = framed.into_parts();
    let mut new_parts = FramedParts::new(parts.io, PeerCodec);
    new_parts.read_buf = parts.read_buf;
    new_parts.write_buf = parts.write_buf;
    let framed = Framed::from_parts(new_parts);
    let (sink, mut stream) = framed.split();

    // Writer side: everything is funneled through one channel so the
    // delayed unchoke/piece tasks don't fight over the sink.
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Message>();
    let writer_log = log.clone();
    let writer = tokio::spawn(async move {
        let mut sink = sink;
        while let Some(msg) = rx.recv().await {
            if let Message::Piece { piece, begin, .. } = &msg {
                log_event(&writer_log, SeedEventKind::PieceSent {
                    piece: *piece,
                    begin: *begin,
                });
            }
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    // Full bitfield
    let num_pieces = torrent.mi.num_pieces();
    let mut bits = vec![0u8; (num_pieces as usize + 7) / 8];
    for index in 0..num_pieces {
        bits[index as usize / 8] |= 0x80 >> (index % 8);
    }
    tx.send(Message::Bitfield(Bytes::from(bits)))?;

    let mut client_md_id: u8 = 0;
    while let Some(msg) = stream.next().await {
        let msg = msg?;
        match msg {
            Message::Interested => {
                log_event(&log, SeedEventKind::Interested);
                let tx = tx.clone();
                let delay = opts.unchoke_delay;
                let log = log.clone();
                tokio::spawn(async move {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    log_event(&log, SeedEventKind::UnchokeSent);
                    let _ = tx.send(Message::Unchoke);
                });
            }
            Message::Request {
                piece,
                begin,
                length,
            } => {
                log_event(&log, SeedEventKind::RequestReceived { piece, begin });
                let start = piece as usize * PIECE_LEN + begin as usize;
                let mut data = torrent.content[start..start + length as usize].to_vec();
                if opts.corrupt_piece == Some(piece) {
                    for b in &mut data {
                        *b ^= 0xff;
                    }
                }
                let tx = tx.clone();
                let delay = opts.piece_delay;
                tokio::spawn(async move {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    let _ = tx.send(Message::Piece {
                        piece,
                        begin,
                        data: Bytes::from(data),
                    });
                });
            }
            Message::Cancel { piece, begin, .. } => {
                log_event(&log, SeedEventKind::CancelReceived { piece, begin });
            }
            Message::Extension { ext_id: 0, payload } => {
                // Client extension handshake: learn its ut_metadata id and
                // answer with ours.
                let msg = btstream::bencode::parse(&payload)?;
                if let Some(m) = msg.get_dict("m") {
                    client_md_id = m.get_int("ut_metadata").unwrap_or(0) as u8;
                }
                let reply = dict(vec![
                    ("m", dict(vec![("ut_metadata", Value::Int(3))])),
                    (
                        "metadata_size",
                        Value::Int(torrent.mi.info_bytes().len() as i64),
                    ),
                ]);
                tx.send(Message::Extension {
                    ext_id: 0,
                    payload: Bytes::from(reply.encode()),
                })?;
            }
            Message::Extension { ext_id: 3, payload } => {
                let (header, _) = btstream::bencode::parse_prefix(&payload)?;
                let piece = header.get_int("piece").unwrap_or(0) as usize;
                if header.get_int("msg_type") != Some(0) || client_md_id == 0 {
                    continue;
                }
                let info = torrent.mi.info_bytes();
                if !opts.serve_metadata {
                    let reply = dict(vec![
                        ("msg_type", Value::Int(2)),
                        ("piece", Value::Int(piece as i64)),
                    ]);
                    tx.send(Message::Extension {
                        ext_id: client_md_id,
                        payload: Bytes::from(reply.encode()),
                    })?;
                    continue;
                }
                let start = piece * 16384;
                let end = (start + 16384).min(info.len());
                let mut reply = dict(vec![
                    ("msg_type", Value::Int(1)),
                    ("piece", Value::Int(piece as i64)),
                    ("total_size", Value::Int(info.len() as i64)),
                ])
                .encode();
                reply.extend_from_slice(&info[start..end]);
                tx.send(Message::Extension {
                    ext_id: client_md_id,
                    payload: Bytes::from(reply),
                })?;
            }
            _ => {}
        }
    }
    writer.abort();
    Ok(())
}

/// A one-socket BEP-15 tracker that answers connect and announce with a
/// fixed peer list.
pub async fn spawn_tracker(peers: Vec<SocketAddr>) -> SocketAddr {
    let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = sock.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 1500];
        loop {
            let Ok((n, from)) = sock.recv_from(&mut buf).await else {
                return;
            };
            if n < 16 {
                continue;
            }
            let action = u32::from_be_bytes(buf[8..12].try_into().unwrap());
            let txid = &buf[12..16];
            match action {
                0 => {
                    let mut reply = [0u8; 16];
                    reply[4..8].copy_from_slice(txid);
                    reply[8..16].copy_from_slice(&0x1122_3344_5566_7788u64.to_be_bytes());
                    let _ = sock.send_to(&reply, from).await;
                }
                1 => {
                    let mut reply = Vec::with_capacity(20 + peers.len() * 6);
                    reply.extend_from_slice(&1u32.to_be_bytes());
                    reply.extend_from_slice(txid);
                    reply.extend_from_slice(&1800u32.to_be_bytes()); // interval
                    reply.extend_from_slice(&1u32.to_be_bytes()); // leechers
                    reply.extend_from_slice(&(peers.len() as u32).to_be_bytes()); // seeders
                    for peer in &peers {
                        if let SocketAddr::V4(v4) = peer {
                            reply.extend_from_slice(&v4.ip().octets());
                            reply.extend_from_slice(&v4.port().to_be_bytes());
                        }
                    }
                    let _ = sock.send_to(&reply, from).await;
                }
                _ => {}
            }
        }
    });
    addr
}
