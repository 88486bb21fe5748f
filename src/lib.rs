//! # btstream
//!
//! A streaming BitTorrent engine: open a `magnet:` link or a `.torrent`
//! file and read any byte range of any file inside it while the torrent
//! is still downloading. Reads carry deadlines that drive the piece
//! scheduler, so playback-style access patterns get their pieces first,
//! duplicate-requested across peers when a single peer would miss the
//! deadline.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │ Session                                                   │
//! │  ┌─────────────┐ ┌──────────────┐ ┌────────────────────┐  │
//! │  │ peer tasks  │ │ tracker      │ │ workers            │  │
//! │  │ (tokio TCP, │ │ clients      │ │ sha1 verify        │  │
//! │  │  codecs)    │ │ (UDP + HTTP) │ │ disk cache         │  │
//! │  └──────┬──────┘ └──────┬───────┘ │ egress tokens      │  │
//! │         │               │         │ 1 s scheduler tick │  │
//! │         ▼               ▼         └─────────┬──────────┘  │
//! │  ┌────────────────────────────────────────────────────┐   │
//! │  │ core (one mutex): torrents, peers, pieces, blocks, │   │
//! │  │ requests, trackers, counters                       │   │
//! │  └────────────────────────────────────────────────────┘   │
//! └───────────────────────────────────────────────────────────┘
//!          ▲ FileHandle::read blocks on piece verification
//! ```
//!
//! The lock is never held across file or socket I/O: workers take piece
//! buffers out of the core, do the work, and put them back.
//!
//! ## Example
//!
//! ```ignore
//! use btstream::{Config, Session};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let session = Session::start(Config::load()?).await?;
//!     let torrent = session.open_magnet("magnet:?xt=urn:btih:...").await?;
//!     torrent.wait_metainfo().await?;
//!     let mut file = torrent.open_file(&torrent.largest_file_path()?).await?;
//!     let mut buf = vec![0u8; 64 * 1024];
//!     let n = file.read(&mut buf).await?;
//!     println!("first {n} bytes ready");
//!     Ok(())
//! }
//! ```
//!
//! ## On-disk cache
//!
//! Verified pieces land in one packed file per torrent under the cache
//! directory; the file also stores the metainfo, so re-opening a magnet
//! after a restart needs no network metadata exchange. A global budget
//! (a percentage of free disk space) bounds the cache; inactive torrents
//! are evicted oldest-first.

pub mod bencode;
pub mod config;
pub mod error;
pub mod metainfo;
pub mod vfs;
pub mod wire;

mod diskio;
mod hasher;
mod peer;
mod piece;
mod rate;
mod sched;
mod session;
mod torrent;
mod tracker;

pub use config::Config;
pub use error::{BtError, BtResult};
pub use metainfo::{InfoHash, MagnetLink, Metainfo};
pub use session::{Session, TorrentHandle, TorrentStats};
pub use vfs::{CancelToken, DirEntry, FileHandle, FileStat, Opened};
