//! SHA-1 piece verification worker.
//!
//! A single background task, spawned on demand when a piece completes and
//! exiting after a minute of idleness. The piece buffer is taken out of
//! the core while the digest runs on a blocking thread, so the lock is
//! never held across the hash computation. On mismatch one contributing
//! peer is blamed (rotating) and the piece restarts from scratch.

use crate::metainfo::InfoHash;
use crate::peer;
use crate::sched;
use crate::session::{Core, Session};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, warn};

const IDLE_EXIT: Duration = Duration::from_secs(60);

struct Job {
    hash: InfoHash,
    index: u32,
    data: Vec<u8>,
    expected: [u8; 20],
}

/// Wake the verification worker, spawning it if it is not running.
pub(crate) fn wake(session: &Arc<Session>, core: &mut Core) {
    session.hash_notify.notify_one();
    if !core.hash_running {
        core.hash_running = true;
        let session = Arc::clone(session);
        tokio::spawn(run(session));
    }
}

async fn run(session: Arc<Session>) {
    loop {
        let job = {
            let mut core = session.core.lock().unwrap();
            take_job(&mut core)
        };

        let Some(job) = job else {
            match timeout(IDLE_EXIT, session.hash_notify.notified()).await {
                Ok(()) => continue,
                Err(_) => {
                    let mut core = session.core.lock().unwrap();
                    if peek_job(&core) {
                        continue;
                    }
                    core.hash_running = false;
                    return;
                }
            }
        };

        let Job {
            hash,
            index,
            data,
            expected,
        } = job;
        let result = tokio::task::spawn_blocking(move || {
            let mut sha = sha1_smol::Sha1::new();
            sha.update(&data);
            (sha.digest().bytes() == expected, data)
        })
        .await;
        let (ok, data) = match result {
            Ok(pair) => pair,
            Err(_) => continue,
        };

        let mut core = session.core.lock().unwrap();
        apply(&session, &mut core, hash, index, data, ok);
    }
}

fn peek_job(core: &Core) -> bool {
    core.torrents.values().any(|to| {
        to.pieces
            .values()
            .any(|p| p.complete && !p.hash_computed && !p.io_busy)
    })
}

fn take_job(core: &mut Core) -> Option<Job> {
    for to in core.torrents.values_mut() {
        let Some(mi) = to.metainfo.as_ref() else {
            continue;
        };
        let candidate = to
            .pieces
            .values()
            .find(|p| p.complete && !p.hash_computed && !p.io_busy)
            .map(|p| p.index);
        let Some(index) = candidate else { continue };

        let mut expected = [0u8; 20];
        expected.copy_from_slice(mi.piece_hash(index));
        let hash = to.info_hash;
        let piece = to.pieces.get_mut(&index).unwrap();
        piece.io_busy = true;
        return Some(Job {
            hash,
            index,
            data: std::mem::take(&mut piece.data),
            expected,
        });
    }
    None
}

fn apply(
    session: &Arc<Session>,
    core: &mut Core,
    hash: InfoHash,
    index: u32,
    data: Vec<u8>,
    ok: bool,
) {
    let Some(to) = core.torrents.get_mut(&hash) else {
        return;
    };
    let Some(piece) = to.pieces.get_mut(&index) else {
        return;
    };
    piece.data = data;
    piece.io_busy = false;
    piece.hash_computed = true;
    piece.hash_ok = ok;

    if ok {
        debug!(torrent = %hash, piece = index, "piece verified");
        to.new_valid_piece = true;
        piece.verified.notify_waiters();
        peer::drain_sendreqs(to);
        // The piece no longer wants data; peers offering only it stop
        // being interesting
        to.update_interest_all();
        session.io_notify.notify_one();
        return;
    }

    warn!(torrent = %hash, piece = index, "piece failed verification");
    to.wasted_bytes += piece.length as u64;
    peer::blame_contributor(session, core, hash, index);
    // Blame may have destroyed a peer; the piece itself restarts clean.
    if let Some(to) = core.torrents.get_mut(&hash) {
        if let Some(piece) = to.pieces.get_mut(&index) {
            piece.restart();
        }
        sched::do_requests(to, Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_matches_reference() {
        // sha1("abc") per FIPS 180-1
        let mut sha = sha1_smol::Sha1::new();
        sha.update(b"abc");
        assert_eq!(
            sha.digest().to_string(),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
    }
}
