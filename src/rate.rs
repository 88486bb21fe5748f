//! Egress token bucket.
//!
//! Each torrent carries a bucket of send credits consumed by PIECE
//! uploads. The refill task tops every bucket up ten times a second with
//! a tenth of the configured rate, capped at one second's worth, so no
//! one-second window can admit more than `max_send_speed` bytes. Upload
//! requests that found the bucket dry are parked on their piece and
//! drained here after each refill.

use crate::peer;
use crate::session::Session;
use std::sync::Arc;
use std::time::Duration;

pub(crate) const REFILL_INTERVAL: Duration = Duration::from_millis(100);

/// One refill step: a tenth of the per-second rate, saturating at a full
/// second of credit.
pub(crate) fn refill(tokens: u64, rate: u64) -> u64 {
    (tokens + rate / 10).min(rate.max(1))
}

pub(crate) async fn run(session: Arc<Session>) {
    let mut tick = tokio::time::interval(REFILL_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = session.shutdown.cancelled() => return,
            _ = tick.tick() => {}
        }
        let mut core = session.core.lock().unwrap();
        let rate = core.limits.max_send_speed;
        for to in core.torrents.values_mut() {
            to.out_tokens = refill(to.out_tokens, rate);
            peer::drain_sendreqs(to);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refill_caps_at_one_second_of_credit() {
        let rate = 1_000_000;
        let mut tokens = 0;
        for _ in 0..25 {
            tokens = refill(tokens, rate);
        }
        assert_eq!(tokens, rate);
    }

    #[test]
    fn test_ten_refills_grant_exactly_one_second_of_rate() {
        // Draining the bucket after every refill: ten rounds inside one
        // second hand out exactly `rate` bytes.
        let rate = 1000;
        let mut spent = 0;
        for _ in 0..10 {
            spent += refill(0, rate);
        }
        assert_eq!(spent, rate);
    }

    #[test]
    fn test_zero_rate_grants_nothing() {
        assert_eq!(refill(0, 0), 0);
    }
}
