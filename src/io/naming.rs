//! Timestamped file names used inside archive directories.
//!
//! Timestamps are seconds since the epoch with four decimals, zero padded to a
//! fixed width so that lexical order equals time order. Within one process every
//! call returns a strictly larger value.

use std::sync::atomic::{AtomicU64, Ordering};

use uuid::Uuid;

use crate::constants::{BUFFER_SUFFIX, LOCK_SUFFIX, TREE_SUFFIX};

static LAST_TICK: AtomicU64 = AtomicU64::new(0);

/// Ten-thousandths of a second since the epoch, strictly increasing per process.
fn next_tick() -> u64 {
    let now = u64::try_from(chrono::Utc::now().timestamp_micros() / 100).unwrap_or(0);
    let mut observed = LAST_TICK.load(Ordering::Relaxed);
    loop {
        let tick = now.max(observed + 1);
        match LAST_TICK.compare_exchange_weak(observed, tick, Ordering::SeqCst, Ordering::Relaxed) {
            Ok(_) => return tick,
            Err(current) => observed = current,
        }
    }
}

fn format_tick(tick: u64) -> String {
    format!("{:011}_{:04}", tick / 10_000, tick % 10_000)
}

/// A fresh timestamp such as `01700000000_1234`.
pub fn timestamp() -> String {
    format_tick(next_tick())
}

/// A session id: timestamp plus process id.
pub fn session_id() -> String {
    format!("{}_{}", timestamp(), std::process::id())
}

pub fn base_tree_name() -> String {
    format!("b{}{TREE_SUFFIX}", timestamp())
}

pub fn transient_tree_name() -> String {
    format!("t{}{TREE_SUFFIX}", timestamp())
}

/// The per-session undecided buffer.
pub fn buffer_name(session: &str) -> String {
    format!("s{session}{BUFFER_SUFFIX}")
}

/// A buffer published into `recent` by `session`.
pub fn recent_name(session: &str) -> String {
    format!("r{}_s{session}{BUFFER_SUFFIX}", timestamp())
}

pub fn lock_name(session: &str) -> String {
    format!("{session}_{}{LOCK_SUFFIX}", Uuid::new_v4())
}

/// True for a recent buffer stored by `session`.
pub fn is_recent_of(name: &str, session: &str) -> bool {
    name.starts_with('r') && name.ends_with(&format!("_s{session}{BUFFER_SUFFIX}"))
}

pub fn is_tree(name: &str) -> bool {
    name.ends_with(TREE_SUFFIX)
}

pub fn is_buffer(name: &str) -> bool {
    name.ends_with(BUFFER_SUFFIX)
}

pub fn is_lock(name: &str) -> bool {
    name.ends_with(LOCK_SUFFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_strictly_increase_and_sort_lexically() {
        let stamps: Vec<String> = (0..500).map(|_| timestamp()).collect();
        for pair in stamps.windows(2) {
            assert!(pair[0] < pair[1], "{} !< {}", pair[0], pair[1]);
        }
        assert_eq!(stamps[0].len(), 16);
        assert_eq!(stamps[0].as_bytes()[11], b'_');
    }

    #[test]
    fn recent_names_identify_their_session() {
        let session = session_id();
        let other = session_id();
        let name = recent_name(&session);
        assert!(is_recent_of(&name, &session));
        assert!(!is_recent_of(&name, &other));
        assert!(is_buffer(&name));
        assert!(is_tree(&base_tree_name()));
        assert!(is_lock(&lock_name(&session)));
        assert!(base_tree_name() < base_tree_name());
    }
}
