//! Physical-frame reference counting for copy-on-write sharing.
//!
//! Grounded on the teacher's `memory/frame_metadata.rs`: a global map from
//! frame number to refcount, consulted by fork (to mark a frame shared) and
//! by the page-fault handler (to decide whether a CoW break can simply
//! reclaim the frame in place or must copy it, spec §4.B).

use super::layout::PAGE_SIZE;
use alloc::collections::BTreeMap;
use spin::Mutex;

static REFCOUNTS: Mutex<BTreeMap<u64, u32>> = Mutex::new(BTreeMap::new());

fn frame_number(paddr: u64) -> u64 {
    paddr / PAGE_SIZE
}

/// Mark a frame as having `count` owners. Used when a shared page is first
/// created (fork marks both the parent's and the child's mapping CoW,
/// starting the count at 2).
pub fn set_refcount(paddr: u64, count: u32) {
    REFCOUNTS.lock().insert(frame_number(paddr), count);
}

/// Current refcount. A frame absent from the map is privately owned
/// (refcount 1) by convention, matching the teacher's "no entry means
/// exclusively owned" default.
pub fn refcount(paddr: u64) -> u32 {
    REFCOUNTS.lock().get(&frame_number(paddr)).copied().unwrap_or(1)
}

/// Increment a frame's refcount, inserting it at 2 if this is the first
/// time it becomes shared.
pub fn inc_refcount(paddr: u64) {
    let mut map = REFCOUNTS.lock();
    map.entry(frame_number(paddr))
        .and_modify(|c| *c += 1)
        .or_insert(2);
}

/// Decrement a frame's refcount. Returns the count after decrementing.
/// Drops the map entry once the count reaches 1 (back to "exclusively
/// owned", so future lookups take the fast `unwrap_or(1)` path).
pub fn dec_refcount(paddr: u64) -> u32 {
    let mut map = REFCOUNTS.lock();
    let key = frame_number(paddr);
    let remaining = match map.get_mut(&key) {
        Some(c) => {
            *c -= 1;
            *c
        }
        None => 0,
    };
    if remaining <= 1 {
        map.remove(&key);
        1
    } else {
        remaining
    }
}

pub fn is_shared(paddr: u64) -> bool {
    refcount(paddr) > 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_frame_is_exclusively_owned() {
        assert_eq!(refcount(0x9000), 1);
        assert!(!is_shared(0x9000));
    }

    #[test]
    fn sharing_tracks_through_inc_and_dec() {
        let frame = 0x1_2000;
        set_refcount(frame, 2);
        assert!(is_shared(frame));

        inc_refcount(frame);
        assert_eq!(refcount(frame), 3);

        assert_eq!(dec_refcount(frame), 2);
        assert!(is_shared(frame));

        assert_eq!(dec_refcount(frame), 1);
        assert!(!is_shared(frame));
    }
}
