//! Client-side identifiers whose lexicographic order matches creation order.
//!
//! An id is `<prefix>_<16 hex digits><14 base62 chars>`. The hex block packs
//! the millisecond clock with a per-millisecond counter, so two ids created in
//! the same process always compare in creation order, and ids created later
//! by the server for the same collection sort after them.

use std::sync::Mutex;

use rand::Rng;

const RANDOM_LEN: usize = 14;
const BASE62: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
const COUNTER_BITS: u32 = 12;

static CLOCK: Mutex<(u64, u64)> = Mutex::new((0, 0));

pub fn ascending(prefix: &str) -> String {
    ascending_at(prefix, crate::now_ms())
}

pub(crate) fn ascending_at(prefix: &str, now_ms: u64) -> String {
    let packed = {
        let mut clock = CLOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let (last_ms, counter) = *clock;
        // Never step backwards, even if the wall clock does.
        let (ms, counter) = if now_ms > last_ms {
            (now_ms, 0)
        } else {
            (last_ms, counter + 1)
        };
        let (ms, counter) = if counter >= 1 << COUNTER_BITS {
            (ms + 1, 0)
        } else {
            (ms, counter)
        };
        *clock = (ms, counter);
        (ms << COUNTER_BITS) | counter
    };

    let mut rng = rand::thread_rng();
    let suffix: String = (0..RANDOM_LEN)
        .map(|_| BASE62[rng.gen_range(0..BASE62.len())] as char)
        .collect();
    format!("{prefix}_{packed:016x}{suffix}")
}
