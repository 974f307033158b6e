//! Short separator keys for tree index levels.
//!
//! Interior nodes store estimated bounds rather than true ones. These helpers
//! pick compact keys that still order correctly against the true bounds.

use std::cmp::Ordering;

use crate::error::{FramedexError, Result};
use crate::types::{Key, Scalar};

/// A compact scalar that sorts at or above `thing`.
pub fn larger_scalar(thing: &Scalar) -> Scalar {
    match thing {
        Scalar::Text(_) => Scalar::Max,
        other => other.clone(),
    }
}

/// A compact scalar that sorts at or below `thing`.
pub fn smaller_scalar(thing: &Scalar) -> Scalar {
    match thing {
        Scalar::Text(_) => Scalar::Text(String::new()),
        other => other.clone(),
    }
}

/// A key at or above every key that does not start with `Max`.
pub fn larger(key: &Key) -> Key {
    match key.first() {
        Some(Scalar::Max) => key.clone(),
        _ => Key::max(),
    }
}

/// The empty key sorts before everything.
pub fn smaller(_key: &Key) -> Key {
    Key::default()
}

fn between_text(low: &str, high: &str, at_left_ok: bool) -> String {
    if high.starts_with(low) {
        if at_left_ok {
            return low.to_owned();
        }
        let count = low.chars().count() + 1;
        return high.chars().take(count).collect();
    }
    let common = low.chars().count().min(high.chars().count());
    for (i, (lc, hc)) in low
        .chars()
        .zip(high.chars())
        .take(common.saturating_sub(1))
        .enumerate()
    {
        if lc != hc {
            return high.chars().take(i + 1).collect();
        }
    }
    if at_left_ok {
        low.to_owned()
    } else {
        let mut out = low.to_owned();
        out.push('\0');
        out
    }
}

/// Scalar separator; requires `low < high`.
pub fn between_scalar(low: &Scalar, high: &Scalar, at_left_ok: bool) -> Scalar {
    match (low, high) {
        (Scalar::Text(l), Scalar::Text(h)) => Scalar::Text(between_text(l, h, at_left_ok)),
        _ if at_left_ok => low.clone(),
        _ => high.clone(),
    }
}

fn extend(prefix: &[Scalar], tail: impl IntoIterator<Item = Scalar>) -> Key {
    Key(prefix.iter().cloned().chain(tail).collect())
}

/// Pick a short key between `low` and `high`.
///
/// With `at_left_ok` the result `r` satisfies `low <= r < high`; otherwise
/// `low < r <= high`.
pub fn between(low: &Key, high: &Key, at_left_ok: bool) -> Result<Key> {
    if low >= high {
        return Err(FramedexError::out_of_order(format!(
            "separator bounds reversed: {low} >= {high}"
        )));
    }
    let lows = low.parts();
    let highs = high.parts();
    let (nlow, nhigh) = (lows.len(), highs.len());
    let fallback = || if at_left_ok { low.clone() } else { high.clone() };
    for i in 0..nlow.min(nhigh) {
        let (lowi, highi) = (&lows[i], &highs[i]);
        if lowi == highi {
            continue;
        }
        if lowi > highi {
            return Err(FramedexError::out_of_order(format!(
                "component {i} reversed in {low} / {high}"
            )));
        }
        let splitter = between_scalar(lowi, highi, at_left_ok);
        if splitter > *lowi && splitter < *highi {
            return Ok(extend(&lows[..i], [splitter]));
        }
        if i + 1 < nlow && splitter == *lowi {
            let large = larger_scalar(&lows[i + 1]);
            if large.cmp(&lows[i + 1]) != Ordering::Equal {
                return Ok(extend(&lows[..i], [splitter, large]));
            }
            return Ok(fallback());
        }
        if i + 1 < nhigh && splitter == *highi {
            let small = smaller_scalar(&highs[i + 1]);
            if small.cmp(&highs[i + 1]) != Ordering::Equal {
                return Ok(extend(&lows[..i], [splitter, small]));
            }
            return Ok(fallback());
        }
        break;
    }
    if at_left_ok {
        Ok(low.clone())
    } else if nhigh > nlow && highs[..nlow] == lows[..] {
        Ok(extend(lows, [smaller_scalar(&highs[nlow])]))
    } else {
        Ok(high.clone())
    }
}
