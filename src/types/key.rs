//! Ordered keys and their scalar components.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// One component of a [`Key`].
///
/// Scalars are totally ordered: numbers (integer and float compared by value)
/// sort before text, text before bytes, and `Max` after everything.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Scalar {
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Max,
}

impl Scalar {
    fn rank(&self) -> u8 {
        match self {
            Self::Int(_) | Self::Float(_) => 0,
            Self::Text(_) => 1,
            Self::Bytes(_) => 2,
            Self::Max => 3,
        }
    }

    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn same_kind(&self, other: &Self) -> bool {
        self.rank() == other.rank()
    }
}

/// Exact comparison of an integer with a float, placed in the float's
/// `total_cmp` order. `0` sorts with `+0.0`, after `-0.0`.
fn int_float_cmp(int: i64, float: f64) -> Ordering {
    // 2^63: the first float above every i64.
    const LIMIT: f64 = 9_223_372_036_854_775_808.0;
    if float.is_nan() {
        return if float.is_sign_negative() {
            Ordering::Greater
        } else {
            Ordering::Less
        };
    }
    if float >= LIMIT {
        return Ordering::Less;
    }
    if float < -LIMIT {
        return Ordering::Greater;
    }
    let whole = float.trunc();
    #[allow(clippy::cast_possible_truncation)]
    let whole_int = whole as i64;
    match int.cmp(&whole_int) {
        Ordering::Equal if float > whole => Ordering::Less,
        Ordering::Equal if float < whole => Ordering::Greater,
        Ordering::Equal if float.is_sign_negative() && int == 0 => Ordering::Greater,
        other => other,
    }
}

impl Ord for Scalar {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => a.cmp(b),
            (Self::Float(a), Self::Float(b)) => a.total_cmp(b),
            (Self::Int(a), Self::Float(b)) => int_float_cmp(*a, *b),
            (Self::Float(a), Self::Int(b)) => int_float_cmp(*b, *a).reverse(),
            (Self::Text(a), Self::Text(b)) => a.cmp(b),
            (Self::Bytes(a), Self::Bytes(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for Scalar {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Scalar {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Scalar {}

impl From<&str> for Scalar {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<String> for Scalar {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for Scalar {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<Vec<u8>> for Scalar {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(s) => write!(f, "{s:?}"),
            Self::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Self::Max => f.write_str("MAX"),
        }
    }
}

/// A tuple of scalars compared lexicographically. A proper prefix sorts first.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Key(pub SmallVec<[Scalar; 4]>);

impl Key {
    pub fn new<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Scalar>,
    {
        Self(parts.into_iter().map(Into::into).collect())
    }

    /// The key that sorts after every other key.
    pub fn max() -> Self {
        Self(smallvec::smallvec![Scalar::Max])
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn parts(&self) -> &[Scalar] {
        &self.0
    }

    pub fn get(&self, index: usize) -> Option<&Scalar> {
        self.0.get(index)
    }

    pub fn last(&self) -> Option<&Scalar> {
        self.0.last()
    }

    pub fn first(&self) -> Option<&Scalar> {
        self.0.first()
    }

    #[must_use]
    pub fn with(&self, part: impl Into<Scalar>) -> Self {
        let mut out = self.clone();
        out.0.push(part.into());
        out
    }

    #[must_use]
    pub fn prefix(&self, len: usize) -> Self {
        Self(self.0.iter().take(len).cloned().collect())
    }

    pub fn starts_with(&self, prefix: &Key) -> bool {
        prefix.len() <= self.len() && self.0[..prefix.len()] == prefix.0[..]
    }

    /// Position of `self` relative to a key range, used when probing.
    pub fn is_within(&self, low: &Key, high: &Key) -> bool {
        low <= self && self < high
    }
}

impl From<Vec<Scalar>> for Key {
    fn from(parts: Vec<Scalar>) -> Self {
        Self(SmallVec::from_vec(parts))
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, part) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{part}")?;
        }
        f.write_str(")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn large_integers_compare_exactly_with_floats() {
        let big = 1_i64 << 53;
        let float = Scalar::Float(big as f64);
        assert!(Scalar::Int(big + 1) > float);
        assert!(float < Scalar::Int(big + 1));
        assert_eq!(Scalar::Int(big), float);
        assert!(Scalar::Int(i64::MAX) < Scalar::Float(9.3e18));
        assert!(Scalar::Int(i64::MIN) > Scalar::Float(-9.3e18));
        assert_eq!(Scalar::Int(i64::MIN), Scalar::Float(-9_223_372_036_854_775_808.0));
        assert!(Scalar::Int(2) < Scalar::Float(2.5));
        assert!(Scalar::Int(-2) > Scalar::Float(-2.5));
        assert!(Scalar::Int(0) > Scalar::Float(-0.0));
        assert_eq!(Scalar::Int(0), Scalar::Float(0.0));
        assert!(Scalar::Int(i64::MAX) < Scalar::Float(f64::NAN));
        assert!(Scalar::Int(i64::MIN) > Scalar::Float(-f64::NAN));

        let mut items = vec![Scalar::Int(big + 1), float.clone(), Scalar::Int(big - 1)];
        items.sort();
        assert_eq!(items, vec![Scalar::Int(big - 1), float, Scalar::Int(big + 1)]);
    }

    #[test]
    fn scalars_order_across_kinds() {
        let mut items = vec![
            Scalar::Max,
            Scalar::text("b"),
            Scalar::Bytes(vec![0]),
            Scalar::Float(2.5),
            Scalar::Int(3),
            Scalar::Int(-1),
            Scalar::text(""),
        ];
        items.sort();
        assert_eq!(
            items,
            vec![
                Scalar::Int(-1),
                Scalar::Float(2.5),
                Scalar::Int(3),
                Scalar::text(""),
                Scalar::text("b"),
                Scalar::Bytes(vec![0]),
                Scalar::Max,
            ]
        );
    }

    #[test]
    fn prefix_sorts_first() {
        let short = Key::new(["a"]);
        let long = Key::new(["a", "b"]);
        assert!(short < long);
        assert!(long < Key::new(["a"]).with(Scalar::Max));
        assert!(long.starts_with(&short));
        assert!(Key::max() > Key::new(["zzzz", "zzzz"]));
    }

    #[test]
    fn key_round_trips_through_bincode() {
        let key = Key::new(["attr"]).with(7_i64).with(vec![1_u8, 2]);
        let bytes = bincode::serde::encode_to_vec(&key, bincode::config::standard()).unwrap();
        let (decoded, _): (Key, usize) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard()).unwrap();
        assert_eq!(decoded, key);
    }
}
