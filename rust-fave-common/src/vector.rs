//! Ternary bit vectors and header spaces.
//!
//! A [`Vector`] is a fixed-length string over `{0, 1, x}` where `x` matches
//! either bit. A [`HeaderSpace`] is the union of its included vectors minus
//! the union of its excluded vectors.

use crate::error::Error;
use crate::mapping::FieldMapping;
use crate::Result;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// One ternary bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bit {
    Zero,
    One,
    /// Don't care.
    Any,
}

impl Bit {
    pub fn from_char(c: char) -> Option<Bit> {
        match c {
            '0' => Some(Bit::Zero),
            '1' => Some(Bit::One),
            'x' | 'X' => Some(Bit::Any),
            _ => None,
        }
    }

    pub fn as_char(self) -> char {
        match self {
            Bit::Zero => '0',
            Bit::One => '1',
            Bit::Any => 'x',
        }
    }

    /// The complementary fixed bit; `x` stays `x`.
    pub fn flipped(self) -> Bit {
        match self {
            Bit::Zero => Bit::One,
            Bit::One => Bit::Zero,
            Bit::Any => Bit::Any,
        }
    }
}

/* ---------------------------------------------------------------- *
 * Vector
 * ---------------------------------------------------------------- */

/// Fixed-length ternary bit string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Vector {
    bits: Vec<Bit>,
}

impl Vector {
    /// A vector of `length` don't-care bits.
    pub fn new(length: usize) -> Self {
        Self::filled(length, Bit::Any)
    }

    pub fn filled(length: usize, bit: Bit) -> Self {
        Self {
            bits: vec![bit; length],
        }
    }

    pub fn from_bits(bits: Vec<Bit>) -> Self {
        Self { bits }
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    pub fn bits(&self) -> &[Bit] {
        &self.bits
    }

    /// Whether every bit is `x`.
    pub fn is_wildcard(&self) -> bool {
        self.bits.iter().all(|b| *b == Bit::Any)
    }

    /// Positions holding a `0` or `1`.
    pub fn fixed_positions(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits
            .iter()
            .enumerate()
            .filter(|(_, b)| **b != Bit::Any)
            .map(|(i, _)| i)
    }

    fn check_range(&self, start: usize, stop: usize) -> Result<()> {
        if start > stop || stop > self.bits.len() {
            return Err(Error::OutOfBounds {
                start,
                stop,
                length: self.bits.len(),
            });
        }
        Ok(())
    }

    /// Copy of bits `start..stop`.
    pub fn slice_get(&self, start: usize, stop: usize) -> Result<Vector> {
        self.check_range(start, stop)?;
        Ok(Vector::from_bits(self.bits[start..stop].to_vec()))
    }

    /// Overwrite bits `start..stop` with `bits`.
    pub fn slice_set(&mut self, start: usize, stop: usize, bits: &Vector) -> Result<()> {
        self.check_range(start, stop)?;
        if stop - start != bits.len() {
            return Err(Error::LengthMismatch {
                expected: stop - start,
                actual: bits.len(),
            });
        }
        self.bits[start..stop].copy_from_slice(&bits.bits);
        Ok(())
    }

    /// Append `n` don't-care bits.
    pub fn enlarge(&mut self, n: usize) {
        self.bits.resize(self.bits.len() + n, Bit::Any);
    }

    pub fn field_get(&self, mapping: &FieldMapping, field: &str) -> Result<Vector> {
        let offset = mapping.offset_of(field)?;
        let width = mapping.width_of(field)?;
        self.slice_get(offset, offset + width)
    }

    pub fn field_set(&mut self, mapping: &FieldMapping, field: &str, bits: &Vector) -> Result<()> {
        let offset = mapping.offset_of(field)?;
        let width = mapping.width_of(field)?;
        self.slice_set(offset, offset + width, bits)
    }

    /// Copy `field` from `src` laid out by `src_mapping` into `dst` laid out
    /// by `dst_mapping`.
    pub fn copy_field(
        src_mapping: &FieldMapping,
        dst_mapping: &FieldMapping,
        src: &Vector,
        dst: &mut Vector,
        field: &str,
    ) -> Result<()> {
        let bits = src.field_get(src_mapping, field)?;
        dst.field_set(dst_mapping, field, &bits)
    }

    /// Rebuild this vector under `dst` for every field of `src`.
    pub fn align(&self, src: &FieldMapping, dst: &FieldMapping) -> Result<Vector> {
        if self.len() != src.length() {
            return Err(Error::LengthMismatch {
                expected: src.length(),
                actual: self.len(),
            });
        }
        let mut aligned = Vector::new(dst.length());
        for (field, _, _) in src.fields() {
            Vector::copy_field(src, dst, self, &mut aligned, field)?;
        }
        Ok(aligned)
    }
}

impl FromStr for Vector {
    type Err = Error;

    /// Parse a ternary string; `,` separators and whitespace are ignored.
    fn from_str(s: &str) -> Result<Self> {
        s.chars()
            .filter(|c| *c != ',' && !c.is_whitespace())
            .map(|c| Bit::from_char(c).ok_or_else(|| Error::invalid_value("vector", s)))
            .collect::<Result<Vec<Bit>>>()
            .map(Vector::from_bits)
    }
}

impl fmt::Display for Vector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for bit in &self.bits {
            write!(f, "{}", bit.as_char())?;
        }
        Ok(())
    }
}

impl Serialize for Vector {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Vector {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/* ---------------------------------------------------------------- *
 * Header space
 * ---------------------------------------------------------------- */

#[derive(Deserialize)]
struct RawHeaderSpace {
    length: usize,
    #[serde(default)]
    hs_list: Vec<Vector>,
    #[serde(default)]
    hs_diff: Vec<Vector>,
}

/// `⋃ hs_list \ ⋃ hs_diff`, all vectors sharing `length`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawHeaderSpace")]
pub struct HeaderSpace {
    length: usize,
    hs_list: Vec<Vector>,
    hs_diff: Vec<Vector>,
}

impl TryFrom<RawHeaderSpace> for HeaderSpace {
    type Error = Error;

    fn try_from(raw: RawHeaderSpace) -> Result<Self> {
        HeaderSpace::from_parts(raw.length, raw.hs_list, raw.hs_diff)
    }
}

impl HeaderSpace {
    /// The empty header space.
    pub fn new(length: usize) -> Self {
        Self {
            length,
            hs_list: Vec::new(),
            hs_diff: Vec::new(),
        }
    }

    pub fn from_parts(length: usize, hs_list: Vec<Vector>, hs_diff: Vec<Vector>) -> Result<Self> {
        if let Some(bad) = hs_list.iter().chain(hs_diff.iter()).find(|v| v.len() != length) {
            return Err(Error::LengthMismatch {
                expected: length,
                actual: bad.len(),
            });
        }
        Ok(Self {
            length,
            hs_list,
            hs_diff,
        })
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn included(&self) -> &[Vector] {
        &self.hs_list
    }

    pub fn excluded(&self) -> &[Vector] {
        &self.hs_diff
    }

    pub fn is_empty(&self) -> bool {
        self.hs_list.is_empty()
    }

    pub fn include(&mut self, vector: Vector) -> Result<()> {
        self.check(&vector)?;
        self.hs_list.push(vector);
        Ok(())
    }

    pub fn exclude(&mut self, vector: Vector) -> Result<()> {
        self.check(&vector)?;
        self.hs_diff.push(vector);
        Ok(())
    }

    fn check(&self, vector: &Vector) -> Result<()> {
        if vector.len() != self.length {
            return Err(Error::LengthMismatch {
                expected: self.length,
                actual: vector.len(),
            });
        }
        Ok(())
    }

    /// Append `n` don't-care bits to every vector.
    pub fn enlarge(&mut self, n: usize) {
        self.length += n;
        for v in self.hs_list.iter_mut().chain(self.hs_diff.iter_mut()) {
            v.enlarge(n);
        }
    }

    /// Rebuild the header space under another field layout.
    pub fn align(&self, src: &FieldMapping, dst: &FieldMapping) -> Result<HeaderSpace> {
        let list = self
            .hs_list
            .iter()
            .map(|v| v.align(src, dst))
            .collect::<Result<Vec<_>>>()?;
        let diff = self
            .hs_diff
            .iter()
            .map(|v| v.align(src, dst))
            .collect::<Result<Vec<_>>>()?;
        HeaderSpace::from_parts(dst.length(), list, diff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Vector {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_and_display() {
        let vector = v("01x,10x");
        assert_eq!(vector.len(), 6);
        assert_eq!(vector.to_string(), "01x10x");
        assert!("01a".parse::<Vector>().is_err());
    }

    #[test]
    fn test_slice_set_then_get() {
        let mut vector = Vector::new(16);
        vector.slice_set(4, 8, &v("1010")).unwrap();
        assert_eq!(vector.slice_get(4, 8).unwrap(), v("1010"));
        assert_eq!(vector.to_string(), "xxxx1010xxxxxxxx");

        // Empty range is fine
        assert_eq!(vector.slice_get(3, 3).unwrap().len(), 0);
    }

    #[test]
    fn test_slice_errors() {
        let mut vector = Vector::new(8);
        assert!(matches!(
            vector.slice_set(0, 4, &v("101")),
            Err(Error::LengthMismatch { expected: 4, actual: 3 })
        ));
        assert!(matches!(
            vector.slice_get(4, 9),
            Err(Error::OutOfBounds { length: 8, .. })
        ));
        assert!(vector.slice_get(5, 4).is_err());
    }

    #[test]
    fn test_enlarge_composes() {
        let base = v("10x1");
        let mut twice = base.clone();
        twice.enlarge(3);
        twice.enlarge(5);

        let mut once = base.clone();
        once.enlarge(8);

        assert_eq!(twice, once);
        assert_eq!(twice.slice_get(0, 4).unwrap(), base);
        assert_eq!(twice.len(), 12);
    }

    #[test]
    fn test_field_set_keeps_other_fields() {
        let mut mapping = FieldMapping::new();
        mapping.extend("packet.ipv6.proto").unwrap();
        mapping.extend("packet.upper.dport").unwrap();

        let mut vector = Vector::new(mapping.length());
        vector
            .field_set(&mapping, "packet.ipv6.proto", &v("00000110"))
            .unwrap();
        vector
            .field_set(&mapping, "packet.upper.dport", &v("0000000001010000"))
            .unwrap();

        assert_eq!(
            vector.field_get(&mapping, "packet.ipv6.proto").unwrap(),
            v("00000110")
        );
        assert_eq!(
            vector.field_get(&mapping, "packet.upper.dport").unwrap(),
            v("0000000001010000")
        );
        assert!(vector.field_get(&mapping, "module").is_err());
    }

    #[test]
    fn test_copy_field_between_layouts() {
        let mut src_map = FieldMapping::new();
        src_map.extend("packet.ipv6.proto").unwrap();
        src_map.extend("module.state").unwrap();

        let mut dst_map = FieldMapping::new();
        dst_map.extend("module.state").unwrap();
        dst_map.extend("packet.upper.dport").unwrap();
        dst_map.extend("packet.ipv6.proto").unwrap();

        let mut src = Vector::new(src_map.length());
        src.field_set(&src_map, "module.state", &v("00000100")).unwrap();
        src.field_set(&src_map, "packet.ipv6.proto", &v("00010001")).unwrap();

        let aligned = src.align(&src_map, &dst_map).unwrap();
        assert_eq!(aligned.len(), 32);
        assert_eq!(aligned.field_get(&dst_map, "module.state").unwrap(), v("00000100"));
        assert_eq!(aligned.field_get(&dst_map, "packet.ipv6.proto").unwrap(), v("00010001"));
        assert!(aligned
            .field_get(&dst_map, "packet.upper.dport")
            .unwrap()
            .is_wildcard());
    }

    #[test]
    fn test_header_space_validation() {
        assert!(HeaderSpace::from_parts(4, vec![v("10xx")], vec![v("101")]).is_err());

        let mut hs = HeaderSpace::new(4);
        hs.include(v("1xxx")).unwrap();
        hs.exclude(v("11xx")).unwrap();
        assert!(hs.include(v("1")).is_err());

        hs.enlarge(2);
        assert_eq!(hs.length(), 6);
        assert_eq!(hs.included()[0], v("1xxxxx"));
        assert_eq!(hs.excluded()[0], v("11xxxx"));
    }

    #[test]
    fn test_header_space_json() {
        let mut hs = HeaderSpace::new(3);
        hs.include(v("1x0")).unwrap();
        hs.exclude(v("110")).unwrap();

        let json = serde_json::to_value(&hs).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"length": 3, "hs_list": ["1x0"], "hs_diff": ["110"]})
        );
        let parsed: HeaderSpace = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, hs);

        // Mismatching vector lengths are rejected on decode
        let bad = serde_json::json!({"length": 3, "hs_list": ["1x"]});
        assert!(serde_json::from_value::<HeaderSpace>(bad).is_err());
    }
}
