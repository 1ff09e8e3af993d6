//! Global field layout.
//!
//! A [`FieldMapping`] assigns every packet field a start offset inside one
//! bit vector. Fields are only ever appended: existing offsets never move
//! and are never reused.

use crate::error::Error;
use crate::field::field_width;
use crate::Result;
use log::debug;
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::{BTreeMap, HashMap};

/// Key under which the total length is stored in the JSON form.
const LENGTH_KEY: &str = "length";

/// Append-only map `field -> offset`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "BTreeMap<String, usize>")]
pub struct FieldMapping {
    order: Vec<String>,
    offsets: HashMap<String, usize>,
    length: usize,
}

impl FieldMapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a mapping by extending with `fields` in order.
    pub fn from_fields<I, S>(fields: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut mapping = Self::new();
        for field in fields {
            mapping.extend(field.as_ref())?;
        }
        Ok(mapping)
    }

    /// Total number of bits.
    pub fn length(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, field: &str) -> bool {
        self.offsets.contains_key(field)
    }

    /// Append `field` at the current end and return its offset.
    pub fn extend(&mut self, field: &str) -> Result<usize> {
        if self.contains(field) {
            return Err(Error::DuplicateField(field.to_string()));
        }
        let width = field_width(field).ok_or_else(|| Error::UnknownField(field.to_string()))?;
        let offset = self.length;
        self.order.push(field.to_string());
        self.offsets.insert(field.to_string(), offset);
        self.length += width;
        debug!("Mapped {} at offset {} ({} bits)", field, offset, width);
        Ok(offset)
    }

    /// Append `field` unless it is already present; returns its offset.
    pub fn ensure(&mut self, field: &str) -> Result<usize> {
        match self.offsets.get(field) {
            Some(offset) => Ok(*offset),
            None => self.extend(field),
        }
    }

    /// Absorb every field of `other`.
    ///
    /// Fields missing here are appended in `other`'s offset order. The result
    /// holds one `(offset_in_other, offset_in_self)` pair for each field of
    /// `other`, so vectors laid out by `other` can be re-sliced.
    pub fn merge(&mut self, other: &FieldMapping) -> Result<Vec<(usize, usize)>> {
        other
            .fields()
            .map(|(field, old, _)| self.ensure(field).map(|new| (old, new)))
            .collect()
    }

    pub fn offset_of(&self, field: &str) -> Result<usize> {
        self.offsets
            .get(field)
            .copied()
            .ok_or_else(|| Error::UnknownField(field.to_string()))
    }

    pub fn width_of(&self, field: &str) -> Result<usize> {
        if !self.contains(field) {
            return Err(Error::UnknownField(field.to_string()));
        }
        field_width(field).ok_or_else(|| Error::UnknownField(field.to_string()))
    }

    /// `(field, offset, width)` in insertion order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, usize, usize)> + '_ {
        self.order.iter().map(move |f| {
            let offset = self.offsets[f];
            (f.as_str(), offset, field_width(f).unwrap_or(0))
        })
    }
}

impl Serialize for FieldMapping {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.order.len() + 1))?;
        for (field, offset, _) in self.fields() {
            map.serialize_entry(field, &offset)?;
        }
        map.serialize_entry(LENGTH_KEY, &self.length)?;
        map.end()
    }
}

impl TryFrom<BTreeMap<String, usize>> for FieldMapping {
    type Error = Error;

    fn try_from(mut raw: BTreeMap<String, usize>) -> Result<Self> {
        let length = raw.remove(LENGTH_KEY);

        let mut by_offset: Vec<(usize, String)> = raw.into_iter().map(|(f, o)| (o, f)).collect();
        by_offset.sort();

        let mut mapping = FieldMapping::new();
        for (offset, field) in by_offset {
            let placed = mapping.extend(&field)?;
            if placed != offset {
                return Err(Error::Decode(format!(
                    "mapping field {} at offset {} leaves a gap (expected {})",
                    field, offset, placed
                )));
            }
        }

        if let Some(length) = length {
            if length != mapping.length {
                return Err(Error::LengthMismatch {
                    expected: mapping.length,
                    actual: length,
                });
            }
        }
        Ok(mapping)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offsets_are_prefix_sums() {
        let mut mapping = FieldMapping::new();
        assert_eq!(mapping.extend("packet.ipv6.destination").unwrap(), 0);
        assert_eq!(mapping.extend("packet.ipv6.proto").unwrap(), 128);
        assert_eq!(mapping.extend("packet.upper.dport").unwrap(), 136);
        assert_eq!(mapping.length(), 152);

        assert_eq!(mapping.offset_of("packet.upper.dport").unwrap(), 136);
        assert_eq!(mapping.width_of("packet.upper.dport").unwrap(), 16);
    }

    #[test]
    fn test_extend_errors() {
        let mut mapping = FieldMapping::new();
        mapping.extend("module").unwrap();
        assert!(matches!(mapping.extend("module"), Err(Error::DuplicateField(_))));
        assert!(matches!(mapping.extend("no.such.field"), Err(Error::UnknownField(_))));
        assert!(matches!(mapping.offset_of("interface"), Err(Error::UnknownField(_))));
        assert_eq!(mapping.length(), 8);
    }

    #[test]
    fn test_merge_never_moves_existing_fields() {
        let mut global = FieldMapping::from_fields(["packet.ipv6.proto", "module.state"]).unwrap();
        let other =
            FieldMapping::from_fields(["packet.upper.sport", "packet.ipv6.proto", "in_port"]).unwrap();

        let pairs = global.merge(&other).unwrap();

        // Old fields unchanged
        assert_eq!(global.offset_of("packet.ipv6.proto").unwrap(), 0);
        assert_eq!(global.offset_of("module.state").unwrap(), 8);
        // New fields appended in other's order
        assert_eq!(global.offset_of("packet.upper.sport").unwrap(), 16);
        assert_eq!(global.offset_of("in_port").unwrap(), 32);
        assert_eq!(global.length(), 64);

        assert_eq!(pairs, vec![(0, 16), (16, 0), (24, 32)]);

        // Merging again is a no-op
        global.merge(&other).unwrap();
        assert_eq!(global.length(), 64);
    }

    #[test]
    fn test_json_form() {
        let mapping = FieldMapping::from_fields(["packet.upper.dport", "module"]).unwrap();
        let json = serde_json::to_string(&mapping).unwrap();
        assert_eq!(json, r#"{"packet.upper.dport":0,"module":16,"length":24}"#);

        let parsed: FieldMapping = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, mapping);
        assert_eq!(parsed.fields().map(|(f, _, _)| f).collect::<Vec<_>>(), vec!["packet.upper.dport", "module"]);
    }

    #[test]
    fn test_json_rejects_gaps() {
        let json = r#"{"packet.upper.dport":0,"module":20,"length":28}"#;
        assert!(serde_json::from_str::<FieldMapping>(json).is_err());

        let json = r#"{"module":0,"length":9}"#;
        assert!(serde_json::from_str::<FieldMapping>(json).is_err());
    }
}
