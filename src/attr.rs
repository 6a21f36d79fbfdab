//! Attribute Dictionary
//!
//! Every packet carries an ordered map of typed attributes in a single
//! dense byte buffer. Well-known attribute names ("f.def", "k.latency",
//! "t.pid", ...) are encoded as one-byte *shorthand* type codes that imply
//! both the name and the base type, keeping the common case at a few bytes
//! per attribute. Everything else uses the long form:
//!
//! ```text
//! shorthand, fixed size : [code >= 0x80][value]
//! shorthand, var size   : [code >= 0x80][len u16 LE][value]
//! long form             : [base type][len u16 LE][name NUL][value]
//! ```
//!
//! The u16 length covers everything after it (name and value for the long
//! form). Records keep insertion order; an update that does not grow the
//! value rewrites in place, otherwise the record is deleted and re-appended.

use crate::error::{Error, Result};

/// Base types an attribute value can have
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrType {
    /// Presence flag, no value bytes
    Void,
    /// One byte, 0 or 1
    Bool,
    /// One byte unsigned
    SmallUnsigned,
    /// One byte signed
    SmallInt,
    /// 64-bit unsigned, little-endian
    Unsigned,
    /// 64-bit signed, little-endian
    Int,
    /// IEEE-754 double, little-endian
    Float,
    /// num (i64) / den (u64), little-endian
    Rational,
    /// UTF-8, NUL-terminated on the wire
    String,
    /// Raw bytes, length carried by the record
    Opaque,
}

impl AttrType {
    fn code(self) -> u8 {
        match self {
            AttrType::Void => 1,
            AttrType::Bool => 2,
            AttrType::SmallUnsigned => 3,
            AttrType::SmallInt => 4,
            AttrType::Unsigned => 5,
            AttrType::Int => 6,
            AttrType::Float => 7,
            AttrType::Rational => 8,
            AttrType::String => 9,
            AttrType::Opaque => 10,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            1 => AttrType::Void,
            2 => AttrType::Bool,
            3 => AttrType::SmallUnsigned,
            4 => AttrType::SmallInt,
            5 => AttrType::Unsigned,
            6 => AttrType::Int,
            7 => AttrType::Float,
            8 => AttrType::Rational,
            9 => AttrType::String,
            10 => AttrType::Opaque,
            _ => return None,
        })
    }

    /// Encoded value size for fixed-size types
    fn fixed_size(self) -> Option<usize> {
        match self {
            AttrType::Void => Some(0),
            AttrType::Bool | AttrType::SmallUnsigned | AttrType::SmallInt => Some(1),
            AttrType::Unsigned | AttrType::Int | AttrType::Float => Some(8),
            AttrType::Rational => Some(16),
            AttrType::String | AttrType::Opaque => None,
        }
    }
}

/// A rational number attribute (e.g. frame rate, sample aspect ratio)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rational {
    /// Numerator
    pub num: i64,
    /// Denominator, never 0
    pub den: u64,
}

/// First shorthand code; codes below are base types or reserved
const SHORTHAND_BASE: u8 = 0x80;

/// Well-known attributes, by shorthand code `SHORTHAND_BASE + 1 + index`
///
/// Prefixes: `f.` flow, `k.` clock, `b.` block, `p.` picture, `s.` sound,
/// `t.` transport stream.
const SHORTHANDS: &[(&str, AttrType)] = &[
    ("f.def", AttrType::String),
    ("f.id", AttrType::Unsigned),
    ("f.random", AttrType::Void),
    ("f.disc", AttrType::Void),
    ("f.error", AttrType::Void),
    ("f.end", AttrType::Void),
    ("f.langs", AttrType::SmallUnsigned),
    ("k.duration", AttrType::Unsigned),
    ("k.rate", AttrType::Rational),
    ("k.latency", AttrType::Unsigned),
    ("b.start", AttrType::Void),
    ("b.end", AttrType::Void),
    ("b.octetrate", AttrType::Unsigned),
    ("b.maxdelay", AttrType::Unsigned),
    ("p.num", AttrType::Unsigned),
    ("p.key", AttrType::Void),
    ("p.hsize", AttrType::Unsigned),
    ("p.vsize", AttrType::Unsigned),
    ("p.format", AttrType::String),
    ("p.sar", AttrType::Rational),
    ("p.progressive", AttrType::Void),
    ("s.rate", AttrType::Unsigned),
    ("s.channels", AttrType::SmallUnsigned),
    ("s.samplesize", AttrType::SmallUnsigned),
    ("t.pid", AttrType::Unsigned),
    ("t.pesid", AttrType::SmallUnsigned),
    ("t.pesalign", AttrType::Void),
    ("t.pesmindur", AttrType::Unsigned),
    ("t.tbrate", AttrType::Unsigned),
    ("t.pcr", AttrType::Void),
];

fn shorthand_for(name: &str, ty: AttrType) -> Option<u8> {
    SHORTHANDS
        .iter()
        .position(|&(n, t)| n == name && t == ty)
        .map(|i| SHORTHAND_BASE + 1 + i as u8)
}

fn shorthand_entry(code: u8) -> Option<(&'static str, AttrType)> {
    if code <= SHORTHAND_BASE {
        return None;
    }
    SHORTHANDS.get((code - SHORTHAND_BASE - 1) as usize).copied()
}

/// A decoded attribute value
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    /// Presence flag
    Void,
    /// Boolean
    Bool(bool),
    /// One-byte unsigned
    SmallUnsigned(u8),
    /// One-byte signed
    SmallInt(i8),
    /// 64-bit unsigned
    Unsigned(u64),
    /// 64-bit signed
    Int(i64),
    /// Double
    Float(f64),
    /// Rational
    Rational(Rational),
    /// UTF-8 string
    String(String),
    /// Raw bytes
    Opaque(Vec<u8>),
}

impl AttrValue {
    /// The base type of this value
    pub fn ty(&self) -> AttrType {
        match self {
            AttrValue::Void => AttrType::Void,
            AttrValue::Bool(_) => AttrType::Bool,
            AttrValue::SmallUnsigned(_) => AttrType::SmallUnsigned,
            AttrValue::SmallInt(_) => AttrType::SmallInt,
            AttrValue::Unsigned(_) => AttrType::Unsigned,
            AttrValue::Int(_) => AttrType::Int,
            AttrValue::Float(_) => AttrType::Float,
            AttrValue::Rational(_) => AttrType::Rational,
            AttrValue::String(_) => AttrType::String,
            AttrValue::Opaque(_) => AttrType::Opaque,
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            AttrValue::Void => {}
            AttrValue::Bool(v) => out.push(u8::from(*v)),
            AttrValue::SmallUnsigned(v) => out.push(*v),
            AttrValue::SmallInt(v) => out.push(*v as u8),
            AttrValue::Unsigned(v) => out.extend_from_slice(&v.to_le_bytes()),
            AttrValue::Int(v) => out.extend_from_slice(&v.to_le_bytes()),
            AttrValue::Float(v) => out.extend_from_slice(&v.to_le_bytes()),
            AttrValue::Rational(r) => {
                out.extend_from_slice(&r.num.to_le_bytes());
                out.extend_from_slice(&r.den.to_le_bytes());
            }
            AttrValue::String(s) => {
                out.extend_from_slice(s.as_bytes());
                out.push(0);
            }
            AttrValue::Opaque(b) => out.extend_from_slice(b),
        }
    }

    fn decode(ty: AttrType, raw: &[u8]) -> Result<Self> {
        let fixed = ty.fixed_size();
        if let Some(size) = fixed {
            if raw.len() != size {
                return Err(Error::Invalid);
            }
        }
        Ok(match ty {
            AttrType::Void => AttrValue::Void,
            AttrType::Bool => AttrValue::Bool(raw[0] != 0),
            AttrType::SmallUnsigned => AttrValue::SmallUnsigned(raw[0]),
            AttrType::SmallInt => AttrValue::SmallInt(raw[0] as i8),
            AttrType::Unsigned => {
                AttrValue::Unsigned(u64::from_le_bytes(raw.try_into().map_err(|_| Error::Invalid)?))
            }
            AttrType::Int => {
                AttrValue::Int(i64::from_le_bytes(raw.try_into().map_err(|_| Error::Invalid)?))
            }
            AttrType::Float => {
                AttrValue::Float(f64::from_le_bytes(raw.try_into().map_err(|_| Error::Invalid)?))
            }
            AttrType::Rational => {
                if raw.len() != 16 {
                    return Err(Error::Invalid);
                }
                AttrValue::Rational(Rational {
                    num: i64::from_le_bytes(raw[..8].try_into().unwrap()),
                    den: u64::from_le_bytes(raw[8..].try_into().unwrap()),
                })
            }
            AttrType::String => {
                let without_nul = raw.strip_suffix(&[0]).ok_or(Error::Invalid)?;
                AttrValue::String(
                    std::str::from_utf8(without_nul)
                        .map_err(|_| Error::Invalid)?
                        .to_owned(),
                )
            }
            AttrType::Opaque => AttrValue::Opaque(raw.to_vec()),
        })
    }
}

/// Location of a record inside the raw buffer
struct Record {
    /// Offset of the type byte
    start: usize,
    /// Offset one past the value
    end: usize,
    /// Offset of the value bytes
    value: usize,
    name_is_inline: bool,
}

/// Ordered attribute dictionary with a dense binary encoding
#[derive(Default, Clone)]
pub struct AttrDict {
    raw: Vec<u8>,
}

impl AttrDict {
    /// Empty dictionary
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether no attribute is set
    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// Size of the encoded form in bytes
    pub fn encoded_len(&self) -> usize {
        self.raw.len()
    }

    /// Remove every attribute
    pub fn clear(&mut self) {
        self.raw.clear();
    }

    /// Decode the record starting at `start`, or None at end of buffer
    fn record_at(&self, start: usize) -> Result<Option<Record>> {
        if start >= self.raw.len() {
            return Ok(None);
        }
        let code = self.raw[start];
        if let Some((_, ty)) = shorthand_entry(code) {
            match ty.fixed_size() {
                Some(size) => {
                    let value = start + 1;
                    let end = value + size;
                    if end > self.raw.len() {
                        return Err(Error::Invalid);
                    }
                    Ok(Some(Record {
                        start,
                        end,
                        value,
                        name_is_inline: false,
                    }))
                }
                None => {
                    if start + 3 > self.raw.len() {
                        return Err(Error::Invalid);
                    }
                    let len = u16::from_le_bytes([self.raw[start + 1], self.raw[start + 2]]);
                    let value = start + 3;
                    let end = value + len as usize;
                    if end > self.raw.len() {
                        return Err(Error::Invalid);
                    }
                    Ok(Some(Record {
                        start,
                        end,
                        value,
                        name_is_inline: false,
                    }))
                }
            }
        } else {
            if AttrType::from_code(code).is_none() {
                return Err(Error::Invalid);
            }
            if start + 3 > self.raw.len() {
                return Err(Error::Invalid);
            }
            let len = u16::from_le_bytes([self.raw[start + 1], self.raw[start + 2]]);
            let body = start + 3;
            let end = body + len as usize;
            if end > self.raw.len() {
                return Err(Error::Invalid);
            }
            let nul = self.raw[body..end]
                .iter()
                .position(|&b| b == 0)
                .ok_or(Error::Invalid)?;
            Ok(Some(Record {
                start,
                end,
                value: body + nul + 1,
                name_is_inline: true,
            }))
        }
    }

    fn record_name_type(&self, rec: &Record) -> (&str, AttrType) {
        if rec.name_is_inline {
            let ty = AttrType::from_code(self.raw[rec.start]).expect("validated on decode");
            let name_bytes = &self.raw[rec.start + 3..rec.value - 1];
            (std::str::from_utf8(name_bytes).unwrap_or(""), ty)
        } else {
            shorthand_entry(self.raw[rec.start]).expect("validated on decode")
        }
    }

    fn find(&self, name: &str, ty: AttrType) -> Result<Option<Record>> {
        let mut offset = 0;
        while let Some(rec) = self.record_at(offset)? {
            let (rec_name, rec_ty) = self.record_name_type(&rec);
            if rec_name == name {
                if rec_ty != ty {
                    // Same name under another type elsewhere is still
                    // possible; keep scanning.
                    offset = rec.end;
                    continue;
                }
                return Ok(Some(rec));
            }
            offset = rec.end;
        }
        Ok(None)
    }

    /// Get an attribute by name and type
    ///
    /// Returns `Ok(None)` when absent, `Err(Invalid)` when the stored bytes
    /// cannot decode as the requested type.
    pub fn get(&self, name: &str, ty: AttrType) -> Result<Option<AttrValue>> {
        match self.find(name, ty)? {
            None => Ok(None),
            Some(rec) => AttrValue::decode(ty, &self.raw[rec.value..rec.end]).map(Some),
        }
    }

    /// Set an attribute, replacing any previous value of the same name and
    /// type
    pub fn set(&mut self, name: &str, value: AttrValue) -> Result<()> {
        let ty = value.ty();
        let mut encoded = Vec::new();
        value.encode(&mut encoded);

        if let Some(rec) = self.find(name, ty)? {
            let old_len = rec.end - rec.value;
            if encoded.len() <= old_len {
                // In-place update; shrink the tail if the value got smaller.
                self.raw[rec.value..rec.value + encoded.len()].copy_from_slice(&encoded);
                if encoded.len() < old_len {
                    let shrink = old_len - encoded.len();
                    self.raw.drain(rec.value + encoded.len()..rec.end);
                    self.fix_length(rec.start, shrink)?;
                }
                return Ok(());
            }
            self.raw.drain(rec.start..rec.end);
        }

        self.append(name, ty, &encoded)
    }

    /// Patch a long-form/varsize length field after an in-place shrink
    fn fix_length(&mut self, start: usize, shrink: usize) -> Result<()> {
        let code = self.raw[start];
        let has_len = if let Some((_, ty)) = shorthand_entry(code) {
            ty.fixed_size().is_none()
        } else {
            true
        };
        if has_len {
            let old = u16::from_le_bytes([self.raw[start + 1], self.raw[start + 2]]);
            let new = old.checked_sub(shrink as u16).ok_or(Error::Invalid)?;
            self.raw[start + 1..start + 3].copy_from_slice(&new.to_le_bytes());
        }
        Ok(())
    }

    fn append(&mut self, name: &str, ty: AttrType, encoded: &[u8]) -> Result<()> {
        if let Some(code) = shorthand_for(name, ty) {
            self.raw.push(code);
            if ty.fixed_size().is_none() {
                let len = u16::try_from(encoded.len()).map_err(|_| Error::Invalid)?;
                self.raw.extend_from_slice(&len.to_le_bytes());
            }
            self.raw.extend_from_slice(encoded);
        } else {
            let total = name.len() + 1 + encoded.len();
            let len = u16::try_from(total).map_err(|_| Error::Invalid)?;
            self.raw.push(ty.code());
            self.raw.extend_from_slice(&len.to_le_bytes());
            self.raw.extend_from_slice(name.as_bytes());
            self.raw.push(0);
            self.raw.extend_from_slice(encoded);
        }
        Ok(())
    }

    /// Delete an attribute; `Ok(false)` when it was not set
    pub fn delete(&mut self, name: &str, ty: AttrType) -> Result<bool> {
        match self.find(name, ty)? {
            None => Ok(false),
            Some(rec) => {
                self.raw.drain(rec.start..rec.end);
                Ok(true)
            }
        }
    }

    /// Iterate attributes in insertion order
    pub fn iter(&self) -> AttrIter<'_> {
        AttrIter {
            dict: self,
            offset: 0,
        }
    }

    // Typed convenience accessors. Pipes use these rather than raw
    // get/set so the type byte can never drift from the call site.

    /// Set a presence flag
    pub fn set_void(&mut self, name: &str) -> Result<()> {
        self.set(name, AttrValue::Void)
    }

    /// Whether a presence flag is set
    pub fn has_void(&self, name: &str) -> bool {
        matches!(self.get(name, AttrType::Void), Ok(Some(_)))
    }

    /// Set a string attribute
    pub fn set_string(&mut self, name: &str, value: &str) -> Result<()> {
        self.set(name, AttrValue::String(value.to_owned()))
    }

    /// Get a string attribute
    pub fn string(&self, name: &str) -> Result<Option<String>> {
        Ok(match self.get(name, AttrType::String)? {
            Some(AttrValue::String(s)) => Some(s),
            _ => None,
        })
    }

    /// Set a 64-bit unsigned attribute
    pub fn set_unsigned(&mut self, name: &str, value: u64) -> Result<()> {
        self.set(name, AttrValue::Unsigned(value))
    }

    /// Get a 64-bit unsigned attribute
    pub fn unsigned(&self, name: &str) -> Result<Option<u64>> {
        Ok(match self.get(name, AttrType::Unsigned)? {
            Some(AttrValue::Unsigned(v)) => Some(v),
            _ => None,
        })
    }

    /// Set a one-byte unsigned attribute
    pub fn set_small_unsigned(&mut self, name: &str, value: u8) -> Result<()> {
        self.set(name, AttrValue::SmallUnsigned(value))
    }

    /// Get a one-byte unsigned attribute
    pub fn small_unsigned(&self, name: &str) -> Result<Option<u8>> {
        Ok(match self.get(name, AttrType::SmallUnsigned)? {
            Some(AttrValue::SmallUnsigned(v)) => Some(v),
            _ => None,
        })
    }

    /// Set a rational attribute
    pub fn set_rational(&mut self, name: &str, value: Rational) -> Result<()> {
        self.set(name, AttrValue::Rational(value))
    }

    /// Get a rational attribute
    pub fn rational(&self, name: &str) -> Result<Option<Rational>> {
        Ok(match self.get(name, AttrType::Rational)? {
            Some(AttrValue::Rational(v)) => Some(v),
            _ => None,
        })
    }

    /// Set an opaque attribute
    pub fn set_opaque(&mut self, name: &str, value: &[u8]) -> Result<()> {
        self.set(name, AttrValue::Opaque(value.to_vec()))
    }

    /// Get an opaque attribute
    pub fn opaque(&self, name: &str) -> Result<Option<Vec<u8>>> {
        Ok(match self.get(name, AttrType::Opaque)? {
            Some(AttrValue::Opaque(v)) => Some(v),
            _ => None,
        })
    }
}

impl std::fmt::Debug for AttrDict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for entry in self.iter() {
            match entry {
                Ok((name, value)) => {
                    map.entry(&name, &value);
                }
                Err(_) => {
                    map.entry(&"<corrupt>", &"");
                    break;
                }
            }
        }
        map.finish()
    }
}

/// Iterator over `(name, value)` pairs in insertion order
pub struct AttrIter<'a> {
    dict: &'a AttrDict,
    offset: usize,
}

impl<'a> Iterator for AttrIter<'a> {
    type Item = Result<(&'a str, AttrValue)>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.dict.record_at(self.offset) {
            Err(err) => {
                self.offset = usize::MAX;
                Some(Err(err))
            }
            Ok(None) => None,
            Ok(Some(rec)) => {
                let (name, ty) = self.dict.record_name_type(&rec);
                let value = AttrValue::decode(ty, &self.dict.raw[rec.value..rec.end]);
                self.offset = rec.end;
                Some(value.map(|v| (name, v)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shorthand_round_trip() {
        let mut dict = AttrDict::new();
        dict.set_string("f.def", "block.mpegts.").unwrap();
        dict.set_unsigned("t.pid", 68).unwrap();
        dict.set_void("t.pesalign").unwrap();
        assert_eq!(dict.string("f.def").unwrap().unwrap(), "block.mpegts.");
        assert_eq!(dict.unsigned("t.pid").unwrap().unwrap(), 68);
        assert!(dict.has_void("t.pesalign"));
        // f.def shorthand: 1 code + 2 len + 14 value (incl. NUL)
        // t.pid shorthand: 1 code + 8 value
        // t.pesalign shorthand: 1 code
        assert_eq!(dict.encoded_len(), 17 + 9 + 1);
    }

    #[test]
    fn long_form_round_trip() {
        let mut dict = AttrDict::new();
        dict.set_unsigned("x.custom", 1234).unwrap();
        dict.set_opaque("x.blob", &[1, 2, 3]).unwrap();
        assert_eq!(dict.unsigned("x.custom").unwrap().unwrap(), 1234);
        assert_eq!(dict.opaque("x.blob").unwrap().unwrap(), vec![1, 2, 3]);
        assert_eq!(dict.unsigned("x.other").unwrap(), None);
    }

    #[test]
    fn wrong_type_is_invisible() {
        let mut dict = AttrDict::new();
        dict.set_unsigned("x.attr", 5).unwrap();
        // Same name, different type: a distinct attribute.
        assert_eq!(dict.string("x.attr").unwrap(), None);
        dict.set_string("x.attr", "five").unwrap();
        assert_eq!(dict.unsigned("x.attr").unwrap().unwrap(), 5);
        assert_eq!(dict.string("x.attr").unwrap().unwrap(), "five");
    }

    #[test]
    fn in_place_update_and_shrink() {
        let mut dict = AttrDict::new();
        dict.set_string("f.def", "block.h264.pic.").unwrap();
        dict.set_unsigned("t.pid", 100).unwrap();
        let len_before = dict.encoded_len();
        // Same size: stays in place.
        dict.set_string("f.def", "block.hevc.pic.").unwrap();
        assert_eq!(dict.encoded_len(), len_before);
        // Shorter: record shrinks, order preserved.
        dict.set_string("f.def", "block.").unwrap();
        assert!(dict.encoded_len() < len_before);
        let names: Vec<String> = dict
            .iter()
            .map(|r| r.unwrap().0.to_owned())
            .collect();
        assert_eq!(names, vec!["f.def", "t.pid"]);
        assert_eq!(dict.string("f.def").unwrap().unwrap(), "block.");
    }

    #[test]
    fn grow_moves_to_tail() {
        let mut dict = AttrDict::new();
        dict.set_string("f.def", "block.").unwrap();
        dict.set_unsigned("t.pid", 100).unwrap();
        dict.set_string("f.def", "block.mpegtsaligned.").unwrap();
        let names: Vec<String> = dict
            .iter()
            .map(|r| r.unwrap().0.to_owned())
            .collect();
        assert_eq!(names, vec!["t.pid", "f.def"]);
    }

    #[test]
    fn delete() {
        let mut dict = AttrDict::new();
        dict.set_void("f.random").unwrap();
        assert!(dict.delete("f.random", AttrType::Void).unwrap());
        assert!(!dict.has_void("f.random"));
        assert!(!dict.delete("f.random", AttrType::Void).unwrap());
    }

    #[test]
    fn rational_and_small_types() {
        let mut dict = AttrDict::new();
        dict.set_rational("k.rate", Rational { num: 30000, den: 1001 })
            .unwrap();
        dict.set_small_unsigned("s.channels", 6).unwrap();
        let r = dict.rational("k.rate").unwrap().unwrap();
        assert_eq!(r.num, 30000);
        assert_eq!(r.den, 1001);
        assert_eq!(dict.small_unsigned("s.channels").unwrap().unwrap(), 6);
    }

    #[test]
    fn dup_is_deep() {
        let mut dict = AttrDict::new();
        dict.set_string("f.def", "sound.").unwrap();
        let mut copy = dict.clone();
        copy.set_string("f.def", "void.").unwrap();
        assert_eq!(dict.string("f.def").unwrap().unwrap(), "sound.");
    }

    #[test]
    fn wire_layout_is_little_endian() {
        // Pin the actual byte layout, not just an encode/decode round
        // trip: a wrong byte order would be self-consistent.
        let mut value = Vec::new();
        AttrValue::Unsigned(1).encode(&mut value);
        assert_eq!(value, [0x01, 0, 0, 0, 0, 0, 0, 0]);

        let mut value = Vec::new();
        AttrValue::Int(-2).encode(&mut value);
        assert_eq!(value, (-2i64).to_le_bytes());

        let mut value = Vec::new();
        AttrValue::Rational(Rational { num: 1, den: 25 }).encode(&mut value);
        assert_eq!(&value[..8], &[0x01, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(&value[8..], &[25, 0, 0, 0, 0, 0, 0, 0]);

        // Full record of a shorthand unsigned: code byte, then the value
        // with its low byte first.
        let mut dict = AttrDict::new();
        dict.set_unsigned("t.pid", 0x1FFE).unwrap();
        let code = shorthand_for("t.pid", AttrType::Unsigned).unwrap();
        let mut expected = vec![code];
        expected.extend_from_slice(&0x1FFEu64.to_le_bytes());
        assert_eq!(dict.raw, expected);
        assert_eq!(dict.raw[1], 0xFE);
        assert_eq!(dict.raw[2], 0x1F);
    }
}
