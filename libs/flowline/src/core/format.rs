// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Minimal capability description for link-time negotiation.
//!
//! A [`Format`] is a media type plus a flat set of constraint fields; a
//! [`FormatSet`] is what a port advertises. The engine only ever needs one
//! question answered: do two sets intersect? Everything richer (caps
//! fixation, renegotiation policy) belongs to the port owners.

use std::collections::BTreeMap;
use std::fmt;

/// One concrete format: a media type name plus constraint fields.
///
/// Two formats are compatible when their media types match and every field
/// key present in both carries the same value. A field present on only one
/// side is unconstrained and does not block compatibility.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Format {
    media_type: String,
    fields: BTreeMap<String, String>,
}

impl Format {
    pub fn new(media_type: impl Into<String>) -> Self {
        Self {
            media_type: media_type.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn media_type(&self) -> &str {
        &self.media_type
    }

    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    pub fn compatible(&self, other: &Format) -> bool {
        if self.media_type != other.media_type {
            return false;
        }
        self.fields
            .iter()
            .all(|(k, v)| other.fields.get(k).is_none_or(|ov| ov == v))
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.media_type)?;
        for (k, v) in &self.fields {
            write!(f, ", {k}={v}")?;
        }
        Ok(())
    }
}

/// The set of formats a port can produce or accept.
///
/// `Any` is the unconstrained set: it intersects with every non-empty set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormatSet {
    Any,
    List(Vec<Format>),
}

impl FormatSet {
    pub fn any() -> Self {
        FormatSet::Any
    }

    pub fn new(formats: Vec<Format>) -> Self {
        FormatSet::List(formats)
    }

    pub fn single(format: Format) -> Self {
        FormatSet::List(vec![format])
    }

    /// True for the empty list set, which intersects with nothing.
    pub fn is_empty(&self) -> bool {
        match self {
            FormatSet::Any => false,
            FormatSet::List(v) => v.is_empty(),
        }
    }

    pub fn intersects(&self, other: &FormatSet) -> bool {
        match (self, other) {
            (FormatSet::Any, o) => !o.is_empty(),
            (s, FormatSet::Any) => !s.is_empty(),
            (FormatSet::List(a), FormatSet::List(b)) => a
                .iter()
                .any(|fa| b.iter().any(|fb| fa.compatible(fb))),
        }
    }
}

impl Default for FormatSet {
    fn default() -> Self {
        FormatSet::Any
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compatible_same_media_type() {
        let a = Format::new("audio/raw").with_field("rate", "48000");
        let b = Format::new("audio/raw").with_field("rate", "48000");
        assert!(a.compatible(&b));
    }

    #[test]
    fn test_incompatible_field_value() {
        let a = Format::new("audio/raw").with_field("rate", "48000");
        let b = Format::new("audio/raw").with_field("rate", "44100");
        assert!(!a.compatible(&b));
    }

    #[test]
    fn test_missing_field_is_unconstrained() {
        let a = Format::new("video/raw").with_field("width", "640");
        let b = Format::new("video/raw");
        assert!(a.compatible(&b));
        assert!(b.compatible(&a));
    }

    #[test]
    fn test_any_intersects_everything_nonempty() {
        let any = FormatSet::any();
        let one = FormatSet::single(Format::new("video/raw"));
        assert!(any.intersects(&one));
        assert!(one.intersects(&any));
        assert!(any.intersects(&any));
    }

    #[test]
    fn test_empty_list_intersects_nothing() {
        let empty = FormatSet::new(vec![]);
        let any = FormatSet::any();
        let one = FormatSet::single(Format::new("video/raw"));
        assert!(!empty.intersects(&any));
        assert!(!empty.intersects(&one));
        assert!(!any.intersects(&empty));
    }

    #[test]
    fn test_list_intersection() {
        let a = FormatSet::new(vec![
            Format::new("audio/raw").with_field("rate", "48000"),
            Format::new("video/raw"),
        ]);
        let b = FormatSet::single(Format::new("video/raw").with_field("width", "1920"));
        assert!(a.intersects(&b));

        let c = FormatSet::single(Format::new("audio/raw").with_field("rate", "44100"));
        assert!(!c.intersects(&FormatSet::single(
            Format::new("audio/raw").with_field("rate", "48000")
        )));
    }
}
