// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Queries: synchronous questions answered in place.
//!
//! The asker builds a query, hands out `&mut Query`, and the answering
//! handler fills the `result` slot. A `true` return means answered.

use super::format::FormatSet;

#[derive(Debug, Clone)]
pub enum Query {
    /// What formats can this port produce or accept, optionally narrowed
    /// by a filter. Backs the link-time capability check.
    Formats {
        filter: Option<FormatSet>,
        result: Option<FormatSet>,
    },
    /// Current stream position, in the collaborators' time unit.
    Position { result: Option<i64> },
    Duration { result: Option<i64> },
    Seeking { result: Option<bool> },
    Custom {
        name: String,
        result: Option<String>,
    },
}

impl Query {
    pub fn formats(filter: Option<FormatSet>) -> Self {
        Query::Formats {
            filter,
            result: None,
        }
    }

    pub fn position() -> Self {
        Query::Position { result: None }
    }

    pub fn duration() -> Self {
        Query::Duration { result: None }
    }

    pub fn seeking() -> Self {
        Query::Seeking { result: None }
    }

    pub fn custom(name: impl Into<String>) -> Self {
        Query::Custom {
            name: name.into(),
            result: None,
        }
    }

    /// Convenience accessor for the formats answer.
    pub fn formats_result(&self) -> Option<&FormatSet> {
        match self {
            Query::Formats { result, .. } => result.as_ref(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::format::{Format, FormatSet};

    #[test]
    fn test_answer_in_place() {
        let mut query = Query::position();
        if let Query::Position { result } = &mut query {
            *result = Some(42);
        }
        assert!(matches!(query, Query::Position { result: Some(42) }));
    }

    #[test]
    fn test_formats_result_accessor() {
        let mut query = Query::formats(None);
        assert!(query.formats_result().is_none());
        if let Query::Formats { result, .. } = &mut query {
            *result = Some(FormatSet::single(Format::new("video/raw")));
        }
        assert!(query.formats_result().is_some());
    }
}
