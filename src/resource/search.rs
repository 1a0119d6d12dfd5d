//! Single-pass search over encoded resource lists.

use super::codec;
use super::codec::RawResource;
use super::codec::ResourceError;
use crate::constants::ID_PROPERTY;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    /// Match on `_id`, always exact.
    Id,
    /// Match one property against any candidate value.
    Value,
}

/// A query against one property.
///
/// With `fuzzy` set, a candidate matches when it is a substring of the
/// property value; otherwise values must be equal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceSearch {
    key: String,
    values: Vec<String>,
    fuzzy: bool,
    mode: SearchMode,
}

impl ResourceSearch {
    /// Validates the query and picks the search mode.
    pub fn init(key: impl Into<String>, values: Vec<String>, fuzzy: bool) -> Result<Self, ResourceError> {
        let key = key.into();
        if key.is_empty() {
            return Err(ResourceError::InvalidQuery("empty search key".into()));
        }
        if values.is_empty() {
            return Err(ResourceError::InvalidQuery(format!("no values to match against {key}")));
        }
        let mode = if key == ID_PROPERTY {
            if values.iter().any(String::is_empty) {
                return Err(ResourceError::InvalidQuery("empty id".into()));
            }
            SearchMode::Id
        } else {
            SearchMode::Value
        };
        Ok(Self {
            key,
            values,
            fuzzy,
            mode,
        })
    }

    pub fn mode(&self) -> SearchMode {
        self.mode
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    fn value_matches(&self, value: &[u8]) -> bool {
        self.values.iter().any(|candidate| {
            let candidate = candidate.as_bytes();
            if self.fuzzy {
                candidate.is_empty() || value.windows(candidate.len()).any(|w| w == candidate)
            } else {
                value == candidate
            }
        })
    }

    /// Whether one resource satisfies the query.
    pub fn matches(&self, raw: &RawResource<'_>) -> Result<bool, ResourceError> {
        match self.mode {
            SearchMode::Id => Ok(self.values.iter().any(|v| v.as_bytes() == raw.id())),
            SearchMode::Value => Ok(raw.get(self.key.as_bytes())?.is_some_and(|v| self.value_matches(v))),
        }
    }

    /// Encoded stream of the matching resources, in input order. Empty when
    /// nothing matches.
    pub fn search(&self, data: &[u8]) -> Result<Vec<u8>, ResourceError> {
        let mut out = Vec::new();
        for raw in codec::walk(data)? {
            let raw = raw?;
            if self.matches(&raw)? {
                if !out.is_empty() {
                    out.extend_from_slice(&[codec::SEP; 3]);
                }
                out.extend_from_slice(raw.raw());
            }
        }
        if !out.is_empty() {
            out.push(codec::END);
        }
        Ok(out)
    }
}
