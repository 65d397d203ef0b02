//! Response locators: a small JSONPath subset parsed once at load time
//!
//! Supported forms: `$`, dotted keys (`$.a.b`), bracket indices (`$[0]`),
//! and bracket keys (`$["a key"]` / `$['a key']`). A locator of exactly
//! `$` addresses the whole body.

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::errors::DomainError;

/// One path segment of a parsed locator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocatorSegment {
    Key(String),
    Index(usize),
}

/// A parsed response locator. Keeps the raw text for reporting and
/// canonical serialization.
#[derive(Debug, Clone)]
pub struct Locator {
    raw: String,
    segments: Vec<LocatorSegment>,
}

impl PartialEq for Locator {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for Locator {}

impl Locator {
    /// Parse a locator string. Fails on anything outside the supported subset.
    pub fn parse(input: &str) -> Result<Self, DomainError> {
        let mut chars = input.chars().peekable();
        match chars.next() {
            Some('$') => {}
            _ => {
                return Err(DomainError::InvalidLocator {
                    locator: input.to_string(),
                    reason: "must start with '$'".to_string(),
                })
            }
        }

        let mut segments = Vec::new();
        while let Some(&c) = chars.peek() {
            match c {
                '.' => {
                    chars.next();
                    let mut key = String::new();
                    while let Some(&k) = chars.peek() {
                        if k == '.' || k == '[' {
                            break;
                        }
                        key.push(k);
                        chars.next();
                    }
                    if key.is_empty() {
                        return Err(DomainError::InvalidLocator {
                            locator: input.to_string(),
                            reason: "empty key after '.'".to_string(),
                        });
                    }
                    segments.push(LocatorSegment::Key(key));
                }
                '[' => {
                    chars.next();
                    match chars.peek() {
                        Some(&q) if q == '\'' || q == '"' => {
                            chars.next();
                            let mut key = String::new();
                            let mut closed = false;
                            for k in chars.by_ref() {
                                if k == q {
                                    closed = true;
                                    break;
                                }
                                key.push(k);
                            }
                            if !closed || chars.next() != Some(']') {
                                return Err(DomainError::InvalidLocator {
                                    locator: input.to_string(),
                                    reason: "unterminated bracket key".to_string(),
                                });
                            }
                            segments.push(LocatorSegment::Key(key));
                        }
                        _ => {
                            let mut digits = String::new();
                            for k in chars.by_ref() {
                                if k == ']' {
                                    break;
                                }
                                digits.push(k);
                            }
                            let index =
                                digits.parse::<usize>().map_err(|_| DomainError::InvalidLocator {
                                    locator: input.to_string(),
                                    reason: format!("invalid index '{digits}'"),
                                })?;
                            segments.push(LocatorSegment::Index(index));
                        }
                    }
                }
                _ => {
                    return Err(DomainError::InvalidLocator {
                        locator: input.to_string(),
                        reason: format!("unexpected character '{c}'"),
                    })
                }
            }
        }

        Ok(Self {
            raw: input.to_string(),
            segments,
        })
    }

    /// True when this locator addresses the whole body (`$`).
    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Walk the parsed JSON body. `None` when any segment does not resolve.
    pub fn resolve<'a>(&self, body: &'a Value) -> Option<&'a Value> {
        let mut current = body;
        for segment in &self.segments {
            current = match segment {
                LocatorSegment::Key(key) => current.as_object()?.get(key)?,
                LocatorSegment::Index(index) => current.as_array()?.get(*index)?,
            };
        }
        Some(current)
    }
}

impl std::fmt::Display for Locator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

impl std::str::FromStr for Locator {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Locator {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for Locator {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Locator::parse(&raw).map_err(de::Error::custom)
    }
}
