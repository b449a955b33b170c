//! Ordered FITS-style header cards.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for HeaderValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(true) => write!(f, "T"),
            Self::Bool(false) => write!(f, "F"),
            Self::Int(value) => write!(f, "{value}"),
            Self::Float(value) => write!(f, "{value}"),
            Self::Text(value) => write!(f, "'{value}'"),
        }
    }
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for HeaderValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeaderCard {
    pub value: HeaderValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
}

impl HeaderCard {
    pub fn new(value: impl Into<HeaderValue>) -> Self {
        Self {
            value: value.into(),
            comment: None,
            units: None,
        }
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn with_units(mut self, units: impl Into<String>) -> Self {
        self.units = Some(units.into());
        self
    }
}

/// Keyword-ordered header store. Cloning produces an independent copy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HeaderSet {
    cards: IndexMap<String, HeaderCard>,
}

impl HeaderSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.cards.clear();
    }

    /// Insert a card. An existing keyword keeps its position and takes the new card.
    pub fn add(&mut self, keyword: impl Into<String>, card: HeaderCard) {
        self.cards.insert(keyword.into().to_ascii_uppercase(), card);
    }

    pub fn add_value(&mut self, keyword: impl Into<String>, value: impl Into<HeaderValue>) {
        self.add(keyword, HeaderCard::new(value));
    }

    pub fn get(&self, keyword: &str) -> Option<&HeaderCard> {
        self.cards.get(&keyword.to_ascii_uppercase())
    }

    pub fn merge(&mut self, other: &HeaderSet) {
        for (keyword, card) in &other.cards {
            self.cards.insert(keyword.clone(), card.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.cards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &HeaderCard)> {
        self.cards.iter().map(|(keyword, card)| (keyword.as_str(), card))
    }
}
