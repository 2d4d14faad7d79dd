//! Backend-neutral item representation.
//!
//! Mirrors the subset of DynamoDB attribute values the kifu schema uses.
//! Numbers are kept as their decimal string form, as on the wire.

use std::collections::HashMap;

/// A single attribute value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrValue {
    S(String),
    N(String),
    Bool(bool),
    L(Vec<AttrValue>),
    Null,
}

impl AttrValue {
    pub fn as_s(&self) -> Option<&str> {
        match self {
            AttrValue::S(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_n(&self) -> Option<&str> {
        match self {
            AttrValue::N(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttrValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_l(&self) -> Option<&[AttrValue]> {
        match self {
            AttrValue::L(l) => Some(l),
            _ => None,
        }
    }
}

/// A stored item: attribute name to value.
pub type Item = HashMap<String, AttrValue>;

/// Primary key of an item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key {
    pub pk: String,
    pub sk: String,
}

impl Key {
    pub fn new(pk: impl Into<String>, sk: impl Into<String>) -> Self {
        Self {
            pk: pk.into(),
            sk: sk.into(),
        }
    }

    /// Extract the primary key attributes from an item.
    pub fn of_item(item: &Item) -> Option<Self> {
        let pk = item.get(PK_ATTR)?.as_s()?;
        let sk = item.get(SK_ATTR)?.as_s()?;
        Some(Self::new(pk, sk))
    }

    /// The key as an attribute map.
    pub fn to_item(&self) -> Item {
        let mut item = Item::with_capacity(2);
        item.insert(PK_ATTR.to_string(), AttrValue::S(self.pk.clone()));
        item.insert(SK_ATTR.to_string(), AttrValue::S(self.sk.clone()));
        item
    }
}

/// Partition key attribute of the table.
pub const PK_ATTR: &str = "pk";
/// Sort key attribute of the table.
pub const SK_ATTR: &str = "sk";
