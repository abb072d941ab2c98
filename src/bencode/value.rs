//! Bencode value model
//!
//! Besides the four wire types, [`Value`] carries the domain records that
//! are persisted in the key/value store. Each record is written as a single
//! tag byte followed by an ordinary dictionary.

use std::collections::BTreeMap;

use crate::peer::KnownPeer;
use crate::stats::{ScrapeData, TorrentStats};
use crate::storage::piece::Piece;
use crate::torrent::TorrentFile;

/// Dictionary key; plain bencode only uses byte strings, persisted piece
/// tables are keyed by integer piece index
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DictKey {
    Integer(i64),
    Bytes(Vec<u8>),
}

impl DictKey {
    /// Key as raw bytes, if it is a byte string
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            DictKey::Bytes(b) => Some(b),
            DictKey::Integer(_) => None,
        }
    }
}

impl From<&str> for DictKey {
    fn from(s: &str) -> Self {
        DictKey::Bytes(s.as_bytes().to_vec())
    }
}

impl From<i64> for DictKey {
    fn from(i: i64) -> Self {
        DictKey::Integer(i)
    }
}

/// Bencode dictionary
pub type Dict = BTreeMap<DictKey, Value>;

/// A decoded bencode value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Integer(i64),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Dict(Dict),
    /// `k` tagged record
    Peer(KnownPeer),
    /// `s` (scrape) or `f` (failure) tagged record
    Scrape(ScrapeData),
    /// `t` tagged record
    Stats(TorrentStats),
    /// `h` tagged record
    File(TorrentFile),
    /// `p` tagged record
    Piece(Piece),
    /// `n`
    Null,
}

impl Value {
    /// Byte string from UTF-8 text
    pub fn string(s: &str) -> Self {
        Value::Bytes(s.as_bytes().to_vec())
    }

    /// Dictionary from string-keyed entries
    pub fn dict<'a>(entries: impl IntoIterator<Item = (&'a str, Value)>) -> Self {
        Value::Dict(entries.into_iter().map(|(k, v)| (DictKey::from(k), v)).collect())
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Byte string as UTF-8, `None` for other variants or invalid UTF-8
    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&Dict> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    pub fn into_list(self) -> Option<Vec<Value>> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn into_dict(self) -> Option<Dict> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Look up a string key if this is a dictionary
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_dict()?.get(&DictKey::from(key))
    }

    /// Whether this is `Null`
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::string(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(l: Vec<Value>) -> Self {
        Value::List(l)
    }
}

impl From<KnownPeer> for Value {
    fn from(p: KnownPeer) -> Self {
        Value::Peer(p)
    }
}

impl From<ScrapeData> for Value {
    fn from(s: ScrapeData) -> Self {
        Value::Scrape(s)
    }
}

impl From<TorrentStats> for Value {
    fn from(s: TorrentStats) -> Self {
        Value::Stats(s)
    }
}

impl From<TorrentFile> for Value {
    fn from(f: TorrentFile) -> Self {
        Value::File(f)
    }
}

impl From<Piece> for Value {
    fn from(p: Piece) -> Self {
        Value::Piece(p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accessors() {
        let value = Value::dict([("name", Value::string("abc")), ("size", Value::Integer(3))]);
        assert_eq!(value.get("name").and_then(Value::as_str), Some("abc"));
        assert_eq!(value.get("size").and_then(Value::as_integer), Some(3));
        assert!(value.get("missing").is_none());
        assert!(Value::Integer(1).get("name").is_none());
    }

    #[test]
    fn test_dict_key_order_puts_integers_first() {
        let mut keys = vec![DictKey::from("a"), DictKey::from(7)];
        keys.sort();
        assert_eq!(keys[0], DictKey::Integer(7));
    }

    #[test]
    fn test_as_str_rejects_invalid_utf8() {
        assert!(Value::Bytes(vec![0xff, 0xfe]).as_str().is_none());
    }
}
