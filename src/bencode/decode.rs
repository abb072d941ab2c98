//! Recursive-descent bencode decoder
//!
//! The decoder walks a cursor over the input. Two modes add special cases on
//! top of plain decoding: metainfo mode keeps the `info` value as its raw byte
//! span, tracker-response mode normalizes `peers` to a list of peer records.

use std::collections::BTreeMap;

use tracing::trace;

use super::record::{is_record_tag, peer_from_dict, record_from_dict, TAG_NULL};
use super::value::{Dict, DictKey, Value};
use crate::error::{Result, TorrentError};
use crate::peer::KnownPeer;

const MAX_DEPTH: usize = 64;

/// Size of one compact peer entry: IPv4 address plus port
pub const COMPACT_PEER_LEN: usize = 6;

/// Special-case handling applied while decoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeMode {
    Plain,
    /// `info` values are returned as their raw encoded bytes
    Metainfo,
    /// `peers` values are returned as a list of `Value::Peer`
    TrackerResponse,
}

/// Decode a complete buffer; trailing bytes are an error
pub fn decode(data: &[u8]) -> Result<Value> {
    Decoder::new(data, DecodeMode::Plain).decode_all()
}

/// Decode torrent metainfo, keeping `info` as the raw span it was read from
pub fn decode_metainfo(data: &[u8]) -> Result<Value> {
    Decoder::new(data, DecodeMode::Metainfo).decode_all()
}

/// Decode a tracker response with `peers` normalized
pub fn decode_tracker_response(data: &[u8]) -> Result<Value> {
    Decoder::new(data, DecodeMode::TrackerResponse).decode_all()
}

/// Cursor over a bencoded buffer
pub struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
    mode: DecodeMode,
}

impl<'a> Decoder<'a> {
    pub fn new(data: &'a [u8], mode: DecodeMode) -> Self {
        Self { data, pos: 0, mode }
    }

    /// Current cursor position
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Decode one value that must span the whole buffer
    pub fn decode_all(mut self) -> Result<Value> {
        let value = self.decode_value(0)?;
        if self.pos != self.data.len() {
            return Err(self.error(format!("{} trailing bytes", self.data.len() - self.pos)));
        }
        Ok(value)
    }

    fn error(&self, message: impl Into<String>) -> TorrentError {
        TorrentError::decode_error(message, self.pos)
    }

    fn peek(&self) -> Result<u8> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or_else(|| self.error("unexpected end of input"))
    }

    /// Decode the value starting at the cursor
    pub fn decode_value(&mut self, depth: usize) -> Result<Value> {
        if depth > MAX_DEPTH {
            return Err(self.error("nesting too deep"));
        }
        match self.peek()? {
            b'i' => self.decode_integer().map(Value::Integer),
            b'0'..=b'9' => self.decode_bytes().map(Value::Bytes),
            b'l' => self.decode_list(depth),
            b'd' => self.decode_dict(depth).map(Value::Dict),
            TAG_NULL => {
                self.pos += 1;
                Ok(Value::Null)
            }
            tag if is_record_tag(tag) => self.decode_record(tag, depth),
            other => Err(self.error(format!("unexpected character '{}'", other.escape_ascii()))),
        }
    }

    fn decode_integer(&mut self) -> Result<i64> {
        self.pos += 1;
        let start = self.pos;
        let end = self.data[start..]
            .iter()
            .position(|&b| b == b'e')
            .map(|offset| start + offset)
            .ok_or_else(|| self.error("unterminated integer"))?;

        let text = std::str::from_utf8(&self.data[start..end]).map_err(|_| self.error("integer is not ASCII"))?;
        // Leading zeros and a plus sign are tolerated
        let digits = text.strip_prefix(['-', '+']).unwrap_or(text);
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(self.error(format!("invalid integer '{}'", text)));
        }
        let value = text
            .parse::<i64>()
            .map_err(|_| self.error(format!("integer out of range '{}'", text)))?;
        self.pos = end + 1;
        Ok(value)
    }

    fn decode_bytes(&mut self) -> Result<Vec<u8>> {
        let start = self.pos;
        let colon = self.data[start..]
            .iter()
            .position(|&b| b == b':')
            .map(|offset| start + offset)
            .ok_or_else(|| self.error("byte string length without ':'"))?;

        let len_text = &self.data[start..colon];
        if !len_text.iter().all(u8::is_ascii_digit) {
            return Err(self.error("invalid byte string length"));
        }
        let len: usize = std::str::from_utf8(len_text)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| self.error("invalid byte string length"))?;

        let body = colon + 1;
        let end = body
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| self.error(format!("byte string of {} bytes truncated", len)))?;
        self.pos = end;
        Ok(self.data[body..end].to_vec())
    }

    fn decode_list(&mut self, depth: usize) -> Result<Value> {
        self.pos += 1;
        let mut items = Vec::new();
        while self.peek()? != b'e' {
            items.push(self.decode_value(depth + 1)?);
        }
        self.pos += 1;
        Ok(Value::List(items))
    }

    fn decode_dict(&mut self, depth: usize) -> Result<Dict> {
        self.pos += 1;
        let mut dict = BTreeMap::new();
        while self.peek()? != b'e' {
            let key = match self.peek()? {
                b'i' => DictKey::Integer(self.decode_integer()?),
                b'0'..=b'9' => DictKey::Bytes(self.decode_bytes()?),
                other => {
                    return Err(self.error(format!("invalid dictionary key start '{}'", other.escape_ascii())))
                }
            };
            let value = match (self.mode, key.as_bytes()) {
                (DecodeMode::Metainfo, Some(b"info")) => self.capture_raw(depth + 1)?,
                (DecodeMode::TrackerResponse, Some(b"peers")) => self.decode_peers(depth + 1)?,
                _ => self.decode_value(depth + 1)?,
            };
            // Duplicate keys: last write wins
            dict.insert(key, value);
        }
        self.pos += 1;
        Ok(dict)
    }

    fn decode_record(&mut self, tag: u8, depth: usize) -> Result<Value> {
        let start = self.pos;
        self.pos += 1;
        if self.peek()? != b'd' {
            return Err(self.error("record body must be a dictionary"));
        }
        let dict = self.decode_dict(depth + 1)?;
        record_from_dict(tag, &dict, start)
    }

    /// Skip over the next value and return its exact encoded bytes
    fn capture_raw(&mut self, depth: usize) -> Result<Value> {
        let start = self.pos;
        self.decode_value(depth)?;
        trace!("Captured raw span {}..{}", start, self.pos);
        Ok(Value::Bytes(self.data[start..self.pos].to_vec()))
    }

    fn decode_peers(&mut self, depth: usize) -> Result<Value> {
        let start = self.pos;
        match self.peek()? {
            b'l' => {
                let Value::List(items) = self.decode_list(depth)? else {
                    return Err(self.error("expected peer list"));
                };
                let peers = items
                    .into_iter()
                    .map(|item| match item {
                        Value::Dict(dict) => peer_from_dict(&dict, start).map(Value::Peer),
                        peer @ Value::Peer(_) => Ok(peer),
                        _ => Err(TorrentError::decode_error("peer entry must be a dictionary", start)),
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(Value::List(peers))
            }
            b'0'..=b'9' => {
                let compact = self.decode_bytes()?;
                Ok(Value::List(
                    parse_compact_peers(&compact)
                        .map_err(|e| reposition(e, start))?
                        .into_iter()
                        .map(Value::Peer)
                        .collect(),
                ))
            }
            other => Err(self.error(format!("unexpected peers encoding '{}'", other.escape_ascii()))),
        }
    }
}

/// Parse 6-byte compact peer entries (IPv4 + big-endian port)
pub fn parse_compact_peers(data: &[u8]) -> Result<Vec<KnownPeer>> {
    if data.len() % COMPACT_PEER_LEN != 0 {
        return Err(TorrentError::decode_error(
            format!("compact peer list length {} is not a multiple of {}", data.len(), COMPACT_PEER_LEN),
            0,
        ));
    }
    Ok(data
        .chunks_exact(COMPACT_PEER_LEN)
        .map(|chunk| {
            let ip = std::net::Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            KnownPeer::new(ip.into(), port, None)
        })
        .collect())
}

/// Move a decode error to an absolute offset
fn reposition(err: TorrentError, position: usize) -> TorrentError {
    match err {
        TorrentError::DecodeError { message, .. } => TorrentError::DecodeError { message, position },
        other => other,
    }
}
