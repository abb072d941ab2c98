//! Domain records carried by the extended codec
//!
//! A record is encoded as its tag byte followed by a plain dictionary.

use std::time::Duration;

use super::value::{Dict, DictKey, Value};
use crate::error::{Result, TorrentError};
use crate::peer::KnownPeer;
use crate::stats::{ScrapeData, TorrentStats};
use crate::storage::piece::Piece;
use crate::torrent::TorrentFile;

pub const TAG_PEER: u8 = b'k';
pub const TAG_SCRAPE: u8 = b's';
pub const TAG_FAILURE: u8 = b'f';
pub const TAG_STATS: u8 = b't';
pub const TAG_FILE: u8 = b'h';
pub const TAG_PIECE: u8 = b'p';
pub const TAG_NULL: u8 = b'n';

/// Whether `byte` starts a tagged record
pub fn is_record_tag(byte: u8) -> bool {
    matches!(byte, TAG_PEER | TAG_SCRAPE | TAG_FAILURE | TAG_STATS | TAG_FILE | TAG_PIECE)
}

/// Counter value: an integer when it fits, otherwise its decimal digits
fn count(n: u64) -> Value {
    match i64::try_from(n) {
        Ok(n) => Value::Integer(n),
        Err(_) => Value::Bytes(n.to_string().into_bytes()),
    }
}

/// Split a record value into its tag and dictionary body
pub(crate) fn record_to_dict(value: &Value) -> Option<(u8, Dict)> {
    let (tag, entries): (u8, Vec<(&str, Value)>) = match value {
        Value::Peer(peer) => {
            let mut entries = vec![
                ("ip", Value::string(&peer.ip.to_string())),
                ("port", Value::Integer(peer.port as i64)),
            ];
            if let Some(id) = &peer.peer_id {
                entries.push(("peer id", Value::string(id)));
            }
            (TAG_PEER, entries)
        }
        Value::Scrape(ScrapeData::Scrape { complete, downloaded, incomplete, name }) => {
            let mut entries = vec![
                ("complete", count(*complete)),
                ("downloaded", count(*downloaded)),
                ("incomplete", count(*incomplete)),
            ];
            if let Some(name) = name {
                entries.push(("name", Value::string(name)));
            }
            (TAG_SCRAPE, entries)
        }
        Value::Scrape(ScrapeData::Failure { reason }) => {
            (TAG_FAILURE, vec![("failure reason", Value::string(reason))])
        }
        Value::Stats(stats) => (
            TAG_STATS,
            vec![
                ("uploaded", count(stats.uploaded)),
                ("downloaded", count(stats.downloaded)),
                ("left", count(stats.left)),
                ("wasted", count(stats.wasted)),
                // bencode has no floats
                ("share ratio", Value::string(&stats.share_ratio.to_string())),
                ("pieces", Value::Integer(stats.pieces as i64)),
                ("have pieces", Value::Integer(stats.have_pieces as i64)),
                ("leech time", count(stats.leech_time.as_secs())),
                ("leech time ns", Value::Integer(stats.leech_time.subsec_nanos() as i64)),
                ("seed time", count(stats.seed_time.as_secs())),
                ("seed time ns", Value::Integer(stats.seed_time.subsec_nanos() as i64)),
            ],
        ),
        Value::File(file) => (
            TAG_FILE,
            vec![
                ("name", Value::string(&file.name)),
                ("index", Value::Integer(file.index as i64)),
                ("offset", count(file.offset)),
                ("length", count(file.length)),
            ],
        ),
        Value::Piece(piece) => {
            let mut entries = vec![
                ("index", Value::Integer(piece.index as i64)),
                ("length", Value::Integer(piece.length as i64)),
                ("hash", Value::Bytes(piece.hash.to_vec())),
            ];
            if let Some(data) = &piece.data {
                entries.push(("data", Value::Bytes(data.clone())));
            }
            (TAG_PIECE, entries)
        }
        _ => return None,
    };
    Some((tag, entries.into_iter().map(|(k, v)| (DictKey::from(k), v)).collect()))
}

/// Field access over a record body, reporting errors at the record's offset
struct Fields<'a> {
    dict: &'a Dict,
    position: usize,
}

impl<'a> Fields<'a> {
    fn value(&self, key: &str) -> Option<&'a Value> {
        self.dict.get(&DictKey::from(key))
    }

    fn missing(&self, key: &str) -> TorrentError {
        TorrentError::decode_error(format!("record field '{}' missing or mistyped", key), self.position)
    }

    fn int(&self, key: &str) -> Result<i64> {
        self.value(key).and_then(Value::as_integer).ok_or_else(|| self.missing(key))
    }

    fn uint<T: TryFrom<i64>>(&self, key: &str) -> Result<T> {
        T::try_from(self.int(key)?).map_err(|_| self.out_of_range(key))
    }

    fn out_of_range(&self, key: &str) -> TorrentError {
        TorrentError::decode_error(format!("record field '{}' out of range", key), self.position)
    }

    fn count(&self, key: &str) -> Result<u64> {
        match self.value(key) {
            Some(Value::Integer(n)) => u64::try_from(*n).map_err(|_| self.out_of_range(key)),
            Some(Value::Bytes(digits)) => std::str::from_utf8(digits)
                .ok()
                .and_then(|text| text.parse().ok())
                .ok_or_else(|| self.out_of_range(key)),
            _ => Err(self.missing(key)),
        }
    }

    fn opt_count(&self, key: &str) -> Result<u64> {
        match self.value(key) {
            None => Ok(0),
            Some(_) => self.count(key),
        }
    }

    fn duration(&self, key: &str) -> Result<Duration> {
        let nanos_key = format!("{} ns", key);
        let nanos: u32 = match self.value(&nanos_key) {
            None => 0,
            Some(_) => self.uint(&nanos_key)?,
        };
        if nanos >= 1_000_000_000 {
            return Err(self.out_of_range(&nanos_key));
        }
        Ok(Duration::new(self.count(key)?, nanos))
    }

    fn bytes(&self, key: &str) -> Result<&'a [u8]> {
        self.value(key).and_then(Value::as_bytes).ok_or_else(|| self.missing(key))
    }

    fn string(&self, key: &str) -> Result<String> {
        Ok(String::from_utf8_lossy(self.bytes(key)?).into_owned())
    }

    fn opt_string(&self, key: &str) -> Option<String> {
        self.value(key)
            .and_then(Value::as_bytes)
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }
}

/// Peer descriptor from a dictionary with `ip`, `port` and optional `peer id`
pub(crate) fn peer_from_dict(dict: &Dict, position: usize) -> Result<KnownPeer> {
    let fields = Fields { dict, position };
    let ip_text = fields.string("ip")?;
    let ip = ip_text
        .parse()
        .map_err(|_| TorrentError::decode_error(format!("invalid peer address '{}'", ip_text), position))?;
    Ok(KnownPeer::new(ip, fields.uint("port")?, fields.opt_string("peer id")))
}

/// Rebuild a record from its tag and dictionary body
pub(crate) fn record_from_dict(tag: u8, dict: &Dict, position: usize) -> Result<Value> {
    let fields = Fields { dict, position };
    let value = match tag {
        TAG_PEER => Value::Peer(peer_from_dict(dict, position)?),
        TAG_SCRAPE => Value::Scrape(ScrapeData::Scrape {
            complete: fields.opt_count("complete")?,
            downloaded: fields.opt_count("downloaded")?,
            incomplete: fields.opt_count("incomplete")?,
            name: fields.opt_string("name"),
        }),
        TAG_FAILURE => Value::Scrape(ScrapeData::failure(fields.string("failure reason")?)),
        TAG_STATS => {
            let ratio_text = fields.string("share ratio")?;
            let share_ratio = ratio_text.parse::<f64>().map_err(|_| {
                TorrentError::decode_error(format!("invalid share ratio '{}'", ratio_text), position)
            })?;
            Value::Stats(TorrentStats {
                uploaded: fields.count("uploaded")?,
                downloaded: fields.count("downloaded")?,
                left: fields.count("left")?,
                wasted: fields.count("wasted")?,
                share_ratio,
                pieces: fields.uint("pieces")?,
                have_pieces: fields.uint("have pieces")?,
                leech_time: fields.duration("leech time")?,
                seed_time: fields.duration("seed time")?,
            })
        }
        TAG_FILE => Value::File(TorrentFile {
            name: fields.string("name")?,
            index: fields.uint("index")?,
            offset: fields.count("offset")?,
            length: fields.count("length")?,
        }),
        TAG_PIECE => {
            let hash: [u8; 20] = fields
                .bytes("hash")?
                .try_into()
                .map_err(|_| TorrentError::decode_error("piece hash must be 20 bytes", position))?;
            Value::Piece(Piece {
                index: fields.uint("index")?,
                length: fields.uint("length")?,
                hash,
                data: fields.value("data").and_then(Value::as_bytes).map(<[u8]>::to_vec),
            })
        }
        other => {
            return Err(TorrentError::decode_error(
                format!("unknown record tag '{}'", other as char),
                position,
            ))
        }
    };
    Ok(value)
}
