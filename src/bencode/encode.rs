//! Bencode encoder
//!
//! Dictionaries are written in key order. Records are written as their tag
//! byte followed by the record's dictionary.

use std::io::Write;

use super::record::{record_to_dict, TAG_NULL};
use super::value::{Dict, DictKey, Value};

/// Encode a value to bytes
pub fn encode(value: &Value) -> Vec<u8> {
    let mut buf = Vec::new();
    encode_into(value, &mut buf);
    buf
}

/// Append the encoding of `value` to `buf`
pub fn encode_into(value: &Value, buf: &mut Vec<u8>) {
    match value {
        Value::Integer(i) => write_integer(*i, buf),
        Value::Bytes(b) => write_bytes(b, buf),
        Value::List(items) => {
            buf.push(b'l');
            for item in items {
                encode_into(item, buf);
            }
            buf.push(b'e');
        }
        Value::Dict(dict) => write_dict(dict, buf),
        Value::Null => buf.push(TAG_NULL),
        record => {
            if let Some((tag, dict)) = record_to_dict(record) {
                buf.push(tag);
                write_dict(&dict, buf);
            }
        }
    }
}

fn write_integer(i: i64, buf: &mut Vec<u8>) {
    // Writing to a Vec cannot fail
    let _ = write!(buf, "i{}e", i);
}

fn write_bytes(bytes: &[u8], buf: &mut Vec<u8>) {
    let _ = write!(buf, "{}:", bytes.len());
    buf.extend_from_slice(bytes);
}

fn write_dict(dict: &Dict, buf: &mut Vec<u8>) {
    buf.push(b'd');
    for (key, value) in dict {
        match key {
            DictKey::Integer(i) => write_integer(*i, buf),
            DictKey::Bytes(b) => write_bytes(b, buf),
        }
        encode_into(value, buf);
    }
    buf.push(b'e');
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::bencode::decode;
    use crate::peer::KnownPeer;
    use crate::stats::{ScrapeData, TorrentStats};
    use crate::storage::piece::Piece;
    use crate::torrent::TorrentFile;

    #[test]
    fn test_encode_scalars() {
        assert_eq!(encode(&Value::Integer(-3)), b"i-3e");
        assert_eq!(encode(&Value::string("spam")), b"4:spam");
        assert_eq!(encode(&Value::Null), b"n");
    }

    #[test]
    fn test_encode_dict_sorted() {
        let value = Value::dict([("b", Value::Integer(2)), ("a", Value::Integer(1))]);
        assert_eq!(encode(&value), b"d1:ai1e1:bi2ee");
    }

    #[test]
    fn test_encode_peer_record_is_tagged() {
        let peer = KnownPeer::new("10.0.0.1".parse().unwrap(), 80, None);
        assert_eq!(encode(&Value::Peer(peer)), b"kd2:ip8:10.0.0.14:porti80ee");
    }

    #[test]
    fn test_records_survive_encoding() {
        let piece_table = Value::Dict(
            [
                (DictKey::Integer(0), Value::Piece(Piece::new(0, 4, [9u8; 20]))),
                (
                    DictKey::Integer(1),
                    Value::Piece(Piece {
                        index: 1,
                        length: 2,
                        hash: [1u8; 20],
                        data: Some(vec![0xde, 0xad]),
                    }),
                ),
            ]
            .into_iter()
            .collect(),
        );
        let stats = TorrentStats {
            uploaded: 10,
            downloaded: 40,
            left: 7,
            wasted: 3,
            share_ratio: 0.25,
            pieces: 4,
            have_pieces: 3,
            leech_time: Duration::from_millis(1500),
            seed_time: Duration::from_millis(20),
        };
        let value = Value::List(vec![
            Value::Peer(KnownPeer::new("::1".parse().unwrap(), 6881, Some("-RT0100-abc".to_string()))),
            Value::Scrape(ScrapeData::Scrape {
                complete: 1,
                downloaded: 2,
                incomplete: 3,
                name: Some("name".to_string()),
            }),
            Value::Scrape(ScrapeData::failure("announce: URL connection failed")),
            Value::Stats(stats),
            Value::File(TorrentFile {
                name: "dir/file.txt".to_string(),
                index: 1,
                offset: 100,
                length: 50,
            }),
            piece_table,
            Value::Null,
        ]);

        assert_eq!(decode(&encode(&value)).unwrap(), value);
    }

    #[test]
    fn test_stats_keep_full_precision() {
        let stats = TorrentStats {
            uploaded: u64::MAX,
            downloaded: i64::MAX as u64 + 1,
            left: i64::MAX as u64,
            wasted: 0,
            share_ratio: 1.0 / 3.0,
            pieces: u32::MAX,
            have_pieces: 1,
            leech_time: Duration::from_micros(1500),
            seed_time: Duration::new(u64::MAX, 999_999_999),
        };
        let value = Value::Stats(stats);
        assert_eq!(decode(&encode(&value)).unwrap(), value);

        let file = Value::File(TorrentFile {
            name: "big".to_string(),
            index: 0,
            offset: u64::MAX - 1,
            length: 1,
        });
        assert_eq!(decode(&encode(&file)).unwrap(), file);
    }
}
