//! Bencode codec
//!
//! Decodes and encodes bencoded data: torrent metainfo, tracker responses,
//! and the tagged domain records persisted by the client.

pub mod decode;
pub mod encode;
pub mod record;
pub mod value;

pub use decode::{decode, decode_metainfo, decode_tracker_response, parse_compact_peers, DecodeMode, Decoder};
pub use encode::{encode, encode_into};
pub use value::{Dict, DictKey, Value};
