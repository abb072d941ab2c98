//! Torrent file parser
//!
//! Handles parsing of .torrent files and extracting metadata.

use tracing::{debug, error, info, trace, warn};

use crate::bencode::{self, Dict, DictKey, Value};
use crate::error::{Result, TorrentError};
use crate::torrent::info::{InfoHash, TorrentFile, TorrentInfo};

/// Parser for .torrent files
pub struct TorrentParser;

fn field<'a>(dict: &'a Dict, key: &str) -> Option<&'a Value> {
    dict.get(&DictKey::from(key))
}

fn required_integer(dict: &Dict, key: &str) -> Result<i64> {
    field(dict, key)
        .and_then(Value::as_integer)
        .ok_or_else(|| TorrentError::parse_error(format!("Missing or invalid '{}' field", key)))
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

impl TorrentParser {
    /// Parse a .torrent file from bytes
    pub fn parse_bytes(data: &[u8]) -> Result<TorrentInfo> {
        info!("Parsing torrent file from {} bytes", data.len());
        trace!("Torrent data (first 100 bytes): {:?}", &data[..data.len().min(100)]);

        let root = bencode::decode_metainfo(data).map_err(|e| {
            error!("Metainfo is not valid bencode: {}", e);
            e
        })?;
        let root = root
            .as_dict()
            .ok_or_else(|| TorrentError::parse_error("Root must be a dictionary"))?;

        let info_bytes = field(root, "info")
            .and_then(Value::as_bytes)
            .ok_or_else(|| TorrentError::parse_error("Missing info dictionary"))?;
        let info_hash = InfoHash::from_info_bytes(info_bytes);
        debug!("Info hash: {}", info_hash);

        let info = bencode::decode(info_bytes)?;
        let info = info
            .as_dict()
            .ok_or_else(|| TorrentError::parse_error("info must be a dictionary"))?;

        let name = field(info, "name")
            .and_then(Value::as_bytes)
            .map(lossy)
            .ok_or_else(|| TorrentError::parse_error("Missing name field"))?;

        let piece_length = required_integer(info, "piece length")?;
        let piece_length = u32::try_from(piece_length)
            .ok()
            .filter(|&len| len > 0)
            .ok_or_else(|| TorrentError::parse_error(format!("Invalid piece length {}", piece_length)))?;

        let pieces_bytes = field(info, "pieces")
            .and_then(Value::as_bytes)
            .ok_or_else(|| TorrentError::parse_error("Missing pieces field"))?;
        let pieces = TorrentInfo::parse_piece_hashes(pieces_bytes)?;

        let files = Self::parse_files(info, &name)?;
        let total_length = files
            .iter()
            .try_fold(0u64, |total, f| total.checked_add(f.length))
            .ok_or_else(|| TorrentError::parse_error("total length overflows"))?;

        let expected = total_length.div_ceil(piece_length as u64);
        if expected != pieces.len() as u64 {
            return Err(TorrentError::parse_error(format!(
                "{} bytes in pieces of {} need {} hashes, found {}",
                total_length,
                piece_length,
                expected,
                pieces.len()
            )));
        }

        let announce_tiers = Self::parse_announce_tiers(root);
        if announce_tiers.is_empty() {
            warn!("Torrent '{}' lists no trackers", name);
        }

        info!(
            "Parsed torrent '{}': {} files, {} pieces of {} bytes, {} tracker tiers",
            name,
            files.len(),
            pieces.len(),
            piece_length,
            announce_tiers.len()
        );
        Ok(TorrentInfo {
            info_hash,
            name,
            piece_length,
            total_length,
            files,
            pieces,
            announce_tiers,
        })
    }

    /// Parse a .torrent file from a file path
    pub fn parse_file(path: &std::path::Path) -> Result<TorrentInfo> {
        info!("Loading torrent file from: {}", path.display());

        let data = std::fs::read(path).map_err(|e| {
            error!("Failed to read torrent file '{}': {}", path.display(), e);
            TorrentError::storage_error_full("Failed to read torrent file", path.display().to_string(), e.to_string())
        })?;

        debug!("Read {} bytes from torrent file", data.len());
        Self::parse_bytes(&data)
    }

    fn parse_files(info: &Dict, name: &str) -> Result<Vec<TorrentFile>> {
        if let Some(length) = field(info, "length") {
            let length = length
                .as_integer()
                .and_then(|l| u64::try_from(l).ok())
                .ok_or_else(|| TorrentError::parse_error("Invalid length field"))?;
            check_path_component(name)?;
            return Ok(vec![TorrentFile {
                name: name.to_string(),
                index: 0,
                offset: 0,
                length,
            }]);
        }

        let entries = field(info, "files")
            .and_then(Value::as_list)
            .ok_or_else(|| TorrentError::parse_error("Neither length nor files found in info dict"))?;

        let mut files = Vec::with_capacity(entries.len());
        let mut offset = 0u64;
        for (index, entry) in entries.iter().enumerate() {
            let entry = entry
                .as_dict()
                .ok_or_else(|| TorrentError::parse_error(format!("File entry {} is not a dictionary", index)))?;
            let length = u64::try_from(required_integer(entry, "length")?)
                .map_err(|_| TorrentError::parse_error(format!("Negative length for file {}", index)))?;
            let path = field(entry, "path")
                .and_then(Value::as_list)
                .ok_or_else(|| TorrentError::parse_error(format!("Missing path for file {}", index)))?
                .iter()
                .map(|component| component.as_bytes().map(lossy))
                .collect::<Option<Vec<_>>>()
                .ok_or_else(|| TorrentError::parse_error(format!("Invalid path for file {}", index)))?;
            if path.is_empty() {
                return Err(TorrentError::parse_error(format!("Empty path for file {}", index)));
            }
            for component in &path {
                check_path_component(component)?;
            }

            files.push(TorrentFile {
                name: path.join("/"),
                index: index as u32,
                offset,
                length,
            });
            offset = offset
                .checked_add(length)
                .ok_or_else(|| TorrentError::parse_error("total length overflows"))?;
        }
        Ok(files)
    }

    /// `announce-list` tiers, falling back to `announce` as a single tier
    fn parse_announce_tiers(root: &Dict) -> Vec<Vec<String>> {
        if let Some(list) = field(root, "announce-list").and_then(Value::as_list) {
            let tiers: Vec<Vec<String>> = list
                .iter()
                .filter_map(Value::as_list)
                .map(|tier| tier.iter().filter_map(Value::as_bytes).map(lossy).collect::<Vec<_>>())
                .filter(|tier| !tier.is_empty())
                .collect();
            if !tiers.is_empty() {
                return tiers;
            }
        }
        field(root, "announce")
            .and_then(Value::as_bytes)
            .map(|url| vec![vec![lossy(url)]])
            .unwrap_or_default()
    }
}

/// A component that cannot leave the directory it is joined onto
fn check_path_component(component: &str) -> Result<()> {
    let invalid = component.is_empty()
        || component == "."
        || component == ".."
        || component.contains(['/', '\\', '\0']);
    if invalid {
        return Err(TorrentError::parse_error(format!("Unsafe path component '{}'", component)));
    }
    Ok(())
}

/// Build metainfo for `data` split into pieces of `piece_length`
#[cfg(test)]
pub(crate) fn sample_metainfo(name: &str, piece_length: u32, data: &[u8], tiers: &[Vec<&str>]) -> Vec<u8> {
    let hashes: Vec<u8> = data
        .chunks(piece_length as usize)
        .flat_map(crate::storage::sha1_digest)
        .collect();
    let info = Value::dict([
        ("length", Value::Integer(data.len() as i64)),
        ("name", Value::string(name)),
        ("piece length", Value::Integer(piece_length as i64)),
        ("pieces", Value::Bytes(hashes)),
    ]);
    if tiers.is_empty() {
        return bencode::encode(&Value::dict([("info", info)]));
    }
    let announce_list = tiers
        .iter()
        .map(|tier| Value::List(tier.iter().map(|url| Value::string(url)).collect()))
        .collect();
    bencode::encode(&Value::dict([
        ("announce", Value::string(tiers[0].first().copied().unwrap_or_default())),
        ("announce-list", Value::List(announce_list)),
        ("info", info),
    ]))
}
