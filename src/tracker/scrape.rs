//! Scrape of every tracker of a torrent

use std::collections::BTreeMap;

use tracing::{debug, info};
use url::Url;

use super::{scrape_from_response, AnnounceTiers, TrackerClient, SCRAPE_CONNECTION_FAILED};
use crate::bencode::{self, DictKey, Value};
use crate::stats::ScrapeData;
use crate::torrent::InfoHash;

/// Scrape URL of a tracker, `None` if its last path segment does not start
/// with `announce`
pub fn scrape_url(tracker: &str, info_hash: &InfoHash) -> Option<String> {
    let mut url = Url::parse(tracker).ok()?;
    let segments: Vec<String> = url.path_segments()?.map(str::to_string).collect();
    let (last, parent) = segments.split_last()?;
    let rest = last.strip_prefix("announce")?;

    let mut path = String::new();
    for segment in parent {
        path.push('/');
        path.push_str(segment);
    }
    path.push_str("/scrape");
    path.push_str(rest);
    url.set_path(&path);

    let separator = if url.query().is_some() { '&' } else { '?' };
    Some(format!(
        "{}{}info_hash={}",
        url,
        separator,
        urlencoding::encode_binary(info_hash.as_bytes())
    ))
}

impl TrackerClient {
    /// Scrape every tracker, recording one outcome per tracker in `stats`
    ///
    /// Trackers are independent: a failure never stops the others from
    /// being contacted. Returns the number of successful scrapes.
    pub async fn scrape(
        &self,
        info_hash: &InfoHash,
        tiers: &AnnounceTiers,
        stats: &mut BTreeMap<String, ScrapeData>,
    ) -> usize {
        let mut succeeded = 0;
        let mut contacted = 0;
        for tracker in tiers.urls() {
            contacted += 1;
            let outcome = match scrape_url(tracker, info_hash) {
                Some(url) => self.scrape_one(&url, info_hash).await,
                None => {
                    debug!("Tracker {} does not support scraping", tracker);
                    None
                }
            };
            let data = outcome.unwrap_or_else(|| ScrapeData::failure(SCRAPE_CONNECTION_FAILED));
            if !data.is_failure() {
                succeeded += 1;
            }
            stats.insert(tracker.clone(), data);
        }
        info!("Scraped {}/{} trackers of {}", succeeded, contacted, info_hash);
        succeeded
    }

    async fn scrape_one(&self, url: &str, info_hash: &InfoHash) -> Option<ScrapeData> {
        let body = match self.fetcher.fetch(url).await {
            Ok(body) => body,
            Err(e) => {
                debug!("Scrape fetch failed: {:#}", e);
                return None;
            }
        };
        let response = bencode::decode(&body).ok()?;
        let files = response.get("files")?.as_dict()?;
        // Prefer our own entry; trackers keyed by something else still count
        let entry = files
            .get(&DictKey::Bytes(info_hash.as_bytes().to_vec()))
            .or_else(|| files.values().next())?;
        match entry {
            Value::Dict(_) => Some(scrape_from_response(entry)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::tracker::testing::MockFetcher;

    fn hash() -> InfoHash {
        InfoHash([0x41; 20])
    }

    #[test]
    fn test_scrape_url_derivation() {
        assert_eq!(
            scrape_url("http://example.com/announce", &hash()).unwrap(),
            format!("http://example.com/scrape?info_hash={}", "A".repeat(20))
        );
        assert_eq!(
            scrape_url("http://example.com/x/announce.php?pk=1", &hash()).unwrap(),
            format!("http://example.com/x/scrape.php?pk=1&info_hash={}", "A".repeat(20))
        );
        assert!(scrape_url("http://example.com/a", &hash()).is_none());
        assert!(scrape_url("http://example.com/announce/x", &hash()).is_none());
        assert!(scrape_url("not a url", &hash()).is_none());
    }

    #[tokio::test]
    async fn test_scrape_is_independent_per_tracker() {
        let mut files = bencode::Dict::new();
        files.insert(
            DictKey::Bytes(hash().as_bytes().to_vec()),
            Value::dict([
                ("complete", Value::Integer(5)),
                ("downloaded", Value::Integer(10)),
                ("incomplete", Value::Integer(2)),
                ("name", Value::string("demo")),
            ]),
        );
        let body = bencode::encode(&Value::dict([("files", Value::Dict(files))]));
        let fetcher = Arc::new(MockFetcher::default().with("http://good/scrape", body));
        let client = TrackerClient::new(fetcher, [b'x'; 20]);
        let tiers = AnnounceTiers::new(vec![
            vec!["http://bad/tracker".to_string()],
            vec!["http://good/announce".to_string()],
        ]);
        let mut stats = BTreeMap::new();

        assert_eq!(client.scrape(&hash(), &tiers, &mut stats).await, 1);
        assert_eq!(stats["http://bad/tracker"], ScrapeData::failure(SCRAPE_CONNECTION_FAILED));
        assert_eq!(
            stats["http://good/announce"],
            ScrapeData::Scrape { complete: 5, downloaded: 10, incomplete: 2, name: Some("demo".to_string()) }
        );
    }
}
