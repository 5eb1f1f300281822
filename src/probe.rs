use reqwest::header::{HeaderMap, ACCEPT_RANGES, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use reqwest::{Client, StatusCode};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("network error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("server answered probe with status {0}")]
    Status(StatusCode),
}

/// What the server told us about the resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeReport {
    pub supports_ranges: bool,
    pub total_size: Option<u64>,
}

/// Discovers range support and total size before planning.
#[derive(Debug, Clone)]
pub struct RangeProber {
    client: Client,
    timeout: Duration,
}

impl RangeProber {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    /// HEAD first; if the server rejects HEAD, fall back to a one-byte ranged GET.
    pub async fn probe(&self, url: &str) -> Result<ProbeReport, ProbeError> {
        let head = self.client.head(url).timeout(self.timeout).send().await?;
        if head.status().is_success() {
            let report = report_from_head(head.headers());
            debug!(url, ?report, "probe via HEAD");
            return Ok(report);
        }

        warn!(url, status = %head.status(), "HEAD rejected, probing with ranged GET");
        let resp = self
            .client
            .get(url)
            .header(RANGE, "bytes=0-0")
            .timeout(self.timeout)
            .send()
            .await?;

        let status = resp.status();
        let report = match status {
            StatusCode::PARTIAL_CONTENT => {
                let total = total_from_content_range(resp.headers());
                ProbeReport { supports_ranges: total.is_some(), total_size: total }
            }
            s if s.is_success() => ProbeReport {
                supports_ranges: false,
                total_size: size_from_headers(resp.headers()),
            },
            s => return Err(ProbeError::Status(s)),
        };
        // Dropping the response abandons any body the server chose to send.
        drop(resp);
        debug!(url, ?report, "probe via ranged GET");
        Ok(report)
    }
}

fn report_from_head(headers: &HeaderMap) -> ProbeReport {
    if has_encoding(headers) {
        return ProbeReport { supports_ranges: false, total_size: None };
    }
    ProbeReport {
        supports_ranges: accepts_byte_ranges(headers),
        total_size: size_from_headers(headers),
    }
}

/// A compressed transfer has no byte-for-byte relation to the resource size.
pub fn has_encoding(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            let v = v.trim();
            !v.is_empty() && !v.eq_ignore_ascii_case("identity")
        })
        .unwrap_or(false)
}

pub fn accepts_byte_ranges(headers: &HeaderMap) -> bool {
    headers
        .get(ACCEPT_RANGES)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').any(|unit| unit.trim().eq_ignore_ascii_case("bytes")))
        .unwrap_or(false)
}

/// `Content-Length` as a size. Zero, negative and non-numeric values count as unknown.
pub fn size_from_headers(headers: &HeaderMap) -> Option<u64> {
    if has_encoding(headers) {
        return None;
    }
    let raw = headers.get(CONTENT_LENGTH)?.to_str().ok()?.trim();
    match raw.parse::<u64>() {
        Ok(0) => None,
        Ok(size) => Some(size),
        Err(_) => {
            warn!(value = raw, "unusable Content-Length");
            None
        }
    }
}

/// Total from `Content-Range: bytes 0-0/N`. `*` means the server does not know.
pub fn total_from_content_range(headers: &HeaderMap) -> Option<u64> {
    let raw = headers.get(CONTENT_RANGE)?.to_str().ok()?;
    let (_, total) = raw.rsplit_once('/')?;
    match total.trim() {
        "*" => None,
        total => total.parse::<u64>().ok().filter(|t| *t > 0),
    }
}

/// Start offset from `Content-Range: bytes START-END/TOTAL`.
pub fn start_from_content_range(headers: &HeaderMap) -> Option<u64> {
    let raw = headers.get(CONTENT_RANGE)?.to_str().ok()?.trim();
    let value = raw.strip_prefix("bytes")?.trim_start();
    let (range, _) = value.split_once('/')?;
    let (start, _) = range.split_once('-')?;
    start.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn headers(pairs: &[(reqwest::header::HeaderName, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(name.clone(), HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn head_with_length_and_ranges() {
        let h = headers(&[(CONTENT_LENGTH, "1000"), (ACCEPT_RANGES, "bytes")]);
        assert_eq!(report_from_head(&h), ProbeReport { supports_ranges: true, total_size: Some(1000) });
    }

    #[test]
    fn accept_ranges_none_is_unsupported() {
        let h = headers(&[(CONTENT_LENGTH, "1000"), (ACCEPT_RANGES, "none")]);
        assert!(!report_from_head(&h).supports_ranges);
    }

    #[test]
    fn encoded_response_hides_size_and_ranges() {
        let h = headers(&[(CONTENT_LENGTH, "1000"), (ACCEPT_RANGES, "bytes"), (CONTENT_ENCODING, "gzip")]);
        assert_eq!(report_from_head(&h), ProbeReport { supports_ranges: false, total_size: None });

        let h = headers(&[(CONTENT_LENGTH, "1000"), (CONTENT_ENCODING, "identity")]);
        assert_eq!(size_from_headers(&h), Some(1000));
    }

    #[test]
    fn zero_or_garbage_length_is_unknown() {
        assert_eq!(size_from_headers(&headers(&[(CONTENT_LENGTH, "0")])), None);
        assert_eq!(size_from_headers(&headers(&[(CONTENT_LENGTH, "-5")])), None);
        assert_eq!(size_from_headers(&headers(&[(CONTENT_LENGTH, "lots")])), None);
    }

    #[test]
    fn content_range_parsing() {
        let h = headers(&[(CONTENT_RANGE, "bytes 0-0/52428800")]);
        assert_eq!(total_from_content_range(&h), Some(52_428_800));
        assert_eq!(start_from_content_range(&h), Some(0));

        let h = headers(&[(CONTENT_RANGE, "bytes 4096-8191/*")]);
        assert_eq!(total_from_content_range(&h), None);
        assert_eq!(start_from_content_range(&h), Some(4096));
    }
}
