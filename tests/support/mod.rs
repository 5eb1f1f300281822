//! Shared wiremock helpers for the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

/// Deterministic test payload.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 % 253) as u8).collect()
}

/// Parse `bytes=START-END` into an inclusive range clamped to `len`.
fn parse_range(header: &str, len: usize) -> Option<(usize, usize)> {
    let bounds = header.trim().strip_prefix("bytes=")?;
    let (start, end) = bounds.split_once('-')?;
    let start: usize = start.trim().parse().ok()?;
    let end: usize = match end.trim() {
        "" => len.checked_sub(1)?,
        end => end.parse::<usize>().ok()?.min(len.checked_sub(1)?),
    };
    (start <= end).then_some((start, end))
}

/// Serves byte ranges of a fixed body, like a static file server.
///
/// The first `fail_first` GETs answer `fail_status` instead.
pub struct RangeResponder {
    body: Arc<Vec<u8>>,
    delay: Option<Duration>,
    fail_first: usize,
    fail_status: u16,
    gets: Arc<AtomicUsize>,
}

impl RangeResponder {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body: Arc::new(body),
            delay: None,
            fail_first: 0,
            fail_status: 503,
            gets: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn failing_first(mut self, count: usize, status: u16) -> Self {
        self.fail_first = count;
        self.fail_status = status;
        self
    }

    /// Counter of GET requests seen, shared with the responder once mounted.
    pub fn counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.gets)
    }
}

impl Respond for RangeResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let seen = self.gets.fetch_add(1, Ordering::SeqCst);
        let template = if seen < self.fail_first {
            ResponseTemplate::new(self.fail_status)
        } else {
            let len = self.body.len();
            let range = request
                .headers
                .get("range")
                .and_then(|v| v.to_str().ok())
                .map(|v| parse_range(v, len));
            match range {
                None => ResponseTemplate::new(200).set_body_bytes(self.body.as_slice()),
                Some(None) => ResponseTemplate::new(416).insert_header("Content-Range", format!("bytes */{len}")),
                Some(Some((start, end))) => ResponseTemplate::new(206)
                    .insert_header("Content-Range", format!("bytes {start}-{end}/{len}"))
                    .set_body_bytes(&self.body[start..=end]),
            }
        };
        match self.delay {
            Some(delay) => template.set_delay(delay),
            None => template,
        }
    }
}

/// Mount a HEAD advertising byte ranges and a ranged GET responder at `route`.
pub async fn mount_ranged(server: &MockServer, route: &str, responder: RangeResponder) {
    let len = responder.body.len();
    Mock::given(method("HEAD"))
        .and(path(route))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Accept-Ranges", "bytes")
                .insert_header("Content-Length", len.to_string()),
        )
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(responder)
        .mount(server)
        .await;
}

/// GET requests the server received, with their `Range` header if any.
pub async fn received_gets(server: &MockServer) -> Vec<Option<String>> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .into_iter()
        .filter(|r| r.method.as_str() == "GET")
        .map(|r| r.headers.get("range").and_then(|v| v.to_str().ok()).map(str::to_string))
        .collect()
}
