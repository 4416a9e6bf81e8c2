//! Client for the external visit-statistics collector.
//!
//! The collector is a separate service with two endpoints: `POST /hit`
//! records a visit, `GET /stats` aggregates view counts over a time range.
//! This module only speaks to it; the collector itself is out of scope.
//!
//! The trait exists so the service can be tested without a network:
//! [`HttpStatsClient`] talks to the real collector over reqwest,
//! [`MockStatsClient`] records calls and returns scripted counts.

use std::collections::HashMap;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Timestamp format the collector's wire API uses.
const STATS_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A single recorded visit to an application URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Visit {
    pub app: String,
    pub uri: String,
    pub ip: String,
    pub timestamp: DateTime<Utc>,
}

/// Half-open is not a thing here: both bounds are inclusive, matching the
/// collector's query contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct HitPayload<'a> {
    app: &'a str,
    uri: &'a str,
    ip: &'a str,
    timestamp: String,
}

#[derive(Debug, Deserialize)]
struct ViewStatsPayload {
    #[allow(dead_code)]
    app: String,
    #[allow(dead_code)]
    uri: String,
    hits: u64,
}

/// Abstraction over the statistics collector.
#[async_trait]
pub trait StatsClient: Send + Sync {
    /// Record one visit. Callers treat this as fire and forget; a failure is
    /// logged, never propagated into the read path.
    async fn record_visit(&self, visit: &Visit) -> Result<()>;

    /// Total hits across `uris` within `range`. With `unique` set the
    /// collector counts each client IP once per URI.
    async fn count_views(&self, uris: &[String], unique: bool, range: ViewRange) -> Result<u64>;
}

// ============================================================================
// HTTP implementation
// ============================================================================

/// Stats client over HTTP.
///
/// # Example
/// ```ignore
/// use guestlist::stats::HttpStatsClient;
///
/// let stats = HttpStatsClient::new("http://stats-server:9090");
/// ```
pub struct HttpStatsClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpStatsClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    /// Use a preconfigured reqwest client (timeouts, proxies).
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }
}

#[async_trait]
impl StatsClient for HttpStatsClient {
    async fn record_visit(&self, visit: &Visit) -> Result<()> {
        let payload = HitPayload {
            app: &visit.app,
            uri: &visit.uri,
            ip: &visit.ip,
            timestamp: visit.timestamp.format(STATS_DATE_FORMAT).to_string(),
        };
        let response = self
            .client
            .post(format!("{}/hit", self.base_url))
            .json(&payload)
            .send()
            .await
            .context("sending hit to stats collector")?;
        if !response.status().is_success() {
            return Err(anyhow!(
                "stats collector rejected hit: {}",
                response.status()
            )
            .into());
        }
        tracing::debug!(uri = %visit.uri, "Recorded visit");
        Ok(())
    }

    async fn count_views(&self, uris: &[String], unique: bool, range: ViewRange) -> Result<u64> {
        let mut query: Vec<(&str, String)> = vec![
            ("start", range.start.format(STATS_DATE_FORMAT).to_string()),
            ("end", range.end.format(STATS_DATE_FORMAT).to_string()),
            ("unique", unique.to_string()),
        ];
        for uri in uris {
            query.push(("uris", uri.clone()));
        }
        let response = self
            .client
            .get(format!("{}/stats", self.base_url))
            .query(&query)
            .send()
            .await
            .context("querying stats collector")?;
        if !response.status().is_success() {
            return Err(anyhow!(
                "stats collector rejected query: {}",
                response.status()
            )
            .into());
        }
        let stats: Vec<ViewStatsPayload> = response
            .json()
            .await
            .context("decoding stats collector response")?;
        Ok(stats.iter().map(|s| s.hits).sum())
    }
}

// ============================================================================
// Mock implementation
// ============================================================================

/// Recording mock for tests. Scripted per-URI counts, every call captured.
#[derive(Default)]
pub struct MockStatsClient {
    visits: Mutex<Vec<Visit>>,
    views: Mutex<HashMap<String, u64>>,
}

impl MockStatsClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the hit count returned for a URI.
    pub fn set_views(&self, uri: impl Into<String>, hits: u64) {
        self.views.lock().insert(uri.into(), hits);
    }

    /// All visits recorded so far, in call order.
    pub fn recorded_visits(&self) -> Vec<Visit> {
        self.visits.lock().clone()
    }
}

#[async_trait]
impl StatsClient for MockStatsClient {
    async fn record_visit(&self, visit: &Visit) -> Result<()> {
        self.visits.lock().push(visit.clone());
        Ok(())
    }

    async fn count_views(&self, uris: &[String], _unique: bool, _range: ViewRange) -> Result<u64> {
        let views = self.views.lock();
        Ok(uris.iter().filter_map(|uri| views.get(uri)).sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn hit_payload_uses_collector_date_format() {
        let timestamp = Utc.with_ymd_and_hms(2025, 3, 14, 9, 26, 53).unwrap();
        let payload = HitPayload {
            app: "guestlist",
            uri: "/events/1",
            ip: "10.0.0.1",
            timestamp: timestamp.format(STATS_DATE_FORMAT).to_string(),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["timestamp"], "2025-03-14 09:26:53");
    }

    #[tokio::test]
    async fn mock_records_visits_in_order() {
        let mock = MockStatsClient::new();
        for uri in ["/events/a", "/events/b"] {
            mock.record_visit(&Visit {
                app: "guestlist".to_string(),
                uri: uri.to_string(),
                ip: "10.0.0.1".to_string(),
                timestamp: Utc::now(),
            })
            .await
            .unwrap();
        }
        let recorded = mock.recorded_visits();
        assert_eq!(recorded.len(), 2);
        assert_eq!(recorded[0].uri, "/events/a");
        assert_eq!(recorded[1].uri, "/events/b");
    }

    #[tokio::test]
    async fn mock_sums_scripted_views_over_requested_uris() {
        let mock = MockStatsClient::new();
        mock.set_views("/events/a", 7);
        mock.set_views("/events/b", 5);
        mock.set_views("/events/unrelated", 100);

        let range = ViewRange {
            start: Utc::now(),
            end: Utc::now(),
        };
        let total = mock
            .count_views(
                &["/events/a".to_string(), "/events/b".to_string()],
                false,
                range,
            )
            .await
            .unwrap();
        assert_eq!(total, 12);
    }
}
