//! Time consensus verification for evidence timestamps
//!
//! Queries several independent NTP servers concurrently and renders a verdict
//! from the median offset. The verdict and every raw sample are embedded in
//! each evidence bundle, so a reader can audit the consensus without
//! re-querying. Results are never cached across bundles.
//!
//! Fails closed: fewer than `min_sources` responses, or a median offset
//! beyond `max_skew_ms`, yields `verified = false`.

use crate::error::{Result, WardenError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

/// Seconds between 1900-01-01 (NTP era 0) and 1970-01-01
const NTP_UNIX_DELTA: f64 = 2_208_988_800.0;

const NTP_PACKET_LEN: usize = 48;

/// Default minimum number of responding sources
pub const DEFAULT_MIN_SOURCES: usize = 2;

/// Default maximum tolerated median offset
pub const DEFAULT_MAX_SKEW_MS: f64 = 5000.0;

// ============================================================================
// Types
// ============================================================================

/// A single source's answer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourceReading {
    pub offset_ms: f64,
    pub rtt_ms: f64,
    pub stratum: u8,
}

/// Raw per-source sample, embedded verbatim in evidence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NtpSample {
    pub server: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rtt_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stratum: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl NtpSample {
    pub fn ok(server: &str, reading: SourceReading) -> Self {
        Self {
            server: server.to_string(),
            offset_ms: Some(reading.offset_ms),
            rtt_ms: Some(reading.rtt_ms),
            stratum: Some(reading.stratum),
            error: None,
        }
    }

    pub fn failed(server: &str, error: impl Into<String>) -> Self {
        Self {
            server: server.to_string(),
            offset_ms: None,
            rtt_ms: None,
            stratum: None,
            error: Some(error.into()),
        }
    }
}

/// Consensus verdict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NtpVerification {
    pub verified: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset_ms: Option<f64>,
    pub sources: Vec<NtpSample>,
    pub source_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

impl NtpVerification {
    /// Placeholder used when no verifier is configured
    pub fn unavailable(reason: &str) -> Self {
        Self {
            verified: false,
            offset_ms: None,
            sources: Vec::new(),
            source_count: 0,
            error: Some(reason.to_string()),
            checked_at: Utc::now(),
        }
    }
}

// ============================================================================
// Sources
// ============================================================================

#[async_trait]
pub trait TimeSource: Send + Sync {
    fn name(&self) -> &str;
    async fn query(&self) -> Result<SourceReading>;
}

/// RFC 4330 SNTP client
pub struct SntpSource {
    server: String,
}

impl SntpSource {
    /// `server` may omit the port; 123 is assumed
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
        }
    }

    fn address(&self) -> String {
        if self.server.contains(':') {
            self.server.clone()
        } else {
            format!("{}:123", self.server)
        }
    }
}

#[async_trait]
impl TimeSource for SntpSource {
    fn name(&self) -> &str {
        &self.server
    }

    async fn query(&self) -> Result<SourceReading> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(self.address()).await?;

        let mut request = [0u8; NTP_PACKET_LEN];
        // LI = 0, VN = 4, Mode = 3 (client)
        request[0] = 0x23;
        let t1 = unix_now();
        let t1_bytes = to_ntp_timestamp(t1);
        request[40..48].copy_from_slice(&t1_bytes);

        socket.send(&request).await?;
        let mut response = [0u8; NTP_PACKET_LEN];
        let len = socket.recv(&mut response).await?;
        let t4 = unix_now();

        parse_response(&response[..len], &t1_bytes, t1, t4)
    }
}

fn parse_response(buf: &[u8], sent: &[u8; 8], t1: f64, t4: f64) -> Result<SourceReading> {
    if buf.len() < NTP_PACKET_LEN {
        return Err(WardenError::TimeSource(format!("short NTP reply ({} bytes)", buf.len())));
    }
    let mode = buf[0] & 0x07;
    if mode != 4 && mode != 5 {
        return Err(WardenError::TimeSource(format!("unexpected NTP mode {}", mode)));
    }
    let stratum = buf[1];
    if stratum == 0 {
        return Err(WardenError::TimeSource("kiss-o'-death reply".to_string()));
    }
    if &buf[24..32] != sent {
        return Err(WardenError::TimeSource("originate timestamp mismatch".to_string()));
    }

    let t2 = from_ntp_timestamp(&buf[32..40]);
    let t3 = from_ntp_timestamp(&buf[40..48]);

    Ok(SourceReading {
        offset_ms: ((t2 - t1) + (t3 - t4)) / 2.0 * 1000.0,
        rtt_ms: ((t4 - t1) - (t3 - t2)) * 1000.0,
        stratum,
    })
}

fn unix_now() -> f64 {
    let now = Utc::now();
    now.timestamp() as f64 + f64::from(now.timestamp_subsec_nanos()) / 1e9
}

fn to_ntp_timestamp(unix_secs: f64) -> [u8; 8] {
    let ntp = unix_secs + NTP_UNIX_DELTA;
    let secs = ntp.trunc() as u32;
    let frac = (ntp.fract() * 4_294_967_296.0) as u32;
    let mut out = [0u8; 8];
    out[..4].copy_from_slice(&secs.to_be_bytes());
    out[4..].copy_from_slice(&frac.to_be_bytes());
    out
}

fn from_ntp_timestamp(bytes: &[u8]) -> f64 {
    let secs = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let frac = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    f64::from(secs) - NTP_UNIX_DELTA + f64::from(frac) / 4_294_967_296.0
}

// ============================================================================
// Verifier
// ============================================================================

/// Median; even sample counts average the two central values
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

/// Render a verdict from raw samples
pub fn evaluate(samples: Vec<NtpSample>, min_sources: usize, max_skew_ms: f64) -> NtpVerification {
    let offsets: Vec<f64> = samples.iter().filter_map(|s| s.offset_ms).collect();
    let source_count = offsets.len();
    let offset = median(&offsets);

    let error = if source_count < min_sources {
        Some(format!(
            "insufficient time sources: {} responded, {} required",
            source_count, min_sources
        ))
    } else {
        match offset {
            Some(o) if o.abs() > max_skew_ms => Some(format!(
                "median offset {:.1}ms exceeds max skew {:.1}ms",
                o, max_skew_ms
            )),
            _ => None,
        }
    };

    NtpVerification {
        verified: error.is_none(),
        offset_ms: if source_count >= min_sources { offset } else { None },
        sources: samples,
        source_count,
        error,
        checked_at: Utc::now(),
    }
}

pub struct TimeVerifier {
    sources: Vec<Arc<dyn TimeSource>>,
    timeout: Duration,
    min_sources: usize,
    max_skew_ms: f64,
}

impl TimeVerifier {
    pub fn new(sources: Vec<Arc<dyn TimeSource>>) -> Self {
        Self {
            sources,
            timeout: Duration::from_secs(2),
            min_sources: DEFAULT_MIN_SOURCES,
            max_skew_ms: DEFAULT_MAX_SKEW_MS,
        }
    }

    /// SNTP sources for each configured server
    pub fn from_servers(servers: &[String]) -> Self {
        Self::new(
            servers
                .iter()
                .map(|s| Arc::new(SntpSource::new(s.clone())) as Arc<dyn TimeSource>)
                .collect(),
        )
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_min_sources(mut self, min_sources: usize) -> Self {
        self.min_sources = min_sources;
        self
    }

    pub fn with_max_skew_ms(mut self, max_skew_ms: f64) -> Self {
        self.max_skew_ms = max_skew_ms;
        self
    }

    /// Query every source concurrently and render a verdict
    pub async fn verify(&self) -> NtpVerification {
        let queries = self.sources.iter().map(|source| {
            let source = Arc::clone(source);
            let timeout = self.timeout;
            async move {
                match tokio::time::timeout(timeout, source.query()).await {
                    Ok(Ok(reading)) => {
                        debug!(
                            "NTP {} offset={:.2}ms rtt={:.2}ms",
                            source.name(),
                            reading.offset_ms,
                            reading.rtt_ms
                        );
                        NtpSample::ok(source.name(), reading)
                    }
                    Ok(Err(e)) => NtpSample::failed(source.name(), e.to_string()),
                    Err(_) => NtpSample::failed(
                        source.name(),
                        format!("timeout after {}ms", timeout.as_millis()),
                    ),
                }
            }
        });

        let samples = futures::future::join_all(queries).await;
        let verdict = evaluate(samples, self.min_sources, self.max_skew_ms);
        if !verdict.verified {
            warn!(
                "Time consensus unverified: {}",
                verdict.error.as_deref().unwrap_or("unknown")
            );
        }
        verdict
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    struct FixedSource {
        name: String,
        offset_ms: Option<f64>,
        delay: Duration,
    }

    impl FixedSource {
        fn arc(name: &str, offset_ms: Option<f64>) -> Arc<dyn TimeSource> {
            Arc::new(Self {
                name: name.to_string(),
                offset_ms,
                delay: Duration::ZERO,
            })
        }
    }

    #[async_trait]
    impl TimeSource for FixedSource {
        fn name(&self) -> &str {
            &self.name
        }

        async fn query(&self) -> Result<SourceReading> {
            tokio::time::sleep(self.delay).await;
            self.offset_ms
                .map(|offset_ms| SourceReading {
                    offset_ms,
                    rtt_ms: 12.0,
                    stratum: 2,
                })
                .ok_or_else(|| WardenError::TimeSource("unreachable".to_string()))
        }
    }

    fn verifier(offsets: &[f64]) -> TimeVerifier {
        TimeVerifier::new(
            offsets
                .iter()
                .enumerate()
                .map(|(i, o)| FixedSource::arc(&format!("ntp{}", i), Some(*o)))
                .collect(),
        )
    }

    #[test]
    fn test_median_even_count_averages_central_pair() {
        assert_relative_eq!(median(&[10.0, 20.0, 30.0, 40.0]).unwrap(), 25.0);
        assert_relative_eq!(median(&[40.0, 10.0, 30.0, 20.0]).unwrap(), 25.0);
    }

    #[test]
    fn test_median_odd_and_empty() {
        assert_relative_eq!(median(&[3.1, 1.8, 2.5]).unwrap(), 2.5);
        assert!(median(&[]).is_none());
    }

    #[tokio::test]
    async fn test_small_offsets_verify() {
        let verdict = verifier(&[1.8, 2.5, 3.1]).with_max_skew_ms(5000.0).verify().await;
        assert!(verdict.verified);
        assert_relative_eq!(verdict.offset_ms.unwrap(), 2.5);
        assert_eq!(verdict.source_count, 3);
        assert_eq!(verdict.sources.len(), 3);
    }

    #[tokio::test]
    async fn test_large_skew_fails_closed() {
        let verdict = verifier(&[5200.0, 5150.0, 5300.0]).with_max_skew_ms(100.0).verify().await;
        assert!(!verdict.verified);
        assert_relative_eq!(verdict.offset_ms.unwrap(), 5200.0);
        assert!(verdict.error.unwrap().contains("exceeds max skew"));
    }

    #[tokio::test]
    async fn test_negative_skew_also_checked() {
        let verdict = verifier(&[-900.0, -950.0]).with_max_skew_ms(500.0).verify().await;
        assert!(!verdict.verified);
    }

    #[tokio::test]
    async fn test_insufficient_sources() {
        let verifier = TimeVerifier::new(vec![
            FixedSource::arc("a", Some(1.0)),
            FixedSource::arc("b", None),
            FixedSource::arc("c", None),
        ]);
        let verdict = verifier.verify().await;
        assert!(!verdict.verified);
        assert_eq!(verdict.source_count, 1);
        assert!(verdict.offset_ms.is_none());
        // Failed samples still recorded for audit
        assert_eq!(verdict.sources.len(), 3);
        assert!(verdict.sources.iter().filter(|s| s.error.is_some()).count() == 2);
    }

    #[tokio::test]
    async fn test_slow_source_times_out() {
        let slow: Arc<dyn TimeSource> = Arc::new(FixedSource {
            name: "slow".to_string(),
            offset_ms: Some(1.0),
            delay: Duration::from_secs(5),
        });
        let verifier = TimeVerifier::new(vec![
            slow,
            FixedSource::arc("a", Some(1.0)),
            FixedSource::arc("b", Some(2.0)),
        ])
        .with_timeout(Duration::from_millis(50));

        let verdict = verifier.verify().await;
        assert!(verdict.verified);
        assert_eq!(verdict.source_count, 2);
        let slow_sample = verdict.sources.iter().find(|s| s.server == "slow").unwrap();
        assert!(slow_sample.error.as_ref().unwrap().contains("timeout"));
    }

    #[test]
    fn test_ntp_timestamp_conversion() {
        let now = 1_700_000_000.25;
        let bytes = to_ntp_timestamp(now);
        assert_relative_eq!(from_ntp_timestamp(&bytes), now, epsilon = 1e-6);
    }

    #[test]
    fn test_parse_response_offset() {
        let t1 = 1_700_000_000.0;
        let sent = to_ntp_timestamp(t1);
        let mut reply = [0u8; NTP_PACKET_LEN];
        reply[0] = 0x24; // VN 4, server mode
        reply[1] = 2;
        reply[24..32].copy_from_slice(&sent);
        // Server clock 100ms ahead, 10ms each way
        reply[32..40].copy_from_slice(&to_ntp_timestamp(t1 + 0.110));
        reply[40..48].copy_from_slice(&to_ntp_timestamp(t1 + 0.111));
        let t4 = t1 + 0.021;

        let reading = parse_response(&reply, &sent, t1, t4).unwrap();
        assert_relative_eq!(reading.offset_ms, 100.0, epsilon = 0.01);
        assert_relative_eq!(reading.rtt_ms, 20.0, epsilon = 0.01);
    }

    #[test]
    fn test_parse_response_rejects_spoofed_origin() {
        let sent = to_ntp_timestamp(1.0);
        let mut reply = [0u8; NTP_PACKET_LEN];
        reply[0] = 0x24;
        reply[1] = 2;
        assert!(parse_response(&reply, &sent, 1.0, 1.1).is_err());
    }
}
