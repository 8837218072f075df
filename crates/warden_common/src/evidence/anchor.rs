//! OpenTimestamps anchoring
//!
//! The bundle digest is submitted to a calendar server (`POST <cal>/digest`
//! with the raw 32 bytes). The calendar answers with serialized timestamp
//! operations, which are wrapped into a detached `.ots` file:
//!
//! ```text
//! magic (31 bytes) | version 0x01 | 0x08 (sha256) | digest (32) | operations
//! ```
//!
//! Operations: `0xf0` append, `0xf1` prepend, `0x08` sha256, `0xff` fork,
//! `0x00` attestation (8-byte tag + varbytes payload).

use super::bundle::OtsProof;
use crate::canonical::sha256;
use crate::error::{Result, WardenError};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use std::time::Duration;
use tracing::{debug, warn};

pub const OTS_HEADER_MAGIC: &[u8] = b"\x00OpenTimestamps\x00\x00Proof\x00\xbf\x89\xe2\xe8\x84\xe8\x92\x94";
pub const OTS_VERSION: u8 = 0x01;

const OP_SHA256: u8 = 0x08;
const OP_APPEND: u8 = 0xf0;
const OP_PREPEND: u8 = 0xf1;
const OP_FORK: u8 = 0xff;
const OP_ATTESTATION: u8 = 0x00;

pub const PENDING_TAG: [u8; 8] = [0x83, 0xdf, 0xe3, 0x0d, 0x2e, 0xf9, 0x0c, 0x8e];
pub const BITCOIN_TAG: [u8; 8] = [0x05, 0x88, 0x96, 0x0d, 0x73, 0xd7, 0x19, 0x01];

const MAX_ARG_LEN: usize = 4096;
const MAX_PAYLOAD_LEN: usize = 8192;
const MAX_DEPTH: usize = 256;

pub const DEFAULT_CALENDARS: [&str; 2] = [
    "https://a.pool.opentimestamps.org",
    "https://b.pool.opentimestamps.org",
];

#[async_trait]
pub trait Anchor: Send + Sync {
    /// Anchor a digest; failure is reported, never fatal to persistence
    async fn anchor(&self, digest: &[u8; 32]) -> Result<OtsProof>;
}

pub struct OpenTimestampsAnchor {
    client: reqwest::Client,
    calendars: Vec<String>,
}

impl OpenTimestampsAnchor {
    pub fn new(calendars: Vec<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, calendars })
    }

    pub fn public_pool(timeout: Duration) -> Result<Self> {
        Self::new(DEFAULT_CALENDARS.iter().map(|c| c.to_string()).collect(), timeout)
    }

    async fn submit(&self, calendar: &str, digest: &[u8; 32]) -> Result<Vec<u8>> {
        let url = format!("{}/digest", calendar.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .header("Accept", "application/vnd.opentimestamps.v1")
            .body(digest.to_vec())
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(WardenError::Anchor(format!("{} returned {}", url, response.status())));
        }
        Ok(response.bytes().await?.to_vec())
    }
}

#[async_trait]
impl Anchor for OpenTimestampsAnchor {
    async fn anchor(&self, digest: &[u8; 32]) -> Result<OtsProof> {
        let mut last_error = WardenError::Anchor("no calendars configured".to_string());
        for calendar in &self.calendars {
            match self.submit(calendar, digest).await {
                Ok(operations) => {
                    let proof = wrap_calendar_response(digest, &operations);
                    // Never store something we cannot replay
                    verify_ots_proof(&proof, digest)?;
                    debug!("Anchored {} at {}", hex::encode(digest), calendar);
                    return Ok(OtsProof {
                        calendar_url: calendar.clone(),
                        proof: BASE64.encode(proof),
                        submitted_at: Utc::now(),
                    });
                }
                Err(e) => {
                    warn!("Calendar {} failed: {}", calendar, e);
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }
}

/// Build a detached `.ots` file from a calendar's operation stream
pub fn wrap_calendar_response(digest: &[u8; 32], operations: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(OTS_HEADER_MAGIC.len() + 34 + operations.len());
    out.extend_from_slice(OTS_HEADER_MAGIC);
    out.push(OTS_VERSION);
    out.push(OP_SHA256);
    out.extend_from_slice(digest);
    out.extend_from_slice(operations);
    out
}

// ============================================================================
// Verification
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attestation {
    Pending { uri: String, commitment: String },
    Bitcoin { height: u64, commitment: String },
    Unknown { tag: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OtsReport {
    pub attestations: Vec<Attestation>,
}

impl OtsReport {
    pub fn is_anchored(&self) -> bool {
        self.attestations
            .iter()
            .any(|a| matches!(a, Attestation::Pending { .. } | Attestation::Bitcoin { .. }))
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn byte(&mut self) -> Result<u8> {
        let b = *self
            .bytes
            .get(self.pos)
            .ok_or_else(|| WardenError::Anchor("truncated proof".to_string()))?;
        self.pos += 1;
        Ok(b)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).filter(|e| *e <= self.bytes.len());
        let end = end.ok_or_else(|| WardenError::Anchor("truncated proof".to_string()))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn varuint(&mut self) -> Result<u64> {
        let mut value: u64 = 0;
        let mut shift = 0;
        loop {
            let b = self.byte()?;
            if shift > 63 {
                return Err(WardenError::Anchor("varuint overflow".to_string()));
            }
            value |= ((b & 0x7f) as u64) << shift;
            if b & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    fn varbytes(&mut self, max: usize) -> Result<&'a [u8]> {
        let len = self.varuint()? as usize;
        if len > max {
            return Err(WardenError::Anchor(format!("field of {} bytes exceeds {}", len, max)));
        }
        self.take(len)
    }

    fn at_end(&self) -> bool {
        self.pos == self.bytes.len()
    }
}

/// Replay a `.ots` proof against the expected digest
///
/// Fails unless the proof commits to `digest` and carries at least one
/// pending-calendar or bitcoin attestation.
pub fn verify_ots_proof(proof: &[u8], digest: &[u8; 32]) -> Result<OtsReport> {
    let mut r = Reader { bytes: proof, pos: 0 };
    if r.take(OTS_HEADER_MAGIC.len())? != OTS_HEADER_MAGIC {
        return Err(WardenError::Anchor("not an OpenTimestamps proof".to_string()));
    }
    let version = r.varuint()?;
    if version != OTS_VERSION as u64 {
        return Err(WardenError::Anchor(format!("unsupported proof version {}", version)));
    }
    if r.byte()? != OP_SHA256 {
        return Err(WardenError::Anchor("proof is not over a sha256 file hash".to_string()));
    }
    if r.take(32)? != digest.as_slice() {
        return Err(WardenError::Anchor("proof commits to a different digest".to_string()));
    }

    let mut attestations = Vec::new();
    walk(&mut r, digest.to_vec(), 0, &mut attestations)?;
    if !r.at_end() {
        return Err(WardenError::Anchor("trailing bytes after proof".to_string()));
    }

    let report = OtsReport { attestations };
    if !report.is_anchored() {
        return Err(WardenError::Anchor("proof carries no usable attestation".to_string()));
    }
    Ok(report)
}

/// One timestamp: any number of forked children, then a final child
fn walk(r: &mut Reader<'_>, msg: Vec<u8>, depth: usize, out: &mut Vec<Attestation>) -> Result<()> {
    if depth > MAX_DEPTH {
        return Err(WardenError::Anchor("proof nesting too deep".to_string()));
    }
    loop {
        let tag = r.byte()?;
        if tag == OP_FORK {
            let child = r.byte()?;
            step(r, child, &msg, depth, out)?;
        } else {
            return step(r, tag, &msg, depth, out);
        }
    }
}

fn step(r: &mut Reader<'_>, tag: u8, msg: &[u8], depth: usize, out: &mut Vec<Attestation>) -> Result<()> {
    let next = match tag {
        OP_ATTESTATION => {
            out.push(read_attestation(r, msg)?);
            return Ok(());
        }
        OP_APPEND => {
            let arg = r.varbytes(MAX_ARG_LEN)?;
            [msg, arg].concat()
        }
        OP_PREPEND => {
            let arg = r.varbytes(MAX_ARG_LEN)?;
            [arg, msg].concat()
        }
        OP_SHA256 => sha256(msg).to_vec(),
        other => {
            return Err(WardenError::Anchor(format!("unsupported operation 0x{:02x}", other)));
        }
    };
    walk(r, next, depth + 1, out)
}

fn read_attestation(r: &mut Reader<'_>, msg: &[u8]) -> Result<Attestation> {
    let tag: [u8; 8] = r
        .take(8)?
        .try_into()
        .map_err(|_| WardenError::Anchor("short attestation tag".to_string()))?;
    let payload = r.varbytes(MAX_PAYLOAD_LEN)?;
    let mut inner = Reader { bytes: payload, pos: 0 };
    let commitment = hex::encode(msg);

    Ok(match tag {
        PENDING_TAG => {
            let uri = inner.varbytes(1000)?;
            let uri = std::str::from_utf8(uri)
                .map_err(|_| WardenError::Anchor("calendar URI not UTF-8".to_string()))?;
            Attestation::Pending {
                uri: uri.to_string(),
                commitment,
            }
        }
        BITCOIN_TAG => Attestation::Bitcoin {
            height: inner.varuint()?,
            commitment,
        },
        other => Attestation::Unknown { tag: hex::encode(other) },
    })
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub fn varuint(mut v: u64, out: &mut Vec<u8>) {
        loop {
            let b = (v & 0x7f) as u8;
            v >>= 7;
            if v == 0 {
                out.push(b);
                return;
            }
            out.push(b | 0x80);
        }
    }

    pub fn varbytes(bytes: &[u8], out: &mut Vec<u8>) {
        varuint(bytes.len() as u64, out);
        out.extend_from_slice(bytes);
    }

    /// What a calendar returns: append a nonce, hash, pending attestation
    pub fn calendar_response(uri: &str) -> Vec<u8> {
        let mut ops = vec![OP_APPEND];
        varbytes(b"nonce-1234", &mut ops);
        ops.push(OP_SHA256);
        ops.push(OP_ATTESTATION);
        ops.extend_from_slice(&PENDING_TAG);
        let mut payload = Vec::new();
        varbytes(uri.as_bytes(), &mut payload);
        varbytes(&payload, &mut ops);
        ops
    }

    pub struct StaticAnchor;

    #[async_trait]
    impl Anchor for StaticAnchor {
        async fn anchor(&self, digest: &[u8; 32]) -> Result<OtsProof> {
            let proof = wrap_calendar_response(digest, &calendar_response("https://calendar.test"));
            Ok(OtsProof {
                calendar_url: "https://calendar.test".to_string(),
                proof: BASE64.encode(proof),
                submitted_at: Utc::now(),
            })
        }
    }

    pub struct DownAnchor;

    #[async_trait]
    impl Anchor for DownAnchor {
        async fn anchor(&self, _digest: &[u8; 32]) -> Result<OtsProof> {
            Err(WardenError::Anchor("calendar unreachable".to_string()))
        }
    }
}
