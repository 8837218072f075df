//! Tamper-evident evidence
//!
//! Every remediation becomes one bundle in its client's hash chain: sealed
//! with a canonical SHA-256 digest, signed, optionally anchored with
//! OpenTimestamps, persisted write-once and spooled for upload.

pub mod anchor;
pub mod bundle;
pub mod chain;
pub mod outbox;
pub mod signer;

pub use anchor::{verify_ots_proof, Anchor, Attestation, OpenTimestampsAnchor, OtsReport};
pub use bundle::{
    EvidenceBundle, EvidenceDraft, ExecutionRecord, IncidentRecord, OtsProof, RunbookRecord,
};
pub use chain::{ChainVerification, EvidenceChain, TamperAlert, TamperKind};
pub use outbox::{EvidenceOutbox, EvidenceUploader, FlushReport};
pub use signer::{load_signer, Blake3MacSigner, BundleSigner, Ed25519Signer, SignerKind};
