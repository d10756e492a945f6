#![forbid(unsafe_code)]

//! Append-only audit log, sink trait, and the JSON-lines trace format.
//!
//! A persisted trace is a stream of self-contained lines: one session
//! envelope, every audit event in sequence order, and a terminator with
//! the stop reason and final ledger snapshot. Replay reconstructs a
//! session from this file alone.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use cw_canon::CanonicalId;
use cw_model::{AuditEvent, ProfileBundle, SessionRequest, StopReason};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How `p_base` is sourced for every ledger update in the session.
pub const P_BASE_DISCIPLINE: &str = "current_ledger_at_update";

/// Arithmetic discipline recorded in the envelope: double precision
/// with replay reading stored numbers rather than recomputing.
pub const ARITHMETIC_DISCIPLINE: &str = "f64_replay_from_recorded";

/// When reserved counterevidence credits become consumable.
pub const RESERVE_TIMING: &str = "end_of_budget_tail";

/// First line of a persisted trace. Carries everything replay needs to
/// rebuild the session, plus fingerprints for drift detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEnvelope {
    pub config_hash: CanonicalId,
    pub root_hashes: Vec<CanonicalId>,
    pub profile_fingerprint: CanonicalId,
    pub p_base_discipline: String,
    pub arithmetic_discipline: String,
    pub reserve_timing: String,
    pub request: SessionRequest,
}

impl SessionEnvelope {
    pub fn new(
        request: &SessionRequest,
        bundle: &ProfileBundle,
    ) -> Result<Self, AuditError> {
        let config_json =
            serde_json::to_vec(&request.config).map_err(|err| AuditError::Serialize {
                detail: err.to_string(),
            })?;
        let root_hashes = request
            .roots
            .iter()
            .map(|root| CanonicalId::of(&root.statement))
            .collect();
        Ok(Self {
            config_hash: CanonicalId::of_bytes(&config_json),
            root_hashes,
            profile_fingerprint: bundle.fingerprint(),
            p_base_discipline: P_BASE_DISCIPLINE.to_owned(),
            arithmetic_discipline: ARITHMETIC_DISCIPLINE.to_owned(),
            reserve_timing: RESERVE_TIMING.to_owned(),
            request: request.clone(),
        })
    }
}

/// Last line of a persisted trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionTerminator {
    pub stop_reason: StopReason,
    pub final_ledger: BTreeMap<String, f64>,
    pub credits_remaining: u64,
}

/// One line of the trace stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TraceRecord {
    Envelope(SessionEnvelope),
    Terminator(SessionTerminator),
    Event(AuditEvent),
}

/// Receives trace records in order. Implementations must not reorder or
/// drop records; a failed append is a session error.
pub trait AuditSink {
    fn append(&mut self, record: &TraceRecord) -> Result<(), AuditError>;
}

/// Collects records in memory; the default for tests and replay capture.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Vec<TraceRecord>,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn records(&self) -> &[TraceRecord] {
        &self.records
    }

    pub fn into_trace(self) -> Result<AuditTrace, AuditError> {
        AuditTrace::from_records(self.records)
    }
}

impl AuditSink for MemorySink {
    fn append(&mut self, record: &TraceRecord) -> Result<(), AuditError> {
        self.records.push(record.clone());
        Ok(())
    }
}

/// Discards every record; for callers that only want the return value.
#[derive(Debug, Default)]
pub struct NullSink;

impl AuditSink for NullSink {
    fn append(&mut self, _record: &TraceRecord) -> Result<(), AuditError> {
        Ok(())
    }
}

/// Writes one JSON line per record, flushing on the terminator.
#[derive(Debug)]
pub struct JsonlFileSink {
    writer: BufWriter<File>,
}

impl JsonlFileSink {
    pub fn create(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let file = File::create(path.as_ref()).map_err(|err| AuditError::SinkIo {
            detail: err.to_string(),
        })?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }
}

impl AuditSink for JsonlFileSink {
    fn append(&mut self, record: &TraceRecord) -> Result<(), AuditError> {
        let line = serde_json::to_string(record).map_err(|err| AuditError::Serialize {
            detail: err.to_string(),
        })?;
        self.writer
            .write_all(line.as_bytes())
            .and_then(|()| self.writer.write_all(b"\n"))
            .map_err(|err| AuditError::SinkIo {
                detail: err.to_string(),
            })?;
        if matches!(record, TraceRecord::Terminator(_)) {
            self.writer.flush().map_err(|err| AuditError::SinkIo {
                detail: err.to_string(),
            })?;
        }
        Ok(())
    }
}

/// Strictly sequenced in-session event log.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditLog {
    events: Vec<AuditEvent>,
}

impl AuditLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn next_seq(&self) -> u64 {
        self.events.len() as u64
    }

    pub fn append(&mut self, event: AuditEvent) -> Result<(), AuditError> {
        let expected = self.next_seq();
        if event.seq != expected {
            return Err(AuditError::OutOfOrder {
                expected,
                got: event.seq,
            });
        }
        self.events.push(event);
        Ok(())
    }

    #[must_use]
    pub fn events(&self) -> &[AuditEvent] {
        &self.events
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Fully parsed trace: envelope, ordered events, terminator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditTrace {
    pub envelope: SessionEnvelope,
    pub events: Vec<AuditEvent>,
    pub terminator: SessionTerminator,
}

impl AuditTrace {
    pub fn from_records(records: Vec<TraceRecord>) -> Result<Self, AuditError> {
        let mut envelope = None;
        let mut terminator = None;
        let mut events = Vec::new();

        for record in records {
            match record {
                TraceRecord::Envelope(found) => {
                    if envelope.replace(found).is_some() {
                        return Err(AuditError::DuplicateEnvelope);
                    }
                }
                TraceRecord::Terminator(found) => {
                    if terminator.replace(found).is_some() {
                        return Err(AuditError::DuplicateTerminator);
                    }
                }
                TraceRecord::Event(event) => {
                    let expected = events.len() as u64;
                    if event.seq != expected {
                        return Err(AuditError::OutOfOrder {
                            expected,
                            got: event.seq,
                        });
                    }
                    events.push(event);
                }
            }
        }

        Ok(Self {
            envelope: envelope.ok_or(AuditError::MissingEnvelope)?,
            events,
            terminator: terminator.ok_or(AuditError::MissingTerminator)?,
        })
    }

    pub fn parse_jsonl(input: &str) -> Result<Self, AuditError> {
        let mut records = Vec::new();
        for (line_no, line) in input.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record: TraceRecord =
                serde_json::from_str(line).map_err(|err| AuditError::MalformedLine {
                    line_no: line_no + 1,
                    detail: err.to_string(),
                })?;
            records.push(record);
        }
        Self::from_records(records)
    }

    pub fn read_jsonl(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|err| AuditError::SinkIo {
            detail: err.to_string(),
        })?;
        Self::parse_jsonl(&contents)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuditError {
    #[error("audit sink io failure: {detail}")]
    SinkIo { detail: String },
    #[error("failed to serialize audit record: {detail}")]
    Serialize { detail: String },
    #[error("event sequence out of order: expected {expected}, got {got}")]
    OutOfOrder { expected: u64, got: u64 },
    #[error("trace line {line_no} is malformed: {detail}")]
    MalformedLine { line_no: usize, detail: String },
    #[error("trace has no session envelope")]
    MissingEnvelope,
    #[error("trace has no terminator")]
    MissingTerminator,
    #[error("trace has more than one envelope")]
    DuplicateEnvelope,
    #[error("trace has more than one terminator")]
    DuplicateTerminator,
}
