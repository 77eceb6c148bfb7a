//! HL7v2 message codec.
//!
//! Encodes a position-indexed message model into the pipe-delimited wire
//! format and decodes wire text back into the same model. Structure specs
//! layered on top give advisory validation per message type.

use thiserror::Error;


pub mod adt;
pub mod decoder;
pub mod delimiters;
pub mod encoder;
pub mod field;
pub mod message;
pub mod segment;
pub mod validation;

pub use decoder::{decode, Decoder};
pub use delimiters::Delimiters;
pub use encoder::{encode, SEGMENT_TERMINATOR};
pub use field::{Component, Field, Repetition};
pub use message::{hl7_timestamp, new_control_id, FieldPath, Message, MessageBuilder};
pub use segment::Segment;
pub use validation::{validate, IssueKind, StructureSpec, ValidationIssue};

/// Errors raised while building, encoding or decoding HL7 messages.
///
/// Offsets are byte offsets into the decoded input; indexes are 0-based
/// segment positions within the message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HL7Error {
    #[error("Empty input: no segments to decode")]
    EmptyInput,

    #[error("Missing MSH segment: message starts with {found:?}")]
    MissingMsh { found: String },

    #[error("Malformed segment {index} at byte {offset}: {reason}")]
    MalformedSegment {
        index: usize,
        offset: usize,
        reason: String,
    },

    #[error("Inconsistent delimiter in segment {index} at byte {offset}: {reason}")]
    InconsistentDelimiter {
        index: usize,
        offset: usize,
        reason: String,
    },

    #[error("Malformed escape sequence at byte {offset}: {reason}")]
    MalformedEscape { offset: usize, reason: String },

    #[error("Invalid segment code {code:?}{}", at_segment(.index))]
    InvalidSegmentCode { code: String, index: Option<usize> },

    #[error("Invalid delimiters: {0}")]
    InvalidDelimiters(String),

    #[error("Invalid message structure: {0}")]
    InvalidStructure(String),

    #[error("Invalid field path {path:?}: {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

fn at_segment(index: &Option<usize>) -> String {
    index.map(|i| format!(" in segment {i}")).unwrap_or_default()
}

impl HL7Error {
    /// Moves a relative escape offset onto an enclosing input.
    pub(crate) fn shifted(self, by: usize) -> Self {
        match self {
            HL7Error::MalformedEscape { offset, reason } => HL7Error::MalformedEscape {
                offset: offset + by,
                reason,
            },
            other => other,
        }
    }
}
