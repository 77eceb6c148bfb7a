//! Advisory structure validation.
//!
//! A [`StructureSpec`] lists, per message structure, the segments in the
//! order the structure allows them, which of them are required or may
//! repeat, and which fields each must carry. [`validate`] walks a message
//! against it and reports every deviation as a [`ValidationIssue`]; it
//! never fails. Specs load from TOML:
//!
//! ```toml
//! [events]
//! "ADT^A04" = "ADT_A01"
//!
//! [structures.ADT_A01]
//! segments = [
//!     { code = "MSH", required = true, required_fields = [9, 10, 12] },
//!     { code = "EVN", required = true },
//!     { code = "PID", required = true, required_fields = [3, 5] },
//!     { code = "PV1" },
//! ]
//! ```

use crate::{HL7Error, Message, Segment};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use tracing::debug;

fn default_true() -> bool {
    true
}

/// One position in a message structure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentRule {
    pub code: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub repeatable: bool,
    #[serde(default)]
    pub required_fields: Vec<usize>,
    /// Highest field position the segment defines; only consulted by the
    /// strict decoder.
    #[serde(default)]
    pub max_fields: Option<usize>,
}

impl SegmentRule {
    pub fn required(code: &str) -> Self {
        Self {
            code: code.to_string(),
            required: true,
            repeatable: false,
            required_fields: Vec::new(),
            max_fields: None,
        }
    }

    pub fn optional(code: &str) -> Self {
        Self {
            required: false,
            ..Self::required(code)
        }
    }

    pub fn repeatable(mut self) -> Self {
        self.repeatable = true;
        self
    }

    pub fn fields(mut self, positions: &[usize]) -> Self {
        self.required_fields = positions.to_vec();
        self
    }

    pub fn max_fields(mut self, max: usize) -> Self {
        self.max_fields = Some(max);
        self
    }
}

/// The ordered segment grammar of one message structure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageStructure {
    pub segments: Vec<SegmentRule>,
    /// Site-defined Z segments may appear anywhere.
    #[serde(default = "default_true")]
    pub allow_z_segments: bool,
}

impl MessageStructure {
    pub fn new(segments: Vec<SegmentRule>) -> Self {
        Self {
            segments,
            allow_z_segments: true,
        }
    }

    pub fn rule(&self, code: &str) -> Option<&SegmentRule> {
        self.segments.iter().find(|r| r.code == code)
    }
}

/// Structures keyed by id (`ADT_A01`), plus trigger events that reuse
/// another event's structure (`ADT^A04` → `ADT_A01`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructureSpec {
    #[serde(default)]
    pub structures: BTreeMap<String, MessageStructure>,
    #[serde(default)]
    pub events: BTreeMap<String, String>,
}

impl StructureSpec {
    /// Parse a spec from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, HL7Error> {
        toml::from_str(text)
            .map_err(|e| HL7Error::Config(format!("invalid structure spec: {}", e)))
    }

    /// Load a spec from a TOML file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, HL7Error> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            HL7Error::Config(format!(
                "failed to read structure spec {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml_str(&text)
    }

    /// Add `other`'s structures and events, replacing any with the same key.
    pub fn merge(&mut self, other: StructureSpec) {
        self.structures.extend(other.structures);
        self.events.extend(other.events);
    }

    /// The v2.5.1 ADT_A01 and ACK structures.
    pub fn standard() -> Self {
        let adt_a01 = MessageStructure::new(vec![
            SegmentRule::required("MSH").fields(&[9, 10, 11, 12]).max_fields(21),
            SegmentRule::optional("SFT").repeatable(),
            SegmentRule::required("EVN").fields(&[2]).max_fields(7),
            SegmentRule::required("PID").fields(&[3, 5]).max_fields(39),
            SegmentRule::optional("PD1"),
            SegmentRule::optional("ROL").repeatable(),
            SegmentRule::optional("NK1").repeatable(),
            SegmentRule::optional("PV1").fields(&[2]).max_fields(52),
            SegmentRule::optional("PV2"),
            SegmentRule::optional("DB1").repeatable(),
            SegmentRule::optional("OBX").repeatable(),
            SegmentRule::optional("AL1").repeatable(),
            SegmentRule::optional("DG1").repeatable(),
            SegmentRule::optional("DRG"),
            SegmentRule::optional("PR1").repeatable(),
            SegmentRule::optional("GT1").repeatable(),
            SegmentRule::optional("IN1").repeatable(),
            SegmentRule::optional("IN2"),
            SegmentRule::optional("IN3").repeatable(),
            SegmentRule::optional("ACC"),
            SegmentRule::optional("UB1"),
            SegmentRule::optional("UB2"),
            SegmentRule::optional("PDA"),
        ]);
        let ack = MessageStructure::new(vec![
            SegmentRule::required("MSH").fields(&[9, 10, 11, 12]).max_fields(21),
            SegmentRule::optional("SFT").repeatable(),
            SegmentRule::required("MSA").fields(&[1, 2]),
            SegmentRule::optional("ERR").repeatable(),
        ]);

        let mut spec = Self::default();
        spec.structures.insert("ADT_A01".to_string(), adt_a01);
        spec.structures.insert("ACK".to_string(), ack);
        for event in ["A01", "A04", "A08", "A13"] {
            spec.events
                .insert(format!("ADT^{}", event), "ADT_A01".to_string());
        }
        spec
    }

    /// Structure id for a message: MSH-9.3 when present, otherwise the event
    /// mapping for `type^trigger`, otherwise `type_trigger`.
    pub fn structure_id(&self, message: &Message) -> Option<String> {
        if let Some(structure) = message.message_structure() {
            return Some(structure.to_string());
        }
        let message_type = message.message_type()?;
        match message.trigger_event() {
            Some(trigger) => {
                let event = format!("{}^{}", message_type, trigger);
                Some(
                    self.events
                        .get(&event)
                        .cloned()
                        .unwrap_or_else(|| format!("{}_{}", message_type, trigger)),
                )
            }
            None => Some(message_type.to_string()),
        }
    }

    /// The structure that applies to `message`, if the spec knows it.
    pub fn structure_for(&self, message: &Message) -> Option<&MessageStructure> {
        self.structure_id(message)
            .and_then(|id| self.structures.get(&id))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IssueKind {
    MissingRequiredSegment,
    UnexpectedSegment,
    MissingRequiredField,
    OutOfOrderSegment,
    UnknownStructure,
}

/// A single structural deviation. `segment_index` is the message position
/// the issue was detected at, when there is one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub kind: IssueKind,
    pub segment: String,
    pub segment_index: Option<usize>,
    pub field: Option<usize>,
    pub message: String,
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

fn issue(
    kind: IssueKind,
    segment: &str,
    segment_index: Option<usize>,
    field: Option<usize>,
    message: String,
) -> ValidationIssue {
    ValidationIssue {
        kind,
        segment: segment.to_string(),
        segment_index,
        field,
        message,
    }
}

fn check_fields(
    rule: &SegmentRule,
    segment: &Segment,
    index: usize,
    issues: &mut Vec<ValidationIssue>,
) {
    for &position in &rule.required_fields {
        if segment.field(position).map_or(true, |f| f.is_empty()) {
            issues.push(issue(
                IssueKind::MissingRequiredField,
                segment.code(),
                Some(index),
                Some(position),
                format!("{}-{} is required", segment.code(), position),
            ));
        }
    }
}

/// Check `message` against the structure `spec` declares for its type.
pub fn validate(message: &Message, spec: &StructureSpec) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();

    let Some(structure) = spec.structure_for(message) else {
        let id = spec
            .structure_id(message)
            .unwrap_or_else(|| "<no MSH-9>".to_string());
        issues.push(issue(
            IssueKind::UnknownStructure,
            "MSH",
            Some(0),
            Some(9),
            format!("no structure defined for {}", id),
        ));
        return issues;
    };

    let rules = &structure.segments;
    let mut matched = vec![false; rules.len()];
    let mut cursor = 0;

    for (index, segment) in message.segments().iter().enumerate() {
        let code = segment.code();

        if let Some(ahead) = rules[cursor..].iter().position(|r| r.code == code) {
            let at = cursor + ahead;
            let later = &message.segments()[index + 1..];
            for k in cursor..at {
                // A required segment that shows up later is out of order, not missing.
                if rules[k].required
                    && !matched[k]
                    && !later.iter().any(|s| s.code() == rules[k].code)
                {
                    issues.push(issue(
                        IssueKind::MissingRequiredSegment,
                        &rules[k].code,
                        Some(index),
                        None,
                        format!("{} is required before {}", rules[k].code, code),
                    ));
                }
            }
            matched[at] = true;
            check_fields(&rules[at], segment, index, &mut issues);
            cursor = if rules[at].repeatable { at } else { at + 1 };
            continue;
        }

        match rules[..cursor].iter().rposition(|r| r.code == code) {
            Some(k) if k + 1 == cursor && matched[k] && !rules[k].repeatable => {
                issues.push(issue(
                    IssueKind::UnexpectedSegment,
                    code,
                    Some(index),
                    None,
                    format!("{} may not repeat", code),
                ));
            }
            Some(k) => {
                issues.push(issue(
                    IssueKind::OutOfOrderSegment,
                    code,
                    Some(index),
                    None,
                    format!("{} appears after segments that must follow it", code),
                ));
                check_fields(&rules[k], segment, index, &mut issues);
            }
            None if structure.allow_z_segments && code.starts_with('Z') => {}
            None => {
                issues.push(issue(
                    IssueKind::UnexpectedSegment,
                    code,
                    Some(index),
                    None,
                    format!("{} is not part of this structure", code),
                ));
            }
        }
    }

    for (k, rule) in rules.iter().enumerate().skip(cursor) {
        if rule.required && !matched[k] {
            issues.push(issue(
                IssueKind::MissingRequiredSegment,
                &rule.code,
                None,
                None,
                format!("{} is required", rule.code),
            ));
        }
    }

    debug!(issues = issues.len(), "validated HL7 message structure");
    issues
}
