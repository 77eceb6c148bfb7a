use crate::{Delimiters, Field, HL7Error};
use serde::{Deserialize, Serialize};

/// Segment code of the message header.
pub const MSH: &str = "MSH";

/// Whether `code` is a valid segment code: three characters of `[A-Z0-9]`.
pub fn is_valid_segment_code(code: &str) -> bool {
    code.len() == 3
        && code
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
}

/// Represents a segment in an HL7 message
///
/// Fields are stored by 1-based position; positions between populated
/// fields hold empty fields. For MSH, field 1 is the field separator and
/// field 2 the encoding characters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    code: String,
    fields: Vec<Field>,
}

impl Segment {
    /// Create an empty segment, validating the code.
    pub fn new(code: &str) -> Result<Self, HL7Error> {
        if !is_valid_segment_code(code) {
            return Err(HL7Error::InvalidSegmentCode {
                code: code.to_string(),
                index: None,
            });
        }
        Ok(Self {
            code: code.to_string(),
            fields: Vec::new(),
        })
    }

    /// An MSH segment declaring `delimiters` in MSH-1/MSH-2.
    pub fn msh(delimiters: &Delimiters) -> Self {
        Self {
            code: MSH.to_string(),
            fields: vec![
                Field::new(delimiters.field.to_string()),
                Field::new(delimiters.encoding_characters()),
            ],
        }
    }

    pub(crate) fn from_parts(code: &str, fields: Vec<Field>) -> Self {
        Self {
            code: code.to_string(),
            fields,
        }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn is_msh(&self) -> bool {
        self.code == MSH
    }

    /// All field positions, starting at position 1.
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Number of present positions, empty ones included.
    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    /// Position of the last non-empty field (0 when all are empty).
    pub fn populated_len(&self) -> usize {
        self.fields
            .iter()
            .rposition(|f| !f.is_empty())
            .map_or(0, |p| p + 1)
    }

    /// Field by 1-based position.
    pub fn field(&self, position: usize) -> Option<&Field> {
        position.checked_sub(1).and_then(|i| self.fields.get(i))
    }

    /// Mutable field by 1-based position, padding with empty fields as needed.
    pub fn field_mut(&mut self, position: usize) -> Result<&mut Field, HL7Error> {
        self.check_writable(position)?;
        let i = position - 1;
        while self.fields.len() <= i {
            self.fields.push(Field::empty());
        }
        Ok(&mut self.fields[i])
    }

    /// Replace the field at a 1-based position.
    pub fn set_field(&mut self, position: usize, field: impl Into<Field>) -> Result<(), HL7Error> {
        *self.field_mut(position)? = field.into();
        Ok(())
    }

    /// Builder form of [`Segment::set_field`].
    pub fn with_field(mut self, position: usize, field: impl Into<Field>) -> Result<Self, HL7Error> {
        self.set_field(position, field)?;
        Ok(self)
    }

    fn check_writable(&self, position: usize) -> Result<(), HL7Error> {
        if position == 0 {
            return Err(HL7Error::InvalidStructure(format!(
                "{} field positions start at 1",
                self.code
            )));
        }
        if self.is_msh() && position <= 2 {
            return Err(HL7Error::InvalidStructure(format!(
                "MSH-{} is derived from the delimiters and cannot be set",
                position
            )));
        }
        Ok(())
    }
}

impl PartialEq for Segment {
    fn eq(&self, other: &Self) -> bool {
        self.code == other.code
            && self.fields[..self.populated_len()] == other.fields[..other.populated_len()]
    }
}

impl Eq for Segment {}
