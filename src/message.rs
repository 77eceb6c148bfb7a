use crate::segment::{is_valid_segment_code, MSH};
use crate::{decoder, encoder, Delimiters, Field, HL7Error, Segment};
use chrono::{DateTime, TimeZone};
use nom::{
    branch::alt,
    bytes::complete::take_while_m_n,
    character::complete::{char, digit1},
    combinator::{all_consuming, map_res, opt},
    sequence::{delimited, preceded},
    IResult,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Format a timestamp the way MSH-7 and EVN-2 carry it (`YYYYMMDDHHMMSS`).
pub fn hl7_timestamp<Tz: TimeZone>(at: &DateTime<Tz>) -> String
where
    Tz::Offset: fmt::Display,
{
    at.format("%Y%m%d%H%M%S").to_string()
}

/// A fresh 20-character message control id for MSH-10.
pub fn new_control_id() -> String {
    let mut id = uuid::Uuid::new_v4().to_string();
    id.truncate(20);
    id
}

/// Represents a complete HL7 message
///
/// The first segment is always MSH and no other MSH follows. Message type,
/// control id and version are read from MSH on demand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    segments: Vec<Segment>,
}

impl Message {
    /// A message holding only an MSH segment that declares `delimiters`.
    pub fn new(delimiters: Delimiters) -> Self {
        Self {
            segments: vec![Segment::msh(&delimiters)],
        }
    }

    /// Assemble a message from decoded segments; the decoder has already
    /// checked the MSH invariants.
    pub(crate) fn from_segments(segments: Vec<Segment>) -> Self {
        Self { segments }
    }

    /// Parse an HL7 message from a string
    pub fn parse(input: &str) -> Result<Self, HL7Error> {
        decoder::decode(input)
    }

    /// Encode with the delimiters this message declares in MSH.
    pub fn encode(&self) -> Result<String, HL7Error> {
        encoder::encode(self, &self.delimiters()?)
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn msh(&self) -> Option<&Segment> {
        self.segments.first().filter(|s| s.is_msh())
    }

    /// Delimiters declared in MSH-1/MSH-2.
    pub fn delimiters(&self) -> Result<Delimiters, HL7Error> {
        let msh = self
            .msh()
            .ok_or_else(|| HL7Error::MissingField("MSH segment".to_string()))?;
        let field = msh
            .field(1)
            .and_then(|f| f.value().chars().next())
            .ok_or_else(|| HL7Error::MissingField("Field separator (MSH.1)".to_string()))?;
        let encoding = msh.field(2).map_or("", Field::value);
        Delimiters::from_encoding_characters(field, encoding)
    }

    /// Get a specific segment by name
    pub fn get_segment(&self, name: &str) -> Option<&Segment> {
        self.segments.iter().find(|s| s.code() == name)
    }

    /// Get all segments with a specific name
    pub fn get_segments(&self, name: &str) -> Vec<&Segment> {
        self.segments.iter().filter(|s| s.code() == name).collect()
    }

    /// Field of the first segment with `code`, by 1-based position.
    pub fn get_field(&self, code: &str, position: usize) -> Option<&Field> {
        self.get_segment(code).and_then(|s| s.field(position))
    }

    /// Set a field on the first segment with `code`, appending the segment
    /// when the message has none yet.
    pub fn set_field(
        &mut self,
        code: &str,
        position: usize,
        field: impl Into<Field>,
    ) -> Result<(), HL7Error> {
        self.segment_or_insert(code)?.set_field(position, field)
    }

    /// Append a segment. MSH may not appear twice.
    pub fn add_segment(&mut self, segment: Segment) -> Result<(), HL7Error> {
        if segment.is_msh() {
            return Err(HL7Error::InvalidStructure(
                "a message has exactly one MSH segment".to_string(),
            ));
        }
        if !is_valid_segment_code(segment.code()) {
            return Err(HL7Error::InvalidSegmentCode {
                code: segment.code().to_string(),
                index: Some(self.segments.len()),
            });
        }
        self.segments.push(segment);
        Ok(())
    }

    fn segment_or_insert(&mut self, code: &str) -> Result<&mut Segment, HL7Error> {
        match self.segments.iter().position(|s| s.code() == code) {
            Some(i) => Ok(&mut self.segments[i]),
            None => {
                self.add_segment(Segment::new(code)?)?;
                let last = self.segments.len() - 1;
                Ok(&mut self.segments[last])
            }
        }
    }

    /// The field a path points at, ignoring its component parts.
    pub fn field_at(&self, path: &FieldPath) -> Option<&Field> {
        let index = path.occurrence.checked_sub(1)?;
        self.get_segments(&path.segment)
            .get(index)
            .and_then(|s| s.field(path.field))
    }

    /// The literal a path points at; missing parts default to position 1.
    pub fn get(&self, path: &FieldPath) -> Option<&str> {
        self.field_at(path)?
            .repetition(path.repetition.unwrap_or(1))?
            .component(path.component.unwrap_or(1))?
            .subcomponent(path.subcomponent.unwrap_or(1))
    }

    /// [`Message::get`] with a textual path such as `PID-5.2`.
    pub fn value(&self, path: &str) -> Result<Option<&str>, HL7Error> {
        let path: FieldPath = path.parse()?;
        Ok(self.get(&path))
    }

    /// Write a literal at `path`, creating the segment and padding positions.
    pub fn set_value(&mut self, path: &FieldPath, value: impl Into<String>) -> Result<(), HL7Error> {
        let occurrences = self.get_segments(&path.segment).len();
        if path.occurrence == 0
            || path.occurrence > occurrences + 1
            || (path.segment == MSH && path.occurrence > 1)
        {
            return Err(HL7Error::InvalidPath {
                path: path.to_string(),
                reason: format!("message has {} {} segment(s)", occurrences, path.segment),
            });
        }
        if path.occurrence > occurrences {
            self.add_segment(Segment::new(&path.segment)?)?;
        }
        let segment = self
            .segments
            .iter_mut()
            .filter(|s| s.code() == path.segment)
            .nth(path.occurrence - 1)
            .ok_or_else(|| HL7Error::MissingField(path.to_string()))?;
        let component = segment
            .field_mut(path.field)?
            .repetition_mut(path.repetition.unwrap_or(1))
            .and_then(|r| r.component_mut(path.component.unwrap_or(1)))
            .ok_or_else(|| HL7Error::InvalidPath {
                path: path.to_string(),
                reason: "positions start at 1".to_string(),
            })?;
        component.set_subcomponent(path.subcomponent.unwrap_or(1), value);
        Ok(())
    }

    /// Segment codes in message order.
    pub fn segment_codes(&self) -> Vec<&str> {
        self.segments.iter().map(Segment::code).collect()
    }

    fn msh_component(&self, field: usize, component: usize) -> Option<&str> {
        self.msh()?
            .field(field)?
            .component(component)
            .map(|c| c.value())
            .filter(|v| !v.is_empty())
    }

    /// Message code, MSH-9.1 (e.g. `ADT`).
    pub fn message_type(&self) -> Option<&str> {
        self.msh_component(9, 1)
    }

    /// Trigger event, MSH-9.2 (e.g. `A01`).
    pub fn trigger_event(&self) -> Option<&str> {
        self.msh_component(9, 2)
    }

    /// Message structure, MSH-9.3 (e.g. `ADT_A01`).
    pub fn message_structure(&self) -> Option<&str> {
        self.msh_component(9, 3)
    }

    /// Message control id, MSH-10.
    pub fn control_id(&self) -> Option<&str> {
        self.msh_component(10, 1)
    }

    /// Version id, MSH-12.
    pub fn version(&self) -> Option<&str> {
        self.msh_component(12, 1)
    }

    /// Check if this is an ADT message
    pub fn is_adt(&self) -> bool {
        self.message_type() == Some("ADT")
    }
}

/// Fluent construction of a [`Message`]; the first error is kept and
/// returned from [`MessageBuilder::build`].
#[derive(Debug)]
pub struct MessageBuilder {
    message: Message,
    error: Option<HL7Error>,
}

impl MessageBuilder {
    pub fn new(delimiters: Delimiters) -> Self {
        Self {
            message: Message::new(delimiters),
            error: None,
        }
    }

    fn apply(mut self, step: impl FnOnce(&mut Message) -> Result<(), HL7Error>) -> Self {
        if self.error.is_none() {
            if let Err(e) = step(&mut self.message) {
                self.error = Some(e);
            }
        }
        self
    }

    /// Set a whole field on the first segment with `code`.
    pub fn field(self, code: &str, position: usize, field: impl Into<Field>) -> Self {
        let field = field.into();
        self.apply(|m| m.set_field(code, position, field))
    }

    /// Set a single literal by path, e.g. `PV1-3.2`.
    pub fn value(self, path: &str, value: impl Into<String>) -> Self {
        let value = value.into();
        self.apply(|m| {
            let path: FieldPath = path.parse()?;
            m.set_value(&path, value)
        })
    }

    /// Append a complete segment (for repeating segments such as OBX).
    pub fn segment(self, segment: Segment) -> Self {
        self.apply(|m| m.add_segment(segment))
    }

    pub fn build(self) -> Result<Message, HL7Error> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.message),
        }
    }
}

impl Default for MessageBuilder {
    fn default() -> Self {
        Self::new(Delimiters::default())
    }
}

/// Location of a value inside a message, written `PID-5.2`, `PID-3[2].1`,
/// `OBX(2)-5` or `PID-11.1.1` (segment occurrence, field, repetition,
/// component, sub-component; all 1-based).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldPath {
    pub segment: String,
    pub occurrence: usize,
    pub field: usize,
    pub repetition: Option<usize>,
    pub component: Option<usize>,
    pub subcomponent: Option<usize>,
}

impl FieldPath {
    pub fn new(segment: &str, field: usize) -> Self {
        Self {
            segment: segment.to_string(),
            occurrence: 1,
            field,
            repetition: None,
            component: None,
            subcomponent: None,
        }
    }

    pub fn occurrence(mut self, occurrence: usize) -> Self {
        self.occurrence = occurrence;
        self
    }

    pub fn repetition(mut self, repetition: usize) -> Self {
        self.repetition = Some(repetition);
        self
    }

    pub fn component(mut self, component: usize) -> Self {
        self.component = Some(component);
        self
    }

    pub fn subcomponent(mut self, subcomponent: usize) -> Self {
        self.subcomponent = Some(subcomponent);
        self
    }
}

fn position(input: &str) -> IResult<&str, usize> {
    map_res(digit1, |digits: &str| digits.parse::<usize>())(input)
}

fn field_path(input: &str) -> IResult<&str, FieldPath> {
    let (input, segment) =
        take_while_m_n(3, 3, |c: char| c.is_ascii_uppercase() || c.is_ascii_digit())(input)?;
    let (input, occurrence) = opt(delimited(char('('), position, char(')')))(input)?;
    let (input, _) = alt((char('-'), char('.')))(input)?;
    let (input, field) = position(input)?;
    let (input, repetition) = opt(delimited(char('['), position, char(']')))(input)?;
    let (input, component) = opt(preceded(char('.'), position))(input)?;
    let (input, subcomponent) = opt(preceded(char('.'), position))(input)?;
    Ok((
        input,
        FieldPath {
            segment: segment.to_string(),
            occurrence: occurrence.unwrap_or(1),
            field,
            repetition,
            component,
            subcomponent,
        },
    ))
}

impl FromStr for FieldPath {
    type Err = HL7Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (_, path) = all_consuming(field_path)(s).map_err(|_| HL7Error::InvalidPath {
            path: s.to_string(),
            reason: "expected SEG[(n)]-field[[rep]][.component[.subcomponent]]".to_string(),
        })?;
        let positions = [
            Some(path.occurrence),
            Some(path.field),
            path.repetition,
            path.component,
            path.subcomponent,
        ];
        if positions.contains(&Some(0)) {
            return Err(HL7Error::InvalidPath {
                path: s.to_string(),
                reason: "positions start at 1".to_string(),
            });
        }
        Ok(path)
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segment)?;
        if self.occurrence != 1 {
            write!(f, "({})", self.occurrence)?;
        }
        write!(f, "-{}", self.field)?;
        if let Some(r) = self.repetition {
            write!(f, "[{}]", r)?;
        }
        if let Some(c) = self.component {
            write!(f, ".{}", c)?;
        }
        if let Some(s) = self.subcomponent {
            write!(f, ".{}", s)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_field_path_parsing() {
        let path: FieldPath = "PID-5.2".parse().unwrap();
        assert_eq!(path, FieldPath::new("PID", 5).component(2));

        let path: FieldPath = "OBX(2)-3[1].1.2".parse().unwrap();
        assert_eq!(
            path,
            FieldPath::new("OBX", 3)
                .occurrence(2)
                .repetition(1)
                .component(1)
                .subcomponent(2)
        );
        assert_eq!(path.to_string(), "OBX(2)-3[1].1.2");

        let dotted: FieldPath = "PV1.3.2".parse().unwrap();
        assert_eq!(dotted, FieldPath::new("PV1", 3).component(2));
    }

    #[test]
    fn test_field_path_rejects_bad_input() {
        assert!("pid-5".parse::<FieldPath>().is_err());
        assert!("PID".parse::<FieldPath>().is_err());
        assert!("PID-5.x".parse::<FieldPath>().is_err());
        assert!(matches!(
            "PID-0".parse::<FieldPath>(),
            Err(HL7Error::InvalidPath { .. })
        ));
    }

    #[test]
    fn test_builder_sets_fields_and_paths() {
        let message = MessageBuilder::default()
            .field("MSH", 9, Field::from_components(["ADT", "A01", "ADT_A01"]))
            .field("MSH", 10, "MSG00001")
            .field("MSH", 12, "2.5.1")
            .field("PID", 5, Field::from_components(["Smith", "John"]))
            .value("PV1-3.2", "ICU")
            .value("PV1-3.4", "HOSPITAL_A")
            .build()
            .unwrap();

        assert_eq!(message.segment_codes(), ["MSH", "PID", "PV1"]);
        assert_eq!(message.message_type(), Some("ADT"));
        assert_eq!(message.trigger_event(), Some("A01"));
        assert_eq!(message.message_structure(), Some("ADT_A01"));
        assert_eq!(message.control_id(), Some("MSG00001"));
        assert_eq!(message.version(), Some("2.5.1"));
        assert!(message.is_adt());
        assert_eq!(message.value("PID-5.2").unwrap(), Some("John"));
        assert_eq!(
            message.get_field("PV1", 3).unwrap().to_string(),
            "^ICU^^HOSPITAL_A"
        );
    }

    #[test]
    fn test_builder_keeps_first_error() {
        let err = MessageBuilder::default()
            .field("pid", 3, "X")
            .field("MSH", 1, "#")
            .build()
            .unwrap_err();
        assert!(matches!(err, HL7Error::InvalidSegmentCode { .. }));

        let err = MessageBuilder::default()
            .value("PID-x", "1")
            .build()
            .unwrap_err();
        assert!(matches!(err, HL7Error::InvalidPath { .. }));
    }

    #[test]
    fn test_msh_cannot_be_added_twice() {
        let mut message = Message::new(Delimiters::default());
        let err = message
            .add_segment(Segment::msh(&Delimiters::default()))
            .unwrap_err();
        assert!(matches!(err, HL7Error::InvalidStructure(_)));
        assert!(message
            .set_value(&"MSH(2)-3".parse().unwrap(), "X")
            .is_err());
    }

    #[test]
    fn test_set_value_on_repeated_segments() {
        let mut message = Message::new(Delimiters::default());
        message
            .set_value(&"OBX(1)-5".parse().unwrap(), "10.5")
            .unwrap();
        message
            .set_value(&"OBX(2)-5".parse().unwrap(), "4.5")
            .unwrap();
        assert!(message.set_value(&"OBX(4)-5".parse().unwrap(), "x").is_err());
        assert_eq!(message.get_segments("OBX").len(), 2);
        assert_eq!(message.value("OBX(2)-5").unwrap(), Some("4.5"));
    }

    #[test]
    fn test_delimiters_follow_msh() {
        let custom = Delimiters::from_encoding_characters('#', "!@$%").unwrap();
        let message = Message::new(custom);
        assert_eq!(message.delimiters().unwrap(), custom);
    }

    #[test]
    fn test_timestamp_and_control_id_helpers() {
        let at = Utc.with_ymd_and_hms(2024, 3, 5, 14, 7, 9).unwrap();
        assert_eq!(hl7_timestamp(&at), "20240305140709");
        let id = new_control_id();
        assert_eq!(id.len(), 20);
        assert_ne!(id, new_control_id());
    }
}
