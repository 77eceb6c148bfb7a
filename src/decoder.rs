use crate::field::split_with_offsets;
use crate::segment::{is_valid_segment_code, MSH};
use crate::{Delimiters, Field, HL7Error, Message, Segment, StructureSpec};
use nom::{
    bytes::complete::{tag, take_till},
    character::complete::anychar,
    IResult,
};
use tracing::{debug, trace};

/// Decode a wire string with the lenient policy: surplus fields are kept.
pub fn decode(input: &str) -> Result<Message, HL7Error> {
    Decoder::new().decode(input)
}

/// Wire-text decoder.
///
/// Delimiters are always taken from the message's own MSH header. A
/// lenient decoder keeps every field it finds, so an unescaped field
/// delimiter in data simply produces extra fields. A strict decoder also
/// rejects segments carrying more populated fields than the structure
/// spec allows for them, reporting [`HL7Error::InconsistentDelimiter`].
#[derive(Debug, Clone, Default)]
pub struct Decoder {
    structures: Option<StructureSpec>,
}

/// One segment's text and where it starts in the input.
struct RawSegment<'a> {
    offset: usize,
    text: &'a str,
}

impl Decoder {
    pub fn new() -> Self {
        Self { structures: None }
    }

    /// Reject segments whose field count exceeds `max_fields` in `structures`.
    pub fn strict(structures: StructureSpec) -> Self {
        Self {
            structures: Some(structures),
        }
    }

    pub fn decode(&self, input: &str) -> Result<Message, HL7Error> {
        let raw = split_segments(input);
        let first = raw.first().ok_or(HL7Error::EmptyInput)?;

        if !first.text.starts_with(MSH) {
            return Err(HL7Error::MissingMsh {
                found: first.text.chars().take(3).collect(),
            });
        }

        let (delimiters, msh) = decode_msh(first)?;
        let mut segments = Vec::with_capacity(raw.len());
        segments.push(msh);

        for (index, segment) in raw.iter().enumerate().skip(1) {
            let decoded = decode_segment(index, segment, &delimiters)?;
            trace!(
                index,
                code = decoded.code(),
                fields = decoded.field_count(),
                "decoded segment"
            );
            segments.push(decoded);
        }

        let message = Message::from_segments(segments);
        if let Some(structures) = &self.structures {
            check_field_counts(&message, &raw, structures)?;
        }

        debug!(
            segments = message.segments().len(),
            message_type = message.message_type().unwrap_or(""),
            control_id = message.control_id().unwrap_or(""),
            "decoded HL7 message"
        );
        Ok(message)
    }
}

/// Split on `\r`, `\n` or `\r\n`, dropping blank trailing segments.
fn split_segments(input: &str) -> Vec<RawSegment<'_>> {
    let bytes = input.as_bytes();
    let mut segments = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\r' | b'\n' => {
                segments.push(RawSegment {
                    offset: start,
                    text: &input[start..i],
                });
                i += if bytes[i] == b'\r' && bytes.get(i + 1) == Some(&b'\n') {
                    2
                } else {
                    1
                };
                start = i;
            }
            _ => i += 1,
        }
    }
    segments.push(RawSegment {
        offset: start,
        text: &input[start..],
    });

    while segments
        .last()
        .map_or(false, |s| s.text.trim().is_empty())
    {
        segments.pop();
    }
    segments
}

/// `MSH`, the field separator, then the encoding characters up to the
/// next field separator.
fn msh_header(input: &str) -> IResult<&str, (char, &str)> {
    let (input, _) = tag(MSH)(input)?;
    let (input, field) = anychar(input)?;
    let (input, encoding) = take_till(move |c: char| c == field)(input)?;
    Ok((input, (field, encoding)))
}

fn decode_msh(raw: &RawSegment<'_>) -> Result<(Delimiters, Segment), HL7Error> {
    let malformed = |reason: String| HL7Error::MalformedSegment {
        index: 0,
        offset: raw.offset,
        reason,
    };

    let (rest, (field, encoding)) =
        msh_header(raw.text).map_err(|_| malformed("MSH header is truncated".to_string()))?;
    if encoding.chars().count() != 4 {
        return Err(malformed(format!(
            "MSH-2 must hold 4 encoding characters, found {:?}",
            encoding
        )));
    }
    let delimiters = Delimiters::from_encoding_characters(field, encoding).map_err(|e| {
        HL7Error::InconsistentDelimiter {
            index: 0,
            offset: raw.offset + MSH.len(),
            reason: e.to_string(),
        }
    })?;

    let mut fields = vec![Field::new(field.to_string()), Field::new(encoding)];
    if let Some(body) = rest.strip_prefix(field) {
        let base = raw.offset + (raw.text.len() - body.len());
        fields.extend(decode_fields(body, base, &delimiters)?);
    }
    Ok((delimiters, Segment::from_parts(MSH, fields)))
}

fn decode_segment(
    index: usize,
    raw: &RawSegment<'_>,
    delimiters: &Delimiters,
) -> Result<Segment, HL7Error> {
    let malformed = |reason: String| HL7Error::MalformedSegment {
        index,
        offset: raw.offset,
        reason,
    };

    let code_end = raw
        .text
        .char_indices()
        .nth(3)
        .map_or(raw.text.len(), |(i, _)| i);
    let (code, rest) = raw.text.split_at(code_end);

    if !is_valid_segment_code(code) {
        return Err(malformed(format!(
            "segment code {:?} is not 3 characters of A-Z/0-9",
            code
        )));
    }
    if code == MSH {
        return Err(malformed("duplicate MSH segment".to_string()));
    }

    let mut chars = rest.chars();
    let body = match chars.next() {
        None => return Ok(Segment::from_parts(code, Vec::new())),
        Some(c) if c == delimiters.field => chars.as_str(),
        Some(c) if c.is_alphanumeric() => {
            return Err(malformed(format!(
                "segment code {:?} is longer than 3 characters",
                raw.text.split(delimiters.field).next().unwrap_or(code)
            )))
        }
        Some(c) => {
            return Err(HL7Error::InconsistentDelimiter {
                index,
                offset: raw.offset + code_end,
                reason: format!(
                    "expected field delimiter {:?} after {}, found {:?}",
                    delimiters.field, code, c
                ),
            })
        }
    };

    let base = raw.offset + code_end + delimiters.field.len_utf8();
    let fields = decode_fields(body, base, delimiters)?;
    Ok(Segment::from_parts(code, fields))
}

fn decode_fields(
    body: &str,
    base: usize,
    delimiters: &Delimiters,
) -> Result<Vec<Field>, HL7Error> {
    split_with_offsets(body, delimiters.field)
        .map(|(at, raw)| Field::parse_at(raw, base + at, delimiters))
        .collect()
}

fn check_field_counts(
    message: &Message,
    raw: &[RawSegment<'_>],
    structures: &StructureSpec,
) -> Result<(), HL7Error> {
    let Some(structure) = structures.structure_for(message) else {
        return Ok(());
    };
    for (index, (segment, raw)) in message.segments().iter().zip(raw).enumerate() {
        let Some(max) = structure.rule(segment.code()).and_then(|r| r.max_fields) else {
            continue;
        };
        let populated = segment.populated_len();
        if populated > max {
            return Err(HL7Error::InconsistentDelimiter {
                index,
                offset: raw.offset,
                reason: format!(
                    "{} carries {} fields but defines at most {}; unescaped field delimiter in data?",
                    segment.code(),
                    populated,
                    max
                ),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::{MessageStructure, SegmentRule};
    use pretty_assertions::assert_eq;

    const ADT: &str = "MSH|^~\\&|SENDING_APP|SENDING_FACILITY|RECEIVING_APP|RECEIVING_FACILITY|20230401123000||ADT^A01|MSG00001|P|2.5\rEVN|A01|20230401123000\rPID|1||12345^^^MRN||DOE^JOHN^^^^||19800101|M\r";

    #[test]
    fn test_decode_msh_fields() {
        let message = decode(ADT).unwrap();
        let msh = message.msh().unwrap();
        assert_eq!(msh.field(1).unwrap().value(), "|");
        assert_eq!(msh.field(2).unwrap().value(), "^~\\&");
        assert_eq!(msh.field(3).unwrap().value(), "SENDING_APP");
        assert_eq!(message.message_type(), Some("ADT"));
        assert_eq!(message.trigger_event(), Some("A01"));
        assert_eq!(message.control_id(), Some("MSG00001"));
        assert_eq!(message.version(), Some("2.5"));
        assert_eq!(message.delimiters().unwrap(), Delimiters::default());
    }

    #[test]
    fn test_terminators_are_lenient() {
        let cr = decode(ADT).unwrap();
        let lf = decode(&ADT.replace('\r', "\n")).unwrap();
        let crlf = decode(&ADT.replace('\r', "\r\n")).unwrap();
        assert_eq!(cr, lf);
        assert_eq!(cr, crlf);
        assert_eq!(crlf.segment_codes(), ["MSH", "EVN", "PID"]);
    }

    #[test]
    fn test_empty_field_positions_are_present() {
        let message = decode("MSH|^~\\&\rPID|||").unwrap();
        let pid = message.get_segment("PID").unwrap();
        assert_eq!(pid.field_count(), 3);
        assert!(pid.fields().iter().all(Field::is_empty));
        assert!(pid.field(2).is_some());
        assert!(pid.field(4).is_none());
    }

    #[test]
    fn test_empty_input() {
        assert_eq!(decode("").unwrap_err(), HL7Error::EmptyInput);
        assert_eq!(decode("\r\n\r\n").unwrap_err(), HL7Error::EmptyInput);
    }

    #[test]
    fn test_missing_msh() {
        assert_eq!(
            decode("PID|1\rMSH|^~\\&").unwrap_err(),
            HL7Error::MissingMsh {
                found: "PID".to_string()
            }
        );
    }

    #[test]
    fn test_malformed_segments() {
        let err = decode("MSH|^~\\&\rPI|1").unwrap_err();
        assert!(matches!(err, HL7Error::MalformedSegment { index: 1, offset: 9, .. }));

        let err = decode("MSH|^~\\&\rpid|1").unwrap_err();
        assert!(matches!(err, HL7Error::MalformedSegment { index: 1, .. }));

        let err = decode("MSH|^~\\&\rPIDX|1").unwrap_err();
        assert!(matches!(err, HL7Error::MalformedSegment { index: 1, .. }));

        let err = decode("MSH|^~\\&\r\rPID|1").unwrap_err();
        assert!(matches!(err, HL7Error::MalformedSegment { index: 1, .. }));

        let err = decode("MSH|^~\\&\rMSH|^~\\&").unwrap_err();
        assert!(matches!(err, HL7Error::MalformedSegment { index: 1, .. }));

        let err = decode("MSH|^~").unwrap_err();
        assert!(matches!(err, HL7Error::MalformedSegment { index: 0, .. }));

        let err = decode("MSH").unwrap_err();
        assert!(matches!(err, HL7Error::MalformedSegment { index: 0, .. }));
    }

    #[test]
    fn test_inconsistent_delimiters() {
        let err = decode("MSH|^~\\&\rPID^1^2").unwrap_err();
        assert_eq!(
            err,
            HL7Error::InconsistentDelimiter {
                index: 1,
                offset: 12,
                reason: "expected field delimiter '|' after PID, found '^'".to_string(),
            }
        );

        let err = decode("MSH|^^\\&").unwrap_err();
        assert!(matches!(err, HL7Error::InconsistentDelimiter { index: 0, .. }));
    }

    #[test]
    fn test_custom_delimiters_from_msh() {
        let message = decode("MSH#!@$%#APP\rPID###A!B@C$F$D").unwrap();
        let pid = message.get_segment("PID").unwrap();
        let field = pid.field(3).unwrap();
        assert_eq!(field.component(1).unwrap().value(), "A");
        assert_eq!(field.component(2).unwrap().value(), "B");
        assert_eq!(field.repetition(2).unwrap().value(), "C#D");
        assert_eq!(message.encode().unwrap(), "MSH#!@$%#APP\rPID###A!B@C$F$D\r");
    }

    #[test]
    fn test_escape_error_reports_absolute_offset() {
        let err = decode("MSH|^~\\&\rNTE|1|bad\\Q\\").unwrap_err();
        assert_eq!(
            err,
            HL7Error::MalformedEscape {
                offset: 18,
                reason: "unknown escape code \"Q\"".to_string(),
            }
        );
    }

    #[test]
    fn test_lenient_keeps_surplus_fields_strict_rejects() {
        let mut spec = StructureSpec::default();
        spec.structures.insert(
            "ADT_A01".to_string(),
            MessageStructure::new(vec![
                SegmentRule::required("MSH"),
                SegmentRule::required("EVN").max_fields(2),
            ]),
        );
        let wire = "MSH|^~\\&|||||||ADT^A01^ADT_A01\rEVN|A01|20240101|oops|";

        let lenient = decode(wire).unwrap();
        assert_eq!(lenient.get_segment("EVN").unwrap().field_count(), 4);

        let err = Decoder::strict(spec.clone()).decode(wire).unwrap_err();
        assert!(matches!(
            err,
            HL7Error::InconsistentDelimiter { index: 1, offset: 31, .. }
        ));

        let ok = "MSH|^~\\&|||||||ADT^A01^ADT_A01\rEVN|A01|20240101||";
        assert!(Decoder::strict(spec).decode(ok).is_ok());
    }
}
