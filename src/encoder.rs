use crate::segment::is_valid_segment_code;
use crate::{Delimiters, HL7Error, Message, Segment};
use tracing::{debug, trace};

/// Segment terminator. Fixed by the standard, never configurable.
pub const SEGMENT_TERMINATOR: char = '\r';

/// Serialize `message` with `delimiters`.
///
/// `delimiters` must be the set the message declares in MSH-1/MSH-2;
/// a mismatch is rejected with [`HL7Error::InvalidDelimiters`]. Every
/// segment is checked before any output is produced, so a failure never
/// yields partial text. Each segment, the last one included, ends with
/// [`SEGMENT_TERMINATOR`].
pub fn encode(message: &Message, delimiters: &Delimiters) -> Result<String, HL7Error> {
    delimiters.validate()?;
    check_segments(message)?;

    let declared = message.delimiters()?;
    if declared != *delimiters {
        return Err(HL7Error::InvalidDelimiters(format!(
            "MSH declares {}{} but encoding was requested with {}{}",
            declared.field,
            declared.encoding_characters(),
            delimiters.field,
            delimiters.encoding_characters()
        )));
    }

    let mut out = String::with_capacity(message.segments().len() * 64);
    for (index, segment) in message.segments().iter().enumerate() {
        let start = out.len();
        write_segment(segment, delimiters, &mut out);
        trace!(index, code = segment.code(), bytes = out.len() - start, "encoded segment");
        out.push(SEGMENT_TERMINATOR);
    }

    debug!(
        segments = message.segments().len(),
        bytes = out.len(),
        "encoded HL7 message"
    );
    Ok(out)
}

fn check_segments(message: &Message) -> Result<(), HL7Error> {
    let first = message
        .segments()
        .first()
        .ok_or_else(|| HL7Error::InvalidStructure("message has no segments".to_string()))?;
    if !first.is_msh() {
        return Err(HL7Error::MissingMsh {
            found: first.code().to_string(),
        });
    }

    for (index, segment) in message.segments().iter().enumerate() {
        if !is_valid_segment_code(segment.code()) {
            return Err(HL7Error::InvalidSegmentCode {
                code: segment.code().to_string(),
                index: Some(index),
            });
        }
        if index > 0 && segment.is_msh() {
            return Err(HL7Error::InvalidStructure(format!(
                "duplicate MSH segment at index {}",
                index
            )));
        }
    }
    Ok(())
}

fn write_segment(segment: &Segment, delimiters: &Delimiters, out: &mut String) {
    out.push_str(segment.code());

    // MSH-1 and MSH-2 are the delimiters themselves, written unescaped.
    let skip = if segment.is_msh() {
        out.push(delimiters.field);
        out.push_str(&delimiters.encoding_characters());
        2
    } else {
        0
    };

    let populated = segment.populated_len();
    for field in segment.fields().iter().take(populated).skip(skip) {
        out.push(delimiters.field);
        field.write_wire(delimiters, out);
    }
}
