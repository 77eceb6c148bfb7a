use crate::HL7Error;
use nom::{
    bytes::complete::{take_till, take_while_m_n},
    character::complete::char,
    combinator::{all_consuming, map_res},
    multi::many1,
    sequence::delimited,
    IResult,
};
use serde::{Deserialize, Serialize};

/// The five separator characters of an HL7 message, as declared in MSH-1/MSH-2
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delimiters {
    pub field: char,
    pub component: char,
    pub subcomponent: char,
    pub repetition: char,
    pub escape: char,
}

impl Default for Delimiters {
    fn default() -> Self {
        Self {
            field: '|',
            component: '^',
            subcomponent: '&',
            repetition: '~',
            escape: '\\',
        }
    }
}

impl Delimiters {
    /// Build a validated profile.
    pub fn new(
        field: char,
        component: char,
        repetition: char,
        escape: char,
        subcomponent: char,
    ) -> Result<Self, HL7Error> {
        let delimiters = Self {
            field,
            component,
            subcomponent,
            repetition,
            escape,
        };
        delimiters.validate()?;
        Ok(delimiters)
    }

    /// Build a profile from the field separator and the MSH-2 encoding
    /// characters (component, repetition, escape, sub-component).
    pub fn from_encoding_characters(field: char, encoding: &str) -> Result<Self, HL7Error> {
        let chars: Vec<char> = encoding.chars().collect();
        match chars.as_slice() {
            [component, repetition, escape, subcomponent] => {
                Self::new(field, *component, *repetition, *escape, *subcomponent)
            }
            _ => Err(HL7Error::InvalidDelimiters(format!(
                "encoding characters must be exactly 4 characters, got {:?}",
                encoding
            ))),
        }
    }

    /// MSH-2 rendering: component, repetition, escape, sub-component.
    pub fn encoding_characters(&self) -> String {
        [self.component, self.repetition, self.escape, self.subcomponent]
            .iter()
            .collect()
    }

    fn all(&self) -> [char; 5] {
        [
            self.field,
            self.component,
            self.repetition,
            self.escape,
            self.subcomponent,
        ]
    }

    /// Check that all five characters are distinct and usable as separators.
    pub fn validate(&self) -> Result<(), HL7Error> {
        let all = self.all();
        for (i, c) in all.iter().enumerate() {
            if c.is_alphanumeric() || c.is_whitespace() || c.is_control() {
                return Err(HL7Error::InvalidDelimiters(format!(
                    "{:?} cannot be used as a delimiter",
                    c
                )));
            }
            if all[i + 1..].contains(c) {
                return Err(HL7Error::InvalidDelimiters(format!(
                    "{:?} is declared more than once",
                    c
                )));
            }
        }
        Ok(())
    }

    /// Whether `c` is one of the five reserved characters.
    pub fn is_reserved(&self, c: char) -> bool {
        self.all().contains(&c)
    }

    /// Replace reserved and non-printable characters with escape sequences.
    pub fn escape(&self, raw: &str) -> String {
        if !raw.chars().any(|c| self.is_reserved(c) || c.is_control()) {
            return raw.to_string();
        }

        let e = self.escape;
        let mut out = String::with_capacity(raw.len() + 8);
        for c in raw.chars() {
            let code = match c {
                c if c == self.field => 'F',
                c if c == self.component => 'S',
                c if c == self.subcomponent => 'T',
                c if c == self.repetition => 'R',
                c if c == self.escape => 'E',
                c if c.is_control() => {
                    let mut buf = [0u8; 4];
                    out.push(e);
                    out.push('X');
                    for byte in c.encode_utf8(&mut buf).as_bytes() {
                        out.push_str(&format!("{:02X}", byte));
                    }
                    out.push(e);
                    continue;
                }
                c => {
                    out.push(c);
                    continue;
                }
            };
            out.push(e);
            out.push(code);
            out.push(e);
        }
        out
    }

    /// Resolve escape sequences in a sub-component literal.
    ///
    /// Error offsets point at the opening escape character, relative to `wire`.
    pub fn unescape(&self, wire: &str) -> Result<String, HL7Error> {
        if !wire.contains(self.escape) {
            return Ok(wire.to_string());
        }

        let mut out = String::with_capacity(wire.len());
        let mut rest = wire;
        while let Some(pos) = rest.find(self.escape) {
            out.push_str(&rest[..pos]);
            let offset = wire.len() - rest.len() + pos;
            let (remaining, body) =
                escape_sequence(self.escape)(&rest[pos..]).map_err(|_| HL7Error::MalformedEscape {
                    offset,
                    reason: "escape sequence has no closing escape character".to_string(),
                })?;
            self.resolve(body, offset, &mut out)?;
            rest = remaining;
        }
        out.push_str(rest);
        Ok(out)
    }

    fn resolve(&self, body: &str, offset: usize, out: &mut String) -> Result<(), HL7Error> {
        match body {
            "F" => out.push(self.field),
            "S" => out.push(self.component),
            "T" => out.push(self.subcomponent),
            "R" => out.push(self.repetition),
            "E" => out.push(self.escape),
            _ if body.starts_with('X') => {
                let (_, bytes) = hex_bytes(&body[1..]).map_err(|_| HL7Error::MalformedEscape {
                    offset,
                    reason: format!("invalid hex escape {:?}", body),
                })?;
                let text = String::from_utf8(bytes).map_err(|_| HL7Error::MalformedEscape {
                    offset,
                    reason: format!("hex escape {:?} is not valid UTF-8", body),
                })?;
                out.push_str(&text);
            }
            _ => {
                return Err(HL7Error::MalformedEscape {
                    offset,
                    reason: format!("unknown escape code {:?}", body),
                })
            }
        }
        Ok(())
    }
}

/// `\code\` with the escape character as both brackets; yields the code.
fn escape_sequence<'a>(escape: char) -> impl Fn(&'a str) -> IResult<&'a str, &'a str> {
    move |input: &'a str| {
        delimited(
            char(escape),
            take_till(move |c: char| c == escape),
            char(escape),
        )(input)
    }
}

fn hex_bytes(input: &str) -> IResult<&str, Vec<u8>> {
    all_consuming(many1(map_res(
        take_while_m_n(2, 2, |c: char| c.is_ascii_hexdigit()),
        |pair: &str| u8::from_str_radix(pair, 16),
    )))(input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_encoding_characters() {
        assert_eq!(Delimiters::default().encoding_characters(), "^~\\&");
    }

    #[test]
    fn test_from_encoding_characters() {
        let d = Delimiters::from_encoding_characters('#', "!@$%").unwrap();
        assert_eq!(d.field, '#');
        assert_eq!(d.component, '!');
        assert_eq!(d.repetition, '@');
        assert_eq!(d.escape, '$');
        assert_eq!(d.subcomponent, '%');
        assert_eq!(d.encoding_characters(), "!@$%");
    }

    #[test]
    fn test_rejects_duplicate_and_alphanumeric_delimiters() {
        assert!(matches!(
            Delimiters::new('|', '^', '^', '\\', '&'),
            Err(HL7Error::InvalidDelimiters(_))
        ));
        assert!(matches!(
            Delimiters::new('|', 'A', '~', '\\', '&'),
            Err(HL7Error::InvalidDelimiters(_))
        ));
        assert!(Delimiters::from_encoding_characters('|', "^~\\").is_err());
    }

    #[test]
    fn test_escape_reserved_characters() {
        let d = Delimiters::default();
        assert_eq!(d.escape("A|B^C&D~E\\F"), "A\\F\\B\\S\\C\\T\\D\\R\\E\\E\\F");
        assert_eq!(d.escape("plain text"), "plain text");
    }

    #[test]
    fn test_escape_control_characters_as_hex() {
        let d = Delimiters::default();
        assert_eq!(d.escape("line1\rline2"), "line1\\X0D\\line2");
        assert_eq!(d.unescape("line1\\X0D0A\\line2").unwrap(), "line1\r\nline2");
    }

    #[test]
    fn test_unescape_all_codes() {
        let d = Delimiters::default();
        assert_eq!(
            d.unescape("\\F\\\\S\\\\T\\\\R\\\\E\\").unwrap(),
            "|^&~\\"
        );
        assert_eq!(d.unescape("Smith \\T\\ Sons").unwrap(), "Smith & Sons");
    }

    #[test]
    fn test_unescape_uses_declared_escape_character() {
        let d = Delimiters::from_encoding_characters('#', "!@$%").unwrap();
        assert_eq!(d.unescape("a$F$b").unwrap(), "a#b");
        assert_eq!(d.escape("a#b!c"), "a$F$b$S$c");
    }

    #[test]
    fn test_unescape_unterminated_sequence() {
        let d = Delimiters::default();
        let err = d.unescape("abc\\F").unwrap_err();
        assert_eq!(
            err,
            HL7Error::MalformedEscape {
                offset: 3,
                reason: "escape sequence has no closing escape character".to_string(),
            }
        );
    }

    #[test]
    fn test_unescape_unknown_code_and_bad_hex() {
        let d = Delimiters::default();
        assert!(matches!(
            d.unescape("x\\Q\\y"),
            Err(HL7Error::MalformedEscape { offset: 1, .. })
        ));
        assert!(matches!(
            d.unescape("\\\\"),
            Err(HL7Error::MalformedEscape { offset: 0, .. })
        ));
        assert!(d.unescape("\\XZZ\\").is_err());
        assert!(d.unescape("\\X0\\").is_err());
        assert!(d.unescape("\\XFF\\").is_err());
    }

    #[test]
    fn test_escape_round_trip_every_reserved_character() {
        let d = Delimiters::default();
        let raw = "|^~\\&\\E\\ \t\u{7f} caf\u{e9}";
        assert_eq!(d.unescape(&d.escape(raw)).unwrap(), raw);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn unescape_inverts_escape(raw in any::<String>()) {
                let d = Delimiters::default();
                prop_assert_eq!(d.unescape(&d.escape(&raw)).unwrap(), raw);
            }

            #[test]
            fn unescape_inverts_escape_with_custom_profile(
                raw in any::<String>(),
                reserved in "[#!@$%|^~&\\\\a-z\t]{0,24}",
            ) {
                let d = Delimiters::from_encoding_characters('#', "!@$%").unwrap();
                for text in [raw.as_str(), reserved.as_str()] {
                    let escaped = d.escape(text);
                    prop_assert!(!escaped.contains(&['#', '!', '@', '%'][..]));
                    prop_assert_eq!(d.unescape(&escaped).unwrap(), text);
                }
            }

            #[test]
            fn escaped_text_has_no_bare_separators(raw in "[a-z|^~&\\\\\r\n]{0,24}") {
                let d = Delimiters::default();
                let escaped = d.escape(&raw);
                prop_assert!(!escaped.contains(&['|', '^', '~', '&', '\r', '\n'][..]));
            }
        }
    }
}
