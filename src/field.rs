//! Field value model: repetitions of components of sub-components.
//!
//! All positions are 1-based, as in HL7 notation (`PID-5.2`). Empty trailing
//! elements at any level are treated as absent: they are ignored by equality
//! and omitted on encode, while empty elements before a populated one keep
//! their position.

use crate::{Delimiters, HL7Error};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The slice up to and including the last non-empty element.
fn populated<T>(items: &[T], is_empty: impl Fn(&T) -> bool) -> &[T] {
    let end = items.iter().rposition(|i| !is_empty(i)).map_or(0, |p| p + 1);
    &items[..end]
}

/// Split `s` on `delim`, pairing each part with its byte offset in `s`.
pub(crate) fn split_with_offsets(s: &str, delim: char) -> impl Iterator<Item = (usize, &str)> + '_ {
    let width = delim.len_utf8();
    let mut offset = 0;
    s.split(delim).map(move |part| {
        let at = offset;
        offset += part.len() + width;
        (at, part)
    })
}

/// Grow `items` with `fill` until index `at` exists, then return it.
fn slot<T>(items: &mut Vec<T>, at: usize, fill: impl Fn() -> T) -> &mut T {
    while items.len() <= at {
        items.push(fill());
    }
    &mut items[at]
}

/// A component: one or more sub-component literals.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Component {
    subcomponents: Vec<String>,
}

impl Component {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            subcomponents: vec![value.into()],
        }
    }

    pub fn empty() -> Self {
        Self::new("")
    }

    pub fn from_subcomponents<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let subcomponents: Vec<String> = values.into_iter().map(Into::into).collect();
        if subcomponents.is_empty() {
            Self::empty()
        } else {
            Self { subcomponents }
        }
    }

    pub fn subcomponents(&self) -> &[String] {
        &self.subcomponents
    }

    /// Sub-component by 1-based position.
    pub fn subcomponent(&self, position: usize) -> Option<&str> {
        position
            .checked_sub(1)
            .and_then(|i| self.subcomponents.get(i))
            .map(String::as_str)
    }

    /// The first sub-component, or "" when there is none.
    pub fn value(&self) -> &str {
        self.subcomponent(1).unwrap_or("")
    }

    pub fn is_empty(&self) -> bool {
        self.subcomponents.iter().all(String::is_empty)
    }

    pub fn set_subcomponent(&mut self, position: usize, value: impl Into<String>) {
        if let Some(i) = position.checked_sub(1) {
            *slot(&mut self.subcomponents, i, String::new) = value.into();
        }
    }

    fn populated(&self) -> &[String] {
        populated(&self.subcomponents, |s| s.is_empty())
    }

    fn write_wire(&self, delimiters: &Delimiters, out: &mut String) {
        for (i, sub) in self.populated().iter().enumerate() {
            if i > 0 {
                out.push(delimiters.subcomponent);
            }
            out.push_str(&delimiters.escape(sub));
        }
    }

    fn parse_at(raw: &str, base: usize, delimiters: &Delimiters) -> Result<Self, HL7Error> {
        let subcomponents = split_with_offsets(raw, delimiters.subcomponent)
            .map(|(at, sub)| {
                delimiters
                    .unescape(sub)
                    .map_err(|e| e.shifted(base + at))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { subcomponents })
    }
}

impl PartialEq for Component {
    fn eq(&self, other: &Self) -> bool {
        self.populated() == other.populated()
    }
}

impl Eq for Component {}

/// One occurrence of a repeating field: one or more components.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Repetition {
    components: Vec<Component>,
}

impl Repetition {
    pub fn new(components: Vec<Component>) -> Self {
        if components.is_empty() {
            Self::empty()
        } else {
            Self { components }
        }
    }

    pub fn empty() -> Self {
        Self {
            components: vec![Component::empty()],
        }
    }

    /// A repetition whose components are each a single literal.
    pub fn from_components<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(values.into_iter().map(Component::new).collect())
    }

    pub fn components(&self) -> &[Component] {
        &self.components
    }

    /// Component by 1-based position.
    pub fn component(&self, position: usize) -> Option<&Component> {
        position.checked_sub(1).and_then(|i| self.components.get(i))
    }

    pub fn component_mut(&mut self, position: usize) -> Option<&mut Component> {
        let i = position.checked_sub(1)?;
        Some(slot(&mut self.components, i, Component::empty))
    }

    pub fn value(&self) -> &str {
        self.component(1).map_or("", Component::value)
    }

    pub fn is_empty(&self) -> bool {
        self.components.iter().all(Component::is_empty)
    }

    fn populated(&self) -> &[Component] {
        populated(&self.components, Component::is_empty)
    }

    fn write_wire(&self, delimiters: &Delimiters, out: &mut String) {
        for (i, component) in self.populated().iter().enumerate() {
            if i > 0 {
                out.push(delimiters.component);
            }
            component.write_wire(delimiters, out);
        }
    }

    fn parse_at(raw: &str, base: usize, delimiters: &Delimiters) -> Result<Self, HL7Error> {
        let components = split_with_offsets(raw, delimiters.component)
            .map(|(at, component)| Component::parse_at(component, base + at, delimiters))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { components })
    }
}

impl PartialEq for Repetition {
    fn eq(&self, other: &Self) -> bool {
        self.populated() == other.populated()
    }
}

impl Eq for Repetition {}

/// A field value: one or more repetitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Field {
    repetitions: Vec<Repetition>,
}

impl Field {
    /// A single literal value.
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            repetitions: vec![Repetition::new(vec![Component::new(value)])],
        }
    }

    pub fn empty() -> Self {
        Self::new("")
    }

    /// A non-repeating field whose components are each a single literal,
    /// e.g. `["Smith", "John"]` for `Smith^John`.
    pub fn from_components<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            repetitions: vec![Repetition::from_components(values)],
        }
    }

    pub fn from_repetitions(repetitions: Vec<Repetition>) -> Self {
        if repetitions.is_empty() {
            Self::empty()
        } else {
            Self { repetitions }
        }
    }

    pub fn repetitions(&self) -> &[Repetition] {
        &self.repetitions
    }

    /// Repetition by 1-based position.
    pub fn repetition(&self, position: usize) -> Option<&Repetition> {
        position.checked_sub(1).and_then(|i| self.repetitions.get(i))
    }

    pub fn repetition_mut(&mut self, position: usize) -> Option<&mut Repetition> {
        let i = position.checked_sub(1)?;
        Some(slot(&mut self.repetitions, i, Repetition::empty))
    }

    pub fn push_repetition(&mut self, repetition: Repetition) {
        if self.is_empty() {
            self.repetitions = vec![repetition];
        } else {
            self.repetitions.push(repetition);
        }
    }

    /// Component of the first repetition, by 1-based position.
    pub fn component(&self, position: usize) -> Option<&Component> {
        self.repetition(1).and_then(|r| r.component(position))
    }

    /// The first leaf value, or "" for an empty field.
    pub fn value(&self) -> &str {
        self.repetition(1).map_or("", Repetition::value)
    }

    pub fn is_empty(&self) -> bool {
        self.repetitions.iter().all(Repetition::is_empty)
    }

    fn populated(&self) -> &[Repetition] {
        populated(&self.repetitions, Repetition::is_empty)
    }

    /// Serialize with `delimiters`, escaping every literal.
    pub fn to_wire(&self, delimiters: &Delimiters) -> String {
        let mut out = String::new();
        self.write_wire(delimiters, &mut out);
        out
    }

    pub(crate) fn write_wire(&self, delimiters: &Delimiters, out: &mut String) {
        for (i, repetition) in self.populated().iter().enumerate() {
            if i > 0 {
                out.push(delimiters.repetition);
            }
            repetition.write_wire(delimiters, out);
        }
    }

    /// Parse one field's wire text (no field delimiters inside).
    pub fn parse(raw: &str, delimiters: &Delimiters) -> Result<Self, HL7Error> {
        Self::parse_at(raw, 0, delimiters)
    }

    /// Like [`Field::parse`], reporting escape errors relative to `base`.
    pub(crate) fn parse_at(raw: &str, base: usize, delimiters: &Delimiters) -> Result<Self, HL7Error> {
        let repetitions = split_with_offsets(raw, delimiters.repetition)
            .map(|(at, repetition)| Repetition::parse_at(repetition, base + at, delimiters))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { repetitions })
    }
}

impl PartialEq for Field {
    fn eq(&self, other: &Self) -> bool {
        self.populated() == other.populated()
    }
}

impl Eq for Field {}

impl Default for Field {
    fn default() -> Self {
        Self::empty()
    }
}

impl From<&str> for Field {
    fn from(value: &str) -> Self {
        Field::new(value)
    }
}

impl From<String> for Field {
    fn from(value: String) -> Self {
        Field::new(value)
    }
}

/// Renders with the standard delimiters.
impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_wire(&Delimiters::default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse(raw: &str) -> Field {
        Field::parse(raw, &Delimiters::default()).unwrap()
    }

    #[test]
    fn test_parse_nested_levels() {
        let field = parse("A1&A2^B~C^^D");
        assert_eq!(field.repetitions().len(), 2);
        let first = field.repetition(1).unwrap();
        assert_eq!(first.components().len(), 2);
        assert_eq!(first.component(1).unwrap().subcomponents(), ["A1", "A2"]);
        assert_eq!(first.component(2).unwrap().value(), "B");
        let second = field.repetition(2).unwrap();
        assert_eq!(second.components().len(), 3);
        assert_eq!(second.component(2).unwrap().value(), "");
        assert_eq!(second.component(3).unwrap().value(), "D");
    }

    #[test]
    fn test_interior_empty_components_keep_position() {
        let field = parse("PAT-123456^^^HOSPITAL_A");
        assert_eq!(field.component(1).unwrap().value(), "PAT-123456");
        assert!(field.component(2).unwrap().is_empty());
        assert!(field.component(3).unwrap().is_empty());
        assert_eq!(field.component(4).unwrap().value(), "HOSPITAL_A");
        assert_eq!(field.to_wire(&Delimiters::default()), "PAT-123456^^^HOSPITAL_A");
    }

    #[test]
    fn test_trailing_empties_are_not_present() {
        let with_trailing = parse("Smith^John^^");
        let without = Field::from_components(["Smith", "John"]);
        assert_eq!(with_trailing, without);
        assert_eq!(with_trailing.to_wire(&Delimiters::default()), "Smith^John");
        assert_eq!(parse("~"), Field::empty());
        assert!(parse("^&^").is_empty());
    }

    #[test]
    fn test_leaves_are_unescaped() {
        let field = parse("Smith \\T\\ Sons^A\\S\\B");
        assert_eq!(field.component(1).unwrap().value(), "Smith & Sons");
        assert_eq!(field.component(2).unwrap().value(), "A^B");
        assert_eq!(
            field.to_wire(&Delimiters::default()),
            "Smith \\T\\ Sons^A\\S\\B"
        );
    }

    #[test]
    fn test_escape_error_offset_is_relative_to_field() {
        let err = Field::parse("ok^bad\\Q\\", &Delimiters::default()).unwrap_err();
        assert!(matches!(err, HL7Error::MalformedEscape { offset: 6, .. }));
    }

    #[test]
    fn test_setters_pad_positions() {
        let mut field = Field::empty();
        field
            .repetition_mut(1)
            .unwrap()
            .component_mut(4)
            .unwrap()
            .set_subcomponent(1, "HOSPITAL_A");
        field
            .repetition_mut(1)
            .unwrap()
            .component_mut(1)
            .unwrap()
            .set_subcomponent(1, "PAT-123456");
        assert_eq!(field.to_string(), "PAT-123456^^^HOSPITAL_A");
        assert!(field.repetition_mut(0).is_none());
    }

    #[test]
    fn test_push_repetition_replaces_empty_field() {
        let mut field = Field::empty();
        field.push_repetition(Repetition::from_components(["A"]));
        field.push_repetition(Repetition::from_components(["B", "C"]));
        assert_eq!(field.to_string(), "A~B^C");
    }

    #[test]
    fn test_serde_uses_nested_arrays() {
        let field = Field::from_components(["Smith", "John"]);
        let json = serde_json::to_string(&field).unwrap();
        assert_eq!(json, r#"[[["Smith"],["John"]]]"#);
        let back: Field = serde_json::from_str(&json).unwrap();
        assert_eq!(back, field);
    }
}
