//! Topic tags.
//!
//! A tag names one broadcast channel and follows the pattern
//! `<variable>@<controller>`, e.g. `%DW2500@20`.

use crate::error::{Error, Result};

/// Separator between the variable name and the controller id.
pub const TAG_SEPARATOR: char = '@';

/// Build the tag for a variable on a controller.
///
/// # Example
/// ```
/// use plcbridge_common::tag::build_tag;
///
/// assert_eq!(build_tag("%DW2500", "20"), "%DW2500@20");
/// ```
pub fn build_tag(variable: &str, controller: &str) -> String {
    format!("{}{}{}", variable, TAG_SEPARATOR, controller)
}

/// Parse a tag into its variable and controller parts.
///
/// The controller id is everything after the last `@`, so variable names
/// may themselves contain `@`. Returns `None` when either part is empty.
///
/// # Example
/// ```
/// use plcbridge_common::tag::parse_tag;
///
/// let parsed = parse_tag("%MX00072@21").unwrap();
/// assert_eq!(parsed.variable, "%MX00072");
/// assert_eq!(parsed.controller, "21");
///
/// assert!(parse_tag("no-separator").is_none());
/// ```
pub fn parse_tag(tag: &str) -> Option<ParsedTag<'_>> {
    let (variable, controller) = tag.rsplit_once(TAG_SEPARATOR)?;

    if variable.is_empty() || controller.is_empty() {
        return None;
    }

    Some(ParsedTag {
        variable,
        controller,
    })
}

/// Parse a tag, returning an error instead of `None`.
pub fn try_parse_tag(tag: &str) -> Result<ParsedTag<'_>> {
    parse_tag(tag).ok_or_else(|| Error::Tag(format!("expected <variable>@<controller>: {tag}")))
}

/// A tag split into its parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedTag<'a> {
    /// Variable name on the controller.
    pub variable: &'a str,
    /// Controller id.
    pub controller: &'a str,
}

impl ParsedTag<'_> {
    /// Rebuild the tag string.
    pub fn to_tag(&self) -> String {
        build_tag(self.variable, self.controller)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_tag() {
        assert_eq!(build_tag("X", "20"), "X@20");
    }

    #[test]
    fn test_parse_tag() {
        let parsed = parse_tag("%DW2516@20").unwrap();
        assert_eq!(parsed.variable, "%DW2516");
        assert_eq!(parsed.controller, "20");
        assert_eq!(parsed.to_tag(), "%DW2516@20");
    }

    #[test]
    fn test_parse_tag_uses_last_separator() {
        let parsed = parse_tag("a@b@21").unwrap();
        assert_eq!(parsed.variable, "a@b");
        assert_eq!(parsed.controller, "21");
    }

    #[test]
    fn test_parse_invalid_tags() {
        assert!(parse_tag("").is_none());
        assert!(parse_tag("X").is_none());
        assert!(parse_tag("@20").is_none());
        assert!(parse_tag("X@").is_none());
        assert!(matches!(try_parse_tag("X"), Err(Error::Tag(_))));
    }
}
