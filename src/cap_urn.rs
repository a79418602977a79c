//! Structured capability URNs and the `accepts` subsumption relation.
//!
//! Modeled as a plain record plus a free function/method, not a class
//! hierarchy — see DESIGN.md for why.

use std::fmt;

use crate::error::CapUrnError;

/// A parsed `cap:(op=X;)?in=Y;out=Z` capability identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CapUrn {
    pub op_spec: Option<String>,
    pub in_spec: String,
    pub out_spec: String,
}

/// `cap:in=media:;out=media:` — pass-through, matches any in/out.
pub fn cap_identity() -> CapUrn {
    CapUrn {
        op_spec: None,
        in_spec: "media:".to_string(),
        out_spec: "media:".to_string(),
    }
}

/// `cap:in=media:;out=media:void` — void sink, accepts anything discarded.
pub fn cap_discard() -> CapUrn {
    CapUrn {
        op_spec: None,
        in_spec: "media:".to_string(),
        out_spec: "media:void".to_string(),
    }
}

impl CapUrn {
    /// Parse the textual form. Tolerant of quoted values and field reordering.
    pub fn parse(text: &str) -> Result<CapUrn, CapUrnError> {
        let rest = text
            .strip_prefix("cap:")
            .ok_or(CapUrnError::MissingPrefix)?;

        let mut op_spec = None;
        let mut in_spec = None;
        let mut out_spec = None;

        for field in split_fields(rest)? {
            let (key, value) = split_field(&field)?;
            match key {
                "op" => op_spec = Some(value),
                "in" => in_spec = Some(value),
                "out" => out_spec = Some(value),
                other => return Err(CapUrnError::MalformedField(other.to_string())),
            }
        }

        Ok(CapUrn {
            op_spec,
            in_spec: in_spec.ok_or(CapUrnError::MissingIn)?,
            out_spec: out_spec.ok_or(CapUrnError::MissingOut)?,
        })
    }

    /// Canonical textual form: fields in a fixed order, always quoted.
    pub fn canonical_string(&self) -> String {
        let mut s = String::from("cap:");
        if let Some(op) = &self.op_spec {
            s.push_str(&format!("op={op:?};"));
        }
        s.push_str(&format!("in={:?};out={:?}", self.in_spec, self.out_spec));
        s
    }

    /// Does `self` (a registered pattern) accept `other` (a request)?
    ///
    /// Subsumption is directional: more-specific requests against
    /// less-specific registrations match; the reverse does not.
    pub fn accepts(&self, other: &CapUrn) -> bool {
        self.op_spec == other.op_spec
            && media_accepts(&self.in_spec, &other.in_spec)
            && media_accepts(&self.out_spec, &other.out_spec)
    }
}

impl fmt::Display for CapUrn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical_string())
    }
}

/// `media:` patterns are `media:` (any) or `media:seg;seg;...`. `pattern`
/// accepts `request` iff pattern's media segment list is a prefix of
/// request's (equal counts as a prefix of itself), or pattern is the empty
/// `media:` wildcard. `media:void` only accepts `media:void` itself.
fn media_accepts(pattern: &str, request: &str) -> bool {
    if pattern == request {
        return true;
    }
    let pattern_body = match pattern.strip_prefix("media:") {
        Some(b) => b,
        None => return false,
    };
    let request_body = match request.strip_prefix("media:") {
        Some(b) => b,
        None => return false,
    };

    // The void sentinel never generalizes beyond itself.
    if pattern_body == "void" || request_body == "void" {
        return pattern_body == request_body;
    }

    if pattern_body.is_empty() {
        return true;
    }

    let pattern_segs: Vec<&str> = pattern_body.split(';').collect();
    let request_segs: Vec<&str> = request_body.split(';').collect();

    if pattern_segs.len() > request_segs.len() {
        return false;
    }
    pattern_segs
        .iter()
        .zip(request_segs.iter())
        .all(|(p, r)| p == r)
}

/// Split the portion after `cap:` into `key=value` field strings, honoring
/// quoted values that may contain `;`.
fn split_fields(rest: &str) -> Result<Vec<String>, CapUrnError> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = rest.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            ';' if !in_quotes => {
                if !current.is_empty() {
                    fields.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(c),
        }
    }
    if in_quotes {
        return Err(CapUrnError::UnterminatedQuote);
    }
    if !current.is_empty() {
        fields.push(current);
    }
    Ok(fields)
}

/// Split a single `key=value` field, stripping surrounding quotes from value.
fn split_field(field: &str) -> Result<(&str, String), CapUrnError> {
    let idx = field
        .find('=')
        .ok_or_else(|| CapUrnError::MalformedField(field.to_string()))?;
    let key = &field[..idx];
    let mut value = &field[idx + 1..];
    if value.starts_with('"') && value.ends_with('"') && value.len() >= 2 {
        value = &value[1..value.len() - 1];
    }
    Ok((key, value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_basic() {
        let urn = CapUrn::parse("cap:in=media:;out=media:").unwrap();
        assert_eq!(urn.in_spec, "media:");
        assert_eq!(urn.out_spec, "media:");
        assert_eq!(urn.op_spec, None);
    }

    #[test]
    fn parse_with_op_and_quotes() {
        let urn = CapUrn::parse(r#"cap:op=double;in="media:void";out="media:void""#).unwrap();
        assert_eq!(urn.op_spec.as_deref(), Some("double"));
        assert_eq!(urn.in_spec, "media:void");
        assert_eq!(urn.out_spec, "media:void");
    }

    #[test]
    fn parse_reordered_fields() {
        let a = CapUrn::parse("cap:out=media:;in=media:").unwrap();
        let b = CapUrn::parse("cap:in=media:;out=media:").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn parse_missing_fields_errors() {
        assert_eq!(CapUrn::parse("cap:in=media:").unwrap_err(), CapUrnError::MissingOut);
        assert_eq!(CapUrn::parse("cap:out=media:").unwrap_err(), CapUrnError::MissingIn);
        assert_eq!(
            CapUrn::parse("in=media:;out=media:").unwrap_err(),
            CapUrnError::MissingPrefix
        );
    }

    #[test]
    fn identity_accepts_specific_request() {
        let pattern = cap_identity();
        let request = CapUrn::parse("cap:in=media:text;out=media:text").unwrap();
        assert!(pattern.accepts(&request));
    }

    #[test]
    fn specific_does_not_accept_more_specific_request() {
        let pattern =
            CapUrn::parse("cap:in=media:text;out=media:text").unwrap();
        let request =
            CapUrn::parse("cap:in=media:text;utf8;normalized;out=media:text").unwrap();
        assert!(!pattern.accepts(&request));
    }

    #[test]
    fn subsumption_directionality() {
        let general = CapUrn::parse("cap:in=media:;out=media:").unwrap();
        let specific = CapUrn::parse("cap:in=media:text;out=media:text").unwrap();
        assert!(general.accepts(&specific));
        assert!(!specific.accepts(&general));
    }

    #[test]
    fn op_must_match_exactly() {
        let pattern = CapUrn::parse("cap:op=double;in=media:;out=media:").unwrap();
        let request = CapUrn::parse("cap:in=media:;out=media:").unwrap();
        assert!(!pattern.accepts(&request));
        assert!(!request.accepts(&pattern));
    }

    #[test]
    fn discard_accepts_any_void_output() {
        let pattern = cap_discard();
        let request = CapUrn::parse("cap:in=media:text;out=media:void").unwrap();
        assert!(pattern.accepts(&request));
    }

    #[test]
    fn void_is_not_generalized_by_empty_media() {
        let pattern = CapUrn::parse("cap:in=media:;out=media:").unwrap();
        let request = CapUrn::parse("cap:in=media:;out=media:void").unwrap();
        assert!(!pattern.accepts(&request));
    }

    #[test]
    fn urn_spec_example_s7() {
        let pattern = CapUrn::parse(
            r#"cap:op=process;in="media:text;utf8";out="media:text;utf8""#,
        )
        .unwrap();
        let exact = CapUrn::parse(
            r#"cap:op=process;in="media:text;utf8";out="media:text;utf8""#,
        )
        .unwrap();
        assert!(pattern.accepts(&exact));

        let too_specific = CapUrn::parse(
            r#"cap:op=process;in="media:text;utf8;normalized";out="media:text""#,
        )
        .unwrap();
        assert!(!pattern.accepts(&too_specific));
    }
}
