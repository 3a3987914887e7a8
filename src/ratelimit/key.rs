//! Store key generation for `(zone, key)` counters.

use std::fmt;
use std::str::FromStr;

use crate::error::{RedbucketError, Result};

/// Default key template.
pub const DEFAULT_KEY_FORMAT: &str = "redbucket:{zone}:{key}";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Zone,
    Key,
}

/// A parsed key template such as `redbucket:{zone}:{key}`.
///
/// The template must reference both `{zone}` and `{key}` and no other field.
/// `{{` and `}}` produce literal braces. Application keys are raw bytes, so
/// rendered store keys are bytes too.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyFormat {
    template: String,
    segments: Vec<Segment>,
}

impl KeyFormat {
    /// Parse and validate a template.
    pub fn new(template: &str) -> Result<Self> {
        let invalid = |reason: &str| {
            RedbucketError::Config(format!("invalid key format {:?}: {}", template, reason))
        };

        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = template.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    literal.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    literal.push('}');
                }
                '{' => {
                    let mut field = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some('{') | None => return Err(invalid("unterminated field")),
                            Some(c) => field.push(c),
                        }
                    }
                    let segment = match field.as_str() {
                        "zone" => Segment::Zone,
                        "key" => Segment::Key,
                        _ => {
                            return Err(invalid(&format!(
                                "only the fields {{zone}} and {{key}} are allowed, found {{{}}}",
                                field
                            )))
                        }
                    };
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(segment);
                }
                '}' => return Err(invalid("single '}' encountered")),
                c => literal.push(c),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        if !segments.contains(&Segment::Zone) || !segments.contains(&Segment::Key) {
            return Err(invalid("must contain the fields {zone} and {key}"));
        }

        Ok(Self {
            template: template.to_string(),
            segments,
        })
    }

    /// Render the store key of one counter.
    pub fn render(&self, zone: &str, key: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.template.len() + zone.len() + key.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.extend_from_slice(text.as_bytes()),
                Segment::Zone => out.extend_from_slice(zone.as_bytes()),
                Segment::Key => out.extend_from_slice(key),
            }
        }
        out
    }

    pub fn template(&self) -> &str {
        &self.template
    }
}

impl Default for KeyFormat {
    fn default() -> Self {
        Self {
            template: DEFAULT_KEY_FORMAT.to_string(),
            segments: vec![
                Segment::Literal("redbucket:".to_string()),
                Segment::Zone,
                Segment::Literal(":".to_string()),
                Segment::Key,
            ],
        }
    }
}

impl FromStr for KeyFormat {
    type Err = RedbucketError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl fmt::Display for KeyFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.template)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_matches_parsed_default() {
        assert_eq!(KeyFormat::default(), KeyFormat::new(DEFAULT_KEY_FORMAT).unwrap());
        assert_eq!(
            KeyFormat::default().render("z1", b"foo"),
            b"redbucket:z1:foo".to_vec()
        );
    }

    #[test]
    fn test_invalid_formats() {
        for template in [
            "invalid {",
            "no fields",
            "{zone} no key",
            "no zone {key}",
            "{zone} {key} extra {}",
            "{zone} {key} {extra}",
            "{zone} {key} extra {0}",
            "{zone} {key} }",
        ] {
            assert!(
                KeyFormat::new(template).is_err(),
                "{:?} should be rejected",
                template
            );
        }
    }

    #[test]
    fn test_valid_formats() {
        for template in ["{zone}{key}", "{key}{zone}", "{zone}{key}{zone}", "{{{zone}{key}}}"] {
            assert!(KeyFormat::new(template).is_ok(), "{:?} should parse", template);
        }
    }

    #[test]
    fn test_render() {
        let format: KeyFormat = "{{{zone}|{key}}}:{zone}".parse().unwrap();
        assert_eq!(format.render("ip", b"10.0.0.1"), b"{ip|10.0.0.1}:ip".to_vec());
    }

    #[test]
    fn test_render_binary_key() {
        let format = KeyFormat::new("rb:{zone}:{key}").unwrap();
        assert_eq!(
            format.render("z", &[0xff, 0x00]),
            vec![b'r', b'b', b':', b'z', b':', 0xff, 0x00]
        );
    }
}
