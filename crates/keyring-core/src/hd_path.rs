//! BIP-32 derivation path templates.
//!
//! A [`PathTemplate`] is a slash-separated path such as `m/44'/60'/0'/0/x`
//! where at most one segment is the placeholder `x`. Resolving a template
//! against an insertion index yields the concrete index list a signer
//! understands:
//!
//! - a hardened segment (`44'`) becomes `0x8000_0000 + 44`,
//! - the placeholder becomes the insertion index (hardened if written `x'`),
//! - a template without placeholder gets the insertion index appended.
//!
//! Resolutions deeper than [`MAX_PATH_DEPTH`] are rejected.
//!
//! # Example
//!
//! ```
//! use hw_keyring_core::hd_path::{HARDENED_OFFSET, PathTemplate};
//!
//! let template: PathTemplate = "m/44'/60'/0'/0/x".parse().unwrap();
//! let indices = template.resolve(3).unwrap();
//! assert_eq!(
//!     indices,
//!     vec![HARDENED_OFFSET + 44, HARDENED_OFFSET + 60, HARDENED_OFFSET, 0, 3]
//! );
//! ```

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Offset added to an index to mark it hardened.
pub const HARDENED_OFFSET: u32 = 0x8000_0000;

/// Maximum number of indices a signer accepts in one path.
pub const MAX_PATH_DEPTH: usize = 5;

/// Concrete index list produced by resolving a template.
pub type IndexList = Vec<u32>;

/// One segment of a path template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Segment {
    Literal(u32),
    Placeholder { hardened: bool },
}

/// A derivation path template with at most one `x` placeholder.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PathTemplate {
    raw: String,
    segments: Vec<Segment>,
}

impl PathTemplate {
    /// Standard BIP-44 Ethereum path, iterating the address index.
    pub const BIP44_STANDARD: &'static str = "m/44'/60'/0'/0/x";

    /// Ledger Live layout, iterating the hardened account index.
    pub const LEDGER_LIVE: &'static str = "m/44'/60'/x'/0/0";

    /// Legacy MEW/MyCrypto layout.
    pub const LEGACY: &'static str = "m/44'/60'/0'/x";

    /// Parses a template.
    ///
    /// A leading `m` segment is stripped. Every other segment must be a
    /// decimal index below [`HARDENED_OFFSET`], optionally followed by `'`,
    /// or the placeholder `x` / `x'`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPath`] for empty or non-numeric segments,
    /// out-of-range indices, or more than one placeholder.
    pub fn parse(template: &str) -> Result<Self> {
        let trimmed = template.trim();
        let mut parts = trimmed.split('/').peekable();
        if parts.peek().is_some_and(|first| first.eq_ignore_ascii_case("m")) {
            parts.next();
        }

        let mut segments = Vec::new();
        for part in parts {
            segments.push(parse_segment(part, trimmed)?);
        }

        let placeholders = segments
            .iter()
            .filter(|s| matches!(s, Segment::Placeholder { .. }))
            .count();
        if placeholders > 1 {
            return Err(Error::InvalidPath(format!(
                "`{trimmed}` has {placeholders} placeholders, at most one is allowed"
            )));
        }

        Ok(Self {
            raw: trimmed.to_owned(),
            segments,
        })
    }

    /// Resolves the template against an insertion index.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidPath`] if `insertion_index` is not below [`HARDENED_OFFSET`]
    /// - [`Error::PathTooLong`] if the result has more than [`MAX_PATH_DEPTH`] indices
    pub fn resolve(&self, insertion_index: u32) -> Result<IndexList> {
        if insertion_index >= HARDENED_OFFSET {
            return Err(Error::InvalidPath(format!(
                "insertion index {insertion_index} is out of range"
            )));
        }

        let mut indices: IndexList = self
            .segments
            .iter()
            .map(|segment| match *segment {
                Segment::Literal(value) => value,
                Segment::Placeholder { hardened: true } => HARDENED_OFFSET + insertion_index,
                Segment::Placeholder { hardened: false } => insertion_index,
            })
            .collect();

        if !self.has_placeholder() {
            indices.push(insertion_index);
        }

        if indices.len() > MAX_PATH_DEPTH {
            return Err(Error::PathTooLong {
                depth: indices.len(),
                max: MAX_PATH_DEPTH,
            });
        }
        Ok(indices)
    }

    /// Returns `true` if the template contains the placeholder.
    #[must_use]
    pub fn has_placeholder(&self) -> bool {
        self.placeholder_position().is_some()
    }

    /// Returns `true` if the placeholder exists and is not the last segment.
    ///
    /// Signers can only batch address derivation by incrementing the last
    /// index, so such templates have to be fetched one index at a time.
    #[must_use]
    pub fn has_non_terminal_placeholder(&self) -> bool {
        self.placeholder_position()
            .is_some_and(|pos| pos + 1 < self.segments.len())
    }

    /// The template as written.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    fn placeholder_position(&self) -> Option<usize> {
        self.segments
            .iter()
            .position(|s| matches!(s, Segment::Placeholder { .. }))
    }
}

impl Default for PathTemplate {
    fn default() -> Self {
        Self {
            raw: Self::BIP44_STANDARD.to_owned(),
            segments: vec![
                Segment::Literal(HARDENED_OFFSET + 44),
                Segment::Literal(HARDENED_OFFSET + 60),
                Segment::Literal(HARDENED_OFFSET),
                Segment::Literal(0),
                Segment::Placeholder { hardened: false },
            ],
        }
    }
}

impl fmt::Display for PathTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for PathTemplate {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for PathTemplate {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<PathTemplate> for String {
    fn from(template: PathTemplate) -> Self {
        template.raw
    }
}

/// Resolves `template` against `insertion_index` in one step.
///
/// # Errors
///
/// See [`PathTemplate::parse`] and [`PathTemplate::resolve`].
pub fn resolve(template: &str, insertion_index: u32) -> Result<IndexList> {
    PathTemplate::parse(template)?.resolve(insertion_index)
}

/// Formats an index list back into `m/...` notation.
///
/// # Example
///
/// ```
/// use hw_keyring_core::hd_path::{HARDENED_OFFSET, format_indices};
///
/// assert_eq!(format_indices(&[HARDENED_OFFSET + 44, 7]), "m/44'/7");
/// ```
#[must_use]
pub fn format_indices(indices: &[u32]) -> String {
    let mut out = String::from("m");
    for &index in indices {
        if index >= HARDENED_OFFSET {
            out.push_str(&format!("/{}'", index - HARDENED_OFFSET));
        } else {
            out.push_str(&format!("/{index}"));
        }
    }
    out
}

fn parse_segment(part: &str, template: &str) -> Result<Segment> {
    let (body, hardened) = match part.strip_suffix('\'') {
        Some(body) => (body, true),
        None => (part, false),
    };

    if body.eq_ignore_ascii_case("x") {
        return Ok(Segment::Placeholder { hardened });
    }

    if body.is_empty() || !body.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::InvalidPath(format!(
            "`{template}` has invalid segment `{part}`"
        )));
    }

    let value: u32 = body
        .parse()
        .ok()
        .filter(|v| *v < HARDENED_OFFSET)
        .ok_or_else(|| Error::InvalidPath(format!("index `{body}` in `{template}` is out of range")))?;

    Ok(Segment::Literal(if hardened {
        HARDENED_OFFSET + value
    } else {
        value
    }))
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use test_case::test_case;

    use super::*;

    const H: u32 = HARDENED_OFFSET;

    #[test_case("m/44'/60'/0'/0/x", 0 => vec![H + 44, H + 60, H, 0, 0]; "standard first")]
    #[test_case("m/44'/60'/0'/0/x", 9 => vec![H + 44, H + 60, H, 0, 9]; "standard tenth")]
    #[test_case("m/44'/60'/x'/0/0", 2 => vec![H + 44, H + 60, H + 2, 0, 0]; "ledger live")]
    #[test_case("m/44'/60'/0'", 4 => vec![H + 44, H + 60, H, 4]; "appended index")]
    #[test_case("m/44'/60'/0'/x", 1 => vec![H + 44, H + 60, H, 1]; "legacy")]
    fn resolves_templates(template: &str, index: u32) -> IndexList {
        resolve(template, index).unwrap()
    }

    #[test]
    fn rejects_six_indices() {
        let err = resolve("m/44'/60'/0'/0/0", 0).unwrap_err();
        assert!(matches!(err, Error::PathTooLong { depth: 6, max: 5 }));

        let err = resolve("m/1/2/3/4/5/x", 0).unwrap_err();
        assert!(matches!(err, Error::PathTooLong { depth: 6, .. }));
    }

    #[test_case("m/44'/abc/0" ; "non numeric")]
    #[test_case("m/44'//0" ; "empty segment")]
    #[test_case("m/x/x" ; "two placeholders")]
    #[test_case("m/2147483648" ; "index too large")]
    fn rejects_invalid_templates(template: &str) {
        assert!(matches!(
            PathTemplate::parse(template),
            Err(Error::InvalidPath(_))
        ));
    }

    #[test]
    fn detects_non_terminal_placeholder() {
        let live: PathTemplate = PathTemplate::LEDGER_LIVE.parse().unwrap();
        assert!(live.has_non_terminal_placeholder());

        let standard = PathTemplate::default();
        assert!(!standard.has_non_terminal_placeholder());

        let appended: PathTemplate = "m/44'/60'/0'".parse().unwrap();
        assert!(!appended.has_placeholder());
        assert!(!appended.has_non_terminal_placeholder());
    }

    #[test]
    fn default_matches_standard_template() {
        assert_eq!(
            PathTemplate::default(),
            PathTemplate::parse(PathTemplate::BIP44_STANDARD).unwrap()
        );
    }

    #[test]
    fn serde_uses_template_string() {
        let template = PathTemplate::parse(PathTemplate::LEDGER_LIVE).unwrap();
        let json = serde_json::to_string(&template).unwrap();
        assert_eq!(json, "\"m/44'/60'/x'/0/0\"");

        let back: PathTemplate = serde_json::from_str(&json).unwrap();
        assert_eq!(back, template);

        assert!(serde_json::from_str::<PathTemplate>("\"m/q\"").is_err());
    }

    #[test]
    fn formats_indices() {
        let indices = resolve(PathTemplate::BIP44_STANDARD, 5).unwrap();
        assert_eq!(format_indices(&indices), "m/44'/60'/0'/0/5");
    }

    proptest! {
        #[test]
        fn placeholder_free_templates_append_index(
            literals in proptest::collection::vec((0u32..1000, any::<bool>()), 0..=4),
            index in 0u32..HARDENED_OFFSET,
        ) {
            let template = std::iter::once("m".to_owned())
                .chain(literals.iter().map(|(v, h)| if *h { format!("{v}'") } else { v.to_string() }))
                .collect::<Vec<_>>()
                .join("/");
            let resolved = resolve(&template, index).unwrap();
            prop_assert_eq!(resolved.len(), literals.len() + 1);
            prop_assert_eq!(*resolved.last().unwrap(), index);
        }

        #[test]
        fn hardened_literals_add_offset(value in 0u32..HARDENED_OFFSET, index in 0u32..HARDENED_OFFSET) {
            let resolved = resolve(&format!("m/{value}'/x"), index).unwrap();
            prop_assert_eq!(resolved, vec![H + value, index]);
        }

        #[test]
        fn never_exceeds_max_depth(depth in 0usize..8, index in 0u32..HARDENED_OFFSET) {
            let template = std::iter::once("m")
                .chain(std::iter::repeat_n("1", depth))
                .collect::<Vec<_>>()
                .join("/");
            match resolve(&template, index) {
                Ok(indices) => prop_assert!(indices.len() <= MAX_PATH_DEPTH),
                Err(Error::PathTooLong { depth: d, .. }) => prop_assert!(d > MAX_PATH_DEPTH),
                Err(other) => prop_assert!(false, "unexpected error {other}"),
            }
        }
    }
}
