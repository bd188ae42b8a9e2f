//! Hierarchical resource names.
//!
//! An HRN is a dot separated path (`plc.princeton.alice`). A literal dot
//! inside a component is written `\.`. Every HRN has exactly one URN form per
//! record kind, `urn:publicid:IDN+<authority>+<kind>+<leaf>`, where the
//! authority components are joined with `:`.

use std::{fmt, str::FromStr};

use rkyv::{Archive, Deserialize, Serialize};

use super::error::BrokerError;

pub const SEPARATOR: char = '.';
const ESCAPE: char = '\\';
const URN_PREFIX: &str = "urn:publicid:IDN+";

#[derive(
    Archive,
    Serialize,
    Deserialize,
    Clone,
    Debug,
    Default,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
)]
#[archive(check_bytes)]
pub struct Hrn(String);

impl Hrn {
    /// Wraps a string without validating it. Use [`Hrn::parse`] for input
    /// that comes from a caller.
    pub fn new(hrn: impl Into<String>) -> Self {
        Self(hrn.into())
    }

    /// Validates that the name is non-empty and has no empty components.
    pub fn parse(hrn: &str) -> Result<Self, BrokerError> {
        let candidate = Self(hrn.to_string());
        if hrn.is_empty() || candidate.components().iter().any(|c| c.is_empty()) {
            return Err(BrokerError::InvalidXrn(hrn.to_string()));
        }
        Ok(candidate)
    }

    /// Accepts either a URN or an HRN. The record kind is only known when a
    /// URN was given.
    pub fn parse_xrn(xrn: &str) -> Result<(Self, Option<RecordType>), BrokerError> {
        if xrn.starts_with("urn:") {
            let (hrn, kind) = Self::from_urn(xrn)?;
            Ok((hrn, Some(kind)))
        } else {
            Ok((Self::parse(xrn)?, None))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Splits on unescaped separators. Escape sequences are kept verbatim so
    /// that joining the components back yields the same HRN.
    pub fn components(&self) -> Vec<&str> {
        let mut out = Vec::new();
        let mut start = 0;
        let mut escaped = false;
        for (idx, ch) in self.0.char_indices() {
            if escaped {
                escaped = false;
                continue;
            }
            match ch {
                ESCAPE => escaped = true,
                SEPARATOR => {
                    out.push(&self.0[start..idx]);
                    start = idx + 1;
                }
                _ => {}
            }
        }
        out.push(&self.0[start..]);
        out
    }

    pub fn from_components<S: AsRef<str>>(components: &[S]) -> Self {
        let joined = components
            .iter()
            .map(|c| c.as_ref())
            .collect::<Vec<_>>()
            .join(".");
        Self(joined)
    }

    /// The enclosing authority, or `None` for a top level name.
    pub fn authority(&self) -> Option<Hrn> {
        let components = self.components();
        if components.len() < 2 {
            return None;
        }
        Some(Self::from_components(&components[..components.len() - 1]))
    }

    pub fn leaf(&self) -> &str {
        let components = self.components();
        components[components.len() - 1]
    }

    /// True when `self` is a strict prefix of `other` in component order.
    pub fn is_ancestor_of(&self, other: &Hrn) -> bool {
        let mine = self.components();
        let theirs = other.components();
        mine.len() < theirs.len() && theirs[..mine.len()] == mine[..]
    }

    /// `self == other` or `self` is an ancestor of `other`.
    pub fn covers(&self, other: &Hrn) -> bool {
        self == other || self.is_ancestor_of(other)
    }

    pub fn to_urn(&self, kind: RecordType) -> String {
        let components: Vec<String> = self.components().iter().map(|c| unescape(c)).collect();
        match kind {
            RecordType::Authority => {
                format!("{}{}+authority+sa", URN_PREFIX, components.join(":"))
            }
            _ => {
                let (leaf, authority) = match components.split_last() {
                    Some((leaf, authority)) => (leaf.as_str(), authority.join(":")),
                    None => ("", String::new()),
                };
                format!("{}{}+{}+{}", URN_PREFIX, authority, kind, leaf)
            }
        }
    }

    pub fn from_urn(urn: &str) -> Result<(Self, RecordType), BrokerError> {
        let invalid = || BrokerError::InvalidXrn(urn.to_string());
        let body = urn.strip_prefix(URN_PREFIX).ok_or_else(invalid)?;
        let mut parts = body.splitn(3, '+');
        let authority = parts.next().filter(|a| !a.is_empty()).ok_or_else(invalid)?;
        let kind = parts.next().ok_or_else(invalid)?;
        let name = parts.next().ok_or_else(invalid)?;
        let kind: RecordType = kind.parse()?;

        let mut components: Vec<String> = authority.split(':').map(escape).collect();
        if kind != RecordType::Authority {
            components.push(escape(name));
        }
        Ok((Self::parse(&Self::from_components(&components).0)?, kind))
    }
}

fn escape(component: &str) -> String {
    component.replace(SEPARATOR, "\\.")
}

fn unescape(component: &str) -> String {
    component.replace("\\.", ".")
}

impl fmt::Display for Hrn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Hrn {
    fn from(hrn: &str) -> Self {
        Self::new(hrn)
    }
}

impl AsRef<str> for Hrn {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// The four kinds of registry record.
#[derive(Archive, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[archive(check_bytes)]
pub enum RecordType {
    User,
    Slice,
    Node,
    Authority,
}

impl RecordType {
    pub const ALL: [RecordType; 4] = [
        RecordType::User,
        RecordType::Slice,
        RecordType::Node,
        RecordType::Authority,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordType::User => "user",
            RecordType::Slice => "slice",
            RecordType::Node => "node",
            RecordType::Authority => "authority",
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordType {
    type Err = BrokerError;

    /// Authority subtypes (`authority+sa`, `authority+am`) fold into
    /// [`RecordType::Authority`].
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(RecordType::User),
            "slice" => Ok(RecordType::Slice),
            "node" => Ok(RecordType::Node),
            "authority" => Ok(RecordType::Authority),
            other if other.starts_with("authority+") => Ok(RecordType::Authority),
            other => Err(BrokerError::UnknownSfaType(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn components_respect_escapes() {
        let hrn = Hrn::new("plc.princeton\\.edu.alice");
        assert_eq!(hrn.components(), vec!["plc", "princeton\\.edu", "alice"]);
        assert_eq!(hrn.authority(), Some(Hrn::new("plc.princeton\\.edu")));
        assert_eq!(hrn.leaf(), "alice");
    }

    #[test]
    fn ancestry_is_component_wise() {
        let a = Hrn::new("plc.pr");
        assert!(a.is_ancestor_of(&Hrn::new("plc.pr.alice")));
        assert!(!a.is_ancestor_of(&Hrn::new("plc.princeton")));
        assert!(!a.is_ancestor_of(&a));
        assert!(a.covers(&a));
    }

    #[test]
    fn parse_rejects_empty_components() {
        assert!(Hrn::parse("plc..alice").is_err());
        assert!(Hrn::parse("").is_err());
        assert!(Hrn::parse(".plc").is_err());
        assert!(Hrn::parse("plc.alice").is_ok());
    }

    #[test]
    fn urn_round_trip_for_user_and_authority() {
        let user = Hrn::new("plc.princeton.alice");
        let urn = user.to_urn(RecordType::User);
        assert_eq!(urn, "urn:publicid:IDN+plc:princeton+user+alice");
        assert_eq!(Hrn::from_urn(&urn).unwrap(), (user, RecordType::User));

        let auth = Hrn::new("plc.princeton");
        let urn = auth.to_urn(RecordType::Authority);
        assert_eq!(urn, "urn:publicid:IDN+plc:princeton+authority+sa");
        assert_eq!(Hrn::from_urn(&urn).unwrap(), (auth, RecordType::Authority));
    }

    #[test]
    fn urn_escapes_dots_inside_components() {
        let (hrn, _) = Hrn::from_urn("urn:publicid:IDN+plc:cs.edu+slice+s1").unwrap();
        assert_eq!(hrn.components(), vec!["plc", "cs\\.edu", "s1"]);
        assert_eq!(
            hrn.to_urn(RecordType::Slice),
            "urn:publicid:IDN+plc:cs.edu+slice+s1"
        );
    }

    #[test]
    fn unknown_kind_is_rejected() {
        assert!(matches!(
            "sliver".parse::<RecordType>(),
            Err(BrokerError::UnknownSfaType(kind)) if kind == "sliver"
        ));
        assert_eq!("authority+am".parse::<RecordType>().unwrap(), RecordType::Authority);
    }
}
