//! Parsed Node.js version requirements.
//!
//! Requirements come from build configuration or a project's
//! `package.json` `engines.node` field, so they follow npm's range syntax
//! rather than Cargo's. [`NpmRange`] translates npm ranges into
//! [`semver::VersionReq`] alternatives:
//!
//! | npm             | semver crate            |
//! |-----------------|-------------------------|
//! | `18.17.0`       | `=18.17.0`              |
//! | `18`            | `=18` (any 18.x.y)      |
//! | `>=18 <20`      | `>=18, <20`             |
//! | `1.2 - 2.3`     | `>=1.2, <=2.3`          |
//! | `^16 \|\| ^18`  | two alternatives        |
//!
//! Tags (`latest`, `lts`, `lts/<codename>`) are only meaningful against the
//! release index, which knows which releases carry an LTS codename.

use std::fmt;

use semver::{Version, VersionReq};

use crate::errors::{ToolchainError, ToolchainResult};

/// A parsed version requirement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionSpec {
    /// No constraint (`*` or an empty requirement).
    Any,
    /// The highest published release.
    Latest,
    /// The highest release with an LTS codename.
    Lts,
    /// The highest release of one LTS line, e.g. `lts/hydrogen`.
    LtsCodename(String),
    /// One exact release.
    Exact(Version),
    /// An npm range.
    Range(NpmRange),
}

/// An npm range: a disjunction of comparator sets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NpmRange {
    raw: String,
    alternatives: Vec<VersionReq>,
}

impl VersionSpec {
    /// Parses a requirement string.
    ///
    /// # Errors
    ///
    /// Returns `InvalidVersionSpec` if the string is neither a tag, an exact
    /// version, nor a valid npm range.
    pub fn parse(input: &str) -> ToolchainResult<Self> {
        let trimmed = input.trim();
        let lower = trimmed.to_ascii_lowercase();

        match lower.as_str() {
            "" | "*" | "x" => return Ok(Self::Any),
            "latest" | "current" | "node" => return Ok(Self::Latest),
            "lts" | "lts/*" => return Ok(Self::Lts),
            _ => {}
        }

        if let Some(codename) = lower.strip_prefix("lts/") {
            if codename.is_empty() || !codename.chars().all(|c| c.is_ascii_alphabetic()) {
                return Err(ToolchainError::invalid_spec(
                    input,
                    "LTS codename must be alphabetic, e.g. lts/hydrogen",
                ));
            }
            return Ok(Self::LtsCodename(codename.to_string()));
        }

        if let Ok(version) = Version::parse(strip_v(trimmed)) {
            return Ok(Self::Exact(version));
        }

        NpmRange::parse(trimmed).map(Self::Range)
    }

    /// Returns whether a release satisfies this spec.
    ///
    /// `lts` is the release's LTS codename, if it has one.
    #[must_use]
    pub fn matches(&self, version: &Version, lts: Option<&str>) -> bool {
        match self {
            Self::Any => version.pre.is_empty(),
            Self::Latest => true,
            Self::Lts => lts.is_some(),
            Self::LtsCodename(codename) => lts.is_some_and(|l| l.eq_ignore_ascii_case(codename)),
            Self::Exact(exact) => version == exact,
            Self::Range(range) => range.matches(version),
        }
    }

    /// Returns whether a locally installed `node` of `version` satisfies this
    /// spec. Tags never do: only the release index knows what they point at.
    #[must_use]
    pub fn is_satisfied_by_local(&self, version: &Version) -> bool {
        !self.is_tag() && self.matches(version, None)
    }

    /// Whether this spec is a tag resolved only through the release index.
    #[must_use]
    pub fn is_tag(&self) -> bool {
        matches!(self, Self::Latest | Self::Lts | Self::LtsCodename(_))
    }

    /// The pinned version, if the spec names exactly one.
    #[must_use]
    pub fn exact(&self) -> Option<&Version> {
        match self {
            Self::Exact(version) => Some(version),
            _ => None,
        }
    }
}

impl NpmRange {
    /// Parses an npm range expression.
    ///
    /// # Errors
    ///
    /// Returns `InvalidVersionSpec` when any alternative is malformed.
    pub fn parse(input: &str) -> ToolchainResult<Self> {
        let mut alternatives = Vec::new();

        for alternative in input.split("||") {
            let alternative = alternative.trim();
            let req = if alternative.is_empty() || matches!(alternative, "*" | "x" | "X") {
                VersionReq::STAR
            } else {
                let translated = translate_alternative(alternative);
                VersionReq::parse(&translated)
                    .map_err(|e| ToolchainError::invalid_spec(input, e.to_string()))?
            };
            alternatives.push(req);
        }

        Ok(Self {
            raw: input.to_string(),
            alternatives,
        })
    }

    /// Returns whether any alternative matches `version`.
    #[must_use]
    pub fn matches(&self, version: &Version) -> bool {
        self.alternatives.iter().any(|req| req.matches(version))
    }
}

/// Translates one `||`-free npm comparator set to semver-crate syntax.
fn translate_alternative(alternative: &str) -> String {
    if let Some((low, high)) = alternative.split_once(" - ") {
        return format!(">={}, <={}", strip_v(low.trim()), strip_v(high.trim()));
    }

    let mut comparators = Vec::new();
    let mut pending_op = String::new();

    for token in alternative.split_whitespace() {
        if token.chars().all(|c| matches!(c, '<' | '>' | '=' | '^' | '~')) {
            pending_op.push_str(token);
            continue;
        }
        let joined = format!("{pending_op}{token}");
        pending_op.clear();
        comparators.push(normalize_comparator(&joined));
    }

    comparators.join(", ")
}

/// Strips a `v` after the operator and pins bare versions with `=`.
fn normalize_comparator(token: &str) -> String {
    let split = token
        .find(|c: char| c.is_ascii_alphanumeric() || c == '*')
        .unwrap_or(token.len());
    let (op, rest) = token.split_at(split);
    let rest = strip_v(rest);

    if matches!(rest, "x" | "X") {
        return "*".to_string();
    }

    let wildcard = rest.contains(['x', 'X', '*']);
    if op.is_empty() && !wildcard {
        format!("={rest}")
    } else {
        format!("{op}{rest}")
    }
}

fn strip_v(s: &str) -> &str {
    s.strip_prefix(['v', 'V']).unwrap_or(s)
}

impl fmt::Display for VersionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("*"),
            Self::Latest => f.write_str("latest"),
            Self::Lts => f.write_str("lts"),
            Self::LtsCodename(codename) => write!(f, "lts/{codename}"),
            Self::Exact(version) => write!(f, "{version}"),
            Self::Range(range) => f.write_str(&range.raw),
        }
    }
}
