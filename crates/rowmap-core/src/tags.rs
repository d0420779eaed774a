//! Field tags and tag-based column filtering.
//!
//! A field carries a comma-separated tag string such as `"noupd,secret"` or
//! `"maxlen=64"`. Labels come from a closed set ([`Label`]) that a
//! [`LabelRegistry`] may extend with application-specific names; anything
//! else is a configuration fault. A [`TagRule`] selects columns by their
//! labels when generating statements.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

use crate::error::ConfigError;

/// Tag string that excludes a field from every column list.
pub const SKIP: &str = "-";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Label {
    /// Integer `id` is not drawn from the table sequence.
    NoSeq,
    /// Never written by INSERT.
    NoIns,
    /// Never written by UPDATE.
    NoUpd,
    /// Left out of the cached select.
    NoCache,
    /// Masked in error reports.
    Secret,
    /// Application label registered through configuration.
    Custom(String),
}

impl Label {
    pub fn builtin(name: &str) -> Option<Label> {
        match name {
            "noseq" => Some(Label::NoSeq),
            "noins" => Some(Label::NoIns),
            "noupd" => Some(Label::NoUpd),
            "nocache" => Some(Label::NoCache),
            "secret" => Some(Label::Secret),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Label::NoSeq => "noseq",
            Label::NoIns => "noins",
            Label::NoUpd => "noupd",
            Label::NoCache => "nocache",
            Label::Secret => "secret",
            Label::Custom(name) => name,
        }
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn label_syntax() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid label pattern"))
}

/// Labels recognized in addition to the built-in set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelRegistry {
    custom: BTreeSet<String>,
}

impl LabelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the given application labels.
    ///
    /// Names that are not valid label syntax or shadow a built-in label are
    /// rejected.
    pub fn with_labels<I, S>(labels: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut registry = Self::new();
        for label in labels {
            registry.register(label.as_ref())?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, label: &str) -> Result<(), ConfigError> {
        if !label_syntax().is_match(label) || Label::builtin(label).is_some() {
            return Err(ConfigError::MalformedTagRule {
                rule: label.to_string(),
            });
        }
        self.custom.insert(label.to_string());
        Ok(())
    }

    pub fn resolve(&self, name: &str) -> Option<Label> {
        Label::builtin(name).or_else(|| {
            self.custom
                .contains(name)
                .then(|| Label::Custom(name.to_string()))
        })
    }

    pub fn contains(&self, label: &Label) -> bool {
        match label {
            Label::Custom(name) => self.custom.contains(name),
            _ => true,
        }
    }
}

/// One parsed tag: a label with an optional `=value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    pub label: Label,
    pub value: Option<String>,
}

/// The parsed tags of one field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagSet {
    tags: Vec<Tag>,
    skip: bool,
}

impl TagSet {
    /// Parse a raw tag string for `field`.
    pub fn parse(field: &str, raw: &str, registry: &LabelRegistry) -> Result<Self, ConfigError> {
        let raw = raw.trim();
        if raw == SKIP {
            return Ok(Self {
                tags: Vec::new(),
                skip: true,
            });
        }
        let mut tags: Vec<Tag> = Vec::new();
        for piece in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (name, value) = match piece.split_once('=') {
                Some((name, value)) => (name.trim(), Some(value.trim().to_string())),
                None => (piece, None),
            };
            if !label_syntax().is_match(name) {
                return Err(ConfigError::MalformedTag {
                    field: field.to_string(),
                    tag: piece.to_string(),
                });
            }
            let label = registry
                .resolve(name)
                .ok_or_else(|| ConfigError::UnknownLabel {
                    field: field.to_string(),
                    label: name.to_string(),
                })?;
            if tags.iter().all(|t| t.label != label) {
                tags.push(Tag { label, value });
            }
        }
        Ok(Self { tags, skip: false })
    }

    /// Field is tagged `-` and excluded from all column lists.
    pub fn is_skip(&self) -> bool {
        self.skip
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn contains(&self, label: &Label) -> bool {
        self.tags.iter().any(|t| &t.label == label)
    }

    pub fn value(&self, label: &Label) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| &t.label == label)
            .and_then(|t| t.value.as_deref())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tag> {
        self.tags.iter()
    }

    /// Tags of an embedded child combined with those inherited from its
    /// parent field. The child's own values win.
    pub fn inherit(&self, parent: &TagSet) -> TagSet {
        let mut tags = self.tags.clone();
        for tag in &parent.tags {
            if !self.contains(&tag.label) {
                tags.push(tag.clone());
            }
        }
        TagSet {
            tags,
            skip: self.skip || parent.skip,
        }
    }
}

/// Column selection by tag label.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TagRule {
    /// Every mapped column.
    #[default]
    All,
    /// Columns carrying none of the labels.
    Exclude(Vec<Label>),
    /// Only columns carrying at least one of the labels.
    Include(Vec<Label>),
}

impl TagRule {
    pub fn exclude(labels: &str) -> Result<Self, ConfigError> {
        parse_rule_labels(labels).map(TagRule::Exclude)
    }

    pub fn include(labels: &str) -> Result<Self, ConfigError> {
        parse_rule_labels(labels).map(TagRule::Include)
    }

    pub fn admits(&self, tags: &TagSet) -> bool {
        match self {
            TagRule::All => true,
            TagRule::Exclude(labels) => !labels.iter().any(|l| tags.contains(l)),
            TagRule::Include(labels) => labels.iter().any(|l| tags.contains(l)),
        }
    }

    /// Check that every custom label in the rule is registered.
    pub fn validate(&self, registry: &LabelRegistry) -> Result<(), ConfigError> {
        let labels = match self {
            TagRule::All => return Ok(()),
            TagRule::Exclude(labels) | TagRule::Include(labels) => labels,
        };
        if labels.is_empty() {
            return Err(ConfigError::MalformedTagRule {
                rule: self.to_string(),
            });
        }
        match labels.iter().find(|l| !registry.contains(l)) {
            Some(unknown) => Err(ConfigError::UnknownLabel {
                field: String::from("<rule>"),
                label: unknown.to_string(),
            }),
            None => Ok(()),
        }
    }
}

impl fmt::Display for TagRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (prefix, labels) = match self {
            TagRule::All => return f.write_str("all"),
            TagRule::Exclude(labels) => ("exclude", labels),
            TagRule::Include(labels) => ("include", labels),
        };
        let names = labels.iter().map(Label::as_str).collect::<Vec<_>>();
        write!(f, "{prefix}:{}", names.join(","))
    }
}

fn parse_rule_labels(raw: &str) -> Result<Vec<Label>, ConfigError> {
    let malformed = || ConfigError::MalformedTagRule {
        rule: raw.to_string(),
    };
    let mut labels = Vec::new();
    for name in raw.split(',').map(str::trim) {
        if !label_syntax().is_match(name) {
            return Err(malformed());
        }
        let label = Label::builtin(name).unwrap_or_else(|| Label::Custom(name.to_string()));
        if !labels.contains(&label) {
            labels.push(label);
        }
    }
    if labels.is_empty() {
        return Err(malformed());
    }
    Ok(labels)
}
