//! Topic templates and subscription patterns.
//!
//! Templates may contain the `{basetopic}` placeholder which is replaced by the
//! configured prefix. Patterns follow the MQTT filter rules: `+` stands for
//! exactly one level, `#` for all remaining levels (including none).

use std::fmt;

pub const BASETOPIC_PLACEHOLDER: &str = "{basetopic}";

/// Replaces every `{basetopic}` in `template` with `basetopic`.
pub fn apply_basetopic(template: &str, basetopic: &str) -> String {
    template.replace(BASETOPIC_PLACEHOLDER, basetopic)
}

/// Strips a leading `<basetopic>/` from `topic`.
pub fn strip_basetopic<'a>(topic: &'a str, basetopic: &str) -> &'a str {
    if basetopic.is_empty() {
        return topic;
    }
    topic
        .strip_prefix(basetopic)
        .and_then(|rest| rest.strip_prefix('/'))
        .unwrap_or(topic)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Level {
    Literal(String),
    /// `+`
    Single,
    /// `#`
    Multi,
}

/// A compiled subscription pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPattern {
    source: String,
    levels: Vec<Level>,
}

impl TopicPattern {
    pub fn new(pattern: &str) -> Self {
        let levels = pattern
            .split('/')
            .map(|level| match level {
                "+" => Level::Single,
                "#" => Level::Multi,
                literal => Level::Literal(literal.to_string()),
            })
            .collect();

        Self {
            source: pattern.to_string(),
            levels,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn has_wildcards(&self) -> bool {
        self.levels
            .iter()
            .any(|level| !matches!(level, Level::Literal(_)))
    }

    /// Checks whether `topic` is covered by this pattern.
    pub fn matches(&self, topic: &str) -> bool {
        let mut topic_levels = topic.split('/');

        for level in &self.levels {
            match level {
                Level::Multi => return true,
                Level::Single => {
                    if topic_levels.next().is_none() {
                        return false;
                    }
                }
                Level::Literal(expected) => match topic_levels.next() {
                    Some(actual) if actual == expected => {}
                    _ => return false,
                },
            }
        }

        // a literal or `+` pattern must consume the whole topic
        topic_levels.next().is_none()
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.source)
    }
}

impl From<&str> for TopicPattern {
    fn from(pattern: &str) -> Self {
        Self::new(pattern)
    }
}
