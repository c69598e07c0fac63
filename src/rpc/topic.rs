use std::fmt::{self, Display, Formatter};

use crate::collections::HashMap;

use crate::error::ProtocolError;

/// A topic with `{token}` placeholders for whole levels, like `rpc/{executorId}/increment`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopicPattern {
    levels: Vec<Level>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Level {
    Literal(String),
    Token(String),
}

impl TopicPattern {
    /// Parse `pattern`, prefixed with `namespace` if given.
    ///
    /// Tokens found in `token_map` are replaced immediately; the rest must be supplied when
    /// publishing.
    pub fn new(
        property_name: &str,
        pattern: &str,
        namespace: Option<&str>,
        token_map: &HashMap<String, String>,
    ) -> Result<Self, ProtocolError> {
        let invalid = || ProtocolError::configuration_invalid(property_name, pattern);

        if let Some(namespace) = namespace {
            if !is_valid_literal(namespace) {
                return Err(ProtocolError::configuration_invalid("namespace", namespace)
                    .with_message("namespace must be a valid topic without wildcards"));
            }
        }

        let full = match namespace {
            Some(namespace) => format!("{namespace}/{pattern}"),
            None => pattern.to_owned(),
        };

        if pattern.is_empty() || full.starts_with('$') {
            return Err(invalid().with_message("pattern must not be empty or start with `$`"));
        }

        let mut levels = Vec::new();

        for level in full.split('/') {
            if let Some(name) = level.strip_prefix('{').and_then(|l| l.strip_suffix('}')) {
                if !is_valid_token_name(name) {
                    return Err(invalid().with_message(format!("invalid token name {name:?}")));
                }

                match token_map.get(name) {
                    Some(value) if is_valid_replacement(value) => {
                        levels.push(Level::Literal(value.clone()))
                    }
                    Some(value) => {
                        return Err(ProtocolError::configuration_invalid(name, value)
                            .with_message("token value is not a valid topic level"))
                    }
                    None => levels.push(Level::Token(name.to_owned())),
                }
            } else if is_valid_replacement(level) {
                levels.push(Level::Literal(level.to_owned()));
            } else {
                return Err(invalid().with_message(format!("invalid topic level {level:?}")));
            }
        }

        Ok(TopicPattern { levels })
    }

    /// Substitute the remaining tokens from `tokens`.
    pub fn as_publish_topic(&self, tokens: &HashMap<String, String>) -> Result<String, ProtocolError> {
        let mut topic = String::new();

        for (i, level) in self.levels.iter().enumerate() {
            if i > 0 {
                topic.push('/');
            }

            match level {
                Level::Literal(literal) => topic.push_str(literal),
                Level::Token(name) => match tokens.get(name) {
                    Some(value) if is_valid_replacement(value) => topic.push_str(value),
                    Some(value) => {
                        return Err(ProtocolError::argument_invalid(name.clone(), value)
                            .with_message("token value is not a valid topic level"))
                    }
                    None => {
                        return Err(ProtocolError::argument_invalid(name.clone(), "none")
                            .with_message("no value supplied for topic token"))
                    }
                },
            }
        }

        Ok(topic)
    }

    /// A filter matching every topic this pattern can produce.
    pub fn as_subscribe_topic(&self) -> String {
        self.levels
            .iter()
            .map(|level| match level {
                Level::Literal(literal) => literal.as_str(),
                Level::Token(_) => "+",
            })
            .collect::<Vec<_>>()
            .join("/")
    }
}

impl Display for TopicPattern {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for (i, level) in self.levels.iter().enumerate() {
            if i > 0 {
                f.write_str("/")?;
            }

            match level {
                Level::Literal(literal) => f.write_str(literal)?,
                Level::Token(name) => write!(f, "{{{name}}}")?,
            }
        }

        Ok(())
    }
}

fn is_valid_token_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// A single non-empty topic level without wildcards or placeholders.
fn is_valid_replacement(level: &str) -> bool {
    !level.is_empty()
        && !level
            .chars()
            .any(|c| matches!(c, '/' | '+' | '#' | '{' | '}' | '\0') || c.is_whitespace())
}

fn is_valid_literal(topic: &str) -> bool {
    topic.split('/').all(is_valid_replacement)
}
