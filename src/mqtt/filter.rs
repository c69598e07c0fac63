use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

/// A parsed MQTT topic filter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Filter {
    tokens: Vec<FilterToken>,
    leaf_kind: LeafKind,
}

impl Filter {
    /// Returns `true` if `topic` is matched by this filter.
    ///
    /// Topics starting with `$` are not matched by a leading wildcard.
    pub fn matches(&self, topic: &str) -> bool {
        if topic.starts_with('$') && !matches!(self.tokens.first(), Some(FilterToken::Literal(_)))
        {
            return false;
        }

        let mut levels = topic.split('/');

        for token in &self.tokens {
            match levels.next() {
                Some(level) if token.matches(level) => (),
                _ => return false,
            }
        }

        // `sport/#` also matches `sport` itself.
        self.leaf_kind.is_any() || levels.next().is_none()
    }

    pub fn has_wildcards(&self) -> bool {
        self.leaf_kind.is_any() || self.tokens.contains(&FilterToken::WildPlus)
    }
}

impl FromStr for Filter {
    type Err = FilterParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(FilterParseError::EmptyFilter);
        }

        let mut tokens = Vec::new();
        let mut leaf_kind = LeafKind::Exact;

        for token in s.split('/') {
            // we have another level after a `#`
            if leaf_kind == LeafKind::Any {
                return Err(FilterParseError::InvalidWildcard);
            }

            match token {
                "+" => tokens.push(FilterToken::WildPlus),
                "#" => leaf_kind = LeafKind::Any,
                _ => {
                    if let Some((idx, ch)) = token
                        .char_indices()
                        .find(|it| matches!(it.1, '#' | '+' | '\0'))
                    {
                        return Err(FilterParseError::InvalidToken {
                            token: token.to_owned(),
                            pos: idx,
                            ch,
                        });
                    }

                    tokens.push(FilterToken::Literal(token.to_owned().into_boxed_str()));
                }
            }
        }

        Ok(Self { tokens, leaf_kind })
    }
}

impl Display for Filter {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut first = true;

        for token in &self.tokens {
            if !first {
                f.write_str("/")?;
            }
            first = false;

            match token {
                FilterToken::Literal(lit) => f.write_str(lit)?,
                FilterToken::WildPlus => f.write_str("+")?,
            }
        }

        if self.leaf_kind.is_any() {
            if !first {
                f.write_str("/")?;
            }
            f.write_str("#")?;
        }

        Ok(())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum FilterParseError {
    /// Filter must not be empty.
    #[error("filter must not be empty")]
    EmptyFilter,

    /// `token` contains an invalid character (`ch`) at `pos`.
    #[error("{token} contains an invalid character starting at {pos} (`{ch}`)")]
    InvalidToken { token: String, pos: usize, ch: char },

    /// Found a `#` wildcard and it wasn't the end of the filter.
    #[error("filter contains a `#` wildcard that isn't trailing")]
    InvalidWildcard,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum FilterToken {
    /// `text`
    Literal(Box<str>),
    /// A `+` (any on this level) wildcard.
    WildPlus,
}

impl FilterToken {
    fn matches(&self, level: &str) -> bool {
        match self {
            FilterToken::Literal(lit) => &**lit == level,
            FilterToken::WildPlus => true,
        }
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum LeafKind {
    /// No wildcard.
    Exact,
    /// A `#` wildcard found.
    Any,
}

impl LeafKind {
    fn is_any(&self) -> bool {
        matches!(self, Self::Any)
    }
}
