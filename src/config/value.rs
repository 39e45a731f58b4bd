//! Environment keys and values
//!
//! The closed set of recognised keys, the kind each one is declared with,
//! and the parser for the right-hand side of a `KEY=value` line.

use std::fmt;
use std::str::FromStr;

/// Kind of value a key is declared to hold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvValueKind {
    /// A single string, `KEY=value`
    Scalar,
    /// A bracketed list, `KEY=[a, b, c]`
    List,
}

impl fmt::Display for EnvValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvValueKind::Scalar => f.write_str("scalar"),
            EnvValueKind::List => f.write_str("list"),
        }
    }
}

/// Recognised environment keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EnvKey {
    /// Google Generative Language API keys
    GeminiApiKeys,
    /// Ollama API key
    OllamaApiKey,
}

impl EnvKey {
    /// Every key, in declaration order
    pub const ALL: [EnvKey; 2] = [EnvKey::GeminiApiKeys, EnvKey::OllamaApiKey];

    /// Name of the key as written in the file
    pub fn as_str(self) -> &'static str {
        match self {
            EnvKey::GeminiApiKeys => "GEMINI_API_KEYS",
            EnvKey::OllamaApiKey => "OLLAMA_API_KEY",
        }
    }

    /// Declared value kind
    pub fn kind(self) -> EnvValueKind {
        match self {
            EnvKey::GeminiApiKeys => EnvValueKind::List,
            EnvKey::OllamaApiKey => EnvValueKind::Scalar,
        }
    }
}

impl fmt::Display for EnvKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a name is not one of the recognised keys
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownKey(pub String);

impl FromStr for EnvKey {
    type Err = UnknownKey;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EnvKey::ALL
            .into_iter()
            .find(|key| key.as_str() == s)
            .ok_or_else(|| UnknownKey(s.to_string()))
    }
}

/// A parsed value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvValue {
    Scalar(String),
    List(Vec<String>),
}

impl EnvValue {
    /// Parse the (already trimmed) right-hand side of a line.
    ///
    /// Text wrapped in `[` and `]` becomes a list split on `,`, with each
    /// element trimmed and empty elements dropped. Anything else is kept
    /// verbatim as a scalar. There is no escaping.
    pub fn parse(raw: &str) -> Self {
        if raw.len() >= 2 && raw.starts_with('[') && raw.ends_with(']') {
            let items = raw[1..raw.len() - 1]
                .split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(str::to_string)
                .collect();
            return EnvValue::List(items);
        }
        EnvValue::Scalar(raw.to_string())
    }

    /// Kind of this value
    pub fn kind(&self) -> EnvValueKind {
        match self {
            EnvValue::Scalar(_) => EnvValueKind::Scalar,
            EnvValue::List(_) => EnvValueKind::List,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_from_str() {
        assert_eq!("GEMINI_API_KEYS".parse::<EnvKey>(), Ok(EnvKey::GeminiApiKeys));
        assert_eq!("OLLAMA_API_KEY".parse::<EnvKey>(), Ok(EnvKey::OllamaApiKey));
    }

    #[test]
    fn test_key_from_str_is_case_sensitive() {
        assert_eq!(
            "gemini_api_keys".parse::<EnvKey>(),
            Err(UnknownKey("gemini_api_keys".to_string()))
        );
    }

    #[test]
    fn test_key_names_roundtrip() {
        for key in EnvKey::ALL {
            assert_eq!(key.to_string().parse::<EnvKey>(), Ok(key));
        }
    }

    #[test]
    fn test_declared_kinds() {
        assert_eq!(EnvKey::GeminiApiKeys.kind(), EnvValueKind::List);
        assert_eq!(EnvKey::OllamaApiKey.kind(), EnvValueKind::Scalar);
    }

    #[test]
    fn test_parse_scalar() {
        assert_eq!(EnvValue::parse("abc123"), EnvValue::Scalar("abc123".to_string()));
    }

    #[test]
    fn test_parse_list_trims_and_drops_empty() {
        assert_eq!(
            EnvValue::parse("[a, b, ,  c ]"),
            EnvValue::List(vec!["a".to_string(), "b".to_string(), "c".to_string()])
        );
    }

    #[test]
    fn test_parse_empty_list() {
        assert_eq!(EnvValue::parse("[]"), EnvValue::List(vec![]));
        assert_eq!(EnvValue::parse("[ , ,]"), EnvValue::List(vec![]));
    }

    #[test]
    fn test_parse_unbalanced_brackets_is_scalar() {
        assert_eq!(EnvValue::parse("[abc"), EnvValue::Scalar("[abc".to_string()));
        assert_eq!(EnvValue::parse("abc]"), EnvValue::Scalar("abc]".to_string()));
        assert_eq!(EnvValue::parse("a[b]c"), EnvValue::Scalar("a[b]c".to_string()));
        assert_eq!(EnvValue::parse("["), EnvValue::Scalar("[".to_string()));
    }

    #[test]
    fn test_parse_nested_brackets_split_naively() {
        assert_eq!(
            EnvValue::parse("[[a], b]"),
            EnvValue::List(vec!["[a]".to_string(), "b".to_string()])
        );
    }
}
