//! Environment file loader
//!
//! Reads API credentials from a `.env` file in the working directory. The
//! file is parsed once at startup against the fixed key schema in
//! [`EnvKey`]; the resulting [`Env`] is immutable and shared by handle.
//!
//! Per-line anomalies (no `=`, unknown key, duplicate key) are logged and
//! skipped. A value of the wrong kind, or any missing key, fails the load.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};

use super::{EnvKey, EnvValue, EnvValueKind, UnknownKey};

/// Default environment file, relative to the working directory
pub const ENV_FILE: &str = ".env";

/// Errors that can occur while loading or reading the environment
#[derive(Debug, Error)]
pub enum EnvError {
    #[error("ENV: {} file not found", .0.display())]
    FileNotFound(PathBuf),

    #[error("ENV: Failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("ENV: Missing required key: {0}")]
    MissingKey(EnvKey),

    #[error("ENV: Missing required keys: {}", join_keys(.0))]
    MissingKeys(Vec<EnvKey>),

    #[error("ENV: Invalid value type for key {key}: {value}. Expected {}", .key.kind())]
    TypeMismatch { key: EnvKey, value: String },

    #[error("ENV: Key {key} is not a {requested} key")]
    SchemaMisuse {
        key: EnvKey,
        requested: EnvValueKind,
    },
}

fn join_keys(keys: &[EnvKey]) -> String {
    keys.iter()
        .map(|key| key.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result type for environment operations
pub type EnvResult<T> = Result<T, EnvError>;

/// A line that was skipped during parsing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvWarning {
    /// Line has no `=`
    InvalidLine { line_no: usize, line: String },
    /// Key name is not recognised
    UnknownKey { line_no: usize, key: String },
    /// Key was already set on an earlier line; the earlier value is kept
    DuplicateKey { line_no: usize, key: EnvKey },
}

impl fmt::Display for EnvWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvWarning::InvalidLine { line_no, line } => {
                write!(f, "Invalid line format (line {}): {}", line_no, line)
            }
            EnvWarning::UnknownKey { line_no, key } => {
                write!(f, "Unknown key (line {}): {}", line_no, key)
            }
            EnvWarning::DuplicateKey { line_no, key } => {
                write!(f, "Duplicate key (line {}): {}", line_no, key)
            }
        }
    }
}

/// Raw outcome of a parse pass, before the completeness check
#[derive(Debug, Default)]
pub struct ParsedLines {
    pub values: HashMap<EnvKey, EnvValue>,
    pub warnings: Vec<EnvWarning>,
}

impl ParsedLines {
    // Logged as the line is read so it survives a later fatal line
    fn skip(&mut self, warning: EnvWarning) {
        warn!("ENV: {}", warning);
        self.warnings.push(warning);
    }
}

/// Parse environment file content line by line.
///
/// Skipped lines are logged as they are read. Only a kind mismatch is an
/// error here. Missing keys are checked by
/// [`Env::parse`].
pub fn parse_lines(content: &str) -> EnvResult<ParsedLines> {
    let mut parsed = ParsedLines::default();

    for (idx, line) in content.lines().enumerate() {
        let line_no = idx + 1;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let Some((name, raw)) = line.split_once('=') else {
            parsed.skip(EnvWarning::InvalidLine {
                line_no,
                line: line.to_string(),
            });
            continue;
        };
        let (name, raw) = (name.trim(), raw.trim());

        let key = match name.parse::<EnvKey>() {
            Ok(key) => key,
            Err(UnknownKey(key)) => {
                parsed.skip(EnvWarning::UnknownKey { line_no, key });
                continue;
            }
        };

        if parsed.values.contains_key(&key) {
            parsed.skip(EnvWarning::DuplicateKey { line_no, key });
            continue;
        }

        let value = EnvValue::parse(raw);
        if value.kind() != key.kind() {
            return Err(EnvError::TypeMismatch {
                key,
                value: raw.to_string(),
            });
        }
        parsed.values.insert(key, value);
    }

    Ok(parsed)
}

/// Loaded, validated environment
///
/// Every key in [`EnvKey::ALL`] is present with its declared kind.
#[derive(Clone, PartialEq, Eq)]
pub struct Env {
    values: HashMap<EnvKey, EnvValue>,
}

impl Env {
    /// Load from [`ENV_FILE`] in the working directory
    pub fn load() -> EnvResult<Self> {
        Self::load_from(Path::new(ENV_FILE))
    }

    /// Load from an explicit path
    pub fn load_from(path: &Path) -> EnvResult<Self> {
        if !path.exists() {
            return Err(EnvError::FileNotFound(path.to_path_buf()));
        }

        debug!("Loading environment from {}", path.display());
        let content = fs::read_to_string(path).map_err(|source| EnvError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    /// Parse and validate environment file content
    pub fn parse(content: &str) -> EnvResult<Self> {
        let ParsedLines { values, .. } = parse_lines(content)?;

        let missing: Vec<EnvKey> = EnvKey::ALL
            .into_iter()
            .filter(|key| !values.contains_key(key))
            .collect();
        if !missing.is_empty() {
            return Err(EnvError::MissingKeys(missing));
        }

        info!("Loaded {} environment keys", values.len());
        Ok(Self { values })
    }

    /// Get a scalar value
    pub fn get(&self, key: EnvKey) -> EnvResult<&str> {
        if key.kind() != EnvValueKind::Scalar {
            return Err(EnvError::SchemaMisuse {
                key,
                requested: EnvValueKind::Scalar,
            });
        }

        match self.values.get(&key).ok_or(EnvError::MissingKey(key))? {
            EnvValue::Scalar(value) => Ok(value.as_str()),
            EnvValue::List(_) => Err(EnvError::TypeMismatch {
                key,
                value: "list value".to_string(),
            }),
        }
    }

    /// Get a list value
    pub fn get_list(&self, key: EnvKey) -> EnvResult<&[String]> {
        if key.kind() != EnvValueKind::List {
            return Err(EnvError::SchemaMisuse {
                key,
                requested: EnvValueKind::List,
            });
        }

        match self.values.get(&key).ok_or(EnvError::MissingKey(key))? {
            EnvValue::List(values) => Ok(values.as_slice()),
            EnvValue::Scalar(value) => Err(EnvError::TypeMismatch {
                key,
                value: value.clone(),
            }),
        }
    }

    #[cfg(test)]
    pub(crate) fn from_values(values: HashMap<EnvKey, EnvValue>) -> Self {
        Self { values }
    }
}

// Values are credentials; only key names are printed.
impl fmt::Debug for Env {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<&EnvKey> = self.values.keys().collect();
        keys.sort();
        f.debug_struct("Env").field("keys", &keys).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io;
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;

    /// Log sink shared with a scoped fmt subscriber
    #[derive(Clone, Default)]
    struct LogBuffer(Arc<Mutex<Vec<u8>>>);

    impl io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl LogBuffer {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).to_string()
        }
    }

    fn with_captured_logs<T>(f: impl FnOnce() -> T) -> (T, String) {
        let buffer = LogBuffer::default();
        let writer = buffer.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        let result = tracing::subscriber::with_default(subscriber, f);
        (result, buffer.contents())
    }

    const VALID: &str = "\
# credentials
GEMINI_API_KEYS=[key-one, key-two]

OLLAMA_API_KEY = ollama-secret
";

    #[test]
    fn test_parse_valid_env() {
        let env = Env::parse(VALID).unwrap();
        assert_eq!(
            env.get_list(EnvKey::GeminiApiKeys).unwrap(),
            ["key-one".to_string(), "key-two".to_string()]
        );
        assert_eq!(env.get(EnvKey::OllamaApiKey).unwrap(), "ollama-secret");
    }

    #[test]
    fn test_list_elements_trimmed_and_empty_dropped() {
        let env = Env::parse("GEMINI_API_KEYS=[a, b, ,  c ]\nOLLAMA_API_KEY=x\n").unwrap();
        assert_eq!(
            env.get_list(EnvKey::GeminiApiKeys).unwrap(),
            ["a".to_string(), "b".to_string(), "c".to_string()]
        );
    }

    #[test]
    fn test_scalar_keeps_inner_brackets() {
        let env = Env::parse("GEMINI_API_KEYS=[a]\nOLLAMA_API_KEY=a[b]c\n").unwrap();
        assert_eq!(env.get(EnvKey::OllamaApiKey).unwrap(), "a[b]c");
    }

    #[test]
    fn test_value_split_on_first_equals() {
        let env = Env::parse("GEMINI_API_KEYS=[a]\nOLLAMA_API_KEY=abc==\n").unwrap();
        assert_eq!(env.get(EnvKey::OllamaApiKey).unwrap(), "abc==");
    }

    #[test]
    fn test_indented_comment_skipped() {
        let env = Env::parse("   # OLLAMA_API_KEY=commented\nGEMINI_API_KEYS=[a]\nOLLAMA_API_KEY=real\n")
            .unwrap();
        assert_eq!(env.get(EnvKey::OllamaApiKey).unwrap(), "real");
    }

    #[test]
    fn test_missing_single_key() {
        let err = Env::parse("GEMINI_API_KEYS=[a]\n").unwrap_err();
        match err {
            EnvError::MissingKeys(keys) => assert_eq!(keys, vec![EnvKey::OllamaApiKey]),
            other => panic!("Expected MissingKeys, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_all_keys_reported_together() {
        let err = Env::parse("# nothing here\n\n").unwrap_err();
        match &err {
            EnvError::MissingKeys(keys) => {
                assert_eq!(keys, &vec![EnvKey::GeminiApiKeys, EnvKey::OllamaApiKey])
            }
            other => panic!("Expected MissingKeys, got {other:?}"),
        }
        assert_eq!(
            err.to_string(),
            "ENV: Missing required keys: GEMINI_API_KEYS, OLLAMA_API_KEY"
        );
    }

    #[test]
    fn test_duplicate_key_keeps_first() {
        let content = "OLLAMA_API_KEY=first\nGEMINI_API_KEYS=[a]\nOLLAMA_API_KEY=second\n";
        let parsed = parse_lines(content).unwrap();
        assert_eq!(
            parsed.warnings,
            vec![EnvWarning::DuplicateKey {
                line_no: 3,
                key: EnvKey::OllamaApiKey
            }]
        );

        let env = Env::parse(content).unwrap();
        assert_eq!(env.get(EnvKey::OllamaApiKey).unwrap(), "first");
    }

    #[test]
    fn test_duplicate_with_wrong_kind_is_not_fatal() {
        let env = Env::parse("OLLAMA_API_KEY=first\nOLLAMA_API_KEY=[x]\nGEMINI_API_KEYS=[a]\n")
            .unwrap();
        assert_eq!(env.get(EnvKey::OllamaApiKey).unwrap(), "first");
    }

    #[test]
    fn test_line_without_equals_skipped() {
        let content = "this line is garbage\nGEMINI_API_KEYS=[a]\nOLLAMA_API_KEY=x\n";
        let parsed = parse_lines(content).unwrap();
        assert_eq!(
            parsed.warnings,
            vec![EnvWarning::InvalidLine {
                line_no: 1,
                line: "this line is garbage".to_string()
            }]
        );
        assert!(Env::parse(content).is_ok());
    }

    #[test]
    fn test_unknown_key_skipped() {
        let content = "GOOGLE_API_KEY=abc\nGEMINI_API_KEYS=[a]\nOLLAMA_API_KEY=x\n";
        let parsed = parse_lines(content).unwrap();
        assert_eq!(
            parsed.warnings,
            vec![EnvWarning::UnknownKey {
                line_no: 1,
                key: "GOOGLE_API_KEY".to_string()
            }]
        );
        assert!(Env::parse(content).is_ok());
    }

    #[test]
    fn test_key_match_is_case_sensitive() {
        let err = Env::parse("gemini_api_keys=[a]\nOLLAMA_API_KEY=x\n").unwrap_err();
        assert!(matches!(err, EnvError::MissingKeys(keys) if keys == vec![EnvKey::GeminiApiKeys]));
    }

    #[test]
    fn test_list_for_scalar_key_is_fatal() {
        let err = Env::parse("GEMINI_API_KEYS=[a]\nOLLAMA_API_KEY=[x]\n").unwrap_err();
        match err {
            EnvError::TypeMismatch { key, value } => {
                assert_eq!(key, EnvKey::OllamaApiKey);
                assert_eq!(value, "[x]");
            }
            other => panic!("Expected TypeMismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_scalar_for_list_key_is_fatal() {
        let err = Env::parse("GEMINI_API_KEYS=just-one\nOLLAMA_API_KEY=x\n").unwrap_err();
        assert!(matches!(
            err,
            EnvError::TypeMismatch { key: EnvKey::GeminiApiKeys, .. }
        ));
        assert_eq!(
            err.to_string(),
            "ENV: Invalid value type for key GEMINI_API_KEYS: just-one. Expected list"
        );
    }

    #[test]
    fn test_type_mismatch_aborts_before_missing_check() {
        let err = Env::parse("OLLAMA_API_KEY=[x]\n").unwrap_err();
        assert!(matches!(err, EnvError::TypeMismatch { .. }));
    }

    #[test]
    fn test_wrong_accessor_is_schema_misuse() {
        let env = Env::parse(VALID).unwrap();

        let err = env.get_list(EnvKey::OllamaApiKey).unwrap_err();
        assert!(matches!(
            err,
            EnvError::SchemaMisuse {
                key: EnvKey::OllamaApiKey,
                requested: EnvValueKind::List
            }
        ));

        let err = env.get(EnvKey::GeminiApiKeys).unwrap_err();
        assert!(matches!(
            err,
            EnvError::SchemaMisuse {
                key: EnvKey::GeminiApiKeys,
                requested: EnvValueKind::Scalar
            }
        ));
    }

    #[test]
    fn test_schema_misuse_regardless_of_contents() {
        let env = Env::from_values(HashMap::new());
        assert!(matches!(
            env.get_list(EnvKey::OllamaApiKey),
            Err(EnvError::SchemaMisuse { .. })
        ));
    }

    #[test]
    fn test_accessor_missing_key() {
        let env = Env::from_values(HashMap::new());
        assert!(matches!(
            env.get(EnvKey::OllamaApiKey),
            Err(EnvError::MissingKey(EnvKey::OllamaApiKey))
        ));
        assert!(matches!(
            env.get_list(EnvKey::GeminiApiKeys),
            Err(EnvError::MissingKey(EnvKey::GeminiApiKeys))
        ));
    }

    #[test]
    fn test_accessor_stored_kind_mismatch() {
        let env = Env::from_values(HashMap::from([
            (EnvKey::OllamaApiKey, EnvValue::List(vec!["x".to_string()])),
            (EnvKey::GeminiApiKeys, EnvValue::Scalar("y".to_string())),
        ]));

        match env.get(EnvKey::OllamaApiKey).unwrap_err() {
            EnvError::TypeMismatch { value, .. } => assert_eq!(value, "list value"),
            other => panic!("Expected TypeMismatch, got {other:?}"),
        }
        match env.get_list(EnvKey::GeminiApiKeys).unwrap_err() {
            EnvError::TypeMismatch { value, .. } => assert_eq!(value, "y"),
            other => panic!("Expected TypeMismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(ENV_FILE);
        fs::write(&path, VALID).unwrap();

        let env = Env::load_from(&path).unwrap();
        assert_eq!(env.get(EnvKey::OllamaApiKey).unwrap(), "ollama-secret");
    }

    #[test]
    fn test_load_from_missing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(ENV_FILE);

        let err = Env::load_from(&path).unwrap_err();
        assert!(matches!(err, EnvError::FileNotFound(p) if p == path));
    }

    #[test]
    fn test_load_twice_is_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(ENV_FILE);
        fs::write(&path, VALID).unwrap();

        let first = Env::load_from(&path).unwrap();
        let second = Env::load_from(&path).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_crlf_line_endings() {
        let env = Env::parse("GEMINI_API_KEYS=[a, b]\r\nOLLAMA_API_KEY=x\r\n").unwrap();
        assert_eq!(env.get(EnvKey::OllamaApiKey).unwrap(), "x");
        assert_eq!(env.get_list(EnvKey::GeminiApiKeys).unwrap().len(), 2);
    }

    #[test]
    fn test_debug_hides_values() {
        let env = Env::parse(VALID).unwrap();
        let debug = format!("{:?}", env);
        assert!(debug.contains("GeminiApiKeys"));
        assert!(!debug.contains("ollama-secret"));
        assert!(!debug.contains("key-one"));
    }

    #[test]
    fn test_skipped_lines_logged_before_fatal_line() {
        let content = "GEMINI_API_KEY=[typo]\nno equals here\nGEMINI_API_KEYS=x\nOLLAMA_API_KEY=y\n";
        let (result, logged) = with_captured_logs(|| Env::parse(content));

        assert!(matches!(
            result,
            Err(EnvError::TypeMismatch { key: EnvKey::GeminiApiKeys, .. })
        ));
        assert!(logged.contains("Unknown key (line 1): GEMINI_API_KEY"));
        assert!(logged.contains("Invalid line format (line 2): no equals here"));
    }

    #[test]
    fn test_duplicate_key_logged() {
        let content = "OLLAMA_API_KEY=a\nOLLAMA_API_KEY=b\nGEMINI_API_KEYS=[k]\n";
        let (result, logged) = with_captured_logs(|| Env::parse(content));

        assert!(result.is_ok());
        assert!(logged.contains("WARN"));
        assert!(logged.contains("Duplicate key (line 2): OLLAMA_API_KEY"));
    }

    #[test]
    fn test_load_from_unreadable_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(ENV_FILE);
        fs::create_dir(&path).unwrap();

        let err = Env::load_from(&path).unwrap_err();
        assert!(matches!(err, EnvError::Read { path: p, .. } if p == path));
    }

    #[test]
    fn test_load_uses_working_directory() {
        let dir = tempdir().unwrap();
        let original = std::env::current_dir().unwrap();
        std::env::set_current_dir(dir.path()).unwrap();

        let missing = Env::load();
        fs::write(dir.path().join(ENV_FILE), VALID).unwrap();
        let loaded = Env::load();

        std::env::set_current_dir(original).unwrap();

        assert!(matches!(missing, Err(EnvError::FileNotFound(p)) if p == Path::new(ENV_FILE)));
        assert_eq!(loaded.unwrap().get(EnvKey::OllamaApiKey).unwrap(), "ollama-secret");
    }
}
