use crate::error::ExecError;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::env as stdenv;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};

/// Name of the project file looked up in a project directory.
pub const CONFIG_FILE: &str = "mrpo.json";

/// Project-level settings handed to every command handler.
///
/// The well-known keys are lifted into fields:
/// - `cwd`: the project directory; relative handler paths are resolved against it.
/// - `name` / `version`: informational project metadata. Any scalar is
///   accepted and kept in its JSON text form (`"version": 1` reads as `"1"`).
///
/// Every other key of the project file is kept verbatim in `extra`, so handlers
/// can read their own settings without this crate knowing about them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectConfig {
    #[serde(default)]
    pub cwd: PathBuf,
    #[serde(
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub name: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub version: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ProjectConfig {
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: cwd.into(),
            ..Self::default()
        }
    }

    /// Look up a key that is not one of the lifted fields.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.extra.get(key)
    }

    /// Resolve `path` against the project directory unless it is absolute.
    pub fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.cwd.join(path)
        }
    }
}

fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Null => None,
        Value::String(text) => Some(text),
        other => Some(other.to_string()),
    })
}

/// Where the project description comes from.
#[derive(Debug, Clone)]
pub enum ConfigSource {
    /// A project directory containing [`CONFIG_FILE`].
    Dir(PathBuf),
    /// A description given in code; must be a JSON object.
    Inline(Value),
}

impl From<PathBuf> for ConfigSource {
    fn from(dir: PathBuf) -> Self {
        ConfigSource::Dir(dir)
    }
}

impl From<Value> for ConfigSource {
    fn from(value: Value) -> Self {
        ConfigSource::Inline(value)
    }
}

/// A parsed project description: settings plus the executor specification.
#[derive(Debug, Clone, Deserialize)]
pub struct Manifest {
    #[serde(flatten)]
    pub config: ProjectConfig,
    #[serde(default)]
    pub executor: Option<Value>,
    #[serde(default)]
    pub executors: Option<Vec<Value>>,
}

impl Manifest {
    pub async fn load(source: ConfigSource) -> Result<Self, ExecError> {
        match source {
            ConfigSource::Dir(dir) => Self::load_dir(dir).await,
            ConfigSource::Inline(value) => Self::from_inline(value),
        }
    }

    async fn load_dir(dir: PathBuf) -> Result<Self, ExecError> {
        let path = dir.join(CONFIG_FILE);
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == IoErrorKind::NotFound => {
                return Err(ExecError::Config(format!(
                    "could not find {} file in {}",
                    CONFIG_FILE,
                    dir.display()
                )));
            }
            Err(err) => {
                return Err(ExecError::Config(format!(
                    "can't read {}: {}",
                    path.display(),
                    err
                )));
            }
        };

        let mut manifest: Manifest = serde_json::from_str(&text)
            .map_err(|err| ExecError::Config(format!("invalid {}: {}", path.display(), err)))?;
        manifest.config.cwd = dir;
        Ok(manifest)
    }

    fn from_inline(value: Value) -> Result<Self, ExecError> {
        if !value.is_object() {
            return Err(ExecError::Config(format!("invalid MrPo config: {}", value)));
        }

        let mut manifest: Manifest = serde_json::from_value(value)
            .map_err(|err| ExecError::Config(format!("invalid MrPo config: {}", err)))?;
        if manifest.config.cwd.as_os_str().is_empty() {
            manifest.config.cwd = stdenv::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        }
        Ok(manifest)
    }
}
