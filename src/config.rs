use serde::{Deserialize, Serialize};
use std::{fs::File, io::BufReader, path::Path, path::PathBuf, time::Duration};

use crate::{cas::options::CasOptions, Error, InternalResult};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StackStateConfig {
    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub options: CasOptions,

    #[serde(default)]
    pub state: StateConfig,
}

/// How to start the computation engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_engine_command")]
    pub command: String,

    #[serde(default = "default_engine_args")]
    pub args: Vec<String>,

    #[serde(default = "default_engine_timeout", with = "duration_ms")]
    pub timeout: Duration,

    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            command: default_engine_command(),
            args: default_engine_args(),
            timeout: default_engine_timeout(),
            working_dir: None,
        }
    }
}

/// Reserved names used by the state machinery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    /// Response field carrying the step number.
    #[serde(default = "default_sequence_field")]
    pub sequence_field: String,

    /// Prefix of instance values in the attempt snapshot.
    #[serde(default = "default_snapshot_prefix")]
    pub snapshot_prefix: String,

    #[serde(default = "default_seed_field")]
    pub seed_field: String,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            sequence_field: default_sequence_field(),
            snapshot_prefix: default_snapshot_prefix(),
            seed_field: default_seed_field(),
        }
    }
}

fn default_engine_command() -> String {
    "maxima".to_string()
}

fn default_engine_args() -> Vec<String> {
    vec!["--very-quiet".to_string()]
}

fn default_engine_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_sequence_field() -> String {
    "_seqn".to_string()
}

fn default_snapshot_prefix() -> String {
    "_isv_".to_string()
}

fn default_seed_field() -> String {
    "_seed".to_string()
}

pub fn from_file<T: for<'de> Deserialize<'de>, P: AsRef<Path>>(path: P) -> InternalResult<T> {
    let file = File::open(path)
        .map_err(|e| Error::Config(format!("Failed to open config file: {}", e)))?;
    let reader = BufReader::new(file);
    let config = serde_json::from_reader(reader)
        .map_err(|e| Error::Config(format!("Failed to parse config file: {}", e)))?;
    Ok(config)
}

pub fn from_str<T: for<'de> Deserialize<'de>>(s: &str) -> InternalResult<T> {
    let config = serde_json::from_str(s)
        .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
    Ok(config)
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

impl StackStateConfig {
    pub fn from_file(path: &str) -> InternalResult<Self> {
        from_file(path)
    }
}
