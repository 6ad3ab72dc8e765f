use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};
use validator::Validate;

#[derive(Debug, Clone, Default, Validate, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    #[validate]
    pub server: Server,

    #[validate]
    pub database: Database,

    #[validate]
    #[serde(flatten)]
    pub judger: obi_judger::Config,
}

#[derive(Debug, Clone, Validate, Serialize, Deserialize)]
#[serde(default)]
pub struct Server {
    #[validate(length(min = 1))]
    pub host: String,

    pub port: u16,
}

impl Default for Server {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Validate, Serialize, Deserialize)]
#[serde(default)]
pub struct Database {
    pub path: PathBuf,

    /// Checks the archive seal when set.
    #[validate(length(min = 1))]
    pub password: Option<String>,

    pub reference: Option<PathBuf>,
}

impl Default for Database {
    fn default() -> Self {
        Self {
            path: "contests.zip".into(),
            password: None,
            reference: None,
        }
    }
}

impl Config {
    /// Reads `path`, or falls back to defaults when it does not exist.
    pub fn load(path: &Path) -> Result<Config> {
        if !path.exists() {
            return Ok(Config::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config: path = {}", path.display()))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Config> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sections_are_flattened() -> Result<()> {
        let config = Config::from_toml(
            r#"
            [server]
            port = 9000

            [database]
            path = "db.zip"

            [engine]
            workers = 4
            "#,
        )?;
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.database.path, PathBuf::from("db.zip"));
        assert_eq!(config.judger.engine.workers, 4);
        Ok(())
    }

    #[test]
    fn missing_file_uses_defaults() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = Config::load(&dir.path().join("obijudge.toml"))?;
        assert_eq!(config.server.port, 8080);
        assert!(config.database.password.is_none());
        Ok(())
    }

    #[test]
    fn empty_password_is_rejected() {
        let config = Config::from_toml("[database]\npassword = \"\"\n");
        assert!(config.is_err());
    }
}
