use std::path::PathBuf;

use anyhow::{ensure, Context, Result};
use config::{Config, Environment, File, Map};
use serde::Deserialize;

const CONFIG_FILE: &str = "blocks_to_category";
const ENV_PREFIX: &str = "BTC";
const DEFAULT_DB_PATH: &str = "data/blocks.sqlite";
const DEFAULT_BATCH_SIZE: usize = 10;
const DEFAULT_POST_TYPE: &str = "post";

/// Runtime configuration: defaults, then `blocks_to_category.toml` if present,
/// then `BTC_*` environment variables (`BTC_POST_TYPES` is comma-separated).
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub db_path: PathBuf,
    pub batch_size: usize,
    pub post_types: Vec<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            batch_size: DEFAULT_BATCH_SIZE,
            post_types: vec![DEFAULT_POST_TYPE.to_string()],
        }
    }
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        Self::load_from(CONFIG_FILE, None)
    }

    /// `file` is a path without extension; `env` replaces the process
    /// environment when given.
    fn load_from(file: &str, env: Option<Map<String, String>>) -> Result<Self> {
        let settings = Config::builder()
            .set_default("db_path", DEFAULT_DB_PATH)?
            .set_default("batch_size", DEFAULT_BATCH_SIZE as i64)?
            .set_default("post_types", vec![DEFAULT_POST_TYPE])?
            .add_source(File::with_name(file).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .source(env)
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("post_types"),
            )
            .build()
            .context("Failed to load configuration")?;

        let cfg: AppConfig = settings
            .try_deserialize()
            .context("Invalid configuration")?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        ensure!(self.batch_size > 0, "batch_size must be at least 1");
        ensure!(!self.post_types.is_empty(), "post_types must name at least one post type");
        Ok(())
    }

    /// Whether posts of this type get categories from their blocks.
    pub fn processes(&self, post_type: &str) -> bool {
        self.post_types.iter().any(|t| t == post_type)
    }
}
