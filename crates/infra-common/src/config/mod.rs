//! Layered configuration loading
//!
//! Settings are resolved in three layers, later layers overriding earlier ones:
//!
//! 1. the service's `Default` values
//! 2. an optional TOML file
//! 3. environment variables, `PREFIX__SECTION__KEY`

use std::path::Path;

use config::{Config, Environment, File, FileFormat};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::errors::context::ErrorExt;
use crate::errors::types::{Error, Result};

/// Separator between nested keys in environment variable names
pub const ENV_SEPARATOR: &str = "__";

/// Load a configuration struct from defaults, an optional file and the environment
pub fn load_config<T>(defaults: &T, path: Option<&Path>, env_prefix: &str) -> Result<T>
where
    T: Serialize + DeserializeOwned,
{
    let base = Config::try_from(defaults)
        .map_err(Error::from)
        .with_context("config", "defaults")?;

    let mut builder = Config::builder().add_source(base);

    if let Some(path) = path {
        debug!(path = %path.display(), "loading configuration file");
        builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(true));
    }

    builder = builder.add_source(
        Environment::with_prefix(env_prefix)
            .separator(ENV_SEPARATOR)
            .try_parsing(true),
    );

    builder
        .build()
        .and_then(|cfg| cfg.try_deserialize::<T>())
        .map_err(Error::from)
        .with_context("config", "load")
}
