use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::debug;

use canopy_base::{CanopyError, CanopyResult, ErrorKind, ResultExt, err};

use crate::path::TreePath;

/// Contents of a `canopy.toml` file. Every field is optional.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Directory exposed as the tree root. Relative paths are resolved against the
    /// directory containing the config file.
    pub root: PathBuf,
    /// Glob patterns on root-relative paths; matching entries are hidden.
    pub ignore: Vec<String>,
    /// Tree paths to print and follow. `""` is the root.
    pub watch: Vec<String>,
    /// How many levels below each watched path are printed.
    pub depth: usize,
    /// Keep running and print every change.
    pub follow: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            ignore: vec![".git".to_string(), "target".to_string()],
            watch: vec![String::new()],
            depth: 2,
            follow: false,
        }
    }
}

impl Config {
    /// Parsed `watch` entries.
    pub fn watch_paths(&self) -> CanopyResult<Vec<TreePath<String>>> {
        self.watch
            .iter()
            .map(|text| {
                TreePath::parse(text).with_context(|| format!("Parsing watch entry '{}'", text))
            })
            .collect()
    }
}

/// Parses the text of a config file.
pub fn parse_config(text: &str) -> CanopyResult<Config> {
    toml::from_str(text).map_err(|e| err!("Invalid configuration: {}", e))
}

/// Loads the config file at `path`; a missing file yields the defaults.
///
/// A relative `root` is made relative to the config file's directory.
pub fn load_config(path: &Path) -> CanopyResult<Config> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no config file, using defaults");
            return Ok(with_base(Config::default(), path));
        }
        Err(source) => {
            return Err(Box::new(CanopyError::new(ErrorKind::FileError {
                path: path.to_path_buf(),
                source,
            })));
        }
    };
    let config =
        parse_config(&text).with_context(|| format!("Loading config from {}", path.display()))?;
    debug!(path = %path.display(), ?config, "loaded config");
    Ok(with_base(config, path))
}

fn with_base(mut config: Config, config_path: &Path) -> Config {
    if config.root.is_relative()
        && let Some(base) = config_path.parent()
    {
        config.root = base.join(&config.root);
    }
    config
}
