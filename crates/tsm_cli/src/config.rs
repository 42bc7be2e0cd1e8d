use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Optional settings file; command-line flags and the environment win over it.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub tsm_path: Option<PathBuf>,
    pub profile: Option<String>,
    pub backup_dir: Option<PathBuf>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, String> {
        let text = fs::read_to_string(path)
            .map_err(|e| format!("failed to read config {}: {e}", path.display()))?;
        let mut config: Config = serde_json::from_str(&text)
            .map_err(|e| format!("invalid config {}: {e}", path.display()))?;
        config.resolve_relative_to(path.parent().unwrap_or(Path::new(".")));
        Ok(config)
    }

    /// Relative paths in the file are taken from the config's own directory.
    fn resolve_relative_to(&mut self, base: &Path) {
        for path in [&mut self.tsm_path, &mut self.backup_dir].into_iter().flatten() {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
    }
}
