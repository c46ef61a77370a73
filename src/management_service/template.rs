use log::debug;
use regex::{Captures, Regex};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error_handling::types::ConfigError;

/// sshd configuration template with `{{ name }}` placeholders.
#[derive(Debug, Clone)]
pub struct SshdTemplate {
    path: PathBuf,
    source: String,
}

impl SshdTemplate {
    /// Loads template `name` from directory `tmpl_dir`.
    pub fn load(tmpl_dir: &Path, name: &str) -> Result<Self, ConfigError> {
        let path = tmpl_dir.join(name);
        if !path.is_file() {
            return Err(ConfigError::TemplateNotFound(path.display().to_string()));
        }
        let source = std::fs::read_to_string(&path)?;
        debug!("Loaded sshd template {}", path.display());
        Ok(SshdTemplate { path, source })
    }

    pub fn from_source(source: &str) -> Self {
        SshdTemplate {
            path: PathBuf::new(),
            source: source.to_string(),
        }
    }

    /// Substitutes every placeholder. Unknown names render as empty text.
    pub fn render(&self, vars: &HashMap<&str, String>) -> String {
        debug!("Rendering sshd template {}", self.path.display());
        let placeholder = match Regex::new(r"\{\{\s*(\w+)\s*\}\}") {
            Ok(re) => re,
            Err(_) => return self.source.clone(),
        };
        placeholder
            .replace_all(&self.source, |caps: &Captures| match vars.get(&caps[1]) {
                Some(value) => value.clone(),
                None => {
                    debug!("Template variable {} is not defined", &caps[1]);
                    String::new()
                }
            })
            .into_owned()
    }
}
