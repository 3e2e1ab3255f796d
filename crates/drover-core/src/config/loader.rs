//! Multi-file configuration loading.
//!
//! Each file (or every YAML file in a directory, in name order) is
//! interpolated, parsed into a partial config and merged into the result.
//! Errors from all sources are collected so a broken deployment reports
//! everything at once.

use std::path::Path;

use indexmap::IndexMap;

use crate::config::{ConfigPath, GlobalConfig, MetricsConfig, interpolate, is_yaml_file};
use crate::error::ConfigError;

/// Trait for configs that can be merged from multiple files.
pub trait Mergeable: Sized + Default {
    type Key: Eq + std::hash::Hash + Clone + std::fmt::Display;
    type Component;

    fn components(&self) -> &IndexMap<Self::Key, Self::Component>;
    fn components_mut(&mut self) -> &mut IndexMap<Self::Key, Self::Component>;
    fn global(&self) -> &GlobalConfig;
    fn global_mut(&mut self) -> &mut GlobalConfig;
    fn metrics(&self) -> &MetricsConfig;
    fn metrics_mut(&mut self) -> &mut MetricsConfig;
    fn parse_yaml(contents: &str) -> Result<Self, ConfigError>;

    /// Merge config-specific sections that are not components.
    ///
    /// Called after components, global and metrics have been merged.
    fn merge_sections(&mut self, _other: &mut Self) -> Result<(), ConfigError> {
        Ok(())
    }

    fn merge(&mut self, mut other: Self) -> Result<(), ConfigError> {
        let duplicates: Vec<String> = other
            .components()
            .keys()
            .filter(|key| self.components().contains_key(*key))
            .map(ToString::to_string)
            .collect();

        if !duplicates.is_empty() {
            return Err(ConfigError::DuplicateComponents { keys: duplicates });
        }

        for (key, component) in other.components_mut().drain(..) {
            self.components_mut().insert(key, component);
        }

        self.global_mut()
            .merge_from(std::mem::take(other.global_mut()));
        self.metrics_mut()
            .merge_from(std::mem::take(other.metrics_mut()));
        self.merge_sections(&mut other)
    }

    /// Keep only the components whose key is listed in `selected`.
    ///
    /// An empty selection keeps everything. Naming a component that is not
    /// configured is an error rather than a silent no-op.
    fn retain_selected(&mut self, selected: &[String], component: &str) -> Result<(), ConfigError> {
        if selected.is_empty() {
            return Ok(());
        }

        let unknown: Vec<String> = selected
            .iter()
            .filter(|wanted| !self.components().keys().any(|key| key.to_string() == **wanted))
            .cloned()
            .collect();

        if !unknown.is_empty() {
            return Err(ConfigError::UnknownSelection {
                component: component.to_string(),
                keys: unknown,
            });
        }

        self.components_mut()
            .retain(|key, _| selected.iter().any(|wanted| *wanted == key.to_string()));
        Ok(())
    }
}

/// Load and merge configuration from every given source.
pub fn load_from_paths<C: Mergeable>(paths: &[ConfigPath]) -> Result<C, ConfigError> {
    let mut config = C::default();
    let mut errors = Vec::new();

    for path in paths {
        let (location, loaded) = match path {
            ConfigPath::File(file) => (file.as_path(), load_file::<C>(file)),
            ConfigPath::Dir(dir) => (dir.as_path(), load_dir::<C>(dir)),
        };

        if let Err(e) = loaded.and_then(|partial| config.merge(partial)) {
            errors.push(format!("{}: {e}", location.display()));
        }
    }

    if !errors.is_empty() {
        return Err(ConfigError::MultipleErrors { errors });
    }
    Ok(config)
}

fn load_file<C: Mergeable>(path: &Path) -> Result<C, ConfigError> {
    if !is_yaml_file(path) {
        return Err(ConfigError::UnsupportedFormat {
            path: path.to_path_buf(),
        });
    }

    let contents =
        std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile { source })?;

    let interpolated = interpolate(&contents);
    if !interpolated.is_ok() {
        return Err(ConfigError::EnvInterpolation {
            message: interpolated.errors.join("\n"),
        });
    }

    C::parse_yaml(&interpolated.text)
}

fn load_dir<C: Mergeable>(dir: &Path) -> Result<C, ConfigError> {
    let mut files: Vec<_> = std::fs::read_dir(dir)
        .map_err(|source| ConfigError::ReadDir {
            path: dir.to_path_buf(),
            source,
        })?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file() && is_yaml_file(path))
        .collect();
    files.sort();

    let mut config = C::default();
    let mut errors = Vec::new();

    for file in files {
        if let Err(e) = load_file::<C>(&file).and_then(|partial| config.merge(partial)) {
            errors.push(format!("{}: {e}", file.display()));
        }
    }

    if !errors.is_empty() {
        return Err(ConfigError::MultipleErrors { errors });
    }
    Ok(config)
}
