//! Error types shared by every drover component.

use snafu::prelude::*;

// ============ Storage Errors ============

/// Errors that can occur while constructing a storage backend.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StorageError {
    /// The storage URL could not be parsed.
    #[snafu(display("Invalid storage URL '{url}': {source}"))]
    InvalidUrl {
        url: String,
        source: url::ParseError,
    },

    /// The URL scheme is not backed by any object store.
    #[snafu(display("Unsupported storage URL '{url}': {source}"))]
    UnsupportedBackend {
        url: String,
        source: object_store::Error,
    },
}

// ============ Config Errors ============

/// Errors that can occur during configuration parsing and validation.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    /// No components were configured.
    #[snafu(display("No {component}s configured"))]
    NoComponents { component: String },

    /// A section every deployment needs is absent.
    #[snafu(display("Missing required '{section}' section"))]
    MissingSection { section: String },

    /// A section was declared in more than one config file.
    #[snafu(display("Section '{section}' is defined in more than one config file"))]
    DuplicateSection { section: String },

    /// A component field holds an unusable value.
    #[snafu(display("{component} '{key}': {message}"))]
    InvalidComponent {
        component: String,
        key: String,
        message: String,
    },

    /// A shared section field holds an unusable value.
    #[snafu(display("Invalid '{section}' section: {message}"))]
    InvalidSection { section: String, message: String },

    /// A component was requested on the command line but is not configured.
    #[snafu(display("Unknown {component}(s) selected: {}", keys.join(", ")))]
    UnknownSelection { component: String, keys: Vec<String> },

    /// Environment variable interpolation failed.
    #[snafu(display("Environment variable interpolation failed:\n{message}"))]
    EnvInterpolation { message: String },

    /// Failed to parse YAML configuration.
    #[snafu(display("Failed to parse YAML: {source}"))]
    YamlParse { source: serde_yaml::Error },

    /// Failed to read configuration file.
    #[snafu(display("Failed to read configuration file: {source}"))]
    ReadFile { source: std::io::Error },

    /// Duplicate component keys found across config files.
    #[snafu(display("Duplicate component keys: {}", keys.join(", ")))]
    DuplicateComponents { keys: Vec<String> },

    /// Unsupported config file format.
    #[snafu(display("Unsupported config format for {}: only .yaml/.yml supported", path.display()))]
    UnsupportedFormat { path: std::path::PathBuf },

    /// Failed to read configuration directory.
    #[snafu(display("Failed to read directory {}", path.display()))]
    ReadDir {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    /// Multiple configuration errors occurred.
    #[snafu(display("Multiple config errors:\n{}", errors.join("\n")))]
    MultipleErrors { errors: Vec<String> },
}

// ============ Metrics Errors ============

/// Errors that can occur during metrics initialization.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum MetricsError {
    /// Failed to initialize the Prometheus exporter.
    #[snafu(display("Failed to initialize Prometheus exporter: {source}"))]
    PrometheusInit {
        source: metrics_exporter_prometheus::BuildError,
    },

    /// Metrics already initialized (double-init attempted).
    #[snafu(display("Metrics already initialized"))]
    AlreadyInitialized,
}

// ============ Pipeline Setup Errors ============

/// Errors that can occur during pipeline setup (before anything runs).
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum PipelineSetupError {
    /// Failed to parse metrics address.
    #[snafu(display("Failed to parse metrics address: {source}"))]
    AddressParse { source: std::net::AddrParseError },

    /// Failed to initialize metrics.
    #[snafu(display("Failed to initialize metrics: {source}"))]
    Metrics { source: MetricsError },

    /// A component could not be constructed from its configuration.
    #[snafu(display("Failed to build {component}: {source}"))]
    Build {
        component: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}
