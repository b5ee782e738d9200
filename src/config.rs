//! Service configuration
//!
//! Describes a service as an ordered list of modules plus per-module
//! logging and WASI settings. The last module of a resolved service is its
//! facade, the only module external callers can reach.
//!
//! Environment variables of each module are merged from three layers, later
//! layers winning:
//!
//! ```text
//! WASM_LOG=off  <  host-supplied envs  <  module-specific envs
//! ```

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::isolation::ModuleBytes;
use crate::logging::LoggingMask;

/// Environment variable controlling guest log levels.
pub const WASM_LOG_ENV: &str = "WASM_LOG";

/// Value of `WASM_LOG` when no layer sets it.
pub const WASM_LOG_DEFAULT: &str = "off";

/// Environment variables, ordered for deterministic merging.
pub type Envs = BTreeMap<String, String>;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("service `{0}` has no modules")]
    NoModules(String),

    #[error("module `{0}` is listed more than once")]
    DuplicateModule(String),

    #[error("module `{0}` is configured but no wasm bytes were supplied for it")]
    MissingModuleBytes(String),

    #[error("module import name must not be empty")]
    EmptyImportName,

    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// WASI settings handed to the control runtime for one module.
///
/// The built-in wasmtime engine links no WASI imports. Of these settings it
/// only reads `WASM_LOG` from `envs`; `preopened_files`, `mapped_dirs` and
/// every other variable are carried through for runtimes that provide WASI.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WasiConfig {
    /// Environment variables visible to the module.
    pub envs: Envs,
    /// Files the module may open.
    pub preopened_files: BTreeSet<PathBuf>,
    /// Guest alias → host path.
    pub mapped_dirs: BTreeMap<String, PathBuf>,
}

/// Per-module settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleConfig {
    /// Whether guest log calls are forwarded at all.
    pub logger_enabled: bool,
    /// Bitmask of forwarded levels, see [`LoggingMask`].
    pub logging_mask: i64,
    pub wasi: WasiConfig,
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self {
            logger_enabled: true,
            logging_mask: LoggingMask::ALL.bits(),
            wasi: WasiConfig::default(),
        }
    }
}

impl ModuleConfig {
    /// The module's resolved `WASM_LOG` value.
    pub fn wasm_log(&self) -> &str {
        self.wasi
            .envs
            .get(WASM_LOG_ENV)
            .map(String::as_str)
            .unwrap_or(WASM_LOG_DEFAULT)
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.wasi.envs.insert(key.into(), value.into());
        self
    }

    /// Merge the env layers in precedence order. The result always contains
    /// `WASM_LOG`.
    fn resolve_envs(&mut self, global: Option<&Envs>) {
        let mut envs = Envs::new();
        envs.insert(WASM_LOG_ENV.to_string(), WASM_LOG_DEFAULT.to_string());
        if let Some(global) = global {
            envs.extend(global.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        envs.append(&mut self.wasi.envs);
        self.wasi.envs = envs;
    }
}

/// One entry of `modules_config`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleEntry {
    pub import_name: String,
    #[serde(default)]
    pub config: ModuleConfig,
}

impl ModuleEntry {
    pub fn new(import_name: impl Into<String>, config: ModuleConfig) -> Self {
        Self {
            import_name: import_name.into(),
            config,
        }
    }
}

/// Caller-supplied service configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Ordered module settings; the last entry is the facade.
    pub modules_config: Vec<ModuleEntry>,
    /// Settings for modules without an entry in `modules_config`.
    pub default_modules_config: Option<ModuleConfig>,
}

impl ServiceConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&raw)
    }
}

/// Module bytes keyed by import name, in caller order.
pub type ModuleSet = Vec<(String, ModuleBytes)>;

/// A fully resolved module: bytes plus merged config.
#[derive(Debug, Clone)]
pub struct ModuleDescriptor {
    pub import_name: String,
    pub wasm_bytes: ModuleBytes,
    pub config: ModuleConfig,
}

/// A fully resolved service, ready for registration.
#[derive(Debug, Clone)]
pub struct ServiceDescriptor {
    pub service_id: String,
    /// The last module is the facade. `resolve` never yields an empty list.
    pub modules: Vec<ModuleDescriptor>,
    pub default_module_config: Option<ModuleConfig>,
}

impl ServiceDescriptor {
    /// Resolve module bytes, optional config and optional global envs.
    ///
    /// Without a config, modules keep the order they were supplied in. With
    /// a config, `modules_config` decides the order; supplied modules it does
    /// not mention are placed ahead of the configured ones with the default
    /// config, so the facade stays the last configured module.
    pub fn resolve(
        service_id: impl Into<String>,
        modules: ModuleSet,
        config: Option<ServiceConfig>,
        envs: Option<&Envs>,
    ) -> Result<Self, ConfigError> {
        let service_id = service_id.into();
        if modules.is_empty() {
            return Err(ConfigError::NoModules(service_id));
        }

        let mut seen = HashSet::new();
        for (name, _) in &modules {
            if name.is_empty() {
                return Err(ConfigError::EmptyImportName);
            }
            if !seen.insert(name.as_str()) {
                return Err(ConfigError::DuplicateModule(name.clone()));
            }
        }

        let ServiceConfig {
            modules_config,
            default_modules_config,
        } = config.unwrap_or_default();
        let fallback = default_modules_config.clone().unwrap_or_default();

        let mut configured = HashSet::new();
        for entry in &modules_config {
            if entry.import_name.is_empty() {
                return Err(ConfigError::EmptyImportName);
            }
            if !configured.insert(entry.import_name.as_str()) {
                return Err(ConfigError::DuplicateModule(entry.import_name.clone()));
            }
            if !seen.contains(entry.import_name.as_str()) {
                return Err(ConfigError::MissingModuleBytes(entry.import_name.clone()));
            }
        }

        let mut bytes: BTreeMap<String, ModuleBytes> = BTreeMap::new();
        let mut unconfigured = Vec::new();
        for (name, wasm) in modules {
            if !configured.contains(name.as_str()) {
                unconfigured.push(name.clone());
            }
            bytes.insert(name, wasm);
        }

        let ordered = unconfigured
            .into_iter()
            .map(|name| (name, fallback.clone()))
            .chain(
                modules_config
                    .into_iter()
                    .map(|entry| (entry.import_name, entry.config)),
            );

        let mut resolved = Vec::with_capacity(bytes.len());
        for (import_name, mut config) in ordered {
            let wasm_bytes = bytes
                .remove(&import_name)
                .ok_or_else(|| ConfigError::MissingModuleBytes(import_name.clone()))?;
            config.resolve_envs(envs);
            resolved.push(ModuleDescriptor {
                import_name,
                wasm_bytes,
                config,
            });
        }

        Ok(Self {
            service_id,
            modules: resolved,
            default_module_config: default_modules_config,
        })
    }

    /// The facade module: always the last one. `None` for a descriptor
    /// built by hand without modules.
    pub fn facade(&self) -> Option<&ModuleDescriptor> {
        self.modules.last()
    }

    pub fn facade_name(&self) -> Option<&str> {
        self.facade().map(|m| m.import_name.as_str())
    }
}
