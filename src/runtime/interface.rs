//! Interface metadata
//!
//! Every service module carries a custom section named `interface-types`
//! listing its callable functions and their parameter names:
//!
//! ```json
//! {"functions": [{"name": "greeting", "params": ["name"]}]}
//! ```
//!
//! The parameter names drive the mapping of named call arguments onto the
//! positional wire form.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use wasmparser::{BinaryReaderError, ExternalKind, Parser, Payload, TypeRef};

/// Name of the custom section holding interface metadata.
pub const INTERFACE_SECTION: &str = "interface-types";

#[derive(Error, Debug)]
pub enum InterfaceError {
    #[error("module is not valid wasm: {0}")]
    Parse(String),

    #[error("module has no `interface-types` custom section")]
    Missing,

    #[error("`interface-types` section is malformed: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("function `{0}` is declared more than once")]
    DuplicateFunction(String),

    #[error("function `{function}` declares parameter `{param}` more than once")]
    DuplicateParam { function: String, param: String },
}

impl From<BinaryReaderError> for InterfaceError {
    fn from(e: BinaryReaderError) -> Self {
        InterfaceError::Parse(e.to_string())
    }
}

/// One callable function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionSignature {
    pub name: String,
    /// Parameter names in positional order.
    #[serde(default)]
    pub params: Vec<String>,
}

/// Interface metadata of one module.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleInterface {
    #[serde(default)]
    pub functions: Vec<FunctionSignature>,
}

impl ModuleInterface {
    /// Read the metadata from a module's custom section.
    pub fn from_wasm(wasm: &[u8]) -> Result<Self, InterfaceError> {
        let mut section = None;
        for payload in Parser::new(0).parse_all(wasm) {
            if let Payload::CustomSection(reader) = payload? {
                if reader.name() == INTERFACE_SECTION {
                    section = Some(reader.data());
                }
            }
        }
        Self::from_json_slice(section.ok_or(InterfaceError::Missing)?)
    }

    pub fn from_json_slice(raw: &[u8]) -> Result<Self, InterfaceError> {
        let interface: ModuleInterface = serde_json::from_slice(raw)?;
        interface.validate()?;
        Ok(interface)
    }

    fn validate(&self) -> Result<(), InterfaceError> {
        let mut names = HashSet::new();
        for func in &self.functions {
            if !names.insert(func.name.as_str()) {
                return Err(InterfaceError::DuplicateFunction(func.name.clone()));
            }
            let mut params = HashSet::new();
            for param in &func.params {
                if !params.insert(param.as_str()) {
                    return Err(InterfaceError::DuplicateParam {
                        function: func.name.clone(),
                        param: param.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn function(&self, name: &str) -> Option<&FunctionSignature> {
        self.functions.iter().find(|f| f.name == name)
    }
}

/// Import or export entry as shown by `svchost inspect`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExternEntry {
    pub module: Option<String>,
    pub name: String,
    pub kind: &'static str,
}

/// Static view of a module: metadata, imports and exports.
#[derive(Debug, Clone, Serialize)]
pub struct ModuleSummary {
    /// `None` when the module has no usable metadata.
    pub interface: Option<ModuleInterface>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface_error: Option<String>,
    pub imports: Vec<ExternEntry>,
    pub exports: Vec<ExternEntry>,
}

impl ModuleSummary {
    pub fn from_wasm(wasm: &[u8]) -> Result<Self, InterfaceError> {
        let mut imports = Vec::new();
        let mut exports = Vec::new();

        for payload in Parser::new(0).parse_all(wasm) {
            match payload? {
                Payload::ImportSection(reader) => {
                    for import in reader {
                        let import = import?;
                        imports.push(ExternEntry {
                            module: Some(import.module.to_string()),
                            name: import.name.to_string(),
                            kind: match import.ty {
                                TypeRef::Func(_) => "func",
                                TypeRef::Table(_) => "table",
                                TypeRef::Memory(_) => "memory",
                                TypeRef::Global(_) => "global",
                                TypeRef::Tag(_) => "tag",
                            },
                        });
                    }
                }
                Payload::ExportSection(reader) => {
                    for export in reader {
                        let export = export?;
                        exports.push(ExternEntry {
                            module: None,
                            name: export.name.to_string(),
                            kind: match export.kind {
                                ExternalKind::Func => "func",
                                ExternalKind::Table => "table",
                                ExternalKind::Memory => "memory",
                                ExternalKind::Global => "global",
                                ExternalKind::Tag => "tag",
                            },
                        });
                    }
                }
                _ => {}
            }
        }

        let (interface, interface_error) = match ModuleInterface::from_wasm(wasm) {
            Ok(interface) => (Some(interface), None),
            Err(e) => (None, Some(e.to_string())),
        };

        Ok(Self {
            interface,
            interface_error,
            imports,
            exports,
        })
    }
}
