//! Control Runtime
//!
//! The engine that actually runs service modules. The rest of the crate
//! talks to it through two traits:
//!
//! - [`ControlRuntimeFactory`] compiles the control module once per host,
//! - [`ControlRuntime`] registers module sets and invokes functions on them.
//!
//! Both are driven from a single thread; a runtime never sees two calls at
//! once. [`WasmtimeFactory`] is the built-in implementation.

mod engine;
mod host;
mod interface;

pub use engine::{WasmtimeFactory, WasmtimeRuntime, CONTROL_NAMESPACE};
pub use host::{
    HostFunctionProvider, HostImports, HostLinkerBuilder, InterfaceBuilder, LinkerError,
    SiblingImports, HOST_NAMESPACE,
};
pub use interface::{
    ExternEntry, FunctionSignature, InterfaceError, ModuleInterface, ModuleSummary,
    INTERFACE_SECTION,
};

use std::fmt;

use thiserror::Error;

use crate::call_params::CallParameters;
use crate::config::ServiceDescriptor;
use crate::error::GuestError;
use crate::logging::LogSink;

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("control module failed to compile: {0}")]
    Compile(String),

    #[error("control module must not import anything, found `{module}::{name}`")]
    ControlImports { module: String, name: String },

    #[error("module `{module}` cannot be registered: {reason}")]
    Registration { module: String, reason: String },

    #[error("no service registered under handle {0}")]
    UnknownHandle(ServiceHandle),

    #[error("module `{0}` is not part of the service")]
    UnknownModule(String),

    #[error(transparent)]
    Guest(#[from] GuestError),
}

impl RuntimeError {
    pub(crate) fn registration(module: &str, reason: impl fmt::Display) -> Self {
        RuntimeError::Registration {
            module: module.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Opaque reference to a registered module set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceHandle(u64);

impl ServiceHandle {
    pub fn new(raw: u64) -> Self {
        ServiceHandle(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ServiceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Compiles the control module into a runtime.
///
/// The factory is moved into the execution context; the runtime it builds
/// never leaves it.
pub trait ControlRuntimeFactory: Send + 'static {
    type Runtime: ControlRuntime;

    fn compile(&self, control_module: &[u8]) -> Result<Self::Runtime, RuntimeError>;
}

/// A compiled control runtime hosting any number of module sets.
pub trait ControlRuntime {
    /// Register every module of `service`. Guest logs go to `log_sink`.
    fn register_module(
        &mut self,
        service: &ServiceDescriptor,
        log_sink: LogSink,
    ) -> Result<ServiceHandle, RuntimeError>;

    /// Call `function` of `module` with JSON `args_json`, returning the JSON
    /// result envelope.
    fn invoke(
        &mut self,
        handle: ServiceHandle,
        module: &str,
        function: &str,
        args_json: &str,
        call_parameters: &CallParameters,
    ) -> Result<String, RuntimeError>;

    /// Drop a registration. Unknown handles are ignored.
    fn release(&mut self, handle: ServiceHandle);
}
