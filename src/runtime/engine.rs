//! Wasmtime control runtime
//!
//! Each registered service gets its own store holding:
//!
//! - one instance of the control module, linkable as `control::*`,
//! - one instance per service module, in descriptor order.
//!
//! A module may import from `host`, `control`, and any module listed
//! before it. Anything else fails registration.

use std::collections::{BTreeMap, HashMap};

use wasmtime::{Engine, ExternType, Instance, Linker, Module, Store};

use super::host::{call_export, GuestMemory, HostImports, RawOutput, ServiceState, SiblingImports};
use super::host::{HostLinkerBuilder, HOST_NAMESPACE};
use super::interface::{FunctionSignature, ModuleInterface};
use super::{ControlRuntime, ControlRuntimeFactory, RuntimeError, ServiceHandle};
use crate::abi::ResultEnvelope;
use crate::call_params::CallParameters;
use crate::config::{ModuleDescriptor, ServiceDescriptor};
use crate::error::GuestError;
use crate::logging::{LogSink, LoggingMask, ModuleLogger};

/// Import namespace under which control module exports are linkable.
pub const CONTROL_NAMESPACE: &str = "control";

/// Builds [`WasmtimeRuntime`]s.
#[derive(Debug, Clone, Default)]
pub struct WasmtimeFactory {
    config: Option<wasmtime::Config>,
}

impl WasmtimeFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a custom wasmtime configuration.
    pub fn with_config(config: wasmtime::Config) -> Self {
        Self {
            config: Some(config),
        }
    }
}

impl ControlRuntimeFactory for WasmtimeFactory {
    type Runtime = WasmtimeRuntime;

    fn compile(&self, control_module: &[u8]) -> Result<WasmtimeRuntime, RuntimeError> {
        let engine = match &self.config {
            Some(config) => {
                Engine::new(config).map_err(|e| RuntimeError::Compile(e.to_string()))?
            }
            None => Engine::default(),
        };

        let control = Module::new(&engine, control_module)
            .map_err(|e| RuntimeError::Compile(format!("{e:#}")))?;

        if let Some(import) = control.imports().next() {
            return Err(RuntimeError::ControlImports {
                module: import.module().to_string(),
                name: import.name().to_string(),
            });
        }

        tracing::debug!(
            exports = control.exports().len(),
            "control module compiled"
        );

        Ok(WasmtimeRuntime {
            engine,
            control,
            services: HashMap::new(),
            next_handle: 1,
        })
    }
}

struct ModuleEntry {
    instance: Instance,
    interface: ModuleInterface,
}

struct ServiceInstance {
    store: Store<ServiceState>,
    modules: HashMap<String, ModuleEntry>,
}

/// Control runtime backed by wasmtime.
pub struct WasmtimeRuntime {
    engine: Engine,
    control: Module,
    services: HashMap<ServiceHandle, ServiceInstance>,
    next_handle: u64,
}

impl WasmtimeRuntime {
    fn instantiate_module(
        &self,
        store: &mut Store<ServiceState>,
        control: Instance,
        earlier: &HashMap<String, ModuleEntry>,
        descriptor: &ModuleDescriptor,
        logger: ModuleLogger,
    ) -> Result<ModuleEntry, RuntimeError> {
        let name = descriptor.import_name.as_str();
        let bytes = descriptor.wasm_bytes.as_slice();

        let interface =
            ModuleInterface::from_wasm(bytes).map_err(|e| RuntimeError::registration(name, e))?;
        let module = Module::new(&self.engine, bytes)
            .map_err(|e| RuntimeError::registration(name, format!("{e:#}")))?;

        // Group sibling imports by the module they come from.
        let mut siblings: BTreeMap<&str, SiblingImports> = BTreeMap::new();
        for import in module.imports() {
            match import.module() {
                HOST_NAMESPACE | CONTROL_NAMESPACE => continue,
                sibling if earlier.contains_key(sibling) => {
                    if !matches!(import.ty(), ExternType::Func(_)) {
                        return Err(RuntimeError::registration(
                            name,
                            format!("import `{sibling}::{}` must be a function", import.name()),
                        ));
                    }
                    check_sibling_export(store, &earlier[sibling], sibling, import.name())
                        .map_err(|reason| RuntimeError::registration(name, reason))?;
                    let entry = siblings
                        .remove(sibling)
                        .unwrap_or_else(|| SiblingImports::new(sibling));
                    siblings.insert(sibling, entry.function(import.name()));
                }
                other => {
                    return Err(RuntimeError::registration(
                        name,
                        format!(
                            "imports `{other}::{}` but `{other}` is not an earlier module of this service",
                            import.name()
                        ),
                    ));
                }
            }
        }

        let mut linker = Linker::new(&self.engine);
        linker
            .instance(&mut *store, CONTROL_NAMESPACE, control)
            .map_err(|e| RuntimeError::registration(name, format!("{e:#}")))?;

        let mut builder = HostLinkerBuilder::new(&mut linker);
        builder
            .register_provider(&HostImports::new(logger))
            .map_err(|e| RuntimeError::registration(name, e))?;
        for provider in siblings.values() {
            builder
                .register_provider(provider)
                .map_err(|e| RuntimeError::registration(name, e))?;
        }

        let instance = linker
            .instantiate(&mut *store, &module)
            .map_err(|e| RuntimeError::registration(name, format!("{e:#}")))?;

        GuestMemory::of_instance(&mut *store, &instance)
            .map_err(|e| RuntimeError::registration(name, format!("{e:#}")))?;

        store.data_mut().add_instance(name, instance);

        Ok(ModuleEntry {
            instance,
            interface,
        })
    }
}

impl ControlRuntime for WasmtimeRuntime {
    fn register_module(
        &mut self,
        service: &ServiceDescriptor,
        log_sink: LogSink,
    ) -> Result<ServiceHandle, RuntimeError> {
        let service_id = service.service_id.as_str();
        let mut store = Store::new(&self.engine, ServiceState::new(service_id));

        let control = Linker::new(&self.engine)
            .instantiate(&mut store, &self.control)
            .map_err(|e| RuntimeError::registration(CONTROL_NAMESPACE, format!("{e:#}")))?;

        let mut modules = HashMap::new();
        for descriptor in &service.modules {
            let config = &descriptor.config;
            let logger = ModuleLogger::new(
                service_id,
                &descriptor.import_name,
                config.logger_enabled,
                LoggingMask::from_bits(config.logging_mask),
                config.wasm_log(),
                log_sink.clone(),
            );

            let entry = self.instantiate_module(&mut store, control, &modules, descriptor, logger)?;
            tracing::debug!(
                service_id,
                module = %descriptor.import_name,
                functions = entry.interface.functions.len(),
                "module instantiated"
            );
            modules.insert(descriptor.import_name.clone(), entry);
        }

        let handle = ServiceHandle::new(self.next_handle);
        self.next_handle += 1;
        self.services.insert(handle, ServiceInstance { store, modules });
        Ok(handle)
    }

    fn invoke(
        &mut self,
        handle: ServiceHandle,
        module: &str,
        function: &str,
        args_json: &str,
        call_parameters: &CallParameters,
    ) -> Result<String, RuntimeError> {
        let service = self
            .services
            .get_mut(&handle)
            .ok_or(RuntimeError::UnknownHandle(handle))?;
        let entry = service
            .modules
            .get(module)
            .ok_or_else(|| RuntimeError::UnknownModule(module.to_string()))?;

        let signature = entry
            .interface
            .function(function)
            .ok_or_else(|| GuestError::MissingFunction(function.to_string()))?;
        let args = positional_args(signature, args_json)?;
        let instance = entry.instance;

        tracing::trace!(module, function, args = %args, "invoking");

        service.store.data_mut().begin_call(call_parameters);
        let outcome = call_export(&mut service.store, instance, function, args.as_bytes());
        service.store.data_mut().end_call();

        Ok(envelope(function, outcome?)?.to_json_string())
    }

    fn release(&mut self, handle: ServiceHandle) {
        if self.services.remove(&handle).is_some() {
            tracing::debug!(%handle, "service released");
        }
    }
}

/// A sibling import must name a callable export of the earlier module.
fn check_sibling_export(
    store: &mut Store<ServiceState>,
    sibling: &ModuleEntry,
    sibling_name: &str,
    function: &str,
) -> Result<(), String> {
    let func = sibling
        .instance
        .get_func(&mut *store, function)
        .ok_or_else(|| format!("imports `{sibling_name}::{function}`, which `{sibling_name}` does not export"))?;
    func.typed::<(i32, i32, i32, i32), i32>(&*store)
        .map(|_| ())
        .map_err(|_| {
            format!(
                "imports `{sibling_name}::{function}`, which is not callable as (i32, i32, i32, i32) -> i32"
            )
        })
}

/// Map call arguments onto the positional order declared in metadata.
fn positional_args(signature: &FunctionSignature, args_json: &str) -> Result<String, GuestError> {
    let mismatch = |reason: String| GuestError::ArgumentMismatch {
        function: signature.name.clone(),
        reason,
    };

    let parsed: serde_json::Value = serde_json::from_str(args_json)
        .map_err(|e| mismatch(format!("arguments are not valid JSON: {e}")))?;

    let values = match parsed {
        serde_json::Value::Array(items) => {
            if items.len() != signature.params.len() {
                return Err(mismatch(format!(
                    "expected {} arguments, got {}",
                    signature.params.len(),
                    items.len()
                )));
            }
            items
        }
        serde_json::Value::Object(mut fields) => signature
            .params
            .iter()
            .map(|param| {
                fields
                    .remove(param)
                    .ok_or_else(|| mismatch(format!("missing argument `{param}`")))
            })
            .collect::<Result<Vec<_>, _>>()?,
        _ => {
            return Err(mismatch(
                "arguments must be an array or an object".to_string(),
            ))
        }
    };

    Ok(serde_json::Value::Array(values).to_string())
}

/// Wrap a raw export result into the result envelope.
fn envelope(function: &str, output: RawOutput) -> Result<ResultEnvelope, GuestError> {
    if output.status != 0 {
        let message = String::from_utf8_lossy(&output.bytes).into_owned();
        let message = if message.is_empty() {
            format!("status {}", output.status)
        } else {
            message
        };
        return Ok(ResultEnvelope::err(message));
    }

    if output.bytes.is_empty() {
        return Ok(ResultEnvelope::ok(serde_json::Value::Null));
    }

    serde_json::from_slice(&output.bytes)
        .map(ResultEnvelope::ok)
        .map_err(|e| GuestError::Fault {
            function: function.to_string(),
            message: format!(
                "returned invalid JSON: {e}, original text: {}",
                String::from_utf8_lossy(&output.bytes)
            ),
        })
}
