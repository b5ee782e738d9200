//! Host Function Registration
//!
//! Builds the imports a service module is linked against:
//!
//! - `host::log_utf8_string` and `host::get_call_parameters`,
//! - one function per sibling import, forwarding the call into an earlier
//!   module of the same service.
//!
//! Every module uses the guest-allocates ABI. A callable export has the
//! signature
//!
//! ```text
//! fn(in_ptr: i32, in_len: i32, out_ptr_ptr: i32, out_len_ptr: i32) -> i32
//! ```
//!
//! and the module exports `memory`, `allocate(size) -> ptr` and optionally
//! `deallocate(ptr, size)`. The host writes input through `allocate`, reads
//! output from the two slots and hands the output buffer back through
//! `deallocate`.

use std::collections::HashMap;

use anyhow::{anyhow, bail, Context};
use thiserror::Error;
use wasmtime::{AsContext, AsContextMut, Caller, Extern, Instance, Linker, Memory, TypedFunc};

use crate::call_params::CallParameters;
use crate::error::GuestError;
use crate::logging::{LogLevel, ModuleLogger};

/// Import namespace of the host functions.
pub const HOST_NAMESPACE: &str = "host";

/// Errors from linker operations
#[derive(Error, Debug)]
pub enum LinkerError {
    #[error("Function registration failed: {0}")]
    FunctionRegistration(String),
}

// ============================================================================
// Store state
// ============================================================================

/// Data of a service store, shared by every module of the service.
pub(crate) struct ServiceState {
    pub(crate) service_id: String,
    instances: HashMap<String, Instance>,
    call_parameters: String,
}

impl ServiceState {
    pub(crate) fn new(service_id: &str) -> Self {
        Self {
            service_id: service_id.to_string(),
            instances: HashMap::new(),
            call_parameters: CallParameters::default().to_json_string(),
        }
    }

    pub(crate) fn add_instance(&mut self, module: &str, instance: Instance) {
        self.instances.insert(module.to_string(), instance);
    }

    fn instance(&self, module: &str) -> Option<Instance> {
        self.instances.get(module).copied()
    }

    /// Parameters visible to guests for the duration of one call.
    pub(crate) fn begin_call(&mut self, params: &CallParameters) {
        self.call_parameters = params.to_json_string();
    }

    pub(crate) fn end_call(&mut self) {
        self.call_parameters = CallParameters::default().to_json_string();
    }
}

// ============================================================================
// Linker builder
// ============================================================================

/// Builder for registering host functions with a Linker.
///
/// Generic over `T` which is the store data type.
pub struct HostLinkerBuilder<'a, T> {
    linker: &'a mut Linker<T>,
}

impl<'a, T> HostLinkerBuilder<'a, T> {
    pub fn new(linker: &'a mut Linker<T>) -> Self {
        Self { linker }
    }

    /// Start defining functions in the import namespace `name`.
    pub fn interface(&mut self, name: &str) -> InterfaceBuilder<'_, 'a, T> {
        InterfaceBuilder {
            linker: self,
            module_name: name.to_string(),
        }
    }

    /// Register a provider's functions.
    pub fn register_provider<P: HostFunctionProvider<T>>(
        &mut self,
        provider: &P,
    ) -> Result<&mut Self, LinkerError> {
        provider.register(self)?;
        Ok(self)
    }
}

/// Builder for registering functions within one import namespace.
pub struct InterfaceBuilder<'a, 'b, T> {
    linker: &'a mut HostLinkerBuilder<'b, T>,
    module_name: String,
}

impl<'a, 'b, T: 'static> InterfaceBuilder<'a, 'b, T> {
    /// Register a host function with direct WASM-level parameters.
    pub fn func_raw<Params, Results>(
        &mut self,
        name: &str,
        func: impl wasmtime::IntoFunc<T, Params, Results>,
    ) -> Result<&mut Self, LinkerError> {
        self.linker
            .linker
            .func_wrap(&self.module_name, name, func)
            .map_err(|e| LinkerError::FunctionRegistration(e.to_string()))?;
        Ok(self)
    }
}

/// Types that provide a set of host functions.
pub trait HostFunctionProvider<T> {
    fn register(&self, builder: &mut HostLinkerBuilder<'_, T>) -> Result<(), LinkerError>;
}

// ============================================================================
// Host namespace
// ============================================================================

/// The `host` namespace of one module.
///
/// - `log_utf8_string(level, target_ptr, target_len, msg_ptr, msg_len)`
/// - `get_call_parameters(out_ptr_ptr, out_len_ptr) -> status`
pub struct HostImports {
    logger: ModuleLogger,
}

impl HostImports {
    pub fn new(logger: ModuleLogger) -> Self {
        Self { logger }
    }
}

impl HostFunctionProvider<ServiceState> for HostImports {
    fn register(&self, builder: &mut HostLinkerBuilder<'_, ServiceState>) -> Result<(), LinkerError> {
        let logger = self.logger.clone();

        builder
            .interface(HOST_NAMESPACE)
            .func_raw(
                "log_utf8_string",
                move |mut caller: Caller<'_, ServiceState>,
                      level: i32,
                      target_ptr: i32,
                      target_len: i32,
                      msg_ptr: i32,
                      msg_len: i32|
                      -> anyhow::Result<()> {
                    // Filtered records never touch guest memory.
                    if !logger.admits(LogLevel::from_guest(level)) {
                        return Ok(());
                    }
                    let memory = caller_memory(&mut caller)?;
                    let target = read_guest(&memory, &caller, target_ptr, target_len)?;
                    let message = read_guest(&memory, &caller, msg_ptr, msg_len)?;
                    logger.log_bytes(level, &target, &message);
                    Ok(())
                },
            )?
            .func_raw(
                "get_call_parameters",
                |mut caller: Caller<'_, ServiceState>,
                 out_ptr_ptr: i32,
                 out_len_ptr: i32|
                 -> anyhow::Result<i32> {
                    let params = caller.data().call_parameters.clone();
                    let guest = GuestMemory::of_caller(&mut caller)?;
                    let ptr = guest.write_bytes(&mut caller, params.as_bytes())?;
                    guest.write_i32(&mut caller, out_ptr_ptr, ptr)?;
                    guest.write_i32(&mut caller, out_len_ptr, params.len() as i32)?;
                    Ok(0)
                },
            )?;

        Ok(())
    }
}

// ============================================================================
// Sibling imports
// ============================================================================

/// Functions a module imports from an earlier module of its service.
///
/// Each import is satisfied by a host function that copies the input out of
/// the caller's memory, calls the sibling's export of the same name and
/// copies the output back. The sibling's status is returned unchanged.
pub struct SiblingImports {
    module: String,
    functions: Vec<String>,
}

impl SiblingImports {
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            functions: Vec::new(),
        }
    }

    pub fn function(mut self, name: impl Into<String>) -> Self {
        self.functions.push(name.into());
        self
    }
}

impl HostFunctionProvider<ServiceState> for SiblingImports {
    fn register(&self, builder: &mut HostLinkerBuilder<'_, ServiceState>) -> Result<(), LinkerError> {
        let mut interface = builder.interface(&self.module);

        for name in &self.functions {
            let module = self.module.clone();
            let function = name.clone();

            interface.func_raw(
                name,
                move |mut caller: Caller<'_, ServiceState>,
                      in_ptr: i32,
                      in_len: i32,
                      out_ptr_ptr: i32,
                      out_len_ptr: i32|
                      -> anyhow::Result<i32> {
                    let target = caller
                        .data()
                        .instance(&module)
                        .ok_or_else(|| anyhow!("module `{module}` is not instantiated"))?;

                    let own = GuestMemory::of_caller(&mut caller)?;
                    let input = own.read_bytes(&caller, in_ptr, in_len)?;

                    tracing::trace!(
                        service_id = %caller.data().service_id,
                        module = %module,
                        function = %function,
                        "cross-module call"
                    );

                    let output = call_export(&mut caller, target, &function, &input)?;

                    let ptr = own.write_bytes(&mut caller, &output.bytes)?;
                    own.write_i32(&mut caller, out_ptr_ptr, ptr)?;
                    own.write_i32(&mut caller, out_len_ptr, output.bytes.len() as i32)?;
                    Ok(output.status)
                },
            )?;
        }

        Ok(())
    }
}

// ============================================================================
// Guest memory
// ============================================================================

/// Memory and allocator exports of one instance.
pub(crate) struct GuestMemory {
    memory: Memory,
    allocate: TypedFunc<i32, i32>,
    deallocate: Option<TypedFunc<(i32, i32), ()>>,
}

impl GuestMemory {
    pub(crate) fn of_instance(
        mut store: impl AsContextMut,
        instance: &Instance,
    ) -> anyhow::Result<Self> {
        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or_else(|| anyhow!("module does not export `memory`"))?;
        let allocate = instance
            .get_typed_func::<i32, i32>(&mut store, "allocate")
            .context("module does not export `allocate(i32) -> i32`")?;
        let deallocate = instance
            .get_typed_func::<(i32, i32), ()>(&mut store, "deallocate")
            .ok();
        Ok(Self {
            memory,
            allocate,
            deallocate,
        })
    }

    fn of_caller<T>(caller: &mut Caller<'_, T>) -> anyhow::Result<Self> {
        let memory = caller_memory(caller)?;
        let allocate = caller
            .get_export("allocate")
            .and_then(Extern::into_func)
            .ok_or_else(|| anyhow!("module does not export `allocate`"))?
            .typed::<i32, i32>(&*caller)
            .context("`allocate` must have signature (i32) -> i32")?;
        let deallocate = caller
            .get_export("deallocate")
            .and_then(Extern::into_func)
            .and_then(|f| f.typed::<(i32, i32), ()>(&*caller).ok());
        Ok(Self {
            memory,
            allocate,
            deallocate,
        })
    }

    /// Allocate a guest buffer and copy `bytes` into it.
    fn write_bytes(&self, mut store: impl AsContextMut, bytes: &[u8]) -> anyhow::Result<i32> {
        let len = i32::try_from(bytes.len()).context("buffer exceeds the guest address space")?;
        let ptr = self.allocate.call(&mut store, len)?;
        self.memory
            .write(&mut store, ptr as u32 as usize, bytes)
            .with_context(|| format!("allocator returned unusable buffer at {ptr}"))?;
        Ok(ptr)
    }

    fn read_bytes(&self, store: impl AsContext, ptr: i32, len: i32) -> anyhow::Result<Vec<u8>> {
        read_guest(&self.memory, store, ptr, len)
    }

    fn read_i32(&self, store: impl AsContext, ptr: i32) -> anyhow::Result<i32> {
        let mut bytes = [0u8; 4];
        self.memory
            .read(&store, ptr as u32 as usize, &mut bytes)
            .with_context(|| format!("slot at {ptr} is out of bounds"))?;
        Ok(i32::from_le_bytes(bytes))
    }

    fn write_i32(&self, store: impl AsContextMut, ptr: i32, value: i32) -> anyhow::Result<()> {
        self.memory
            .write(store, ptr as u32 as usize, &value.to_le_bytes())
            .with_context(|| format!("slot at {ptr} is out of bounds"))
    }

    fn free(&self, store: impl AsContextMut, ptr: i32, len: i32) -> anyhow::Result<()> {
        if let Some(deallocate) = &self.deallocate {
            deallocate.call(store, (ptr, len))?;
        }
        Ok(())
    }
}

fn caller_memory<T>(caller: &mut Caller<'_, T>) -> anyhow::Result<Memory> {
    caller
        .get_export("memory")
        .and_then(Extern::into_memory)
        .ok_or_else(|| anyhow!("module does not export `memory`"))
}

fn read_guest(memory: &Memory, store: impl AsContext, ptr: i32, len: i32) -> anyhow::Result<Vec<u8>> {
    if len < 0 {
        bail!("negative buffer length {len}");
    }
    if len == 0 {
        return Ok(Vec::new());
    }
    let start = ptr as u32 as usize;
    let len = len as usize;
    if start.saturating_add(len) > memory.data_size(&store) {
        bail!("buffer {start}..{} is out of bounds", start.saturating_add(len));
    }
    let mut buffer = vec![0u8; len];
    memory.read(&store, start, &mut buffer)?;
    Ok(buffer)
}

// ============================================================================
// Calling exports
// ============================================================================

/// Raw result of one export call.
#[derive(Debug)]
pub(crate) struct RawOutput {
    pub(crate) status: i32,
    pub(crate) bytes: Vec<u8>,
}

/// Call `function` of `instance` with `input` using the guest-allocates ABI.
pub(crate) fn call_export(
    mut store: impl AsContextMut,
    instance: Instance,
    function: &str,
    input: &[u8],
) -> Result<RawOutput, GuestError> {
    let fault = |e: anyhow::Error| GuestError::Fault {
        function: function.to_string(),
        message: format!("{e:#}"),
    };

    let func = instance
        .get_func(&mut store, function)
        .ok_or_else(|| GuestError::MissingFunction(function.to_string()))?;
    let func = func
        .typed::<(i32, i32, i32, i32), i32>(&store)
        .context("export has an unexpected signature")
        .map_err(fault)?;
    let guest = GuestMemory::of_instance(&mut store, &instance).map_err(fault)?;

    run_export(&mut store, &guest, &func, input).map_err(fault)
}

fn run_export(
    store: &mut impl AsContextMut,
    guest: &GuestMemory,
    func: &TypedFunc<(i32, i32, i32, i32), i32>,
    input: &[u8],
) -> anyhow::Result<RawOutput> {
    let in_ptr = guest.write_bytes(&mut *store, input)?;
    let slots = guest.write_bytes(&mut *store, &[0u8; 8])?;

    let status = func.call(&mut *store, (in_ptr, input.len() as i32, slots, slots + 4))?;

    let out_ptr = guest.read_i32(&*store, slots)?;
    let out_len = guest.read_i32(&*store, slots + 4)?;
    let bytes = guest.read_bytes(&*store, out_ptr, out_len)?;

    if out_len > 0 {
        guest.free(&mut *store, out_ptr, out_len)?;
    }
    guest.free(&mut *store, slots, 8)?;
    guest.free(&mut *store, in_ptr, input.len() as i32)?;

    Ok(RawOutput { status, bytes })
}
