//! Service Registry
//!
//! Owns the control runtime and the map of registered services. Lives inside
//! the execution context and is only ever touched by one thread, so calls
//! are serialized by construction.
//!
//! ```text
//! Uninitialized --init--> Initialized --terminate--> Terminated
//! ```

use std::collections::BTreeMap;

use crate::abi::{decode_envelope, encode_args, CallArgs, Value};
use crate::call_params::CallParameters;
use crate::config::ServiceDescriptor;
use crate::error::{GuestError, HostError};
use crate::logging::LogSink;
use crate::runtime::{ControlRuntime, ControlRuntimeFactory, RuntimeError, ServiceHandle};

/// Host lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    Initialized,
    Terminated,
}

#[derive(Debug)]
struct ServiceEntry {
    handle: ServiceHandle,
    facade: String,
}

pub struct Registry<F: ControlRuntimeFactory> {
    factory: F,
    runtime: Option<F::Runtime>,
    state: LifecycleState,
    services: BTreeMap<String, ServiceEntry>,
}

impl<F: ControlRuntimeFactory> Registry<F> {
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            runtime: None,
            state: LifecycleState::Uninitialized,
            services: BTreeMap::new(),
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Compile the control module. Allowed once.
    pub fn init(&mut self, control_module: &[u8]) -> Result<(), HostError> {
        match self.state {
            LifecycleState::Initialized => return Err(HostError::AlreadyInitialized),
            LifecycleState::Terminated => return Err(HostError::Terminated),
            LifecycleState::Uninitialized => {}
        }

        let runtime = self.factory.compile(control_module).map_err(HostError::Init)?;
        self.runtime = Some(runtime);
        self.state = LifecycleState::Initialized;
        tracing::info!(bytes = control_module.len(), "control runtime initialized");
        Ok(())
    }

    pub(crate) fn ensure_initialized(&self) -> Result<(), HostError> {
        match self.state {
            LifecycleState::Initialized => Ok(()),
            LifecycleState::Uninitialized => Err(HostError::NotInitialized),
            LifecycleState::Terminated => Err(HostError::Terminated),
        }
    }

    /// Register every module of `descriptor`. An existing registration under
    /// the same id is replaced only once the new one succeeded.
    pub fn create_service(
        &mut self,
        descriptor: ServiceDescriptor,
        log_sink: LogSink,
    ) -> Result<(), HostError> {
        self.ensure_initialized()?;
        let runtime = self.runtime.as_mut().ok_or(HostError::NotInitialized)?;
        let facade = descriptor
            .facade_name()
            .ok_or_else(|| HostError::Registration {
                service_id: descriptor.service_id.clone(),
                source: RuntimeError::registration(&descriptor.service_id, "service has no modules"),
            })?
            .to_string();

        let handle = runtime
            .register_module(&descriptor, log_sink)
            .map_err(|source| HostError::Registration {
                service_id: descriptor.service_id.clone(),
                source,
            })?;

        let entry = ServiceEntry { handle, facade };
        tracing::info!(
            service_id = %descriptor.service_id,
            facade = %entry.facade,
            modules = descriptor.modules.len(),
            "service registered"
        );

        if let Some(old) = self.services.insert(descriptor.service_id, entry) {
            runtime.release(old.handle);
        }
        Ok(())
    }

    /// Call `function` on the facade module of `service_id`.
    pub fn call_service(
        &mut self,
        service_id: &str,
        function: &str,
        args: &CallArgs,
        call_parameters: &CallParameters,
    ) -> Result<Value, HostError> {
        self.ensure_initialized()?;
        let runtime = self.runtime.as_mut().ok_or(HostError::NotInitialized)?;
        let entry = self
            .services
            .get(service_id)
            .ok_or_else(|| HostError::ServiceNotFound(service_id.to_string()))?;

        let args_json = encode_args(args)?;
        tracing::debug!(service_id, facade = %entry.facade, function, "calling service");

        let raw = runtime.invoke(entry.handle, &entry.facade, function, &args_json, call_parameters)?;
        decode_envelope(&raw)?.into_outcome().map_err(|message| {
            HostError::Guest(GuestError::Failed {
                function: function.to_string(),
                message,
            })
        })
    }

    /// Discard every service and the control runtime. Idempotent.
    pub fn terminate(&mut self) {
        if self.state == LifecycleState::Terminated {
            return;
        }
        if let Some(runtime) = self.runtime.as_mut() {
            for entry in self.services.values() {
                runtime.release(entry.handle);
            }
        }
        let released = self.services.len();
        self.services.clear();
        self.runtime = None;
        self.state = LifecycleState::Terminated;
        tracing::info!(released, "service host terminated");
    }

    /// Ids of registered services, sorted.
    pub fn service_ids(&self) -> Vec<String> {
        self.services.keys().cloned().collect()
    }

    pub fn facade_of(&self, service_id: &str) -> Option<&str> {
        self.services.get(service_id).map(|e| e.facade.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::ResultEnvelope;
    use crate::isolation::ModuleBytes;
    use crate::logging::tracing_sink;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Journal {
        registered: Vec<(ServiceHandle, String)>,
        released: Vec<ServiceHandle>,
        invoked: Vec<(String, String, String)>,
    }

    struct FakeFactory {
        journal: Arc<Mutex<Journal>>,
    }

    struct FakeRuntime {
        journal: Arc<Mutex<Journal>>,
        next: u64,
    }

    impl ControlRuntimeFactory for FakeFactory {
        type Runtime = FakeRuntime;

        fn compile(&self, control_module: &[u8]) -> Result<FakeRuntime, RuntimeError> {
            if control_module == b"broken" {
                return Err(RuntimeError::Compile("broken".into()));
            }
            Ok(FakeRuntime {
                journal: self.journal.clone(),
                next: 0,
            })
        }
    }

    impl ControlRuntime for FakeRuntime {
        fn register_module(
            &mut self,
            service: &ServiceDescriptor,
            _log_sink: LogSink,
        ) -> Result<ServiceHandle, RuntimeError> {
            if service.modules.iter().any(|m| m.wasm_bytes.is_empty()) {
                return Err(RuntimeError::registration("empty", "no bytes"));
            }
            self.next += 1;
            let handle = ServiceHandle::new(self.next);
            self.journal
                .lock()
                .unwrap()
                .registered
                .push((handle, service.service_id.clone()));
            Ok(handle)
        }

        fn invoke(
            &mut self,
            _handle: ServiceHandle,
            module: &str,
            function: &str,
            args_json: &str,
            _call_parameters: &CallParameters,
        ) -> Result<String, RuntimeError> {
            self.journal.lock().unwrap().invoked.push((
                module.to_string(),
                function.to_string(),
                args_json.to_string(),
            ));
            match function {
                "fail" => Ok(ResultEnvelope::err("nope").to_json_string()),
                "garbage" => Ok("{oops".to_string()),
                _ => Ok(ResultEnvelope::ok(serde_json::json!(module)).to_json_string()),
            }
        }

        fn release(&mut self, handle: ServiceHandle) {
            self.journal.lock().unwrap().released.push(handle);
        }
    }

    fn registry() -> (Registry<FakeFactory>, Arc<Mutex<Journal>>) {
        let journal = Arc::new(Mutex::new(Journal::default()));
        let registry = Registry::new(FakeFactory {
            journal: journal.clone(),
        });
        (registry, journal)
    }

    fn descriptor(id: &str, modules: &[&str]) -> ServiceDescriptor {
        ServiceDescriptor::resolve(
            id,
            modules
                .iter()
                .map(|m| (m.to_string(), ModuleBytes::from(vec![1u8])))
                .collect(),
            None,
            None,
        )
        .unwrap()
    }

    #[test]
    fn lifecycle_gates_operations() {
        let (mut registry, _) = registry();
        assert!(matches!(
            registry.create_service(descriptor("s", &["m"]), tracing_sink()),
            Err(HostError::NotInitialized)
        ));

        registry.init(b"control").unwrap();
        assert!(matches!(
            registry.init(b"control"),
            Err(HostError::AlreadyInitialized)
        ));

        registry.terminate();
        registry.terminate();
        assert_eq!(registry.state(), LifecycleState::Terminated);
        assert!(matches!(
            registry.call_service("s", "f", &CallArgs::none(), &CallParameters::default()),
            Err(HostError::Terminated)
        ));
        assert!(matches!(registry.init(b"control"), Err(HostError::Terminated)));
    }

    #[test]
    fn service_without_modules_is_rejected() {
        let (mut registry, journal) = registry();
        registry.init(b"control").unwrap();
        let empty = ServiceDescriptor {
            service_id: "s".into(),
            modules: Vec::new(),
            default_module_config: None,
        };
        match registry.create_service(empty, tracing_sink()) {
            Err(HostError::Registration { service_id, source }) => {
                assert_eq!(service_id, "s");
                assert!(source.to_string().contains("no modules"), "{source}");
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(registry.service_ids().is_empty());
        assert!(journal.lock().unwrap().registered.is_empty());
    }

    #[test]
    fn init_failure_leaves_host_uninitialized() {
        let (mut registry, _) = registry();
        assert!(matches!(registry.init(b"broken"), Err(HostError::Init(_))));
        assert_eq!(registry.state(), LifecycleState::Uninitialized);
    }

    #[test]
    fn calls_go_to_the_facade() {
        let (mut registry, journal) = registry();
        registry.init(b"control").unwrap();
        registry
            .create_service(descriptor("s", &["donkey", "shrek"]), tracing_sink())
            .unwrap();

        let result = registry
            .call_service(
                "s",
                "greeting",
                &CallArgs::positional(["test"]),
                &CallParameters::default(),
            )
            .unwrap();
        assert_eq!(result, Value::from("shrek"));

        let journal = journal.lock().unwrap();
        assert_eq!(
            journal.invoked,
            vec![("shrek".into(), "greeting".into(), r#"["test"]"#.into())]
        );
    }

    #[test]
    fn unknown_service_is_not_found() {
        let (mut registry, _) = registry();
        registry.init(b"control").unwrap();
        match registry.call_service("ghost", "f", &CallArgs::none(), &CallParameters::default()) {
            Err(HostError::ServiceNotFound(id)) => assert_eq!(id, "ghost"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn guest_error_and_bad_envelope_are_raised() {
        let (mut registry, _) = registry();
        registry.init(b"control").unwrap();
        registry
            .create_service(descriptor("s", &["m"]), tracing_sink())
            .unwrap();

        let params = CallParameters::default();
        match registry.call_service("s", "fail", &CallArgs::none(), &params) {
            Err(HostError::Guest(GuestError::Failed { function, message })) => {
                assert_eq!(function, "fail");
                assert_eq!(message, "nope");
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(matches!(
            registry.call_service("s", "garbage", &CallArgs::none(), &params),
            Err(HostError::Marshal(_))
        ));
    }

    #[test]
    fn reregistration_replaces_and_releases_old_handle() {
        let (mut registry, journal) = registry();
        registry.init(b"control").unwrap();
        registry
            .create_service(descriptor("s", &["a"]), tracing_sink())
            .unwrap();
        registry
            .create_service(descriptor("s", &["b"]), tracing_sink())
            .unwrap();

        assert_eq!(registry.facade_of("s"), Some("b"));
        assert_eq!(registry.service_ids(), vec!["s".to_string()]);
        assert_eq!(journal.lock().unwrap().released, vec![ServiceHandle::new(1)]);
    }

    #[test]
    fn failed_reregistration_keeps_previous_service() {
        let (mut registry, journal) = registry();
        registry.init(b"control").unwrap();
        registry
            .create_service(descriptor("s", &["a"]), tracing_sink())
            .unwrap();

        let broken = ServiceDescriptor::resolve(
            "s",
            vec![("b".into(), ModuleBytes::from(Vec::<u8>::new()))],
            None,
            None,
        )
        .unwrap();
        assert!(matches!(
            registry.create_service(broken, tracing_sink()),
            Err(HostError::Registration { .. })
        ));
        assert_eq!(registry.facade_of("s"), Some("a"));
        assert!(journal.lock().unwrap().released.is_empty());
    }

    #[test]
    fn terminate_releases_everything() {
        let (mut registry, journal) = registry();
        registry.init(b"control").unwrap();
        registry
            .create_service(descriptor("a", &["m"]), tracing_sink())
            .unwrap();
        registry
            .create_service(descriptor("b", &["m"]), tracing_sink())
            .unwrap();

        registry.terminate();
        assert!(registry.service_ids().is_empty());

        let journal = journal.lock().unwrap();
        let registered: Vec<ServiceHandle> = journal.registered.iter().map(|(h, _)| *h).collect();
        assert_eq!(journal.registered[1].1, "b");
        let mut released = journal.released.clone();
        released.sort_by_key(|h| h.raw());
        assert_eq!(released, registered);
    }
}
