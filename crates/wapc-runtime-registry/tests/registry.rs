//! Integration tests for wapc-runtime-registry.
//!
//! These tests verify the module lifecycle:
//! - Loading from disk, validation and load-error wrapping
//! - Invocation through the instance pool
//! - Host calls routed through a shared callback router
//! - Replacement, unloading and shutdown
//! - End-to-end execution of a waPC guest on Wasmtime

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use wapc_runtime_common::{
    CallbackError, EngineConfig, ExecutionConfig, ModuleLoadSpec, PoolConfig, PoolError,
    RuntimeConfig, RuntimeError,
};
use wapc_runtime_core::{
    CancellationToken, GuestEngine, GuestInstance, GuestModule, HostCallHandler,
};
use wapc_runtime_host::{
    CallbackRegistration, CallbackRouter, CapabilityPolicy, LoggingHooks, RouterConfig, hooks,
};
use wapc_runtime_registry::ModuleRegistry;

// ============================================================================
// Fake engine
// ============================================================================

/// Engine whose "module bytes" select behavior:
/// - `broken...` fails to compile
/// - `no-instances...` compiles but cannot be instantiated
/// - anything else is a module tagged with its bytes
#[derive(Default)]
struct FakeEngine {
    loads: AtomicUsize,
}

impl GuestEngine for FakeEngine {
    fn load(
        &self,
        name: &str,
        bytes: &[u8],
        handler: Arc<dyn HostCallHandler>,
    ) -> Result<Arc<dyn GuestModule>, RuntimeError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if bytes.starts_with(b"broken") {
            return Err(RuntimeError::compilation_failed("bad module bytes"));
        }
        Ok(Arc::new(FakeModule {
            name: name.to_string(),
            tag: String::from_utf8_lossy(bytes).into_owned(),
            handler,
            instantiable: !bytes.starts_with(b"no-instances"),
        }))
    }
}

struct FakeModule {
    name: String,
    tag: String,
    handler: Arc<dyn HostCallHandler>,
    instantiable: bool,
}

#[async_trait]
impl GuestModule for FakeModule {
    fn name(&self) -> &str {
        &self.name
    }

    async fn instantiate(&self) -> Result<Box<dyn GuestInstance>, RuntimeError> {
        if !self.instantiable {
            return Err(RuntimeError::instantiation("missing export"));
        }
        Ok(Box::new(FakeInstance {
            tag: self.tag.clone(),
            handler: Arc::clone(&self.handler),
            broken: false,
        }))
    }

    fn close(&self) {}
}

struct FakeInstance {
    tag: String,
    handler: Arc<dyn HostCallHandler>,
    broken: bool,
}

#[async_trait]
impl GuestInstance for FakeInstance {
    async fn invoke(
        &mut self,
        scope: &CancellationToken,
        operation: &str,
        payload: &[u8],
    ) -> Result<Vec<u8>, RuntimeError> {
        match operation {
            "echo" => Ok(payload.to_vec()),
            "tag" => Ok(self.tag.as_bytes().to_vec()),
            "hostcall" => Ok(self
                .handler
                .host_call(scope, "default", "counter", "increment", payload)?),
            "slow" => {
                tokio::time::sleep(Duration::from_millis(300)).await;
                Ok(payload.to_vec())
            }
            "slow-hostcall" => {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(self
                    .handler
                    .host_call(scope, "default", "counter", "increment", payload)?)
            }
            "trap" => {
                self.broken = true;
                Err(RuntimeError::trap("unreachable"))
            }
            other => Err(RuntimeError::guest_call(other, "unknown operation")),
        }
    }

    fn is_reusable(&self) -> bool {
        !self.broken
    }

    fn close(&mut self) {}
}

// ============================================================================
// Helpers
// ============================================================================

fn echo_router() -> Arc<CallbackRouter> {
    let router = Arc::new(CallbackRouter::new(RouterConfig::new()));
    router
        .register(
            CallbackRegistration::new("default", "counter", "increment")
                .handler(|input| Ok(input.to_vec())),
        )
        .unwrap();
    router
}

fn fake_registry(handler: Arc<dyn HostCallHandler>) -> (ModuleRegistry, Arc<FakeEngine>) {
    let engine = Arc::new(FakeEngine::default());
    let pool_config = PoolConfig {
        default_pool_size: 2,
        acquire_timeout_ms: 100,
    };
    let registry = ModuleRegistry::new(
        Arc::clone(&engine) as Arc<dyn GuestEngine>,
        handler,
        pool_config,
    );
    (registry, engine)
}

fn write_module(dir: &TempDir, file: &str, contents: &[u8]) -> String {
    let path: PathBuf = dir.path().join(file);
    let mut handle = std::fs::File::create(&path).unwrap();
    handle.write_all(contents).unwrap();
    path.to_string_lossy().into_owned()
}

// ============================================================================
// Test: Loading
// ============================================================================

#[tokio::test]
async fn test_missing_path_is_wrapped_and_not_registered() {
    let (registry, engine) = fake_registry(echo_router());

    let err = registry
        .load_module(ModuleLoadSpec::new("m", "/does/not/exist"))
        .await
        .unwrap_err();

    match err {
        RuntimeError::ModuleLoad { name, path, source } => {
            assert_eq!(name, "m");
            assert_eq!(path, "/does/not/exist");
            match *source {
                RuntimeError::Io(io) => assert_eq!(io.kind(), std::io::ErrorKind::NotFound),
                other => panic!("expected io error, got {other:?}"),
            }
        }
        other => panic!("expected module load error, got {other:?}"),
    }
    assert_eq!(engine.loads.load(Ordering::SeqCst), 0);

    let lookup = registry.get_module("m").unwrap_err();
    assert!(lookup.is_not_found());
}

#[tokio::test]
async fn test_invalid_spec_rejected() {
    let (registry, _) = fake_registry(echo_router());

    let err = registry
        .load_module(ModuleLoadSpec::new("", "/tmp/module.wasm"))
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::InvalidModuleConfig { .. }));

    let err = registry
        .load_module(ModuleLoadSpec::new("m", ""))
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::InvalidModuleConfig { .. }));

    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_compile_failure_is_wrapped() {
    let dir = TempDir::new().unwrap();
    let path = write_module(&dir, "broken.wasm", b"broken");
    let (registry, _) = fake_registry(echo_router());

    let err = registry
        .load_module(ModuleLoadSpec::new("m", &path))
        .await
        .unwrap_err();

    assert!(err.is_engine_error());
    assert!(matches!(
        err,
        RuntimeError::ModuleLoad { ref source, .. }
            if matches!(**source, RuntimeError::CompilationFailed { .. })
    ));
    assert!(registry.get_module("m").is_err());
}

#[tokio::test]
async fn test_instantiation_failure_is_wrapped() {
    let dir = TempDir::new().unwrap();
    let path = write_module(&dir, "empty.wasm", b"no-instances");
    let (registry, _) = fake_registry(echo_router());

    let err = registry
        .load_module(ModuleLoadSpec::new("m", &path))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        RuntimeError::ModuleLoad { ref source, .. }
            if matches!(**source, RuntimeError::Instantiation { .. })
    ));
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_pool_size_resolution() {
    let dir = TempDir::new().unwrap();
    let path = write_module(&dir, "echo.wasm", b"v1");
    let (registry, _) = fake_registry(echo_router());

    let defaulted = registry
        .load_module(ModuleLoadSpec::new("default-size", &path))
        .await
        .unwrap();
    let explicit = registry
        .load_module(ModuleLoadSpec::new("explicit-size", &path).with_pool_size(5))
        .await
        .unwrap();

    assert_eq!(defaulted.pool().size(), 2);
    assert_eq!(explicit.pool().size(), 5);
    assert_eq!(registry.list_modules(), ["default-size", "explicit-size"]);
}

// ============================================================================
// Test: Invocation
// ============================================================================

#[tokio::test]
async fn test_invoke_echo() {
    let dir = TempDir::new().unwrap();
    let path = write_module(&dir, "echo.wasm", b"v1");
    let (registry, _) = fake_registry(echo_router());
    registry
        .load_module(ModuleLoadSpec::new("m", &path))
        .await
        .unwrap();

    let output = registry.invoke("m", "echo", b"payload").await.unwrap();

    assert_eq!(output, b"payload");
    let module = registry.get_module("m").unwrap();
    assert_eq!(module.name(), "m");
    assert_eq!(module.source_path().to_string_lossy(), path);
    assert_eq!(module.pool().available(), 2);
}

#[tokio::test]
async fn test_invoke_unknown_module() {
    let (registry, _) = fake_registry(echo_router());

    let err = registry.invoke("missing", "echo", b"").await.unwrap_err();

    assert!(matches!(
        err,
        RuntimeError::ModuleNotFound { ref module_id } if module_id == "missing"
    ));
}

#[tokio::test]
async fn test_host_call_through_router() {
    let dir = TempDir::new().unwrap();
    let path = write_module(&dir, "counter.wasm", b"v1");
    let (registry, _) = fake_registry(echo_router());
    registry
        .load_module(ModuleLoadSpec::new("m", &path))
        .await
        .unwrap();

    let output = registry.invoke("m", "hostcall", b"Hello World").await.unwrap();

    assert_eq!(output, b"Hello World");
}

#[tokio::test]
async fn test_host_call_to_unregistered_route() {
    let dir = TempDir::new().unwrap();
    let path = write_module(&dir, "counter.wasm", b"v1");
    let router = Arc::new(CallbackRouter::new(RouterConfig::new()));
    let (registry, _) = fake_registry(router);
    registry
        .load_module(ModuleLoadSpec::new("m", &path))
        .await
        .unwrap();

    let err = registry.invoke("m", "hostcall", b"x").await.unwrap_err();

    assert!(matches!(
        err,
        RuntimeError::HostCall(CallbackError::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_pool_exhaustion_times_out() {
    let dir = TempDir::new().unwrap();
    let path = write_module(&dir, "slow.wasm", b"v1");
    let (registry, _) = fake_registry(echo_router());
    let registry = Arc::new(registry);
    registry
        .load_module(ModuleLoadSpec::new("m", &path).with_pool_size(1))
        .await
        .unwrap();

    let busy = {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move { registry.invoke("m", "slow", b"first").await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let err = registry.invoke("m", "echo", b"second").await.unwrap_err();
    assert!(matches!(err, RuntimeError::Pool(PoolError::Timeout { .. })));
    assert!(err.is_resource_limit());

    assert_eq!(busy.await.unwrap().unwrap(), b"first");
    assert_eq!(registry.invoke("m", "echo", b"third").await.unwrap(), b"third");
}

#[tokio::test]
async fn test_trapped_instance_shrinks_pool() {
    let dir = TempDir::new().unwrap();
    let path = write_module(&dir, "trap.wasm", b"v1");
    let (registry, _) = fake_registry(echo_router());
    let module = registry
        .load_module(ModuleLoadSpec::new("m", &path))
        .await
        .unwrap();

    let err = registry.invoke("m", "trap", b"").await.unwrap_err();

    assert!(matches!(err, RuntimeError::Trap { .. }));
    assert_eq!(module.pool().capacity(), 1);
    assert_eq!(registry.invoke("m", "echo", b"ok").await.unwrap(), b"ok");
}

// ============================================================================
// Test: Lifecycle
// ============================================================================

#[tokio::test]
async fn test_reload_replaces_and_closes_previous() {
    let dir = TempDir::new().unwrap();
    let v1 = write_module(&dir, "v1.wasm", b"v1");
    let v2 = write_module(&dir, "v2.wasm", b"v2");
    let (registry, _) = fake_registry(echo_router());

    let old = registry
        .load_module(ModuleLoadSpec::new("m", &v1))
        .await
        .unwrap();
    registry
        .load_module(ModuleLoadSpec::new("m", &v2))
        .await
        .unwrap();

    assert!(old.is_closed());
    assert!(old.pool().is_closed());
    assert!(matches!(old.run("echo", b"x").await, Err(RuntimeError::Canceled)));

    assert_eq!(registry.invoke("m", "tag", b"").await.unwrap(), b"v2");
    assert_eq!(registry.len(), 1);

    let old_scope = old.scope().clone();
    assert!(!old_scope.is_cancelled());
    drop(old);
    assert!(old_scope.is_cancelled());
}

#[tokio::test]
async fn test_reload_lets_running_invocation_finish() {
    let dir = TempDir::new().unwrap();
    let v1 = write_module(&dir, "v1.wasm", b"v1");
    let v2 = write_module(&dir, "v2.wasm", b"v2");
    let (registry, _) = fake_registry(echo_router());
    let registry = Arc::new(registry);

    let old_scope = registry
        .load_module(ModuleLoadSpec::new("m", &v1))
        .await
        .unwrap()
        .scope()
        .clone();

    let running = {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move { registry.invoke("m", "slow-hostcall", b"in flight").await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    registry
        .load_module(ModuleLoadSpec::new("m", &v2))
        .await
        .unwrap();
    assert!(!old_scope.is_cancelled());

    assert_eq!(running.await.unwrap().unwrap(), b"in flight");
    assert!(old_scope.is_cancelled());
    assert_eq!(registry.invoke("m", "tag", b"").await.unwrap(), b"v2");
}

#[tokio::test]
async fn test_unload_cancels_running_invocation() {
    let dir = TempDir::new().unwrap();
    let path = write_module(&dir, "m.wasm", b"v1");
    let (registry, _) = fake_registry(echo_router());
    let registry = Arc::new(registry);
    registry
        .load_module(ModuleLoadSpec::new("m", &path))
        .await
        .unwrap();

    let running = {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move { registry.invoke("m", "slow-hostcall", b"x").await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    registry.unload_module("m").unwrap();

    let err = running.await.unwrap().unwrap_err();
    assert!(matches!(err, RuntimeError::HostCall(CallbackError::Canceled)));
}

#[tokio::test]
async fn test_failed_reload_keeps_previous() {
    let dir = TempDir::new().unwrap();
    let good = write_module(&dir, "good.wasm", b"v1");
    let bad = write_module(&dir, "bad.wasm", b"broken");
    let (registry, _) = fake_registry(echo_router());

    registry
        .load_module(ModuleLoadSpec::new("m", &good))
        .await
        .unwrap();
    let err = registry
        .load_module(ModuleLoadSpec::new("m", &bad))
        .await
        .unwrap_err();

    assert!(err.is_engine_error());
    assert_eq!(registry.invoke("m", "tag", b"").await.unwrap(), b"v1");
}

#[tokio::test]
async fn test_unload_module() {
    let dir = TempDir::new().unwrap();
    let path = write_module(&dir, "m.wasm", b"v1");
    let (registry, _) = fake_registry(echo_router());
    let first = registry
        .load_module(ModuleLoadSpec::new("first", &path))
        .await
        .unwrap();
    registry
        .load_module(ModuleLoadSpec::new("second", &path))
        .await
        .unwrap();

    registry.unload_module("first").unwrap();

    assert!(first.is_closed());
    assert!(registry.get_module("first").unwrap_err().is_not_found());
    assert!(registry.unload_module("first").unwrap_err().is_not_found());

    let second = registry.get_module("second").unwrap();
    assert!(!second.is_closed());
    assert_eq!(registry.invoke("second", "echo", b"alive").await.unwrap(), b"alive");
}

#[tokio::test]
async fn test_close_all() {
    let dir = TempDir::new().unwrap();
    let path = write_module(&dir, "m.wasm", b"v1");
    let (registry, _) = fake_registry(echo_router());
    let a = registry
        .load_module(ModuleLoadSpec::new("a", &path))
        .await
        .unwrap();
    let b = registry
        .load_module(ModuleLoadSpec::new("b", &path))
        .await
        .unwrap();

    registry.close_all();

    assert!(registry.is_empty());
    for module in [&a, &b] {
        assert!(module.is_closed());
        assert!(module.scope().is_cancelled());
        assert!(module.pool().is_closed());
        assert_eq!(module.pool().capacity(), 0);
    }
    assert!(registry.invoke("a", "echo", b"").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_load_after_close_all_is_refused() {
    let dir = TempDir::new().unwrap();
    let path = write_module(&dir, "m.wasm", b"v1");
    let (registry, engine) = fake_registry(echo_router());

    registry.close_all();
    assert!(registry.is_closed());

    let err = registry
        .load_module(ModuleLoadSpec::new("m", &path))
        .await
        .unwrap_err();

    assert!(matches!(err, RuntimeError::RegistryClosed));
    assert_eq!(engine.loads.load(Ordering::SeqCst), 0);
    assert!(registry.is_empty());
    assert!(registry.invoke("m", "echo", b"").await.unwrap_err().is_not_found());
}

// ============================================================================
// Test: End-to-end on Wasmtime
// ============================================================================

const COUNTER_GUEST: &str = r#"
(module
    (import "wapc" "__guest_request" (func $guest_request (param i32 i32)))
    (import "wapc" "__guest_response" (func $guest_response (param i32 i32)))
    (import "wapc" "__guest_error" (func $guest_error (param i32 i32)))
    (import "wapc" "__host_call"
        (func $host_call (param i32 i32 i32 i32 i32 i32 i32 i32) (result i32)))
    (import "wapc" "__host_response_len" (func $host_response_len (result i32)))
    (import "wapc" "__host_response" (func $host_response (param i32)))
    (import "wapc" "__host_error_len" (func $host_error_len (result i32)))
    (import "wapc" "__host_error" (func $host_error (param i32)))

    (memory (export "memory") 2)

    (data (i32.const 0) "default")
    (data (i32.const 16) "counter")
    (data (i32.const 32) "increment")

    (func (export "__guest_call") (param $op_len i32) (param $payload_len i32) (result i32)
        (local $len i32)
        (call $guest_request (i32.const 1024) (i32.const 4096))
        (if (i32.eqz
                (call $host_call
                    (i32.const 0) (i32.const 7)
                    (i32.const 16) (i32.const 7)
                    (i32.const 32) (i32.const 9)
                    (i32.const 4096) (local.get $payload_len)))
            (then
                (local.set $len (call $host_error_len))
                (call $host_error (i32.const 32768))
                (call $guest_error (i32.const 32768) (local.get $len))
                (return (i32.const 0))))
        (local.set $len (call $host_response_len))
        (call $host_response (i32.const 32768))
        (call $guest_response (i32.const 32768) (local.get $len))
        (i32.const 1))
)
"#;

fn wasmtime_config() -> RuntimeConfig {
    RuntimeConfig {
        engine: EngineConfig {
            pooling_allocator: false,
            ..Default::default()
        },
        execution: ExecutionConfig {
            inherit_stdio: false,
            ..Default::default()
        },
        pool: PoolConfig {
            default_pool_size: 2,
            acquire_timeout_ms: 1_000,
        },
    }
}

#[tokio::test]
async fn test_wasm_guest_hello_world() {
    let dir = TempDir::new().unwrap();
    let path = write_module(&dir, "counter.wat", COUNTER_GUEST.as_bytes());
    let router = echo_router();
    let registry = ModuleRegistry::from_config(&wasmtime_config(), router).unwrap();

    registry
        .load_module(ModuleLoadSpec::new("counter", &path))
        .await
        .unwrap();
    let output = registry
        .invoke("counter", "increment", b"Hello World")
        .await
        .unwrap();

    assert_eq!(output, b"Hello World");
    registry.close_all();
}

#[tokio::test]
async fn test_wasm_guest_concurrent_invocations() {
    let dir = TempDir::new().unwrap();
    let path = write_module(&dir, "counter.wat", COUNTER_GUEST.as_bytes());
    let calls = Arc::new(AtomicUsize::new(0));
    let router = Arc::new(CallbackRouter::new(RouterConfig::new()));
    {
        let calls = Arc::clone(&calls);
        router
            .register(
                CallbackRegistration::new("default", "counter", "increment").handler(
                    move |input| {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(input.to_vec())
                    },
                ),
            )
            .unwrap();
    }
    let registry = Arc::new(ModuleRegistry::from_config(&wasmtime_config(), router).unwrap());
    registry
        .load_module(ModuleLoadSpec::new("counter", &path))
        .await
        .unwrap();

    let mut tasks = Vec::new();
    for i in 0..8 {
        let registry = Arc::clone(&registry);
        tasks.push(tokio::spawn(async move {
            let payload = format!("call-{i}");
            let output = registry
                .invoke("counter", "increment", payload.as_bytes())
                .await
                .unwrap();
            assert_eq!(output, payload.as_bytes());
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(calls.load(Ordering::SeqCst), 8);
    assert_eq!(registry.get_module("counter").unwrap().pool().available(), 2);
}

#[tokio::test]
async fn test_wasm_guest_policy_denial() {
    let dir = TempDir::new().unwrap();
    let path = write_module(&dir, "counter.wat", COUNTER_GUEST.as_bytes());

    let policy = CapabilityPolicy::builder().allow_namespace("metrics").build();
    let pre_hook = hooks::chain([LoggingHooks::new().pre_hook(), policy.into_pre_hook()]);
    let router = Arc::new(CallbackRouter::new(
        RouterConfig::new().with_shared_pre_hook(pre_hook),
    ));
    router
        .register(
            CallbackRegistration::new("default", "counter", "increment")
                .handler(|input| Ok(input.to_vec())),
        )
        .unwrap();
    let registry = ModuleRegistry::from_config(&wasmtime_config(), router).unwrap();
    registry
        .load_module(ModuleLoadSpec::new("counter", &path))
        .await
        .unwrap();

    let err = registry
        .invoke("counter", "increment", b"Hello World")
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        RuntimeError::GuestCall { ref message, .. }
            if message == "permission denied: default:counter:increment"
    ));
}
