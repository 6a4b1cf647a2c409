#![cfg(feature = "wasmtime")]

use std::sync::Arc;

use nova_bridge::script::{Console, ConsoleLevel, HostGlobals};
use nova_bridge::{
    bridge_error, Bridge, BridgeConfig, BridgeInstance, BridgeModule, CallbackError, HostObject,
    HostValue, NativeProvider, ScriptProvider, TestMetricsSink,
};
use nova_bridge_abi::{imports, ArgsEncoder};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;

/// Bump allocator with an `(ptr, len)` table at 4096 and a heap from 8192.
const ALLOCATOR: &str = r#"
  (memory (export "memory") 1)
  (global $next_id (mut i32) (i32.const 0))
  (global $heap (mut i32) (i32.const 8192))
  (func $slot (param $id i32) (result i32)
    (i32.add (i32.const 4096) (i32.mul (local.get $id) (i32.const 8))))
  (func (export "create_allocation") (param $len i32) (result i32)
    (local $id i32)
    (local.set $id (global.get $next_id))
    (i32.store (call $slot (local.get $id)) (global.get $heap))
    (i32.store offset=4 (call $slot (local.get $id)) (local.get $len))
    (global.set $heap (i32.add (global.get $heap) (local.get $len)))
    (global.set $next_id (i32.add (local.get $id) (i32.const 1)))
    (local.get $id))
  (func (export "allocation_pointer") (param $id i32) (result i32)
    (i32.load (call $slot (local.get $id))))
"#;

const IMPORTS: &str = r#"
  (import "env" "__register_function" (func $register (param i32 i32) (result i32)))
  (import "env" "__invoke_function" (func $invoke (param i32 i32 i32) (result i32)))
  (import "env" "__invoke_function_and_return_object" (func $invoke_object (param i32 i32 i32) (result i64)))
  (import "env" "__invoke_function_and_return_string" (func $invoke_string (param i32 i32 i32) (result i32)))
  (import "env" "__release_handle" (func $release (param i32)))
  (import "env" "__invoke" (func $invoke_unified (param i32 i32 i32 i32 i32) (result i64)))
"#;

/// `(data ...)` segment placing `bytes` at `offset`.
fn segment(offset: u32, bytes: &[u8]) -> String {
    let escaped: String = bytes.iter().map(|b| format!("\\{b:02x}")).collect();
    format!("(data (i32.const {offset}) \"{escaped}\")")
}

fn guest(imports: &str, body: &str) -> String {
    format!("(module {imports} {ALLOCATOR} {body})")
}

fn run(wat: &str, bridge: Bridge) -> BridgeInstance {
    let module = BridgeModule::from_wat(wat).unwrap();
    let mut instance = module.instantiate_with(bridge).unwrap();
    instance.run_main().unwrap();
    instance
}

fn read_u32(memory: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(memory[at..at + 4].try_into().unwrap())
}

fn read_i64(memory: &[u8], at: usize) -> i64 {
    i64::from_le_bytes(memory[at..at + 8].try_into().unwrap())
}

/// Bytes of guest allocation `id`, found through the allocator's table.
fn allocation(memory: &[u8], id: u32) -> Vec<u8> {
    let slot = 4096 + id as usize * 8;
    let ptr = read_u32(memory, slot) as usize;
    let len = read_u32(memory, slot + 4) as usize;
    memory[ptr..ptr + len].to_vec()
}

#[test]
fn registered_callback_sums_numbers() {
    let source = "(a, b) => a + b";
    let mut args = ArgsEncoder::new();
    args.f64(2.0).f64(3.0);

    let wat = guest(
        IMPORTS,
        &format!(
            r#"
            {src}
            {args}
            (func (export "main")
              (i32.store (i32.const 1024)
                (call $invoke
                  (call $register (i32.const 0) (i32.const {src_len}))
                  (i32.const 64) (i32.const {args_len}))))
            "#,
            src = segment(0, source.as_bytes()),
            src_len = source.len(),
            args = segment(64, args.as_bytes()),
            args_len = args.as_bytes().len(),
        ),
    );

    let mut instance = run(&wat, Bridge::default());
    let memory = instance.memory().unwrap();
    assert_eq!(read_u32(memory, 1024), 5);
    assert_eq!(instance.bridge().registry().len(), 1);
}

#[test]
fn string_arguments_and_text_results_cross_guest_memory() {
    let source = "(s) => s.toUpperCase() + '!'";
    let mut args = ArgsEncoder::new();
    args.string_at(256, 4);

    let wat = guest(
        IMPORTS,
        &format!(
            r#"
            {src}
            {text}
            {args}
            (func (export "main")
              (i32.store (i32.const 1024)
                (call $invoke_string
                  (call $register (i32.const 0) (i32.const {src_len}))
                  (i32.const 512) (i32.const {args_len}))))
            "#,
            src = segment(0, source.as_bytes()),
            src_len = source.len(),
            text = segment(256, b"nova"),
            args = segment(512, args.as_bytes()),
            args_len = args.as_bytes().len(),
        ),
    );

    let mut instance = run(&wat, Bridge::default());
    let memory = instance.memory().unwrap();
    let id = read_u32(memory, 1024);
    assert_eq!(allocation(memory, id), b"NOVA!".to_vec());
}

#[test]
fn object_handles_are_passed_back_and_released() {
    let mut provider = NativeProvider::new();
    provider
        .insert_fn("make", |_| {
            Ok(HostValue::Object(HostObject::new(String::from("widget"))))
        })
        .insert_fn("describe", |args: &[HostValue]| match args.first() {
            Some(HostValue::Object(obj)) => obj
                .downcast_ref::<String>()
                .map(|name| HostValue::from(name.as_str()))
                .ok_or_else(|| CallbackError::type_error("not a widget")),
            _ => Err(CallbackError::type_error("expected an object")),
        });
    let bridge = Bridge::with_provider(Arc::new(provider), BridgeConfig::default());

    let wat = guest(
        IMPORTS,
        &format!(
            r#"
            {make}
            {describe}
            (func (export "main")
              (local $handle i64)
              (local $describe i32)
              (local.set $handle
                (call $invoke_object
                  (call $register (i32.const 0) (i32.const 4))
                  (i32.const 0) (i32.const 0)))
              (local.set $describe (call $register (i32.const 8) (i32.const 8)))
              (i64.store (i32.const 1024) (local.get $handle))
              (i32.store8 (i32.const 256) (i32.const 5))
              (i32.store (i32.const 257) (i32.wrap_i64 (local.get $handle)))
              (i32.store (i32.const 1040)
                (call $invoke_string (local.get $describe) (i32.const 256) (i32.const 5)))
              (call $release (i32.wrap_i64 (local.get $handle))))
            "#,
            make = segment(0, b"make"),
            describe = segment(8, b"describe"),
        ),
    );

    let mut instance = run(&wat, bridge);
    assert!(instance.bridge().handles().is_empty());
    let memory = instance.memory().unwrap();
    assert_ne!(read_i64(memory, 1024), 0);
    let id = read_u32(memory, 1040);
    assert_eq!(allocation(memory, id), b"widget".to_vec());
}

#[test]
fn unified_import_returns_float_bits_for_inline_source() {
    let source = "(x) => x / 4";
    let mut args = ArgsEncoder::new();
    args.f64(3.0);

    let wat = guest(
        IMPORTS,
        &format!(
            r#"
            {src}
            {args}
            (func (export "main")
              (i64.store (i32.const 1024)
                (call $invoke_unified
                  (i32.const 0) (i32.const {src_len})
                  (i32.const 64) (i32.const {args_len})
                  (i32.const 4))))
            "#,
            src = segment(0, source.as_bytes()),
            src_len = source.len(),
            args = segment(64, args.as_bytes()),
            args_len = args.as_bytes().len(),
        ),
    );

    let mut instance = run(&wat, Bridge::default());
    assert!(instance.bridge().registry().is_empty());
    let memory = instance.memory().unwrap();
    assert_eq!(f64::from_bits(read_i64(memory, 1024) as u64), 0.75);
}

#[test]
fn bridge_failures_trap_with_a_recoverable_error() {
    let metrics = Arc::new(TestMetricsSink::default());
    let bridge = Bridge::default().with_metrics(metrics.clone());
    let wat = guest(
        IMPORTS,
        r#"
        (func (export "main")
          (drop (call $invoke (i32.const 7) (i32.const 0) (i32.const 0))))
        "#,
    );

    let module = BridgeModule::from_wat(&wat).unwrap();
    let mut instance = module.instantiate_with(bridge).unwrap();
    let err = instance.run_main().unwrap_err();
    let bridge_err = bridge_error(&err).expect("trap carries the bridge error");
    assert_eq!(bridge_err.kind(), "unknown_callback_id");

    let snapshot = metrics.snapshot_for(imports::INVOKE_FUNCTION);
    assert_eq!(snapshot.invocation_count, 1);
    assert_eq!(snapshot.error_kinds, vec!["unknown_callback_id"]);
}

#[test]
fn unknown_return_kind_traps() {
    let wat = guest(
        IMPORTS,
        r#"
        (func (export "main")
          (drop (call $invoke_unified
            (i32.const 0) (i32.const 0) (i32.const 0) (i32.const 0) (i32.const 42))))
        "#,
    );

    let module = BridgeModule::from_wat(&wat).unwrap();
    let mut instance = module.instantiate(BridgeConfig::default()).unwrap();
    let err = instance.run_main().unwrap_err();
    assert_eq!(bridge_error(&err).map(|e| e.kind()), Some("unknown_return_kind"));
}

#[test]
fn text_results_need_the_guest_allocator() {
    let source = "() => 'hi'";
    let wat = format!(
        r#"(module
          (import "env" "__register_function" (func $register (param i32 i32) (result i32)))
          (import "env" "__invoke_function_and_return_string" (func $invoke_string (param i32 i32 i32) (result i32)))
          (memory (export "memory") 1)
          {src}
          (func (export "main")
            (drop (call $invoke_string
              (call $register (i32.const 0) (i32.const {src_len}))
              (i32.const 0) (i32.const 0)))))"#,
        src = segment(0, source.as_bytes()),
        src_len = source.len(),
    );

    let module = BridgeModule::from_wat(&wat).unwrap();
    let mut instance = module.instantiate(BridgeConfig::default()).unwrap();
    let err = instance.run_main().unwrap_err();
    assert_eq!(bridge_error(&err).map(|e| e.kind()), Some("missing_export"));
}

#[test]
fn legacy_pointer_export_name_is_accepted() {
    let source = "() => 'ok'";
    let wat = format!(
        r#"(module
          (import "env" "__invoke_and_return_string" (func $legacy (param i32 i32 i32 i32) (result i32)))
          (memory (export "memory") 1)
          (func (export "create_allocation") (param i32) (result i32) (i32.const 0))
          (func (export "get_allocation") (param i32) (result i32) (i32.const 2048))
          {src}
          (func (export "main")
            (i32.store (i32.const 1024)
              (call $legacy (i32.const 0) (i32.const {src_len}) (i32.const 0) (i32.const 0)))))"#,
        src = segment(0, source.as_bytes()),
        src_len = source.len(),
    );

    let mut instance = run(&wat, Bridge::default());
    let memory = instance.memory().unwrap();
    assert_eq!(read_u32(memory, 1024), 0);
    assert_eq!(&memory[2048..2050], b"ok");
}

#[test]
fn legacy_imports_are_not_linked_when_disabled() {
    let wat = r#"(module
      (import "env" "__invoke_and_return" (func $legacy (param i32 i32 i32 i32) (result i32)))
      (memory (export "memory") 1)
      (func (export "main")))"#;

    let mut config = BridgeConfig::default();
    config.protocol.legacy_inline_calls = false;

    let module = BridgeModule::from_wat(wat).unwrap();
    let err = module
        .instantiate(config)
        .err()
        .expect("instantiation must fail without the legacy import");
    assert!(format!("{err:#}").contains("__invoke_and_return"), "{err:#}");

    assert!(module.instantiate(BridgeConfig::default()).is_ok());
}

#[derive(Default)]
struct CaptureConsole {
    lines: Mutex<Vec<(ConsoleLevel, String)>>,
}

impl Console for CaptureConsole {
    fn write(&self, level: ConsoleLevel, message: &str) {
        self.lines.lock().push((level, message.to_owned()));
    }
}

#[test]
fn console_output_goes_to_the_configured_console() {
    let console = Arc::new(CaptureConsole::default());
    let provider = ScriptProvider::new(HostGlobals::standard().with_console(console.clone()));
    let bridge = Bridge::with_provider(Arc::new(provider), BridgeConfig::default());

    let source = "function (n) { console.warn('count', n + 1); }";
    let mut args = ArgsEncoder::new();
    args.f64(41.0);

    let wat = guest(
        IMPORTS,
        &format!(
            r#"
            {src}
            {args}
            (func (export "main")
              (drop (call $invoke
                (call $register (i32.const 0) (i32.const {src_len}))
                (i32.const 256) (i32.const {args_len}))))
            "#,
            src = segment(0, source.as_bytes()),
            src_len = source.len(),
            args = segment(256, args.as_bytes()),
            args_len = args.as_bytes().len(),
        ),
    );

    run(&wat, bridge);
    assert_eq!(
        console.lines.lock().clone(),
        vec![(ConsoleLevel::Warn, "count 42".to_owned())]
    );
}
