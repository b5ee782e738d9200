//! WAT guest modules shared by the integration tests.
//!
//! Every guest uses a bump allocator and the guest-allocates call ABI:
//! `(in_ptr, in_len, out_ptr_ptr, out_len_ptr) -> status`.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use svchost::{LogMessage, LogSink};

/// Heap starts above the constant data area.
const HEAP_START: u32 = 8192;

const PRELUDE: &str = r#"
    (memory (export "memory") 2)
    (global $heap (mut i32) (i32.const 8192))
    (func $allocate (export "allocate") (param $size i32) (result i32)
        (local $ptr i32)
        (local.set $ptr (global.get $heap))
        (global.set $heap (i32.add (global.get $heap) (local.get $size)))
        (local.get $ptr))
    (func (export "deallocate") (param i32 i32))
    (func $reply (param $out_ptr i32) (param $out_len i32) (param $ptr i32) (param $len i32) (result i32)
        (i32.store (local.get $out_ptr) (local.get $ptr))
        (i32.store (local.get $out_len) (local.get $len))
        (i32.const 0))
"#;

/// Escape bytes for a WAT string literal.
fn wat_string(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() + 2);
    out.push('"');
    for &b in bytes {
        if (b.is_ascii_graphic() && b != b'"' && b != b'\\') || b == b' ' {
            out.push(b as char);
        } else {
            out.push_str(&format!("\\{b:02x}"));
        }
    }
    out.push('"');
    out
}

/// Builder for a guest module.
#[derive(Default)]
pub struct Guest {
    imports: Vec<String>,
    functions: Vec<serde_json::Value>,
    data: Vec<String>,
    body: Vec<String>,
    next_data: u32,
}

impl Guest {
    pub fn new() -> Self {
        Self {
            next_data: 64,
            ..Self::default()
        }
    }

    /// Place `bytes` in the data area, returning `(offset, len)`.
    fn place(&mut self, bytes: &[u8]) -> (u32, u32) {
        let offset = self.next_data;
        let len = bytes.len() as u32;
        self.data
            .push(format!("(data (i32.const {offset}) {})", wat_string(bytes)));
        self.next_data = (offset + len + 8) & !7;
        assert!(self.next_data < HEAP_START, "constant data overflows into the heap");
        (offset, len)
    }

    /// Add an import line, e.g. `(import "host" "x" (func $x))`.
    pub fn import(mut self, wat: &str) -> Self {
        self.imports.push(wat.to_string());
        self
    }

    /// Declare a function in the interface metadata.
    pub fn declare(mut self, name: &str, params: &[&str]) -> Self {
        self.functions
            .push(serde_json::json!({ "name": name, "params": params }));
        self
    }

    /// Add raw WAT module fields.
    pub fn raw(mut self, wat: &str) -> Self {
        self.body.push(wat.to_string());
        self
    }

    /// A function returning `output` verbatim with status 0.
    pub fn constant(mut self, name: &str, params: &[&str], output: &str) -> Self {
        let (offset, len) = self.place(output.as_bytes());
        self.declare(name, params).raw(&format!(
            r#"(func (export "{name}") (param i32 i32 i32 i32) (result i32)
                (call $reply (local.get 2) (local.get 3) (i32.const {offset}) (i32.const {len})))"#
        ))
    }

    /// A function reporting `message` with a non-zero status.
    pub fn failing(mut self, name: &str, params: &[&str], message: &str) -> Self {
        let (offset, len) = self.place(message.as_bytes());
        self.declare(name, params).raw(&format!(
            r#"(func (export "{name}") (param i32 i32 i32 i32) (result i32)
                (drop (call $reply (local.get 2) (local.get 3) (i32.const {offset}) (i32.const {len})))
                (i32.const 1))"#
        ))
    }

    /// A function that traps.
    pub fn trapping(self, name: &str, params: &[&str]) -> Self {
        self.declare(name, params).raw(&format!(
            r#"(func (export "{name}") (param i32 i32 i32 i32) (result i32)
                unreachable)"#
        ))
    }

    /// `name(x)` returning the JSON string `"<prefix><x>"`. The input must be
    /// a one-element array holding a plain string.
    pub fn greeter(mut self, name: &str, prefix: &str) -> Self {
        let (offset, len) = self.place(format!("\"{prefix}").as_bytes());
        self.declare(name, &["name"]).raw(&format!(
            r#"(func (export "{name}") (param $in i32) (param $len i32) (param $out_ptr i32) (param $out_len i32) (result i32)
                (local $name_len i32) (local $total i32) (local $buf i32)
                (local.set $name_len (i32.sub (local.get $len) (i32.const 4)))
                (local.set $total (i32.add (local.get $name_len) (i32.const {total_extra})))
                (local.set $buf (call $allocate (local.get $total)))
                (memory.copy (local.get $buf) (i32.const {offset}) (i32.const {len}))
                (memory.copy
                    (i32.add (local.get $buf) (i32.const {len}))
                    (i32.add (local.get $in) (i32.const 2))
                    (local.get $name_len))
                (i32.store8
                    (i32.add (local.get $buf) (i32.sub (local.get $total) (i32.const 1)))
                    (i32.const 34))
                (call $reply (local.get $out_ptr) (local.get $out_len) (local.get $buf) (local.get $total)))"#,
            total_extra = len + 1,
        ))
    }

    /// A void function emitting one guest log record.
    pub fn logging(self, name: &str, level: i32, target: &str, message: &str) -> Self {
        self.logging_bytes(name, level, target.as_bytes(), message.as_bytes())
    }

    /// Like [`Guest::logging`], with arbitrary message bytes.
    pub fn logging_bytes(mut self, name: &str, level: i32, target: &[u8], message: &[u8]) -> Self {
        let (t_off, t_len) = self.place(target);
        let (m_off, m_len) = self.place(message);
        self.declare(name, &[]).raw(&format!(
            r#"(func (export "{name}") (param i32 i32 i32 i32) (result i32)
                (call $log (i32.const {level}) (i32.const {t_off}) (i32.const {t_len}) (i32.const {m_off}) (i32.const {m_len}))
                (call $reply (local.get 2) (local.get 3) (i32.const 0) (i32.const 0)))"#
        ))
    }

    pub fn wat(&self) -> String {
        let interface = serde_json::json!({ "functions": self.functions }).to_string();
        format!(
            "(module\n{}\n(@custom \"interface-types\" {})\n{}\n{}\n{}\n)",
            self.imports.join("\n"),
            wat_string(interface.as_bytes()),
            PRELUDE,
            self.data.join("\n"),
            self.body.join("\n"),
        )
    }

    pub fn wasm(&self) -> Vec<u8> {
        wat::parse_str(self.wat()).expect("parse guest WAT")
    }
}

pub const LOG_IMPORT: &str =
    r#"(import "host" "log_utf8_string" (func $log (param i32 i32 i32 i32 i32)))"#;

/// A control module with nothing in it.
pub fn empty_control() -> Vec<u8> {
    wat::parse_str("(module)").expect("parse control WAT")
}

/// A control module exporting `answer() -> 42`.
pub fn answering_control() -> Vec<u8> {
    wat::parse_str(r#"(module (func (export "answer") (result i32) (i32.const 42)))"#)
        .expect("parse control WAT")
}

/// `greeting(name) -> "Hi, <name>"`.
pub fn greeting() -> Vec<u8> {
    Guest::new().greeter("greeting", "Hi, ").wasm()
}

/// `greeting_record() -> {str, num}` and `void_fn() -> null`.
pub fn greeting_record() -> Vec<u8> {
    Guest::new()
        .constant(
            "greeting_record",
            &[],
            r#"{"str":"Hello, world!","num":42}"#,
        )
        .constant("void_fn", &[], "")
        .greeter("greeting", "Hi, ")
        .failing("fail_gracefully", &[], "something went wrong")
        .trapping("trap", &[])
        .wasm()
}

/// `greeting(name) -> "Donkey: hi, <name>"` plus a function the facade
/// does not re-export.
pub fn donkey() -> Vec<u8> {
    Guest::new()
        .greeter("greeting", "Donkey: hi, ")
        .constant("donkey_only", &[], r#""hee-haw""#)
        .wasm()
}

/// `greeting(name) -> ["Shrek: hi, <name>", donkey.greeting(name)]`.
pub fn shrek() -> Vec<u8> {
    let prefix = "\"Shrek: hi, ";
    let mut guest = Guest::new().import(
        r#"(import "donkey" "greeting" (func $donkey (param i32 i32 i32 i32) (result i32)))"#,
    );
    let (offset, len) = guest.place(prefix.as_bytes());
    guest
        .declare("greeting", &["name"])
        .raw(&format!(
            r#"(func (export "greeting") (param $in i32) (param $len i32) (param $out_ptr i32) (param $out_len i32) (result i32)
                (local $slots i32) (local $status i32) (local $d_ptr i32) (local $d_len i32)
                (local $name_len i32) (local $total i32) (local $buf i32) (local $pos i32)
                (local.set $slots (call $allocate (i32.const 8)))
                (local.set $status
                    (call $donkey (local.get $in) (local.get $len) (local.get $slots) (i32.add (local.get $slots) (i32.const 4))))
                (if (local.get $status) (then unreachable))
                (local.set $d_ptr (i32.load (local.get $slots)))
                (local.set $d_len (i32.load (i32.add (local.get $slots) (i32.const 4))))
                (local.set $name_len (i32.sub (local.get $len) (i32.const 4)))
                (local.set $total
                    (i32.add (i32.add (local.get $name_len) (local.get $d_len)) (i32.const {total_extra})))
                (local.set $buf (call $allocate (local.get $total)))
                (i32.store8 (local.get $buf) (i32.const 91))
                (local.set $pos (i32.add (local.get $buf) (i32.const 1)))
                (memory.copy (local.get $pos) (i32.const {offset}) (i32.const {len}))
                (local.set $pos (i32.add (local.get $pos) (i32.const {len})))
                (memory.copy (local.get $pos) (i32.add (local.get $in) (i32.const 2)) (local.get $name_len))
                (local.set $pos (i32.add (local.get $pos) (local.get $name_len)))
                (i32.store8 (local.get $pos) (i32.const 34))
                (i32.store8 (i32.add (local.get $pos) (i32.const 1)) (i32.const 44))
                (local.set $pos (i32.add (local.get $pos) (i32.const 2)))
                (memory.copy (local.get $pos) (local.get $d_ptr) (local.get $d_len))
                (local.set $pos (i32.add (local.get $pos) (local.get $d_len)))
                (i32.store8 (local.get $pos) (i32.const 93))
                (call $reply (local.get $out_ptr) (local.get $out_len) (local.get $buf) (local.get $total)))"#,
            total_extra = len + 4,
        ))
        .wasm()
}

/// One void function per guest level: `log_error` (1) through `log_trace` (5).
pub fn logger() -> Vec<u8> {
    Guest::new()
        .import(LOG_IMPORT)
        .logging("log_error", 1, "logger", "error message")
        .logging("log_warn", 2, "logger", "warn message")
        .logging("log_info", 3, "logger", "info message")
        .logging("log_debug", 4, "logger", "debug message")
        .logging("log_trace", 5, "logger", "trace message")
        .wasm()
}

/// `call_parameters()` returns the JSON the host exposes for the current call.
pub fn params_echo() -> Vec<u8> {
    Guest::new()
        .import(
            r#"(import "host" "get_call_parameters" (func $get_params (param i32 i32) (result i32)))"#,
        )
        .declare("call_parameters", &[])
        .raw(
            r#"(func (export "call_parameters") (param i32 i32) (param $out_ptr i32) (param $out_len i32) (result i32)
                (call $get_params (local.get $out_ptr) (local.get $out_len)))"#,
        )
        .wasm()
}

/// Log sink collecting every record.
pub fn collecting_sink() -> (LogSink, Arc<Mutex<Vec<LogMessage>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink_seen = seen.clone();
    let sink: LogSink = Arc::new(move |msg| sink_seen.lock().unwrap().push(msg));
    (sink, seen)
}
