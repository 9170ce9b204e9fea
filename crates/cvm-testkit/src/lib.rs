//! WAT fixtures for exercising the contract runtime with small, hand-assembled guests.
//!
//! Guests follow the AssemblyScript layout the host expects: every buffer is preceded by a
//! 4-byte little-endian length, strings use two bytes per character, and `__new(size, align)`
//! is a bump allocator that writes that header.

use std::fmt::Write;

/// Offset of the first static buffer. Address 0 stays free so it can mean "null".
const DATA_BASE: u32 = 16;

/// Packs ASCII text two bytes per character, the way guests hand strings to the host.
pub fn legacy_string(text: &str) -> Vec<u8> {
    text.bytes().flat_map(|b| [b, 0]).collect()
}

/// Builds a contract module exporting `memory`, `__new` and one function per method.
#[derive(Debug, Default)]
pub struct ContractBuilder {
    data: Vec<u8>,
    methods: Vec<String>,
}

impl ContractBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Places a length-prefixed buffer in the data segment and returns its pointer.
    pub fn buffer(&mut self, bytes: &[u8]) -> u32 {
        while self.data.len() % 4 != 0 {
            self.data.push(0);
        }
        self.data
            .extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        let ptr = DATA_BASE + self.data.len() as u32;
        self.data.extend_from_slice(bytes);
        ptr
    }

    pub fn string(&mut self, text: &str) -> u32 {
        self.buffer(&legacy_string(text))
    }

    /// Adds an export `(state, sender, args) -> ()`. The body can name the params
    /// `$state`, `$sender`, `$args`, call `$alloc` and every host import.
    pub fn method(&mut self, name: &str, body: &str) -> &mut Self {
        self.methods.push(format!(
            "  (func (export \"{name}\") (param $state i32) (param $sender i32) (param $args i32)\n{body})"
        ));
        self
    }

    pub fn wat(&self) -> String {
        let heap = (DATA_BASE + self.data.len() as u32 + 3) & !3;
        let mut data = String::with_capacity(self.data.len() * 3);
        for byte in &self.data {
            let _ = write!(&mut data, "\\{byte:02x}");
        }
        format!(
            r#"(module
  (import "runtime" "db.save" (func $db_save (param i32 i32)))
  (import "runtime" "db.load" (func $db_load (param i32) (result i32)))
  (import "runtime" "contract.call" (func $contract_call (param i32 i32 i32)))
  (import "runtime" "contract.create" (func $contract_create (param i64 i32) (result i32)))
  (import "runtime" "event.emit" (func $event_emit (param i32 i32)))
  (import "env" "abort" (func $abort (param i32 i32 i32 i32)))
  (memory (export "memory") 4)
  (global $heap (mut i32) (i32.const {heap}))
  (data (i32.const {DATA_BASE}) "{data}")
  (func $alloc (export "__new") (param $size i32) (param $align i32) (result i32)
    (local $ptr i32)
    (i32.store (global.get $heap) (local.get $size))
    (local.set $ptr (i32.add (global.get $heap) (i32.const 4)))
    (global.set $heap
      (i32.and
        (i32.add (i32.add (local.get $ptr) (local.get $size)) (i32.const 3))
        (i32.const -4)))
    (local.get $ptr))
{methods}
)"#,
            methods = self.methods.join("\n"),
        )
    }

    pub fn build(&self) -> Vec<u8> {
        wat::parse_str(self.wat()).expect("assemble guest contract")
    }
}

/// Entity key the counter methods read and write.
pub const COUNTER_KEY: &str = "count";
/// Entity key `init` stores the sender under.
pub const OWNER_KEY: &str = "owner";
/// Entity keys `relay` reads the next hops from (legacy-packed contract ids).
pub const NEXT_KEY: &str = "next";
pub const ALSO_KEY: &str = "also";
/// Entity key `probe` inspects.
pub const PROBE_KEY: &str = "probe";
/// Entity key `saveThenRelay` writes its args under.
pub const SAVED_KEY: &str = "saved";

/// The general-purpose test contract.
///
/// Methods:
/// - `init`: saves the sender under `owner`
/// - `addOne`: increments an i32 counter under `count`
/// - `crash`: calls `abort("crash", "index.ts", 12, 5)`
/// - `infiniteLoop`: spins until fuel runs out
/// - `saveThenLoop`: writes `count` then spins
/// - `callback`: `contract.call("target", "method", "args")`
/// - `createContract`: `contract.create(le64 code id from args, args)`, saves the id under `child`
/// - `emitEvent`: `event.emit("event", "data")`
/// - `relay`: emits `visited`, then calls `relay` on the ids stored under `next` and `also`
/// - `probe`: emits `probe` with `absent`, `empty` or `present`
/// - `saveThenRelay`: saves args under `saved`, then calls `saveThenRelay` on the id under `next`
pub fn test_contract() -> Vec<u8> {
    test_contract_builder().build()
}

pub fn test_contract_builder() -> ContractBuilder {
    let mut b = ContractBuilder::new();
    let owner = b.string(OWNER_KEY);
    let count = b.string(COUNTER_KEY);
    let crash_msg = b.string("crash");
    let crash_file = b.string("index.ts");
    let target = b.string("target");
    let method = b.string("method");
    let args = b.buffer(b"args");
    let child = b.string("child");
    let event = b.string("event");
    let data = b.string("data");
    let visited = b.string("visited");
    let relay = b.string("relay");
    let next = b.string(NEXT_KEY);
    let also = b.string(ALSO_KEY);
    let probe = b.string(PROBE_KEY);
    let absent = b.string("absent");
    let empty = b.string("empty");
    let present = b.string("present");
    let saved = b.string(SAVED_KEY);
    let save_then_relay = b.string("saveThenRelay");

    b.method("init", &format!("    (call $db_save (i32.const {owner}) (local.get $sender))\n"));
    b.method(
        "addOne",
        &format!(
            r#"    (local $ptr i32)
    (local $next i32)
    (local.set $ptr (call $db_load (i32.const {count})))
    (if (i32.eqz (local.get $ptr))
      (then (local.set $next (i32.const 1)))
      (else (local.set $next (i32.add (i32.load (local.get $ptr)) (i32.const 1)))))
    (local.set $ptr (call $alloc (i32.const 4) (i32.const 1)))
    (i32.store (local.get $ptr) (local.get $next))
    (call $db_save (i32.const {count}) (local.get $ptr))
"#
        ),
    );
    b.method(
        "crash",
        &format!(
            "    (call $abort (i32.const {crash_msg}) (i32.const {crash_file}) (i32.const 12) (i32.const 5))\n    unreachable\n"
        ),
    );
    b.method("infiniteLoop", "    (loop $spin (br $spin))\n");
    b.method(
        "saveThenLoop",
        &format!(
            "    (call $db_save (i32.const {count}) (local.get $args))\n    (loop $spin (br $spin))\n"
        ),
    );
    b.method(
        "callback",
        &format!(
            "    (call $contract_call (i32.const {target}) (i32.const {method}) (i32.const {args}))\n"
        ),
    );
    b.method(
        "createContract",
        &format!(
            "    (call $db_save (i32.const {child})\n      (call $contract_create (i64.load (local.get $args)) (local.get $args)))\n"
        ),
    );
    b.method(
        "emitEvent",
        &format!("    (call $event_emit (i32.const {event}) (i32.const {data}))\n"),
    );
    b.method(
        "relay",
        &format!(
            r#"    (local $hop i32)
    (call $event_emit (i32.const {visited}) (i32.const {relay}))
    (local.set $hop (call $db_load (i32.const {next})))
    (if (local.get $hop)
      (then (call $contract_call (local.get $hop) (i32.const {relay}) (local.get $args))))
    (local.set $hop (call $db_load (i32.const {also})))
    (if (local.get $hop)
      (then (call $contract_call (local.get $hop) (i32.const {relay}) (local.get $args))))
"#
        ),
    );
    b.method(
        "probe",
        &format!(
            r#"    (local $ptr i32)
    (local.set $ptr (call $db_load (i32.const {probe})))
    (if (i32.eqz (local.get $ptr))
      (then (call $event_emit (i32.const {probe}) (i32.const {absent})))
      (else
        (if (i32.eqz (i32.load (i32.sub (local.get $ptr) (i32.const 4))))
          (then (call $event_emit (i32.const {probe}) (i32.const {empty})))
          (else (call $event_emit (i32.const {probe}) (i32.const {present}))))))
"#
        ),
    );
    b.method(
        "saveThenRelay",
        &format!(
            r#"    (local $hop i32)
    (call $db_save (i32.const {saved}) (local.get $args))
    (local.set $hop (call $db_load (i32.const {next})))
    (if (local.get $hop)
      (then (call $contract_call (local.get $hop) (i32.const {save_then_relay}) (local.get $args))))
"#
        ),
    );
    b
}
