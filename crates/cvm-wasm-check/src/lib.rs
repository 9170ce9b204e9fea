//! Static gate that rejects contract code able to behave differently across re-executions.
//!
//! Every scan works on raw bytes and ignores instruction boundaries: a byte that only looks
//! like a float opcode (inside a data segment, a name, a LEB immediate) still rejects the
//! module. Rejecting some deterministic code is acceptable, admitting nondeterministic code
//! is not.

use thiserror::Error;

const WASM_MAGIC: [u8; 4] = [0x00, 0x61, 0x73, 0x6d];
const HEADER_LEN: usize = 8;

const SIMD_PREFIX: u8 = 0xfd;
const V128_TYPE: u8 = 0x7b;
const ATOMIC_PREFIX: u8 = 0xfe;

const MEMORY_SECTION_ID: u8 = 5;
const LIMITS_HAS_MAX: u8 = 0x01;
const LIMITS_SHARED: u8 = 0x02;

/// Which scan flagged the module.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Deterministic,
    FloatingPoint,
    Simd,
    Threads,
}

impl Verdict {
    pub fn is_deterministic(self) -> bool {
        self == Verdict::Deterministic
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CheckError {
    #[error("invalid wasm binary: too short ({0} bytes)")]
    TooShort(usize),
    #[error("invalid wasm binary: wrong magic number")]
    BadMagic,
    #[error("invalid wasm binary: truncated at offset {0}")]
    Truncated(usize),
    #[error("invalid wasm binary: LEB128 overflow at offset {0}")]
    LebOverflow(usize),
}

/// Returns `true` when the module may contain float, SIMD or threading operations.
pub fn contains_nondeterministic_ops(wasm: &[u8]) -> Result<bool, CheckError> {
    Ok(!check(wasm)?.is_deterministic())
}

/// Runs the float, SIMD and threading scans in that order, stopping at the first hit.
pub fn check(wasm: &[u8]) -> Result<Verdict, CheckError> {
    let body = body(wasm)?;
    if body.iter().any(|b| is_float_opcode(*b)) {
        return Ok(Verdict::FloatingPoint);
    }
    if body.iter().any(|b| *b == SIMD_PREFIX || *b == V128_TYPE) {
        return Ok(Verdict::Simd);
    }
    if body.contains(&ATOMIC_PREFIX) || has_shared_memory(body)? {
        return Ok(Verdict::Threads);
    }
    Ok(Verdict::Deterministic)
}

fn body(wasm: &[u8]) -> Result<&[u8], CheckError> {
    if wasm.len() < HEADER_LEN {
        return Err(CheckError::TooShort(wasm.len()));
    }
    if wasm[..4] != WASM_MAGIC {
        return Err(CheckError::BadMagic);
    }
    Ok(&wasm[HEADER_LEN..])
}

fn is_float_opcode(byte: u8) -> bool {
    matches!(
        byte,
        // f32/f64 comparisons
        0x5b..=0x66
        // f32/f64 unary and binary arithmetic
        | 0x8b..=0xa6
        // i32.trunc_f32/f64
        | 0xa8..=0xab
        // i64.trunc_f32/f64, convert, demote, promote
        | 0xae..=0xbb
    )
}

/// Walks the section table looking for a shared memory in the memory section.
fn has_shared_memory(body: &[u8]) -> Result<bool, CheckError> {
    let mut reader = Reader::new(body, HEADER_LEN);
    while !reader.is_empty() {
        let section_id = reader.byte()?;
        let size = reader.leb128()?;
        if section_id != MEMORY_SECTION_ID {
            if !reader.skip(size) {
                break;
            }
            continue;
        }
        let count = reader.leb128()?;
        for _ in 0..count {
            let flags = reader.byte()?;
            if flags & LIMITS_SHARED != 0 {
                return Ok(true);
            }
            reader.leb128()?;
            if flags & LIMITS_HAS_MAX != 0 {
                reader.leb128()?;
            }
        }
        break;
    }
    Ok(false)
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
    // Offset of `bytes` inside the full module, for error reporting.
    base: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8], base: usize) -> Self {
        Self {
            bytes,
            pos: 0,
            base,
        }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn byte(&mut self) -> Result<u8, CheckError> {
        let byte = *self
            .bytes
            .get(self.pos)
            .ok_or(CheckError::Truncated(self.base + self.pos))?;
        self.pos += 1;
        Ok(byte)
    }

    /// Unsigned LEB128: 7 low bits per byte, little-endian groups, high bit continues.
    fn leb128(&mut self) -> Result<u64, CheckError> {
        let start = self.base + self.pos;
        let mut result = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = self.byte()?;
            if shift >= 64 {
                return Err(CheckError::LebOverflow(start));
            }
            result |= u64::from(byte & 0x7f) << shift;
            shift += 7;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
        }
    }

    /// Returns `false` when the declared size runs past the end of the stream.
    fn skip(&mut self, len: u64) -> bool {
        match usize::try_from(len)
            .ok()
            .and_then(|len| self.pos.checked_add(len))
        {
            Some(end) if end <= self.bytes.len() => {
                self.pos = end;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: [u8; 8] = [0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00];

    fn module(sections: &[u8]) -> Vec<u8> {
        let mut bytes = HEADER.to_vec();
        bytes.extend_from_slice(sections);
        bytes
    }

    #[test]
    fn module_without_flagged_bytes_is_deterministic() {
        // custom section named "x", then an unshared memory with a maximum
        let wasm = module(&[0x00, 0x02, 0x01, b'x', 0x05, 0x04, 0x01, 0x01, 0x01, 0x02]);
        assert_eq!(check(&wasm), Ok(Verdict::Deterministic));
        assert_eq!(contains_nondeterministic_ops(&wasm), Ok(false));
    }

    #[test]
    fn function_type_tag_trips_the_float_scan() {
        // 0x60 opens every function type and is also f32.ge.
        let wasm = wat::parse_str(
            r#"(module
  (func (export "add") (param i32 i32) (result i32)
    local.get 0
    local.get 1
    i32.add))"#,
        )
        .unwrap();
        assert_eq!(check(&wasm), Ok(Verdict::FloatingPoint));
    }

    #[test]
    fn empty_module_is_deterministic() {
        assert_eq!(contains_nondeterministic_ops(&HEADER), Ok(false));
    }

    #[test]
    fn float_arithmetic_is_rejected() {
        let wasm = wat::parse_str(
            r#"(module
  (func (export "sum") (param f32 f32) (result f32)
    local.get 0
    local.get 1
    f32.add))"#,
        )
        .unwrap();
        assert_eq!(check(&wasm), Ok(Verdict::FloatingPoint));
    }

    #[test]
    fn float_opcode_byte_in_custom_section_is_rejected() {
        // custom section (id 0), size 3, name len 1 "x", payload 0x92
        let wasm = module(&[0x00, 0x03, 0x01, b'x', 0x92]);
        assert_eq!(contains_nondeterministic_ops(&wasm), Ok(true));
        assert_eq!(check(&wasm), Ok(Verdict::FloatingPoint));
    }

    #[test]
    fn simd_prefix_and_v128_are_rejected() {
        assert_eq!(check(&module(&[0x00, 0x02, 0x01, SIMD_PREFIX])), Ok(Verdict::Simd));
        assert_eq!(check(&module(&[0x00, 0x02, 0x01, V128_TYPE])), Ok(Verdict::Simd));
    }

    #[test]
    fn atomic_prefix_is_rejected() {
        assert_eq!(
            check(&module(&[0x00, 0x02, 0x01, ATOMIC_PREFIX])),
            Ok(Verdict::Threads)
        );
    }

    #[test]
    fn shared_memory_flag_is_rejected() {
        // memory section: 1 entry, flags shared|max, min 1, max 2
        let wasm = module(&[0x05, 0x04, 0x01, 0x03, 0x01, 0x02]);
        assert_eq!(check(&wasm), Ok(Verdict::Threads));
    }

    #[test]
    fn sections_before_memory_are_skipped_by_size() {
        // custom section whose payload holds a flags-like 0x03 byte, then an unshared memory
        let wasm = module(&[
            0x00, 0x03, 0x01, b'x', 0x03, // custom
            0x05, 0x03, 0x01, 0x00, 0x01, // memory, min only
        ]);
        assert_eq!(check(&wasm), Ok(Verdict::Deterministic));
    }

    #[test]
    fn malformed_headers_are_errors() {
        assert_eq!(check(&[0x00, 0x61, 0x73]), Err(CheckError::TooShort(3)));
        assert_eq!(
            check(&[0x01, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00]),
            Err(CheckError::BadMagic)
        );
    }

    #[test]
    fn truncated_memory_entry_is_an_error() {
        let wasm = module(&[0x05, 0x03, 0x01]);
        assert_eq!(check(&wasm), Err(CheckError::Truncated(11)));
    }

    #[test]
    fn multi_byte_leb_sizes_are_decoded() {
        let mut sections = vec![0x00, 0x81, 0x01, 0x00];
        sections.extend(std::iter::repeat_n(0x00, 128));
        sections.extend_from_slice(&[0x05, 0x03, 0x01, 0x02, 0x01]);
        assert_eq!(check(&module(&sections)), Ok(Verdict::Threads));
    }
}
