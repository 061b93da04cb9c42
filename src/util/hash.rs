//! All hashing in the analyzer is xxhash64 with the default seed. Stack ids
//! and digests must be byte-for-byte reproducible across runs, so the byte
//! layouts below are fixed.

use std::fmt;
use std::hash::Hasher;

use twox_hash::XxHash64;

pub fn xxh64(bytes: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(bytes);
    hasher.finish()
}

/// Call-stack id chained from a parent stack id and a callee entry point
/// (16-byte layout, used by the call-stack leakage engine).
pub fn call_stack_id(parent_stack_id: u64, target_instruction_id: u64) -> u64 {
    let mut buf = [0u8; 16];
    buf[..8].copy_from_slice(&parent_stack_id.to_le_bytes());
    buf[8..].copy_from_slice(&target_instruction_id.to_le_bytes());
    xxh64(&buf)
}

/// Call-stack id chained from a parent stack id and both branch ends
/// (24-byte layout, used by the control-flow engine).
pub fn branch_stack_id(
    parent_stack_id: u64,
    source_instruction_id: u64,
    target_instruction_id: u64,
) -> u64 {
    let mut buf = [0u8; 24];
    buf[..8].copy_from_slice(&parent_stack_id.to_le_bytes());
    buf[8..16].copy_from_slice(&source_instruction_id.to_le_bytes());
    buf[16..].copy_from_slice(&target_instruction_id.to_le_bytes());
    xxh64(&buf)
}

/// 16-byte rolling digest of the memory-address sequence one instruction
/// produced during one testcase.
///
/// Each access writes the address id into bytes 8..16 and then folds the
/// whole 16 bytes through xxhash64 into bytes 0..8, so the digest is
/// order-sensitive.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct AccessDigest([u8; 16]);

impl AccessDigest {
    pub fn update(&mut self, address_id: u64) {
        self.0[8..].copy_from_slice(&address_id.to_le_bytes());
        let folded = xxh64(&self.0);
        self.0[..8].copy_from_slice(&folded.to_le_bytes());
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for AccessDigest {
    /// Digests print as the uppercase hex of their first 8 bytes.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for byte in &self.0[..8] {
            write!(f, "{:02X}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for AccessDigest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "AccessDigest({})", self)
    }
}
