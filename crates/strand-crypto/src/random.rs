//! Secure random values.

use rand_core::{OsRng, RngCore};

/// Random 32-bit value used as a per-frame nonce.
#[must_use]
pub fn nonce_u32() -> u32 {
    OsRng.next_u32()
}

/// Fill a buffer with random bytes from the operating system.
pub fn fill_bytes(buf: &mut [u8]) {
    OsRng.fill_bytes(buf);
}
