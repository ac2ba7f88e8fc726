//! Deterministic 64-bit mixing for the connection handshake.
//!
//! The handshake is a weak challenge/response used to reject obviously-wrong
//! peers, not a security mechanism. The initiator sends `scramble(seed)`; the
//! responder must answer `scramble(scramble(seed))`. Because [`scramble`] is
//! asymmetric (`scramble(scramble(x)) != x` for almost all inputs), echoing
//! the challenge back verbatim fails validation.

/// Multiplier applied between mixing rounds (Knuth's MMIX LCG constant).
pub const SCRAMBLE_PRIME: u64 = 6364136223846793005;

/// Additive offset applied between mixing rounds. Doubles as a protocol
/// version marker: peers built with a different offset cannot validate.
pub const SCRAMBLE_OFFSET: u64 = 1000;

/// Mix 64 bits down to 32 with an xorshift-and-rotate step.
fn mix_bits(x: u64) -> u32 {
    let x = x ^ 0xA0B1_C2D3;
    let xor_shifted = (((x >> 18) ^ x) >> 27) as u32;
    let rot = (x >> 59) as u32;
    xor_shifted.rotate_right(rot) ^ 0x1234_5678
}

/// Scramble a 64-bit value: two rounds of [`mix_bits`] interleaved with a
/// multiply-add. Pure and deterministic; all arithmetic wraps.
pub fn scramble(input: u64) -> u64 {
    let round = u64::from(mix_bits(input))
        .wrapping_mul(SCRAMBLE_PRIME)
        .wrapping_add(SCRAMBLE_OFFSET);
    u64::from(mix_bits(round))
        .wrapping_mul(SCRAMBLE_PRIME)
        .wrapping_add(SCRAMBLE_OFFSET)
}

/// Nanosecond wall-clock reading used to seed handshake challenges.
pub(crate) fn clock_seed() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}
