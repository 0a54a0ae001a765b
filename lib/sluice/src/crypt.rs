//! Carrier stream obfuscation.
//!
//! A byte-level XOR mixer, deliberately not a cryptographic primitive. Each
//! direction of a carrier connection owns one `Cipher` whose single mixing
//! byte absorbs the plaintext as it passes, so encoder and decoder stay in
//! lockstep as long as they start from equal state and observe the same
//! byte stream. State is reset on every (re)connect.

/// Initial mixing byte at (re)connect time.
pub const MIX_SEED: u8 = 0xd1;
/// Fixed key byte.
pub const KEY_SEED: u8 = 0x67;

/// Stateful obfuscator for one direction of a carrier connection.
#[derive(Debug, Clone)]
pub struct Cipher {
    mix: u8,
    key: u8,
}

impl Cipher {
    /// Creates a cipher in the state both peers assume after a (re)connect.
    #[inline]
    pub fn new() -> Cipher {
        Cipher {
            mix: MIX_SEED,
            key: KEY_SEED,
        }
    }

    /// Current mixing state. The encoder and decoder of a lossless stream
    /// end up with equal values.
    #[inline]
    pub fn mix(&self) -> u8 {
        self.mix
    }

    /// Encodes a single byte, absorbing the plaintext into the mixing state.
    #[inline]
    pub fn encode_byte(&mut self, plain: u8) -> u8 {
        let coded = plain ^ self.mix ^ self.key;
        self.mix ^= plain;
        coded
    }

    /// Decodes a single byte, absorbing the recovered plaintext.
    #[inline]
    pub fn decode_byte(&mut self, coded: u8) -> u8 {
        let plain = coded ^ self.mix ^ self.key;
        self.mix ^= plain;
        plain
    }

    /// Encodes a buffer in place.
    #[inline]
    pub fn encode(&mut self, buf: &mut [u8]) {
        for byte in buf.iter_mut() {
            *byte = self.encode_byte(*byte);
        }
    }

    /// Decodes a buffer in place.
    #[inline]
    pub fn decode(&mut self, buf: &mut [u8]) {
        for byte in buf.iter_mut() {
            *byte = self.decode_byte(*byte);
        }
    }
}
