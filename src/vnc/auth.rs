//! VNC Authentication (RFB security type 2).
//!
//! The server sends a random 16-byte challenge; the client DES-encrypts it with a key
//! derived from the password and sends it back. The response is accepted when it matches
//! any entry of the session's password list.

use des::cipher::generic_array::GenericArray;
use des::cipher::{BlockEncrypt, KeyInit};
use des::Des;
use rand::RngCore;

/// Length of the challenge and response.
pub const CHALLENGE_LEN: usize = 16;

/// Owned list of accepted passwords.
///
/// The session stores a single credential as a one-element list; an absent list means no
/// authentication is required.
#[derive(Clone)]
pub struct PasswordList {
    passwords: Vec<String>,
}

impl PasswordList {
    pub fn single(password: impl Into<String>) -> Self {
        Self {
            passwords: vec![password.into()],
        }
    }

    pub fn len(&self) -> usize {
        self.passwords.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passwords.is_empty()
    }

    /// Returns true when `response` is the encrypted `challenge` under any listed password.
    pub fn check(&self, challenge: &[u8; CHALLENGE_LEN], response: &[u8; CHALLENGE_LEN]) -> bool {
        self.passwords
            .iter()
            .any(|password| encrypt_challenge(password, challenge) == *response)
    }
}

impl std::fmt::Debug for PasswordList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PasswordList")
            .field("len", &self.passwords.len())
            .finish()
    }
}

/// Generates a fresh random challenge.
pub fn generate_challenge() -> [u8; CHALLENGE_LEN] {
    let mut challenge = [0u8; CHALLENGE_LEN];
    rand::thread_rng().fill_bytes(&mut challenge);
    challenge
}

/// Encrypts `challenge` the way a VNC viewer does for `password`.
///
/// Only the first 8 bytes of the password are significant, and each key byte is
/// bit-reversed as required by the original VNC implementation.
pub fn encrypt_challenge(password: &str, challenge: &[u8; CHALLENGE_LEN]) -> [u8; CHALLENGE_LEN] {
    let mut key = [0u8; 8];
    for (slot, byte) in key.iter_mut().zip(password.bytes()) {
        *slot = byte.reverse_bits();
    }

    let cipher = Des::new(GenericArray::from_slice(&key));
    let mut response = *challenge;
    for block in response.chunks_exact_mut(8) {
        cipher.encrypt_block(GenericArray::from_mut_slice(block));
    }
    response
}
