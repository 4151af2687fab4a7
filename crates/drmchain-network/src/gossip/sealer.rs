//! Sealer Ratchet
//!
//! A sealer is one direction of a session's symmetric state. Both ends
//! build the sealer for a given sender from the same key seed and the
//! sender's tag, so the sender's seal and the receiver's unseal line up
//! frame by frame:
//! - The key stream yields a 32-byte IV, then 48 bytes per step
//!   (16-byte MAC key followed by a 32-byte AES key)
//! - Every step hashes the IV forward and bumps the sequence
//! - `seal` steps the ratchet; `unseal` never does

use drmchain_crypto::constants::{CIPHER_BLOCK_SIZE, CIPHER_KEY_SIZE, MAC_KEY_SIZE};
use drmchain_crypto::{apply_keystream, compute_mac, digest, verify_mac};
use drmchain_crypto::{CipherKey, KeySeed, KeyStream, MacKey};
use zeroize::Zeroize;

use crate::error::{SealError, SealResult};
use crate::gossip::messages::{MessageSeal, SealKind};

/// Size of the evolving IV
pub const IV_SIZE: usize = 32;

/// Key material consumed per ratchet step
pub const STEP_MATERIAL_SIZE: usize = MAC_KEY_SIZE + CIPHER_KEY_SIZE;

/// Ratcheting encrypt-then-MAC state for one direction of a session
pub struct Sealer {
    session_id: String,
    sequence: u64,
    iv: [u8; IV_SIZE],
    mac_key: MacKey,
    cipher_key: CipherKey,
    key_stream: KeyStream,
}

impl Sealer {
    /// Build the sealer for frames sent by the node with `sender_tag`.
    ///
    /// The first key step is taken here, so the sealer starts at sequence 0.
    pub fn new(session_id: impl Into<String>, key_seed: &KeySeed, sender_tag: &str) -> SealResult<Self> {
        let mut key_stream = KeyStream::new(key_seed, sender_tag.as_bytes())?;
        let mut iv = [0u8; IV_SIZE];
        key_stream.fill(&mut iv)?;

        let (mac_key, cipher_key) = next_keys(&mut key_stream)?;
        let first_iv = digest(&iv);
        iv.zeroize();
        Ok(Self {
            session_id: session_id.into(),
            sequence: 0,
            iv: first_iv,
            mac_key,
            cipher_key,
            key_stream,
        })
    }

    /// Session this sealer belongs to
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Sequence the next frame will be sealed (or expected) at
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Encrypt and authenticate `plaintext`, then step the ratchet
    pub fn seal(&mut self, plaintext: &[u8], kind: SealKind) -> SealResult<MessageSeal> {
        let mut ciphertext = plaintext.to_vec();
        apply_keystream(&self.cipher_key, &self.cipher_iv(), &mut ciphertext)?;
        let mac = compute_mac(&self.mac_key, &[&ciphertext, &mac_sequence(self.sequence)])?;

        let seal = MessageSeal {
            kind,
            session_id: self.session_id.clone(),
            mac: mac.to_vec(),
            sequence: self.sequence,
            ciphertext,
        };
        self.update()?;
        Ok(seal)
    }

    /// Verify and decrypt a frame sealed at the current position.
    ///
    /// The ratchet is left where it is; call [`update`](Self::update)
    /// once the frame has been accepted.
    pub fn unseal(&self, seal: &MessageSeal) -> SealResult<Vec<u8>> {
        if seal.session_id != self.session_id {
            return Err(SealError::WrongSession {
                expected: self.session_id.clone(),
                actual: seal.session_id.clone(),
            });
        }
        if seal.sequence != self.sequence {
            return Err(SealError::WrongSequence {
                expected: self.sequence,
                actual: seal.sequence,
            });
        }

        verify_mac(&self.mac_key, &[&seal.ciphertext, &mac_sequence(seal.sequence)], &seal.mac)
            .map_err(|_| SealError::InvalidSeal)?;

        let mut plaintext = seal.ciphertext.clone();
        apply_keystream(&self.cipher_key, &self.cipher_iv(), &mut plaintext)?;
        Ok(plaintext)
    }

    /// Step the ratchet once
    pub fn update(&mut self) -> SealResult<()> {
        let (mac_key, cipher_key) = next_keys(&mut self.key_stream)?;
        self.mac_key = mac_key;
        self.cipher_key = cipher_key;
        self.iv = digest(&self.iv);
        self.sequence += 1;
        Ok(())
    }

    /// Step the ratchet until it sits at `target`
    pub fn update_to_seq(&mut self, target: u64) -> SealResult<()> {
        if target < self.sequence {
            return Err(SealError::CannotRewind {
                current: self.sequence,
                target,
            });
        }
        while self.sequence < target {
            self.update()?;
        }
        Ok(())
    }

    fn cipher_iv(&self) -> [u8; CIPHER_BLOCK_SIZE] {
        let mut iv = [0u8; CIPHER_BLOCK_SIZE];
        iv.copy_from_slice(&self.iv[..CIPHER_BLOCK_SIZE]);
        iv
    }
}

impl Drop for Sealer {
    fn drop(&mut self) {
        self.iv.zeroize();
    }
}

impl std::fmt::Debug for Sealer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sealer")
            .field("session_id", &self.session_id)
            .field("sequence", &self.sequence)
            .finish_non_exhaustive()
    }
}

/// Sequence as covered by the MAC: the low 32 bits, big-endian
fn mac_sequence(sequence: u64) -> [u8; 4] {
    (sequence as u32).to_be_bytes()
}

fn next_keys(key_stream: &mut KeyStream) -> SealResult<(MacKey, CipherKey)> {
    let mut material = [0u8; STEP_MATERIAL_SIZE];
    key_stream.fill(&mut material)?;

    let mac_key = MacKey::try_from_slice(&material[..MAC_KEY_SIZE]);
    let cipher_key = CipherKey::try_from_slice(&material[MAC_KEY_SIZE..]);
    material.zeroize();
    Ok((mac_key?, cipher_key?))
}
