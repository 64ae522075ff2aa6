use crate::block::BLOCK_SIZE;
use crate::dirent::DIRENT_SIZE;
use crate::error::{FsError, FsResult};
use crate::inode::INODE_SIZE;
use crypto_secretbox::aead::{AeadCore, AeadInPlace, OsRng};
use crypto_secretbox::{Key, KeyInit, Nonce, Tag, XSalsa20Poly1305};

pub const KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 24;
pub const TAG_SIZE: usize = 16;

/// Per-record framing overhead: sentinel byte, nonce, authentication tag.
pub const ENC_OVERHEAD: usize = 1 + NONCE_SIZE + TAG_SIZE;

pub const ENC_INODE_SIZE: usize = INODE_SIZE + ENC_OVERHEAD;
pub const ENC_DIRENT_SIZE: usize = DIRENT_SIZE + ENC_OVERHEAD;
pub const ENC_BLOCK_SIZE: usize = BLOCK_SIZE + ENC_OVERHEAD;

/// All bits set in the first byte of every sealed record, so a chunk that
/// was punched into a hole (reads back as zeros) is unambiguous.
const SENTINEL: u8 = 0xFF;

fn crypt_error() -> FsError {
    FsError::Io(std::io::Error::from_raw_os_error(libc::EIO))
}

/// Seals and opens fixed-size records with XSalsa20-Poly1305.
pub struct Sealer {
    cipher: XSalsa20Poly1305,
}

impl Sealer {
    pub fn new(key: &[u8; KEY_SIZE]) -> Self {
        Self {
            cipher: XSalsa20Poly1305::new(Key::from_slice(key)),
        }
    }

    /// Frame `msg` into `out` with a fresh random nonce;
    /// `out.len() == msg.len() + ENC_OVERHEAD`.
    pub fn seal(&self, msg: &[u8], out: &mut [u8]) -> FsResult<()> {
        debug_assert_eq!(out.len(), msg.len() + ENC_OVERHEAD);
        out[0] = SENTINEL;
        let nonce = XSalsa20Poly1305::generate_nonce(&mut OsRng);
        out[1..1 + NONCE_SIZE].copy_from_slice(nonce.as_slice());
        let body = 1 + NONCE_SIZE;
        let tag_at = body + msg.len();
        out[body..tag_at].copy_from_slice(msg);
        let tag = self
            .cipher
            .encrypt_in_place_detached(&nonce, b"", &mut out[body..tag_at])
            .map_err(|_| crypt_error())?;
        out[tag_at..].copy_from_slice(tag.as_slice());
        Ok(())
    }

    /// Recover the record framed in `framed` into `msg`. A zero sentinel
    /// marks a punched-out chunk and yields an all-zero record without
    /// touching the cipher; a failed authentication is an I/O error.
    pub fn open(&self, framed: &[u8], msg: &mut [u8]) -> FsResult<()> {
        debug_assert_eq!(framed.len(), msg.len() + ENC_OVERHEAD);
        if framed[0] == 0 {
            msg.fill(0);
            return Ok(());
        }
        let nonce = Nonce::from_slice(&framed[1..1 + NONCE_SIZE]);
        let body = 1 + NONCE_SIZE;
        let tag_at = body + msg.len();
        msg.copy_from_slice(&framed[body..tag_at]);
        let tag = Tag::from_slice(&framed[tag_at..]);
        self.cipher
            .decrypt_in_place_detached(nonce, b"", msg, tag)
            .map_err(|_| crypt_error())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; KEY_SIZE] = [0x42; KEY_SIZE];

    #[test]
    fn seal_open_round_trip() {
        let sealer = Sealer::new(&KEY);
        let msg: Vec<u8> = (0..100u8).collect();
        let mut framed = vec![0u8; msg.len() + ENC_OVERHEAD];
        sealer.seal(&msg, &mut framed).unwrap();
        assert_eq!(framed[0], 0xFF);

        let mut recovered = vec![0u8; msg.len()];
        sealer.open(&framed, &mut recovered).unwrap();
        assert_eq!(recovered, msg);
    }

    #[test]
    fn nonces_are_fresh_per_seal() {
        let sealer = Sealer::new(&KEY);
        let msg = [7u8; 16];
        let mut a = [0u8; 16 + ENC_OVERHEAD];
        let mut b = [0u8; 16 + ENC_OVERHEAD];
        sealer.seal(&msg, &mut a).unwrap();
        sealer.seal(&msg, &mut b).unwrap();
        assert_ne!(a[1..1 + NONCE_SIZE], b[1..1 + NONCE_SIZE]);
        assert_ne!(a[1 + NONCE_SIZE..], b[1 + NONCE_SIZE..]);
    }

    #[test]
    fn tampering_is_detected() {
        let sealer = Sealer::new(&KEY);
        let msg = [1u8; 32];
        let mut framed = [0u8; 32 + ENC_OVERHEAD];
        sealer.seal(&msg, &mut framed).unwrap();
        framed[1 + NONCE_SIZE] ^= 0x01;
        let mut out = [0u8; 32];
        assert!(sealer.open(&framed, &mut out).is_err());
    }

    #[test]
    fn wrong_key_is_detected() {
        let sealer = Sealer::new(&KEY);
        let other = Sealer::new(&[0x43; KEY_SIZE]);
        let msg = [1u8; 32];
        let mut framed = [0u8; 32 + ENC_OVERHEAD];
        sealer.seal(&msg, &mut framed).unwrap();
        let mut out = [0u8; 32];
        assert!(other.open(&framed, &mut out).is_err());
    }

    #[test]
    fn punched_hole_opens_to_zeros() {
        let sealer = Sealer::new(&KEY);
        let framed = [0u8; 64 + ENC_OVERHEAD];
        let mut out = [0xAAu8; 64];
        sealer.open(&framed, &mut out).unwrap();
        assert_eq!(out, [0u8; 64]);
    }

    #[test]
    fn encrypted_sizes_add_overhead() {
        assert_eq!(ENC_OVERHEAD, 41);
        assert_eq!(ENC_BLOCK_SIZE, BLOCK_SIZE + 41);
        assert_eq!(ENC_INODE_SIZE, INODE_SIZE + 41);
        assert_eq!(ENC_DIRENT_SIZE, DIRENT_SIZE + 41);
    }
}
