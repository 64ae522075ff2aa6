use crate::crypt::KEY_SIZE;
use std::path::PathBuf;

/// Which storage implementation backs the six container files.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendKind {
    /// Memory-mapped container files.
    Mmap,
    /// Plain files driven with pread/pwrite.
    File,
    /// Everything in RAM; nothing survives unmount.
    Mem,
}

/// Mount configuration as handed over by the adapter.
#[derive(Clone, Debug)]
pub struct Config {
    /// Directory holding the six container files.
    pub dir: PathBuf,
    /// Hard ceiling on total container bytes; 0 means unlimited.
    pub max_size: u64,
    /// 32-byte key; present means every stored record is encrypted.
    pub key: Option<[u8; KEY_SIZE]>,
    /// Punch holes into the block container for freed mid-container chunks.
    pub punch_holes: bool,
    pub backend: BackendKind,
}

impl Config {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            max_size: 0,
            key: None,
            punch_holes: false,
            backend: BackendKind::Mmap,
        }
    }

    pub fn max_size(mut self, max_size: u64) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn key(mut self, key: [u8; KEY_SIZE]) -> Self {
        self.key = Some(key);
        self
    }

    pub fn punch_holes(mut self, punch_holes: bool) -> Self {
        self.punch_holes = punch_holes;
        self
    }

    pub fn backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }
}

/// Parse a byte count with an optional K/M/G/T suffix (powers of 1024).
pub fn parse_size(value: &str) -> Option<u64> {
    let value = value.trim();
    let (digits, suffix) = match value.find(|c: char| !c.is_ascii_digit()) {
        Some(pos) => value.split_at(pos),
        None => (value, ""),
    };
    let base: u64 = digits.parse().ok()?;
    let factor: u64 = match suffix {
        "" => 1,
        "K" | "k" => 1 << 10,
        "M" | "m" => 1 << 20,
        "G" | "g" => 1 << 30,
        "T" | "t" => 1 << 40,
        _ => return None,
    };
    base.checked_mul(factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_size_accepts_suffixes() {
        assert_eq!(parse_size("0"), Some(0));
        assert_eq!(parse_size("4096"), Some(4096));
        assert_eq!(parse_size("16K"), Some(16 * 1024));
        assert_eq!(parse_size("2M"), Some(2 * 1024 * 1024));
        assert_eq!(parse_size("3G"), Some(3 * 1024 * 1024 * 1024));
        assert_eq!(parse_size("1T"), Some(1u64 << 40));
    }

    #[test]
    fn parse_size_rejects_junk() {
        assert_eq!(parse_size("12Q"), None);
        assert_eq!(parse_size("K"), None);
        assert_eq!(parse_size(""), None);
        assert_eq!(parse_size("99999999999999999999T"), None);
    }

    #[test]
    fn builder_defaults() {
        let config = Config::new("/tmp/somewhere");
        assert_eq!(config.max_size, 0);
        assert!(config.key.is_none());
        assert!(!config.punch_holes);
        assert_eq!(config.backend, BackendKind::Mmap);
    }
}
