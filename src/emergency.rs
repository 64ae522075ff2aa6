use std::sync::atomic::{AtomicU8, Ordering};
use tracing::error;

/// Process-wide corruption latch. Once raised, every write path refuses with
/// a read-only error for the remainder of the mount; only the first raise
/// wins. Readers keep working so the containers can still be inspected.
static EMERGENCY: AtomicU8 = AtomicU8::new(0);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EmergencyKind {
    /// An internal invariant was violated.
    Bug = 1,
    /// A rollback or recovery step failed and left partial state behind.
    SystemFailure = 2,
}

impl EmergencyKind {
    fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(EmergencyKind::Bug),
            2 => Some(EmergencyKind::SystemFailure),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EmergencyKind::Bug => "bug",
            EmergencyKind::SystemFailure => "system failure",
        }
    }
}

pub fn raise(kind: EmergencyKind) {
    error!(
        kind = kind.as_str(),
        "emergency: file system is corrupt, enforcing read-only access"
    );
    let _ = EMERGENCY.compare_exchange(0, kind as u8, Ordering::SeqCst, Ordering::SeqCst);
}

pub fn current() -> Option<EmergencyKind> {
    EmergencyKind::from_raw(EMERGENCY.load(Ordering::SeqCst))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_names() {
        assert_eq!(EmergencyKind::Bug.as_str(), "bug");
        assert_eq!(EmergencyKind::SystemFailure.as_str(), "system failure");
    }
}
