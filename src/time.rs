use std::time::{SystemTime, UNIX_EPOCH};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// A point in time as stored in inodes: seconds since the Unix epoch plus
/// nanoseconds. The trailing pad keeps the on-medium record free of implicit
/// padding.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct UnixTime {
    pub seconds: i64,
    pub nanoseconds: u32,
    pad: u32,
}

impl UnixTime {
    pub fn new(seconds: i64, nanoseconds: u32) -> Self {
        Self {
            seconds,
            nanoseconds,
            pad: 0,
        }
    }

    pub fn now() -> Self {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(d) => Self::new(d.as_secs() as i64, d.subsec_nanos()),
            Err(e) => {
                // clock before the epoch
                let d = e.duration();
                Self::new(-(d.as_secs() as i64), d.subsec_nanos())
            }
        }
    }

    pub fn is_older_than(&self, other: &UnixTime) -> bool {
        self.seconds < other.seconds
            || (self.seconds == other.seconds && self.nanoseconds < other.nanoseconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_compares_seconds_then_nanoseconds() {
        let a = UnixTime::new(10, 0);
        let b = UnixTime::new(10, 5);
        let c = UnixTime::new(11, 0);
        assert!(a.is_older_than(&b));
        assert!(b.is_older_than(&c));
        assert!(!c.is_older_than(&a));
        assert!(!a.is_older_than(&a));
    }

    #[test]
    fn now_is_after_epoch() {
        let t = UnixTime::now();
        assert!(t.seconds > 0);
    }
}
