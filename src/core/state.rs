//! Cumulative stream state flags
//!
//! Every failure reported by the engine is also recorded here. The mask
//! only grows until [`IoState`] is cleared by the caller, so an embedding
//! application can run a whole sequence of calls and inspect the outcome
//! once.

use bitflags::bitflags;

bitflags! {
    /// Stream/container state bits.
    ///
    /// The empty set means `good`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct IoState: u32 {
        /// End of the active stream reached.
        const EOF               = 1 << 0;
        /// A fixed-size record ran past the end of the stream.
        const OUT_OF_READ       = 1 << 1;
        /// Table or medium growth failed.
        const OUT_OF_MEMORY     = 1 << 2;
        /// Generic failure (bad argument, bad mode, seek out of range).
        const FAIL              = 1 << 3;
        /// Structural corruption.
        const BAD_DATA          = 1 << 4;
        /// Named stream does not exist.
        const NOT_FOUND         = 1 << 5;
        /// Operation not permitted on this stream or cursor.
        const ACCESS_VIOLATION  = 1 << 6;
        const CANT_OPEN_STORE   = 1 << 7;
        const CANT_CREATE_STORE = 1 << 8;
        /// Container magic mismatch.
        const BAD_SIG           = 1 << 9;
        const CANT_READ_CATALOG = 1 << 10;
        const CANT_WRITE_CATALOG = 1 << 11;
        /// Cluster index does not resolve inside the master table.
        const CANT_FIND         = 1 << 12;
        const CANT_READ         = 1 << 13;
        const CANT_WRITE        = 1 << 14;
        /// Reserved for object serializers layered on top.
        const BAD_CLASS_ID      = 1 << 15;
        /// Reserved for object serializers layered on top.
        const DOUBLED_CLASS_ID  = 1 << 16;
        /// Stream or container written by a newer format.
        const VER_VIOLATION     = 1 << 17;
        /// Unclassified medium failure.
        const HARD_FAIL         = 1 << 18;
        /// No stream is open, or the container is closed.
        const CLOSED            = 1 << 19;
        const WRITE_PROTECT     = 1 << 20;
        /// Reserved for object serializers layered on top.
        const CANT_WRITE_OBJECT = 1 << 21;
        /// A value does not fit the narrower on-disk or in-memory width.
        const UNDERFLOW_64_TO_32 = 1 << 22;
        /// Reserved for object serializers layered on top.
        const ENCRYPTED         = 1 << 23;
        /// Recovery mode skipped something it could not interpret.
        const SKIPPED_UNKNOWN   = 1 << 24;
        /// Recovery mode stopped reading a stream early.
        const READ_ABORTED      = 1 << 25;
        /// Reserved for object serializers layered on top.
        const SKIPPED_UNKN_ATTR = 1 << 26;
    }
}

impl IoState {
    /// Flags that describe a condition rather than a failure.
    pub const INFORMATIONAL: IoState = IoState::EOF
        .union(IoState::SKIPPED_UNKNOWN)
        .union(IoState::SKIPPED_UNKN_ATTR);

    /// No failure recorded.
    pub fn is_good(&self) -> bool {
        self.difference(Self::INFORMATIONAL).is_empty()
    }

    pub fn is_eof(&self) -> bool {
        self.contains(IoState::EOF)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_is_good() {
        assert!(IoState::empty().is_good());
        assert!(IoState::default().is_good());
    }

    #[test]
    fn test_eof_is_not_a_failure() {
        let state = IoState::EOF | IoState::SKIPPED_UNKNOWN;
        assert!(state.is_good());
        assert!(state.is_eof());
    }

    #[test]
    fn test_failure_bits_accumulate() {
        let mut state = IoState::empty();
        state |= IoState::BAD_DATA;
        state |= IoState::EOF;
        assert!(!state.is_good());
        assert!(state.contains(IoState::BAD_DATA | IoState::EOF));
    }

    #[test]
    fn test_flags_are_distinct() {
        let all: Vec<IoState> = IoState::all().iter().collect();
        assert_eq!(all.len(), 27);
        assert_eq!(all.iter().fold(0u32, |acc, f| acc | f.bits()).count_ones(), 27);
    }
}
