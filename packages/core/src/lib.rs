//! `PatchSync` core -- Hybrid Logical Clock, peer identity, column values,
//! and replication message schemas.
//!
//! This crate is the store-free foundation of the `PatchSync` replication
//! engine:
//!
//! - **HLC** ([`hlc`]): packed 53-bit timestamps, the mutable clock state,
//!   and peer-id generation
//! - **Values** ([`value`]): the typed column value carried in patch deltas
//! - **Messages** ([`messages`]): `Patch`, `Ping`, and
//!   `MissingPatchRequest` schemas exchanged between peers
//!
//! The engine crate layers the SQLite store, patch tables, and the merge on
//! top of these types.

pub mod hlc;
pub mod messages;
pub mod value;

// HLC
pub use hlc::{generate_peer_id, ClockSource, Hlc, HlcError, HlcState, SystemClock, EPOCH_MS};

// Messages
pub use messages::{Delta, Message, MissingPatchRequest, Patch, Ping};

// Values
pub use value::Value;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crate_loads() {
        // Empty body: if this test runs, the crate compiles and loads.
    }

    /// Verify all re-exports are accessible from the crate root.
    #[test]
    fn reexports_accessible() {
        let _ = Hlc::ZERO;
        let _ = SystemClock;
        let _ = Value::Null;
        let _ = Message::Ping(Ping {
            peer: 1,
            last_at: Hlc::ZERO,
            last_seq: 0,
        });
        assert!(EPOCH_MS > 0);
    }

    #[test]
    fn hlc_msgpack_roundtrip() {
        let hlc = Hlc::from_parts(EPOCH_MS + 123, 45).unwrap();
        let bytes = rmp_serde::to_vec(&hlc).expect("serialize Hlc");
        let decoded: Hlc = rmp_serde::from_slice(&bytes).expect("deserialize Hlc");
        assert_eq!(hlc, decoded);
    }
}
