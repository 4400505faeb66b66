//! Hybrid Logical Clock (HLC) for distributed causality tracking.
//!
//! Provides monotonically increasing timestamps that combine physical
//! wall-clock time with a logical counter, ensuring total ordering of writes
//! across peers. The HLC is the foundation for LWW (Last-Write-Wins) patch
//! merging.
//!
//! # Wire format
//!
//! A timestamp is a signed 53-bit integer: the upper 40 bits hold the
//! millisecond offset from [`EPOCH_MS`] (2025-01-01T00:00:00Z), the lower 13
//! bits hold a logical counter in `[0, 8191]`. The numeric value is the sole
//! wire contract; it fits losslessly in an IEEE-754 double for
//! cross-language peers.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Fixed epoch for timestamp offsets: 2025-01-01T00:00:00Z in Unix ms.
pub const EPOCH_MS: i64 = 1_735_689_600_000;

/// Number of low bits reserved for the logical counter.
const COUNTER_BITS: u32 = 13;

/// Mask extracting the logical counter from a packed timestamp.
const COUNTER_MASK: i64 = 0x1FFF;

/// Largest representable logical counter.
pub const MAX_COUNTER: i64 = 8191;

/// Modulus for the random low bits of a generated peer id.
const PEER_ENTROPY_MOD: u32 = 8092;

/// Error constructing a timestamp from out-of-range parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HlcError {
    /// The wall-clock input predates [`EPOCH_MS`].
    #[error("timestamp {unix_ms}ms predates the clock epoch {EPOCH_MS}ms")]
    BeforeEpoch {
        /// The rejected wall-clock milliseconds.
        unix_ms: i64,
    },
    /// The counter input is outside `[0, 8191]`.
    #[error("counter {counter} outside [0, {MAX_COUNTER}]")]
    CounterRange {
        /// The rejected counter value.
        counter: i64,
    },
}

/// A packed hybrid logical timestamp.
///
/// Ordering is the numeric order of the packed value, which sorts by
/// millisecond part first and counter second. Ties across peers are broken
/// outside the timestamp, by peer id.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Hlc(i64);

impl Hlc {
    /// The zero timestamp, ordered before every generated timestamp.
    pub const ZERO: Hlc = Hlc(0);

    /// Packs a wall-clock millisecond value and a counter into a timestamp.
    ///
    /// # Errors
    ///
    /// Rejects `unix_ms` before [`EPOCH_MS`] and counters outside
    /// `[0, 8191]`. This is the only range check; internal encoding always
    /// operates on vetted, non-negative offsets.
    pub fn from_parts(unix_ms: i64, counter: i64) -> Result<Self, HlcError> {
        if unix_ms < EPOCH_MS {
            return Err(HlcError::BeforeEpoch { unix_ms });
        }
        if !(0..=MAX_COUNTER).contains(&counter) {
            return Err(HlcError::CounterRange { counter });
        }
        Ok(Self(pack(unix_ms - EPOCH_MS, counter)))
    }

    /// Reinterprets a raw packed value received from a peer.
    #[must_use]
    pub fn from_raw(value: i64) -> Self {
        Self(value)
    }

    /// Returns the packed numeric value.
    #[must_use]
    pub fn raw(self) -> i64 {
        self.0
    }

    /// Returns the wall-clock millisecond part.
    #[must_use]
    pub fn unix_ms(self) -> i64 {
        (self.0 >> COUNTER_BITS) + EPOCH_MS
    }

    /// Returns the logical counter part.
    #[must_use]
    pub fn counter(self) -> i64 {
        self.0 & COUNTER_MASK
    }
}

impl fmt::Display for Hlc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Packs a non-negative millisecond offset and counter. Callers vet ranges.
fn pack(offset_ms: i64, counter: i64) -> i64 {
    (offset_ms << COUNTER_BITS) | counter
}

/// Abstraction over the system clock for dependency injection.
///
/// Allows deterministic testing by replacing the real clock with a fixed
/// one. The default implementation ([`SystemClock`]) delegates to
/// `std::time::SystemTime`.
pub trait ClockSource: Send + Sync {
    /// Returns the current time as milliseconds since the Unix epoch.
    fn now_ms(&self) -> i64;
}

/// Default clock source that reads the real system time.
#[derive(Debug, Clone)]
pub struct SystemClock;

impl ClockSource for SystemClock {
    fn now_ms(&self) -> i64 {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX)
    }
}

/// Mutable clock state generating local timestamps and absorbing remote ones.
///
/// Every locally generated timestamp is strictly greater than any timestamp
/// previously generated or received, so the node never goes backwards even
/// when its wall clock does. The gap between the wall clock and the logical
/// frontier is observable via [`HlcState::drift`] so operators can detect
/// NTP problems.
pub struct HlcState {
    /// Highest timestamp seen, whether generated locally or received.
    highest: Hlc,
    /// Logical counter added on top of `highest` while the wall clock lags.
    counter: i64,
    /// `highest - wall_clock` at the last lagging generation, packed units.
    drift: i64,
    /// Set while a saturation warning for the current episode has been emitted.
    saturated: bool,
    clock: Box<dyn ClockSource>,
}

impl HlcState {
    /// Creates a fresh state reading time from `clock`.
    #[must_use]
    pub fn new(clock: Box<dyn ClockSource>) -> Self {
        Self {
            highest: Hlc::ZERO,
            counter: 0,
            drift: 0,
            saturated: false,
            clock,
        }
    }

    /// Returns a reference to the clock source backing this state.
    ///
    /// The engine reads the same clock for peer bookkeeping and retention.
    #[must_use]
    pub fn clock_source(&self) -> &dyn ClockSource {
        &*self.clock
    }

    /// Returns the highest timestamp seen so far.
    #[must_use]
    pub fn highest(&self) -> Hlc {
        self.highest
    }

    /// Returns the last observed clock drift, in packed timestamp units.
    ///
    /// Zero when the wall clock is keeping up; positive when timestamps are
    /// being generated ahead of the wall clock.
    #[must_use]
    pub fn drift(&self) -> i64 {
        self.drift
    }

    /// Generates the next local timestamp. Total; cannot fail.
    ///
    /// When the wall clock is ahead of everything seen, the result is the
    /// wall clock with a zero counter. Otherwise the counter advances on top
    /// of the highest seen timestamp; counter saturation is a warning, not
    /// an error, and the value keeps growing to preserve monotonicity.
    pub fn create(&mut self) -> Hlc {
        let now_ms = self.clock.now_ms().max(EPOCH_MS);
        let now_hlc = Hlc(pack(now_ms - EPOCH_MS, 0));

        if now_hlc > self.highest {
            self.highest = now_hlc;
            self.counter = 0;
            self.saturated = false;
            return now_hlc;
        }

        self.counter += 1;
        if self.counter > MAX_COUNTER && !self.saturated {
            self.saturated = true;
            tracing::warn!(
                counter = self.counter,
                highest = self.highest.raw(),
                wall_ms = now_ms,
                "HLC counter saturated; local wall clock lags the logical frontier"
            );
        }
        self.drift = self.highest.raw() - now_hlc.raw();
        Hlc(self.highest.raw() + self.counter)
    }

    /// Absorbs a timestamp observed from a remote peer.
    ///
    /// A remote value behind the local frontier is a no-op. When the remote
    /// frontier advances the millisecond part, the local counter resets.
    pub fn receive(&mut self, remote: Hlc) {
        if remote > self.highest {
            if remote.unix_ms() > self.highest.unix_ms() {
                self.counter = 0;
                self.saturated = false;
            }
            self.highest = remote;
        }
    }
}

impl fmt::Debug for HlcState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HlcState")
            .field("highest", &self.highest)
            .field("counter", &self.counter)
            .field("drift", &self.drift)
            .finish_non_exhaustive()
    }
}

/// Generates a 53-bit peer id from the wall clock and 13 random low bits.
///
/// Stable ids must be persisted by the operator; this is the fallback for
/// nodes configured without one. Collisions require two peers to start in
/// the same millisecond and draw the same entropy.
#[must_use]
pub fn generate_peer_id(clock: &dyn ClockSource) -> i64 {
    let now_ms = clock.now_ms().max(EPOCH_MS);
    let entropy = i64::from(rand::random::<u32>() % PEER_ENTROPY_MOD);
    pack(now_ms - EPOCH_MS, entropy)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicI64, Ordering as AtomicOrdering};
    use std::sync::Arc;

    use super::*;

    /// A deterministic clock source for testing. Time is controlled explicitly.
    struct FixedClock {
        time: Arc<AtomicI64>,
    }

    impl FixedClock {
        fn new(initial: i64) -> (Self, Arc<AtomicI64>) {
            let time = Arc::new(AtomicI64::new(initial));
            (Self { time: time.clone() }, time)
        }
    }

    impl ClockSource for FixedClock {
        fn now_ms(&self) -> i64 {
            self.time.load(AtomicOrdering::Relaxed)
        }
    }

    const T0: i64 = EPOCH_MS + 86_400_000;

    fn make_state(initial: i64) -> (HlcState, Arc<AtomicI64>) {
        let (clock, time) = FixedClock::new(initial);
        (HlcState::new(Box::new(clock)), time)
    }

    // ---- Codec ----

    #[test]
    fn from_parts_packs_and_unpacks() {
        let hlc = Hlc::from_parts(T0, 42).unwrap();
        assert_eq!(hlc.unix_ms(), T0);
        assert_eq!(hlc.counter(), 42);
        assert_eq!(hlc.raw(), ((T0 - EPOCH_MS) << 13) | 42);
    }

    #[test]
    fn from_parts_rejects_pre_epoch() {
        assert_eq!(
            Hlc::from_parts(EPOCH_MS - 1, 0),
            Err(HlcError::BeforeEpoch {
                unix_ms: EPOCH_MS - 1
            })
        );
    }

    #[test]
    fn from_parts_rejects_counter_out_of_range() {
        assert_eq!(
            Hlc::from_parts(T0, MAX_COUNTER + 1),
            Err(HlcError::CounterRange {
                counter: MAX_COUNTER + 1
            })
        );
        assert_eq!(
            Hlc::from_parts(T0, -1),
            Err(HlcError::CounterRange { counter: -1 })
        );
    }

    #[test]
    fn epoch_start_is_zero() {
        let hlc = Hlc::from_parts(EPOCH_MS, 0).unwrap();
        assert_eq!(hlc, Hlc::ZERO);
    }

    #[test]
    fn ordering_is_millis_then_counter() {
        let a = Hlc::from_parts(T0, MAX_COUNTER).unwrap();
        let b = Hlc::from_parts(T0 + 1, 0).unwrap();
        let c = Hlc::from_parts(T0, 1).unwrap();
        assert!(a < b);
        assert!(c < a);
    }

    // ---- create() monotonicity ----

    #[test]
    fn create_returns_wall_clock_when_ahead() {
        let (mut state, _) = make_state(T0);
        let ts = state.create();
        assert_eq!(ts.unix_ms(), T0);
        assert_eq!(ts.counter(), 0);
    }

    #[test]
    fn create_increments_counter_when_clock_stalls() {
        let (mut state, _) = make_state(T0);
        let ts1 = state.create();
        let ts2 = state.create();
        let ts3 = state.create();
        assert_eq!(ts1.counter(), 0);
        assert_eq!(ts2.counter(), 1);
        assert_eq!(ts3.counter(), 2);
        assert_eq!(ts2.unix_ms(), T0);
    }

    #[test]
    fn create_resets_counter_when_clock_advances() {
        let (mut state, time) = make_state(T0);
        state.create();
        state.create();
        time.store(T0 + 5, AtomicOrdering::Relaxed);
        let ts = state.create();
        assert_eq!(ts.unix_ms(), T0 + 5);
        assert_eq!(ts.counter(), 0);
    }

    #[test]
    fn create_sequence_strictly_increasing() {
        let (mut state, _) = make_state(T0);
        let mut prev = Hlc::ZERO;
        for _ in 0..1000 {
            let ts = state.create();
            assert!(ts > prev);
            prev = ts;
        }
    }

    #[test]
    fn create_survives_backwards_clock() {
        let (mut state, time) = make_state(T0 + 1000);
        let ts1 = state.create();
        time.store(T0, AtomicOrdering::Relaxed);
        let ts2 = state.create();
        assert!(ts2 > ts1);
        assert_eq!(ts2.unix_ms(), T0 + 1000);
    }

    #[test]
    fn create_continues_past_counter_saturation() {
        let (mut state, _) = make_state(T0);
        let mut prev = state.create();
        for _ in 0..(MAX_COUNTER + 10) {
            let ts = state.create();
            assert!(ts > prev);
            prev = ts;
        }
    }

    #[test]
    fn drift_tracks_logical_lead() {
        let (mut state, _) = make_state(T0);
        assert_eq!(state.drift(), 0);
        let remote = Hlc::from_parts(T0 + 60_000, 0).unwrap();
        state.receive(remote);
        state.create();
        assert_eq!(state.drift(), remote.raw() - Hlc::from_parts(T0, 0).unwrap().raw());
    }

    // ---- receive() dominance ----

    #[test]
    fn receive_then_create_dominates_remote() {
        let (mut state, _) = make_state(T0);
        let remote = Hlc::from_parts(T0 + 10_000, 7).unwrap();
        state.receive(remote);
        let ts = state.create();
        assert!(ts > remote);
    }

    #[test]
    fn receive_behind_frontier_is_noop() {
        let (mut state, _) = make_state(T0 + 1000);
        let ts1 = state.create();
        state.receive(Hlc::from_parts(T0, 5).unwrap());
        assert_eq!(state.highest(), ts1);
    }

    #[test]
    fn receive_same_millis_keeps_counter() {
        let (mut state, _) = make_state(T0);
        state.create();
        state.create(); // counter now 1
        let remote = Hlc::from_parts(T0, 500).unwrap();
        state.receive(remote);
        let ts = state.create();
        assert!(ts > remote);
        assert_eq!(ts.unix_ms(), T0);
    }

    #[test]
    fn receive_newer_millis_resets_counter() {
        let (mut state, time) = make_state(T0);
        state.create();
        state.create();
        let remote = Hlc::from_parts(T0 + 100, 3).unwrap();
        state.receive(remote);
        time.store(T0 + 200, AtomicOrdering::Relaxed);
        let ts = state.create();
        assert_eq!(ts.unix_ms(), T0 + 200);
        assert_eq!(ts.counter(), 0);
    }

    #[test]
    fn bidirectional_exchange_totally_ordered() {
        let (mut a, _) = make_state(T0);
        let (mut b, _) = make_state(T0);

        let msg1 = a.create();
        b.receive(msg1);
        let msg2 = b.create();
        a.receive(msg2);
        let msg3 = a.create();

        assert!(msg1 < msg2);
        assert!(msg2 < msg3);
    }

    // ---- Peer identity ----

    #[test]
    fn generated_peer_id_embeds_wall_clock() {
        let (clock, _) = FixedClock::new(T0);
        let id = generate_peer_id(&clock);
        assert_eq!(Hlc::from_raw(id).unix_ms(), T0);
        assert!(Hlc::from_raw(id).counter() < 8092);
    }

    #[test]
    fn generated_peer_id_positive() {
        let (clock, _) = FixedClock::new(T0);
        for _ in 0..100 {
            assert!(generate_peer_id(&clock) > 0);
        }
    }
}

#[cfg(test)]
mod proptests {
    use proptest::prelude::*;

    use super::*;

    proptest! {
        /// Round-trip: packing any in-range (ms, counter) pair and unpacking
        /// it returns the original parts.
        #[test]
        fn codec_round_trip(
            offset_ms in 0_i64..(1_i64 << 40),
            counter in 0_i64..=MAX_COUNTER,
        ) {
            let unix_ms = EPOCH_MS + offset_ms;
            let hlc = Hlc::from_parts(unix_ms, counter).unwrap();
            prop_assert_eq!(hlc.unix_ms(), unix_ms);
            prop_assert_eq!(hlc.counter(), counter);
        }

        /// Packed ordering agrees with lexicographic (ms, counter) ordering.
        #[test]
        fn packed_order_matches_part_order(
            a_ms in 0_i64..(1_i64 << 40),
            a_ctr in 0_i64..=MAX_COUNTER,
            b_ms in 0_i64..(1_i64 << 40),
            b_ctr in 0_i64..=MAX_COUNTER,
        ) {
            let a = Hlc::from_parts(EPOCH_MS + a_ms, a_ctr).unwrap();
            let b = Hlc::from_parts(EPOCH_MS + b_ms, b_ctr).unwrap();
            prop_assert_eq!(a.cmp(&b), (a_ms, a_ctr).cmp(&(b_ms, b_ctr)));
        }
    }
}
