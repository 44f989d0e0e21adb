//! Per-site execution profiles.
//!
//! Every profiled bytecode site owns a small record that the fast path and
//! the slow path both write (a single atomic OR) and that the lowering
//! pass reads to decide which specialized fast path to generate. The same
//! records are consulted by the optimizing tier as speculation hints.
//!
//! Profiles only ever widen: once a representation has been observed it is
//! never forgotten. That monotonicity is what makes racing writers safe.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::value::Value;

/// Bucket encoding for "nothing recorded". Never produced by boxing: it
/// would be a payload-carrying negative NaN, which the value constructors
/// canonicalize away.
pub const PROFILE_BUCKET_EMPTY: u64 = u64::MAX;

// =============================================================================
// Observed Value Types
// =============================================================================

bitflags::bitflags! {
    /// The set of concrete representations a site has seen.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ObservedTypes: u32 {
        const INT32     = 1 << 0;
        const DOUBLE    = 1 << 1;
        const CELL      = 1 << 2;
        const BOOLEAN   = 1 << 3;
        /// undefined, null, and anything else.
        const OTHER     = 1 << 4;
    }
}

impl ObservedTypes {
    /// Classify a single value.
    #[inline]
    pub fn of(value: Value) -> Self {
        if value.is_int32() {
            ObservedTypes::INT32
        } else if value.is_double() {
            ObservedTypes::DOUBLE
        } else if value.is_cell() {
            ObservedTypes::CELL
        } else if value.is_boolean() {
            ObservedTypes::BOOLEAN
        } else {
            ObservedTypes::OTHER
        }
    }

    /// True if the site has only ever seen int32.
    #[inline]
    pub fn is_only_int32(self) -> bool {
        !self.is_empty() && (self - ObservedTypes::INT32).is_empty()
    }

    /// True if the site has only ever seen numbers.
    #[inline]
    pub fn is_only_number(self) -> bool {
        !self.is_empty() && (self - (ObservedTypes::INT32 | ObservedTypes::DOUBLE)).is_empty()
    }
}

/// A value profile for one bytecode site.
///
/// Two recording paths exist. Slow paths classify and OR into the
/// observed set directly. Generated fast paths just store the raw result
/// into the single-word bucket (one plain store, no classification)
/// and readers fold the bucket into the set lazily. Both are safe under
/// races because the set only widens.
#[derive(Debug)]
pub struct ValueProfile {
    observed: AtomicU32,
    bucket: AtomicU64,
}

impl ValueProfile {
    /// Create an empty profile.
    #[inline]
    pub const fn new() -> Self {
        ValueProfile {
            observed: AtomicU32::new(0),
            bucket: AtomicU64::new(PROFILE_BUCKET_EMPTY),
        }
    }

    /// Record one observed value.
    #[inline]
    pub fn record(&self, value: Value) {
        self.observed
            .fetch_or(ObservedTypes::of(value).bits(), Ordering::Relaxed);
    }

    /// Address of the bucket word, for the store the JIT emits.
    #[inline]
    pub fn bucket_addr(&self) -> usize {
        &self.bucket as *const AtomicU64 as usize
    }

    /// Snapshot the observed set, folding in the fast-path bucket.
    #[inline]
    pub fn observed(&self) -> ObservedTypes {
        let bucket = self.bucket.load(Ordering::Relaxed);
        if bucket != PROFILE_BUCKET_EMPTY {
            self.observed.fetch_or(
                ObservedTypes::of(Value::from_bits(bucket)).bits(),
                Ordering::Relaxed,
            );
        }
        ObservedTypes::from_bits_truncate(self.observed.load(Ordering::Relaxed))
    }

    /// True if nothing has been recorded yet.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.observed().is_empty()
    }
}

impl Default for ValueProfile {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Array Modes
// =============================================================================

bitflags::bitflags! {
    /// The closed set of element-storage representations an indexed-access
    /// site can observe. The lowering pass specializes for exactly one of
    /// these per site; every other mode falls to the generic helper.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ArrayModes: u32 {
        const INT32_DENSE  = 1 << 0;
        const DOUBLE_DENSE = 1 << 1;
        const VALUE_DENSE  = 1 << 2;
        /// Sparse / hole-y overflow representation.
        const SPARSE       = 1 << 3;
        const TYPED_I8     = 1 << 8;
        const TYPED_U8     = 1 << 9;
        const TYPED_I16    = 1 << 10;
        const TYPED_U16    = 1 << 11;
        const TYPED_I32    = 1 << 12;
        const TYPED_U32    = 1 << 13;
        const TYPED_F32    = 1 << 14;
        const TYPED_F64    = 1 << 15;
    }
}

impl ArrayModes {
    /// True if exactly one mode has been observed.
    #[inline]
    pub fn is_monomorphic(self) -> bool {
        self.bits().count_ones() == 1
    }

    /// The single observed mode, if monomorphic.
    #[inline]
    pub fn single(self) -> Option<ArrayModes> {
        if self.is_monomorphic() { Some(self) } else { None }
    }
}

/// An array profile for one indexed-access site.
#[derive(Debug, Default)]
pub struct ArrayProfile {
    modes: AtomicU32,
}

impl ArrayProfile {
    /// Create an empty profile.
    #[inline]
    pub const fn new() -> Self {
        ArrayProfile {
            modes: AtomicU32::new(0),
        }
    }

    /// Record one observed backing mode.
    #[inline]
    pub fn record(&self, mode: ArrayModes) {
        self.modes.fetch_or(mode.bits(), Ordering::Relaxed);
    }

    /// Snapshot the observed mode set.
    #[inline]
    pub fn observed(&self) -> ArrayModes {
        ArrayModes::from_bits_truncate(self.modes.load(Ordering::Relaxed))
    }

    /// Address of the mode word, for the OR the JIT fast path emits.
    #[inline]
    pub fn modes_addr(&self) -> usize {
        &self.modes as *const AtomicU32 as usize
    }

    /// The mode the lowering pass should specialize for: the single
    /// observed mode, or none if the site is empty or polymorphic.
    #[inline]
    pub fn mode_to_specialize(&self) -> Option<ArrayModes> {
        self.observed().single()
    }
}

// =============================================================================
// Execution Counter
// =============================================================================

/// Tier-up / deoptimization feedback counter for one program.
///
/// The interpreter and baseline code bump it; the optimizing tier reads
/// `should_optimize`. When a deoptimization is scheduled, `deopt_backoff`
/// both clears progress and raises the threshold so the program is not
/// immediately re-optimized with the same flawed assumption.
#[derive(Debug)]
pub struct ExecutionCounter {
    count: AtomicU32,
    threshold: AtomicU32,
}

impl ExecutionCounter {
    /// Default optimization threshold.
    pub const DEFAULT_THRESHOLD: u32 = 1000;

    /// Create a counter with the default threshold.
    #[inline]
    pub fn new() -> Self {
        Self::with_threshold(Self::DEFAULT_THRESHOLD)
    }

    /// Create a counter with a custom threshold.
    #[inline]
    pub fn with_threshold(threshold: u32) -> Self {
        ExecutionCounter {
            count: AtomicU32::new(0),
            threshold: AtomicU32::new(threshold),
        }
    }

    /// Record one execution (function entry or loop back-edge).
    #[inline]
    pub fn record(&self) {
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Whether the program is hot enough for the optimizing tier.
    #[inline]
    pub fn should_optimize(&self) -> bool {
        self.count.load(Ordering::Relaxed) >= self.threshold.load(Ordering::Relaxed)
    }

    /// Current count.
    #[inline]
    pub fn count(&self) -> u32 {
        self.count.load(Ordering::Relaxed)
    }

    /// Current threshold.
    #[inline]
    pub fn threshold(&self) -> u32 {
        self.threshold.load(Ordering::Relaxed)
    }

    /// Back off after a deoptimization: clear progress and double the
    /// threshold (saturating) so re-optimization is deferred.
    pub fn deopt_backoff(&self) {
        self.count.store(0, Ordering::Relaxed);
        let current = self.threshold.load(Ordering::Relaxed);
        self.threshold
            .store(current.saturating_mul(2), Ordering::Relaxed);
    }
}

impl Default for ExecutionCounter {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_profile_widens() {
        let profile = ValueProfile::new();
        assert!(profile.is_empty());

        profile.record(Value::int32(1));
        assert_eq!(profile.observed(), ObservedTypes::INT32);
        assert!(profile.observed().is_only_int32());

        profile.record(Value::int32(2));
        assert!(profile.observed().is_only_int32());

        profile.record(Value::double(1.5));
        assert!(!profile.observed().is_only_int32());
        assert!(profile.observed().is_only_number());

        profile.record(Value::undefined());
        assert!(!profile.observed().is_only_number());
        // Widening never loses earlier observations.
        assert!(profile.observed().contains(ObservedTypes::INT32));
        assert!(profile.observed().contains(ObservedTypes::DOUBLE));
    }

    #[test]
    fn test_bucket_folds_into_observed() {
        let profile = ValueProfile::new();
        assert!(profile.is_empty());

        // Simulate the JIT's raw bucket store.
        let bucket = profile.bucket_addr() as *const AtomicU64;
        unsafe { (*bucket).store(Value::double(2.5).to_bits(), Ordering::Relaxed) };

        assert!(profile.observed().contains(ObservedTypes::DOUBLE));
        assert!(!profile.is_empty());
    }

    #[test]
    fn test_observed_classification() {
        assert_eq!(ObservedTypes::of(Value::int32(0)), ObservedTypes::INT32);
        assert_eq!(ObservedTypes::of(Value::double(0.5)), ObservedTypes::DOUBLE);
        assert_eq!(
            ObservedTypes::of(Value::boolean(true)),
            ObservedTypes::BOOLEAN
        );
        assert_eq!(ObservedTypes::of(Value::undefined()), ObservedTypes::OTHER);
        assert_eq!(ObservedTypes::of(Value::null()), ObservedTypes::OTHER);
    }

    #[test]
    fn test_array_profile_specialization_choice() {
        let profile = ArrayProfile::new();
        assert_eq!(profile.mode_to_specialize(), None);

        profile.record(ArrayModes::INT32_DENSE);
        assert_eq!(profile.mode_to_specialize(), Some(ArrayModes::INT32_DENSE));

        // A second mode makes the site polymorphic: no specialization.
        profile.record(ArrayModes::DOUBLE_DENSE);
        assert_eq!(profile.mode_to_specialize(), None);
        assert!(profile.observed().contains(ArrayModes::INT32_DENSE));
    }

    #[test]
    fn test_typed_array_modes_distinct() {
        let profile = ArrayProfile::new();
        profile.record(ArrayModes::TYPED_F64);
        assert_eq!(profile.mode_to_specialize(), Some(ArrayModes::TYPED_F64));
    }

    #[test]
    fn test_execution_counter() {
        let counter = ExecutionCounter::with_threshold(3);
        assert!(!counter.should_optimize());
        counter.record();
        counter.record();
        assert!(!counter.should_optimize());
        counter.record();
        assert!(counter.should_optimize());
    }

    #[test]
    fn test_execution_counter_backoff() {
        let counter = ExecutionCounter::with_threshold(2);
        counter.record();
        counter.record();
        assert!(counter.should_optimize());

        counter.deopt_backoff();
        assert!(!counter.should_optimize());
        assert_eq!(counter.count(), 0);
        assert_eq!(counter.threshold(), 4);

        // Needs to re-earn the (doubled) threshold.
        counter.record();
        counter.record();
        assert!(!counter.should_optimize());
    }
}
