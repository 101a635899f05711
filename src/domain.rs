//! Validated domain values for relay tunables
//!
//! Strongly-typed wrappers around the knobs exposed on the command line
//! and in the configuration file, so out-of-range values are rejected at
//! the edge instead of surfacing as misbehaviour deep in the pipeline.

use nutype::nutype;

/// Capacity of a per-destination queue, in metric lines
#[nutype(
    validate(greater_or_equal = 8, less_or_equal = 100_000_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 25_000
)]
pub struct QueueCapacity(usize);

impl QueueCapacity {
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

/// Number of metrics a sender writes out per batch
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 1_000_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 2500
)]
pub struct BatchSize(usize);

impl BatchSize {
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

/// Consecutive stalls tolerated on one enqueue before converting to a drop
#[nutype(
    validate(less_or_equal = 15),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 4
)]
pub struct MaxStalls(usize);

impl MaxStalls {
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

/// Number of dispatcher workers
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 512),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into
    )
)]
pub struct WorkerCount(usize);

impl WorkerCount {
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

/// Socket I/O timeout in milliseconds
#[nutype(
    validate(greater_or_equal = 50, less_or_equal = 600_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 600
)]
pub struct IoTimeoutMs(u64);

impl IoTimeoutMs {
    #[must_use]
    pub fn as_duration(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.into_inner())
    }

    #[must_use]
    pub fn as_u64(&self) -> u64 {
        self.into_inner()
    }
}

/// Interval between self-statistics submissions, in seconds
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 3600),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 60
)]
pub struct StatsInterval(u64);

impl StatsInterval {
    #[must_use]
    pub fn as_secs(&self) -> u64 {
        self.into_inner()
    }
}

/// Upper bound on one metric line, terminator included
#[nutype(
    validate(greater_or_equal = 64, less_or_equal = 1_048_576),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 32_768
)]
pub struct MaxLineLength(usize);

impl MaxLineLength {
    #[must_use]
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}
