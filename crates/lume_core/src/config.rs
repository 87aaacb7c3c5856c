//! Resource budget for the target part.
//!
//! Sized for a smart-bulb MCU class device: 64 KiB SRAM (~40 KiB usable
//! beside the radio stack), 512 KiB flash, 48 MHz integer-only CPU, low-power
//! mesh radio. Every constant below is a hard budget, not a tunable.

// =============================================================================
// Memory budget (bytes)
// =============================================================================

/// One weight shard, header included.
pub const WEIGHT_SHARD_SIZE: usize = 4 * 1024;

/// Mesh transport MTU after the vendor-model envelope.
pub const MESH_MSG_MAX_SIZE: usize = 380;

// =============================================================================
// Model sharding
// =============================================================================

/// Shards resident in RAM (a sliding window over the full model).
pub const MAX_SHARDS_IN_RAM: usize = 4;

/// Shards in the full fleet-wide model.
pub const TOTAL_MODEL_SHARDS: usize = 64;

// =============================================================================
// Federated learning
// =============================================================================

/// Base learning rate before resonance modulation (Q16.16 raw bits, 0.001).
pub const LEARNING_RATE_BITS: i32 = 66;

/// Gradient applications are batched: one apply per this many samples.
pub const SAMPLES_PER_APPLY: u8 = 10;

/// Weight broadcast period in milliseconds.
pub const GOSSIP_INTERVAL_MS: u32 = 5_000;

/// Neighbors unheard for this long are garbage-collected.
pub const NEIGHBOR_TIMEOUT_MS: u32 = 30_000;

// =============================================================================
// Hardware safety
// =============================================================================

/// Throttling begins above this chip temperature (degrees C).
pub const TEMP_THROTTLE_C: i16 = 55;

/// All learning work stops at or above this temperature.
pub const TEMP_SHUTDOWN_C: i16 = 70;

// =============================================================================
// Scheduler timeslots
// =============================================================================

/// Guard interval before the next radio event. Exceeding it is a correctness
/// violation of the radio stack's public contract, not a soft deadline.
pub const RADIO_GUARD_US: u32 = 2_000;

/// Maximum single learning burst.
pub const SLICE_BURST_US: u32 = 5_000;

/// Slices shorter than this are not worth the dispatch overhead.
pub const SLICE_MIN_US: u32 = 100;

/// System tick rate: ticks per microsecond.
pub const TICKS_PER_US: u32 = 16;

/// Milliseconds to ticks.
#[inline]
pub const fn ms_to_ticks(ms: u32) -> u32 {
    ms.wrapping_mul(TICKS_PER_US).wrapping_mul(1_000)
}
