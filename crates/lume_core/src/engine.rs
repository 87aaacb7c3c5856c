//! The learning engine: local training and mesh synchronization.
//!
//! Training flow, once per granted slice:
//!
//! 1. Collect environmental features (power, thermals, mesh, light state)
//! 2. Derive what actually happened since the previous step
//! 3. Forward pass on the current shard with the *previous* features
//! 4. Multi-head loss against the actuals
//! 5. Per-feature gradients, folded into a running average
//! 6. Every tenth sample, apply the average with a resonance-scaled rate
//!
//! The sync task gossips one resident shard round-robin every five seconds
//! and follows it with a heartbeat, unless the neighborhood (or this node's
//! own thermals) says to back off.

use fixed::types::I16F16;

use crate::coherence::{self, CoherenceInputs};
use crate::config::{
    GOSSIP_INTERVAL_MS, LEARNING_RATE_BITS, MAX_SHARDS_IN_RAM, SAMPLES_PER_APPLY, TICKS_PER_US,
};
use crate::gossip::{Gossip, MAX_NEIGHBORS};
use crate::hal::{MeshTx, SectorFlash};
use crate::light::LightController;
use crate::persist::ShardStore;
use crate::sched::{Scheduler, TaskKind, TaskPriority};
use crate::shard::WeightShard;

/// Feature vector width; one byte per signal.
pub const FEATURE_LEN: usize = 16;

/// Prediction heads and the weight stride each one owns.
pub const HEAD_COUNT: usize = 6;
const HEAD_STRIDE: usize = 16;

/// Loss weight per head; scene prediction matters most.
const LOSS_WEIGHTS: [i16; HEAD_COUNT] = [2, 1, 1, 2, 3, 1];

/// A training step needs at least this much budget to be worth starting.
const MIN_TRAINING_BUDGET_US: u32 = 1_000;

/// Local load above which the sync step announces backpressure instead of
/// gossiping; the same line neighbors use to count a peer as overloaded.
const BACKPRESSURE_LOAD: u8 = 80;

/// Environmental snapshot, one signed byte per signal, fed to every head.
///
/// `mesh_activity`, `rssi_avg`, `rssi_variance`, and `hop_count_avg` are
/// sourced from the gossip layer but not yet wired there; they read zero
/// until the mesh stack exposes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LocalFeatures {
    pub power_level: i8,
    /// Chip temperature offset from 40 C.
    pub temperature: i8,
    pub mesh_activity: i8,
    pub neighbor_count: i8,
    pub uptime_phase: i8,
    pub circadian_phase: i8,
    pub rssi_avg: i8,
    pub rssi_variance: i8,
    pub brightness: i8,
    pub color_temp: i8,
    pub scene_id: i8,
    pub brightness_velocity: i8,
    pub hop_count_avg: i8,
    pub shard_diversity: i8,
    pub reserved: [i8; 2],
}

impl LocalFeatures {
    /// The wire/model ordering of the sixteen feature bytes.
    pub fn as_array(&self) -> [i8; FEATURE_LEN] {
        [
            self.power_level,
            self.temperature,
            self.mesh_activity,
            self.neighbor_count,
            self.uptime_phase,
            self.circadian_phase,
            self.rssi_avg,
            self.rssi_variance,
            self.brightness,
            self.color_temp,
            self.scene_id,
            self.brightness_velocity,
            self.hop_count_avg,
            self.shard_diversity,
            self.reserved[0],
            self.reserved[1],
        ]
    }
}

/// What each head is asked to predict for the next step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PredictionTargets {
    pub next_mesh_activity: i8,
    pub next_power_level: i8,
    pub circadian_next: i8,
    pub neighbor_rssi_delta: i8,
    pub next_scene: i8,
    pub temperature_trend: i8,
    pub reserved: [i8; 2],
}

impl PredictionTargets {
    pub fn as_array(&self) -> [i8; HEAD_COUNT] {
        [
            self.next_mesh_activity,
            self.next_power_level,
            self.circadian_next,
            self.neighbor_rssi_delta,
            self.next_scene,
            self.temperature_trend,
        ]
    }

    fn from_array(heads: [i8; HEAD_COUNT]) -> Self {
        PredictionTargets {
            next_mesh_activity: heads[0],
            next_power_level: heads[1],
            circadian_next: heads[2],
            neighbor_rssi_delta: heads[3],
            next_scene: heads[4],
            temperature_trend: heads[5],
            reserved: [0; 2],
        }
    }
}

/// Running average of per-feature gradients, cleared on each application.
#[derive(Debug, Clone, Copy)]
pub struct GradientAccum {
    pub gradients: [i8; FEATURE_LEN],
    pub sample_count: u8,
}

impl GradientAccum {
    const fn new() -> Self {
        GradientAccum {
            gradients: [0; FEATURE_LEN],
            sample_count: 0,
        }
    }

    fn clear(&mut self) {
        *self = Self::new();
    }

    /// Fold a sample into the running average:
    /// `g <- (g * n + sample) / (n + 1)`.
    fn accumulate(&mut self, sample: &[i8; FEATURE_LEN]) {
        let n = self.sample_count as i16;
        for (g, &s) in self.gradients.iter_mut().zip(sample.iter()) {
            *g = ((*g as i16 * n + s as i16) / (n + 1)) as i8;
        }
        self.sample_count = self.sample_count.saturating_add(1);
    }
}

/// Read-only taps the feature collector pulls from the rest of the node.
pub struct FeatureSources<'a> {
    pub light: &'a LightController,
    pub gossip: &'a Gossip,
    /// Scheduler thermal throttle, 0-100.
    pub throttle_percent: u8,
    /// Last sampled chip temperature.
    pub chip_temp_c: i16,
    pub now_tick: u32,
}

pub struct LearningEngine {
    shards: [WeightShard; MAX_SHARDS_IN_RAM],
    grad_accum: GradientAccum,
    current_slot: usize,
    broadcast_slot: usize,
    local_epoch: u16,
    samples_since_sync: u8,
    last_gossip_tick: u32,
    coherence_score: I16F16,
    prev_features: LocalFeatures,
    prev_targets: PredictionTargets,
    store: ShardStore,
}

impl LearningEngine {
    /// Seed the resident window with shards 0..4. Flash recovery happens per
    /// slot through [`LearningEngine::rotate`].
    pub fn new(store: ShardStore) -> Self {
        LearningEngine {
            shards: [
                WeightShard::init(0),
                WeightShard::init(1),
                WeightShard::init(2),
                WeightShard::init(3),
            ],
            grad_accum: GradientAccum::new(),
            current_slot: 0,
            broadcast_slot: 0,
            local_epoch: 0,
            samples_since_sync: 0,
            last_gossip_tick: 0,
            coherence_score: I16F16::ZERO,
            prev_features: LocalFeatures::default(),
            prev_targets: PredictionTargets::default(),
            store,
        }
    }

    /// Register the training and sync tasks with the scheduler.
    pub fn start(&self, sched: &mut Scheduler) {
        if !sched.register(TaskKind::Training, TaskPriority::Low)
            || !sched.register(TaskKind::Sync, TaskPriority::Normal)
        {
            log::warn!("scheduler table full; learning tasks not registered");
        }
    }

    // -------------------------------------------------------------------------
    // Training task (Low priority)
    // -------------------------------------------------------------------------

    /// One training step. Returns whether the task wants more time; a budget
    /// under 1 ms defers the whole step rather than risk running long.
    pub fn training_step(&mut self, budget_us: u32, src: &FeatureSources<'_>) -> bool {
        if budget_us < MIN_TRAINING_BUDGET_US {
            return false;
        }

        let features = self.collect_features(src);
        let actual = self.compute_actual_targets(&features);

        let predicted = forward(&self.shards[self.current_slot], &self.prev_features);
        let error = multi_head_loss(&predicted, &actual);
        let gradients = backward(&self.prev_features, error);

        self.grad_accum.accumulate(&gradients);
        self.samples_since_sync = self.samples_since_sync.saturating_add(1);

        if self.samples_since_sync >= SAMPLES_PER_APPLY {
            let multiplier = coherence::resonance(coherence::coherence(CoherenceInputs {
                throttle_percent: src.throttle_percent,
                neighbor_count: src.gossip.neighbor_count(),
                max_neighbors: MAX_NEIGHBORS as u8,
                light_transitioning: src.light.is_transitioning(),
            }));
            self.coherence_score = multiplier;

            let lr = I16F16::from_bits(LEARNING_RATE_BITS) * multiplier;
            self.shards[self.current_slot].apply_gradient(&self.grad_accum.gradients, lr);
            self.grad_accum.clear();
            self.samples_since_sync = 0;
            self.local_epoch = self.local_epoch.wrapping_add(1);
            log::trace!(
                "epoch {} on shard {}",
                self.local_epoch,
                self.shards[self.current_slot].header.shard_id
            );
        }

        self.prev_features = features;
        self.prev_targets = actual;
        self.current_slot = (self.current_slot + 1) % MAX_SHARDS_IN_RAM;

        true
    }

    fn collect_features(&self, src: &FeatureSources<'_>) -> LocalFeatures {
        let seconds = self.local_epoch as u32 * 10;
        LocalFeatures {
            power_level: src.light.power_estimate() as i8,
            temperature: (src.chip_temp_c - 40).clamp(-128, 127) as i8,
            mesh_activity: 0,
            neighbor_count: src.gossip.neighbor_count() as i8,
            uptime_phase: ((src.now_tick >> 20) & 0x7F) as i8,
            circadian_phase: coherence::circadian_wave(coherence::circadian_phase(seconds)),
            rssi_avg: 0,
            rssi_variance: 0,
            brightness: src.light.brightness() as i8,
            color_temp: src.light.color_temp() as i8,
            scene_id: src.light.detect_scene() as i8,
            brightness_velocity: src.light.brightness_velocity(),
            hop_count_avg: 0,
            shard_diversity: src.gossip.shard_diversity(&self.resident_ids()),
            reserved: [0; 2],
        }
    }

    /// Retrospective supervision: what the last step should have predicted.
    fn compute_actual_targets(&self, current: &LocalFeatures) -> PredictionTargets {
        PredictionTargets {
            next_mesh_activity: current.mesh_activity,
            next_power_level: current.power_level,
            circadian_next: current.circadian_phase,
            neighbor_rssi_delta: current.rssi_avg.wrapping_sub(self.prev_features.rssi_avg),
            next_scene: current.scene_id,
            temperature_trend: current.temperature.wrapping_sub(self.prev_features.temperature),
            reserved: [0; 2],
        }
    }

    // -------------------------------------------------------------------------
    // Sync task (Normal priority)
    // -------------------------------------------------------------------------

    /// Gossip one resident shard and a heartbeat, every gossip interval.
    /// Backpressure (remote or local) resets the interval without sending
    /// weights.
    pub fn sync_step<T: MeshTx>(
        &mut self,
        now: u32,
        gossip: &mut Gossip,
        tx: &mut T,
        throttle_percent: u8,
    ) -> bool {
        let elapsed_ms = now.wrapping_sub(self.last_gossip_tick) / (TICKS_PER_US * 1_000);
        if elapsed_ms < GOSSIP_INTERVAL_MS {
            return false;
        }

        gossip.gc_neighbors(now);

        if throttle_percent > BACKPRESSURE_LOAD {
            gossip.send_backpressure(tx);
            self.last_gossip_tick = now;
            return false;
        }

        if gossip.should_throttle() {
            log::debug!("neighborhood overloaded; deferring gossip");
            self.last_gossip_tick = now;
            return false;
        }

        gossip.broadcast_shard(tx, &self.shards[self.broadcast_slot]);
        self.broadcast_slot = (self.broadcast_slot + 1) % MAX_SHARDS_IN_RAM;

        gossip.send_heartbeat(
            tx,
            throttle_percent,
            MAX_SHARDS_IN_RAM as u8,
            self.local_epoch,
        );

        self.last_gossip_tick = now;
        false
    }

    // -------------------------------------------------------------------------
    // Mesh upcalls
    // -------------------------------------------------------------------------

    /// A complete shard arrived. Resident ids merge in place; anything else
    /// is written through to flash for a later rotation to pick up.
    pub fn on_shard_received<F: SectorFlash>(&mut self, incoming: &WeightShard, flash: &mut F) {
        for shard in self.shards.iter_mut() {
            if shard.header.shard_id == incoming.header.shard_id {
                shard.fed_avg(incoming);
                return;
            }
        }
        if !incoming.verify() {
            return;
        }
        if let Err(e) = self.store.write(flash, incoming) {
            // The ping-pong pair still holds the previous copy.
            log::warn!("write-through of shard {} failed: {e}", incoming.header.shard_id);
        }
    }

    /// A neighbor asked for a shard. Serve it from RAM unless the
    /// neighborhood is already saturated.
    pub fn on_shard_request<T: MeshTx>(&mut self, shard_id: u8, gossip: &mut Gossip, tx: &mut T) {
        if gossip.should_throttle() {
            return;
        }
        if let Some(shard) = self.shards.iter().find(|s| s.header.shard_id == shard_id) {
            gossip.broadcast_shard(tx, shard);
        }
    }

    // -------------------------------------------------------------------------
    // Shard rotation
    // -------------------------------------------------------------------------

    /// Swap a resident slot to a different shard id: persist the occupant,
    /// then load the newcomer from flash or seed it fresh.
    pub fn rotate<F: SectorFlash>(&mut self, slot: usize, new_id: u8, flash: &mut F) {
        if slot >= MAX_SHARDS_IN_RAM {
            return;
        }
        if let Err(e) = self.store.write(flash, &self.shards[slot]) {
            log::warn!("persisting shard {} failed: {e}", self.shards[slot].header.shard_id);
        }
        self.shards[slot] = match self.store.read(flash, new_id) {
            Ok(shard) => shard,
            Err(e) => {
                log::debug!("shard {new_id} not recoverable ({e}); seeding fresh");
                WeightShard::init(new_id)
            }
        };
    }

    /// Persist every resident shard, ahead of a planned power-down.
    pub fn persist_all<F: SectorFlash>(&mut self, flash: &mut F) {
        for shard in self.shards.iter() {
            if let Err(e) = self.store.write(flash, shard) {
                log::warn!("shutdown flush of shard {} failed: {e}", shard.header.shard_id);
            }
        }
    }

    // -------------------------------------------------------------------------
    // Introspection
    // -------------------------------------------------------------------------

    pub fn local_epoch(&self) -> u16 {
        self.local_epoch
    }

    pub fn shards_held(&self) -> u8 {
        MAX_SHARDS_IN_RAM as u8
    }

    pub fn current_shard_id(&self) -> u8 {
        self.shards[self.current_slot].header.shard_id
    }

    /// Resonance multiplier recorded at the last gradient application.
    pub fn coherence_score(&self) -> I16F16 {
        self.coherence_score
    }

    pub fn shard(&self, slot: usize) -> &WeightShard {
        &self.shards[slot]
    }

    pub fn resident_ids(&self) -> [u8; MAX_SHARDS_IN_RAM] {
        let mut ids = [0u8; MAX_SHARDS_IN_RAM];
        for (id, shard) in ids.iter_mut().zip(self.shards.iter()) {
            *id = shard.header.shard_id;
        }
        ids
    }
}

// -----------------------------------------------------------------------------
// Model math (free functions: pure, integer-only)
// -----------------------------------------------------------------------------

/// Six independent linear heads; head `h` owns weights `[16h, 16h + 16)`.
/// Output is `clamp((sum_i w_i * feat_i) >> 6)` per head.
pub fn forward(shard: &WeightShard, features: &LocalFeatures) -> PredictionTargets {
    let feat = features.as_array();
    let mut heads = [0i8; HEAD_COUNT];
    for (h, out) in heads.iter_mut().enumerate() {
        let offset = h * HEAD_STRIDE;
        let sum: i32 = feat
            .iter()
            .enumerate()
            .map(|(i, &f)| shard.weights[offset + i] as i32 * f as i32)
            .sum();
        *out = (sum >> 6).clamp(-128, 127) as i8;
    }
    PredictionTargets::from_array(heads)
}

/// Weighted sum of absolute per-head errors, averaged by 10, clamped to i8.
pub fn multi_head_loss(predicted: &PredictionTargets, actual: &PredictionTargets) -> i8 {
    let p = predicted.as_array();
    let a = actual.as_array();
    let total: i16 = p
        .iter()
        .zip(a.iter())
        .zip(LOSS_WEIGHTS.iter())
        .map(|((&p, &a), &w)| (p as i16 - a as i16).abs() * w)
        .sum();
    (total / 10).min(127) as i8
}

/// Per-feature gradient: `clamp(error * feat_i / 16)`.
pub fn backward(features: &LocalFeatures, error: i8) -> [i8; FEATURE_LEN] {
    let feat = features.as_array();
    let mut gradients = [0i8; FEATURE_LEN];
    for (g, &f) in gradients.iter_mut().zip(feat.iter()) {
        let raw = error as i16 * f as i16 / 16;
        *g = raw.clamp(-128, 127) as i8;
    }
    gradients
}
