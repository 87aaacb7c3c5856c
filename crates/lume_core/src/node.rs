//! Node glue: static construction and the three entry points the radio
//! stack drives.
//!
//! Construction order is fixed (lights, scheduler, gossip, engine) and
//! nothing here re-enters itself: the radio receive callback, the idle
//! callback, and the 50 Hz main-loop poll are dispatched serially by the
//! radio stack, so every component sees single-threaded access by
//! construction.

use crate::config::{ms_to_ticks, TICKS_PER_US};
use crate::engine::{FeatureSources, LearningEngine};
use crate::gossip::{Gossip, RxEvent};
use crate::hal::Platform;
use crate::light::LightController;
use crate::persist::ShardStore;
use crate::sched::{Scheduler, TaskKind};

/// Light transitions advance every 20 ms.
const LIGHT_TICK_TICKS: u32 = ms_to_ticks(20);

/// One mesh lighting node: the lighting endpoint and its federated-learning
/// sidecar, wired to a concrete platform.
pub struct LightNode<P: Platform> {
    platform: P,
    light: LightController,
    sched: Scheduler,
    gossip: Gossip,
    engine: LearningEngine,
    last_light_tick: u32,
}

impl<P: Platform> LightNode<P> {
    /// Bring the node up. `mesh_addr` is the provisioned unicast address.
    pub fn new(platform: P, mesh_addr: u16) -> Self {
        let light = LightController::new();
        let mut sched = Scheduler::new();
        let gossip = Gossip::new(mesh_addr);
        let engine = LearningEngine::new(ShardStore::default());
        engine.start(&mut sched);
        log::info!("node {mesh_addr:04x} up, {} tasks", sched.task_count());

        LightNode {
            platform,
            light,
            sched,
            gossip,
            engine,
            last_light_tick: 0,
        }
    }

    // -------------------------------------------------------------------------
    // Entry points (registered with the radio stack)
    // -------------------------------------------------------------------------

    /// Vendor-model receive callback.
    pub fn on_vendor_message(&mut self, data: &[u8], src: u16, rssi: i8) {
        let now = self.platform.now();
        match self.gossip.on_receive(data, src, rssi, now) {
            Some(RxEvent::Shard(shard)) => {
                self.engine.on_shard_received(&shard, &mut self.platform);
            }
            Some(RxEvent::ShardRequest(id)) => {
                self.engine
                    .on_shard_request(id, &mut self.gossip, &mut self.platform);
            }
            None => {}
        }
    }

    /// Standard light-control receive callback. Applied or latched
    /// immediately; nothing on this path can fail or wait.
    pub fn on_light_command(&mut self, brightness: u8, temp: u8, transition_ms: u16) {
        self.light
            .set_target(&mut self.platform, brightness, temp, transition_ms);
    }

    /// Radio-stack idle callback: the only place learning work runs.
    pub fn on_radio_idle(&mut self) {
        let Some(slice) = self.sched.begin_slice(&mut self.platform) else {
            return;
        };
        let started = self.platform.now();

        let wants_more = match slice.kind {
            TaskKind::Training => {
                let src = FeatureSources {
                    light: &self.light,
                    gossip: &self.gossip,
                    throttle_percent: self.sched.throttle_level(),
                    chip_temp_c: self.sched.current_temp(),
                    now_tick: started,
                };
                self.engine.training_step(slice.budget_us, &src)
            }
            TaskKind::Sync => {
                let throttle = self.sched.throttle_level();
                self.engine
                    .sync_step(started, &mut self.gossip, &mut self.platform, throttle)
            }
        };

        let elapsed_us = self.platform.now().wrapping_sub(started) / TICKS_PER_US;
        self.sched
            .finish_slice(slice.kind, started, elapsed_us, wants_more);
    }

    /// Main-loop poll; advances light transitions at 50 Hz.
    pub fn poll_light(&mut self) {
        let now = self.platform.now();
        if now.wrapping_sub(self.last_light_tick) >= LIGHT_TICK_TICKS {
            self.light.tick(&mut self.platform);
            self.last_light_tick = now;
        }
    }

    /// Swap a resident shard slot to a different shard id.
    pub fn rotate_shard(&mut self, slot: usize, new_id: u8) {
        self.engine.rotate(slot, new_id, &mut self.platform);
    }

    /// Flush all resident shards to flash ahead of a planned power-down.
    pub fn on_shutdown(&mut self) {
        self.engine.persist_all(&mut self.platform);
    }

    // -------------------------------------------------------------------------
    // Introspection
    // -------------------------------------------------------------------------

    pub fn light(&self) -> &LightController {
        &self.light
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.sched
    }

    pub fn gossip(&self) -> &Gossip {
        &self.gossip
    }

    pub fn engine(&self) -> &LearningEngine {
        &self.engine
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn platform_mut(&mut self) -> &mut P {
        &mut self.platform
    }
}
