//! lume_core: the on-device runtime of a federated smart-lighting node.
//!
//! Each node is a lighting endpoint first and a training participant second.
//! The full model is sharded across the fleet in 4 KiB weight shards; nodes
//! train locally during radio-idle windows, gossip shards over the mesh
//! vendor model, and merge incoming shards via contributor-weighted
//! federated averaging.
//!
//! The crate is `no_std` and allocation-free after construction: every
//! buffer is statically sized for a ~64 KiB SRAM part. Hardware access goes
//! through the narrow traits in [`hal`]; the [`node::LightNode`] glue layer
//! wires the components to a concrete [`hal::Platform`].
//!
//! Layering, leaves first:
//!
//! - [`shard`]    - weight shard with CRC-16 integrity and FedAvg
//! - [`persist`]  - ping-pong wear-leveled flash storage
//! - [`light`]    - PWM lighting state machine (the bulb's first job)
//! - [`sched`]    - cooperative time-slicer under a thermal budget
//! - [`gossip`]   - mesh vendor protocol: framing, reassembly, neighbors
//! - [`coherence`] - fixed-point resonance curve and circadian encoding
//! - [`engine`]   - multi-head fixed-point training loop
//! - [`node`]     - static construction and radio/idle callbacks

#![cfg_attr(not(any(test, feature = "sim")), no_std)]
#![deny(unsafe_code)]

pub mod coherence;
pub mod config;
pub mod engine;
pub mod gossip;
pub mod hal;
pub mod light;
pub mod node;
pub mod persist;
pub mod sched;
pub mod shard;

pub use engine::{LearningEngine, LocalFeatures, PredictionTargets};
pub use gossip::{Gossip, RxEvent};
pub use light::{LightController, Scene};
pub use node::LightNode;
pub use persist::ShardStore;
pub use sched::{Scheduler, TaskKind, TaskPriority};
pub use shard::WeightShard;
