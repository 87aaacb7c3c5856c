//! Cooperative time-slicer for learning work.
//!
//! The radio stack owns the CPU; this scheduler only fills the idle windows
//! it is handed. Each slice computes how many microseconds remain before the
//! next radio event, subtracts a guard interval, caps the burst, scales by
//! the thermal throttle, and hands the budget to the single best runnable
//! task. Tasks yield voluntarily; the budget is sized so a well-behaved task
//! can never cross the guard.
//!
//! Lighting is never scheduled here: it is driven by radio commands and the
//! 50 Hz main loop directly, so it cannot queue behind learning work.

use heapless::Vec;

use crate::config::{
    RADIO_GUARD_US, SLICE_BURST_US, SLICE_MIN_US, TEMP_SHUTDOWN_C, TEMP_THROTTLE_C, TICKS_PER_US,
};
use crate::hal::{Clock, RadioTiming, ThermalAdc};

pub const MAX_TASKS: usize = 8;

/// Thermal samples are taken every Nth slice to keep ADC overhead off the
/// idle path (roughly 1 Hz at typical idle-callback rates).
const THERMAL_SAMPLE_PERIOD: u8 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Idle,
    Running,
    Throttled,
    Killed,
}

/// Lower value = higher semantic priority. Critical is reserved for the
/// radio stack itself and never scheduled by this core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum TaskPriority {
    Critical = 0,
    High = 1,
    Normal = 2,
    Low = 3,
}

/// The closed set of work this core schedules. A tagged variant instead of
/// function pointers: the glue layer dispatches on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// Local gradient work (Low priority).
    Training,
    /// Gossip broadcast and heartbeat (Normal priority).
    Sync,
}

#[derive(Debug, Clone, Copy)]
pub struct TaskSlot {
    pub kind: TaskKind,
    pub priority: TaskPriority,
    pub state: TaskState,
    pub last_run_tick: u32,
    pub total_runtime_us: u32,
    pub run_count: u16,
    /// Set when the last dispatch declined more work; such a task sits out
    /// one slice so lower-priority tasks are not starved by a front-runner
    /// that has nothing to do.
    yielded: bool,
}

/// A dispatch grant: which task to run and how long it may take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slice {
    pub kind: TaskKind,
    pub budget_us: u32,
}

pub struct Scheduler {
    tasks: Vec<TaskSlot, MAX_TASKS>,
    current_temp_c: i16,
    throttle_level: u8,
    thermal_counter: u8,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler {
            tasks: Vec::new(),
            current_temp_c: 25,
            throttle_level: 0,
            thermal_counter: 0,
        }
    }

    /// Add a task. Rejected silently (false) when the table is full.
    pub fn register(&mut self, kind: TaskKind, priority: TaskPriority) -> bool {
        let slot = TaskSlot {
            kind,
            priority,
            state: TaskState::Idle,
            last_run_tick: 0,
            total_runtime_us: 0,
            run_count: 0,
            yielded: false,
        };
        self.tasks.push(slot).is_ok()
    }

    /// Compute this idle window's grant, if any. The caller dispatches the
    /// returned task and reports back through [`Scheduler::finish_slice`].
    ///
    /// The budget is `(next_event - now - guard) / ticks_per_us`, capped at
    /// the burst maximum and scaled by the thermal throttle. Under the
    /// minimum, or at 100 % throttle, nothing is granted.
    pub fn begin_slice<P>(&mut self, platform: &mut P) -> Option<Slice>
    where
        P: Clock + RadioTiming + ThermalAdc,
    {
        self.update_thermals(platform);

        if self.throttle_level >= 100 {
            return None;
        }

        let now = platform.now();
        let delta = platform.next_event_tick().wrapping_sub(now);
        if delta > i32::MAX as u32 {
            // Next event already passed (or the horizon wrapped): no window.
            return None;
        }
        let guard_ticks = RADIO_GUARD_US * TICKS_PER_US;
        let available_ticks = delta.saturating_sub(guard_ticks);

        let mut budget_us = available_ticks / TICKS_PER_US;
        budget_us = budget_us.min(SLICE_BURST_US);
        budget_us = budget_us * (100 - self.throttle_level as u32) / 100;
        if budget_us < SLICE_MIN_US {
            return None;
        }

        let throttle = self.throttle_level;
        let runnable = |t: &TaskSlot| {
            t.state != TaskState::Killed && !(t.state == TaskState::Throttled && throttle > 50)
        };

        // Highest semantic priority among tasks that did not just yield;
        // a slice where everyone yielded falls back to the plain ordering.
        let pick = self
            .tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| runnable(t) && !t.yielded)
            .min_by_key(|(_, t)| t.priority)
            .or_else(|| {
                self.tasks
                    .iter()
                    .enumerate()
                    .filter(|(_, t)| runnable(t))
                    .min_by_key(|(_, t)| t.priority)
            })?
            .0;

        // Tasks passed over this round become eligible again next round.
        for (i, task) in self.tasks.iter_mut().enumerate() {
            if i != pick {
                task.yielded = false;
            }
        }

        let best = &mut self.tasks[pick];
        best.state = TaskState::Running;
        Some(Slice {
            kind: best.kind,
            budget_us,
        })
    }

    /// Record a completed dispatch: elapsed time, run count, back to idle.
    /// `wants_more` is the task's advisory return; declining sits the task
    /// out for one slice.
    pub fn finish_slice(
        &mut self,
        kind: TaskKind,
        started_at_tick: u32,
        elapsed_us: u32,
        wants_more: bool,
    ) {
        for task in self.tasks.iter_mut() {
            if task.kind == kind && task.state == TaskState::Running {
                task.total_runtime_us = task.total_runtime_us.saturating_add(elapsed_us);
                task.run_count = task.run_count.wrapping_add(1);
                task.last_run_tick = started_at_tick;
                task.state = TaskState::Idle;
                task.yielded = !wants_more;
                return;
            }
        }
    }

    /// Current thermal throttle, 0-100. 100 means learning is suspended.
    pub fn throttle_level(&self) -> u8 {
        self.throttle_level
    }

    /// Last sampled chip temperature in degrees C.
    pub fn current_temp(&self) -> i16 {
        self.current_temp_c
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Rough learning duty-cycle estimate from cumulative runtimes.
    pub fn learning_duty_cycle(&self) -> u8 {
        let total: u32 = self
            .tasks
            .iter()
            .filter(|t| t.priority >= TaskPriority::Normal)
            .map(|t| t.total_runtime_us)
            .sum();
        ((total / 10_000) % 100) as u8
    }

    fn update_thermals<A: ThermalAdc>(&mut self, adc: &mut A) {
        self.thermal_counter = self.thermal_counter.wrapping_add(1);
        if self.thermal_counter < THERMAL_SAMPLE_PERIOD {
            return;
        }
        self.thermal_counter = 0;

        let raw = adc.sample_temp_raw();
        self.current_temp_c = (raw as i16 - 1100) / 4;

        let prev = self.throttle_level;
        self.throttle_level = if self.current_temp_c >= TEMP_SHUTDOWN_C {
            100
        } else if self.current_temp_c >= TEMP_THROTTLE_C {
            ((self.current_temp_c - TEMP_THROTTLE_C) as u32 * 100
                / (TEMP_SHUTDOWN_C - TEMP_THROTTLE_C) as u32) as u8
        } else {
            0
        };
        if self.throttle_level != prev {
            log::debug!(
                "thermal throttle {}% at {}C",
                self.throttle_level,
                self.current_temp_c
            );
        }
    }

    /// Force an immediate thermal sample on the next slice.
    #[cfg(any(test, feature = "sim"))]
    pub fn force_thermal_sample(&mut self) {
        self.thermal_counter = THERMAL_SAMPLE_PERIOD - 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::sim::SimPlatform;

    fn sched_with_tasks() -> Scheduler {
        let mut s = Scheduler::new();
        assert!(s.register(TaskKind::Training, TaskPriority::Low));
        assert!(s.register(TaskKind::Sync, TaskPriority::Normal));
        s
    }

    #[test]
    fn task_table_caps_at_eight() {
        let mut s = Scheduler::new();
        for _ in 0..MAX_TASKS {
            assert!(s.register(TaskKind::Training, TaskPriority::Low));
        }
        assert!(!s.register(TaskKind::Sync, TaskPriority::Normal));
        assert_eq!(s.task_count(), MAX_TASKS);
    }

    #[test]
    fn no_slice_without_radio_window() {
        let mut p = SimPlatform::new();
        let mut s = sched_with_tasks();
        // Next event closer than the guard interval.
        p.radio_event_in_us(RADIO_GUARD_US / 2);
        assert_eq!(s.begin_slice(&mut p), None);
    }

    #[test]
    fn budget_respects_guard_and_burst_cap() {
        let mut p = SimPlatform::new();
        let mut s = sched_with_tasks();

        // A 3 ms window leaves 1 ms after the 2 ms guard.
        p.radio_event_in_us(3_000);
        let slice = s.begin_slice(&mut p).unwrap();
        assert_eq!(slice.budget_us, 1_000);
        s.finish_slice(slice.kind, p.now(), 500, true);

        // A huge window is capped at the burst maximum.
        p.radio_event_in_us(1_000_000);
        let slice = s.begin_slice(&mut p).unwrap();
        assert_eq!(slice.budget_us, SLICE_BURST_US);
    }

    #[test]
    fn budget_never_crosses_guard() {
        let mut p = SimPlatform::new();
        let mut s = sched_with_tasks();
        for window_us in [2_100u32, 2_500, 4_000, 9_000, 50_000] {
            p.radio_event_in_us(window_us);
            if let Some(slice) = s.begin_slice(&mut p) {
                // Even spent fully, the slice ends before the guard begins.
                assert!(
                    slice.budget_us + RADIO_GUARD_US <= window_us,
                    "window {window_us}"
                );
                s.finish_slice(slice.kind, p.now(), slice.budget_us, true);
            }
        }
    }

    #[test]
    fn sub_minimum_budget_is_refused() {
        let mut p = SimPlatform::new();
        let mut s = sched_with_tasks();
        p.radio_event_in_us(RADIO_GUARD_US + SLICE_MIN_US - 1);
        assert_eq!(s.begin_slice(&mut p), None);
    }

    #[test]
    fn highest_priority_runnable_task_wins() {
        let mut p = SimPlatform::new();
        let mut s = sched_with_tasks();
        p.radio_event_in_us(10_000);
        // Sync (Normal) outranks Training (Low).
        let slice = s.begin_slice(&mut p).unwrap();
        assert_eq!(slice.kind, TaskKind::Sync);
    }

    #[test]
    fn declining_task_sits_out_one_slice() {
        let mut p = SimPlatform::new();
        let mut s = sched_with_tasks();
        p.radio_event_in_us(10_000);

        // Sync runs first but has nothing to do; Training takes the next
        // slice, then Sync is eligible again.
        let mut order = [TaskKind::Sync; 4];
        for slot in order.iter_mut() {
            let slice = s.begin_slice(&mut p).unwrap();
            *slot = slice.kind;
            let wants_more = slice.kind == TaskKind::Training;
            s.finish_slice(slice.kind, p.now(), 100, wants_more);
        }
        assert_eq!(
            order,
            [
                TaskKind::Sync,
                TaskKind::Training,
                TaskKind::Sync,
                TaskKind::Training
            ]
        );
    }

    #[test]
    fn finish_slice_updates_accounting() {
        let mut p = SimPlatform::new();
        let mut s = sched_with_tasks();
        p.radio_event_in_us(10_000);
        let slice = s.begin_slice(&mut p).unwrap();
        let started = p.now();
        s.finish_slice(slice.kind, started, 800, true);

        let task = s.tasks.iter().find(|t| t.kind == slice.kind).unwrap();
        assert_eq!(task.run_count, 1);
        assert_eq!(task.total_runtime_us, 800);
        assert_eq!(task.last_run_tick, started);
        assert_eq!(task.state, TaskState::Idle);
    }

    #[test]
    fn throttle_ramps_linearly_between_thresholds() {
        let mut p = SimPlatform::new();
        let mut s = sched_with_tasks();
        p.radio_event_in_us(10_000);

        for (temp, want) in [(54, 0u8), (55, 0), (58, 20), (62, 46), (70, 100), (80, 100)] {
            p.set_temp_c(temp);
            s.force_thermal_sample();
            if let Some(slice) = s.begin_slice(&mut p) {
                s.finish_slice(slice.kind, p.now(), 0, true);
            }
            assert_eq!(s.throttle_level(), want, "temp {temp}");
        }
    }

    #[test]
    fn full_throttle_suspends_all_dispatch() {
        let mut p = SimPlatform::new();
        let mut s = sched_with_tasks();
        p.radio_event_in_us(10_000);
        p.set_temp_c(75);
        s.force_thermal_sample();
        assert_eq!(s.begin_slice(&mut p), None);
        assert_eq!(s.throttle_level(), 100);

        // Cooling below the low threshold restores dispatch.
        p.set_temp_c(40);
        s.force_thermal_sample();
        assert!(s.begin_slice(&mut p).is_some());
    }

    #[test]
    fn throttle_scales_budget() {
        let mut p = SimPlatform::new();
        let mut s = sched_with_tasks();
        p.radio_event_in_us(1_000_000);
        p.set_temp_c(62); // 46 % throttle
        s.force_thermal_sample();
        let slice = s.begin_slice(&mut p).unwrap();
        assert_eq!(slice.budget_us, SLICE_BURST_US * (100 - 46) / 100);
    }
}
