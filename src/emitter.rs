//! Phase observers for collection cycles.

use crate::stats::CycleStats;

/// Observer invoked at the phase boundaries of every cycle. All hooks default
/// to no-ops, so an implementation overrides only the boundaries it cares
/// about. Hooks run on the thread driving the cycle and must not call back
/// into the heap.
pub trait Emitter {
    fn cycle_start(&mut self) {}
    fn mark_start(&mut self) {}
    fn mark_end(&mut self) {}
    fn sweep_start(&mut self) {}
    fn sweep_end(&mut self) {}
    fn cycle_end(&mut self, _stats: &CycleStats) {}
}

/// Ignores every phase.
#[derive(Default)]
pub struct NullEmitter;

impl Emitter for NullEmitter {}

#[cfg(feature = "emitter-log")]
pub use self::log::LogEmitter;

#[cfg(feature = "emitter-log")]
mod log {
    use std::time::{Duration, Instant};

    use super::Emitter;
    use crate::stats::CycleStats;

    /// Emits per-phase timings and cycle statistics through `tracing`, and
    /// accumulates totals across cycles.
    #[derive(Default)]
    pub struct LogEmitter {
        cycle_began: Option<Instant>,
        phase_began: Option<Instant>,
        mark_elapsed: Duration,
        sweep_elapsed: Duration,
        cycles: u64,
        total_mark: Duration,
        total_sweep: Duration,
        total_collected: usize,
    }

    impl LogEmitter {
        pub fn new() -> Self {
            Self::default()
        }

        /// Cycles observed so far.
        pub fn cycles(&self) -> u64 {
            self.cycles
        }

        /// Accumulated (mark, sweep) time across all observed cycles.
        pub fn totals(&self) -> (Duration, Duration) {
            (self.total_mark, self.total_sweep)
        }
    }

    impl Emitter for LogEmitter {
        fn cycle_start(&mut self) {
            self.cycle_began = Some(Instant::now());
            self.mark_elapsed = Duration::ZERO;
            self.sweep_elapsed = Duration::ZERO;
        }

        fn mark_start(&mut self) {
            self.phase_began = Some(Instant::now());
        }

        fn mark_end(&mut self) {
            if let Some(began) = self.phase_began.take() {
                self.mark_elapsed = began.elapsed();
            }
        }

        fn sweep_start(&mut self) {
            self.phase_began = Some(Instant::now());
        }

        fn sweep_end(&mut self) {
            if let Some(began) = self.phase_began.take() {
                self.sweep_elapsed = began.elapsed();
            }
        }

        fn cycle_end(&mut self, stats: &CycleStats) {
            self.cycles += 1;
            self.total_mark += self.mark_elapsed;
            self.total_sweep += self.sweep_elapsed;
            self.total_collected += stats.collected;
            let total = self.cycle_began.take().map_or(Duration::ZERO, |t| t.elapsed());
            tracing::debug!(
                cycle = self.cycles,
                on_stack = stats.on_stack,
                traced = stats.traced,
                retained = stats.retained,
                collected = stats.collected,
                mark_us = self.mark_elapsed.as_micros() as u64,
                sweep_us = self.sweep_elapsed.as_micros() as u64,
                total_us = total.as_micros() as u64,
                "gc cycle"
            );
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn accumulates_across_cycles() {
            let mut emitter = LogEmitter::new();
            for _ in 0..3 {
                emitter.cycle_start();
                emitter.mark_start();
                emitter.mark_end();
                emitter.sweep_start();
                emitter.sweep_end();
                emitter.cycle_end(&CycleStats {
                    collected: 2,
                    ..CycleStats::default()
                });
            }
            assert_eq!(emitter.cycles(), 3);
            assert_eq!(emitter.total_collected, 6);
        }
    }
}
