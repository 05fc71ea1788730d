// Trainer callbacks

use crate::config::constants::MEMORY_CHECK_INTERVAL;
use crate::models::MemoryUsage;

/// Progress of a training run, handed to callbacks after every optimizer step
#[derive(Debug, Clone, Default)]
pub struct TrainerState {
    /// Optimizer steps taken so far
    pub global_step: usize,
    pub max_steps: usize,
    /// Fractional epoch (1.5 = halfway through the second epoch)
    pub epoch: f64,
    /// Mean micro-batch loss of the last step
    pub loss: f64,
    pub learning_rate: f64,
    pub best_eval_loss: Option<f64>,
}

/// Hook into the training loop
pub trait TrainerCallback: Send {
    fn on_step_end(&mut self, state: &TrainerState);

    fn on_evaluate(&mut self, _state: &TrainerState, _eval_loss: f64) {}
}

type MemoryProbe = Box<dyn Fn() -> MemoryUsage + Send>;

/// Warns when process memory grows past a limit
pub struct MemoryMonitor {
    limit_gb: f64,
    interval: usize,
    probe: MemoryProbe,
    warnings: usize,
}

impl MemoryMonitor {
    pub fn new(limit_gb: f64) -> Self {
        Self::with_probe(limit_gb, Box::new(MemoryUsage::current))
    }

    pub fn with_probe(limit_gb: f64, probe: MemoryProbe) -> Self {
        Self {
            limit_gb,
            interval: MEMORY_CHECK_INTERVAL,
            probe,
            warnings: 0,
        }
    }

    /// Number of high-memory warnings emitted so far
    pub fn warnings(&self) -> usize {
        self.warnings
    }
}

impl TrainerCallback for MemoryMonitor {
    fn on_step_end(&mut self, state: &TrainerState) {
        if state.global_step % self.interval != 0 {
            return;
        }
        let usage = (self.probe)();
        if usage.exceeds(self.limit_gb) {
            self.warnings += 1;
            tracing::warn!(
                step = state.global_step,
                "High memory usage: {:.2} GB (limit {:.2} GB)",
                usage.allocated_gb,
                self.limit_gb
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(allocated_gb: f64) -> MemoryUsage {
        MemoryUsage {
            allocated_gb,
            used_gb: allocated_gb,
            total_gb: 16.0,
            free_gb: 16.0 - allocated_gb,
        }
    }

    fn state(global_step: usize) -> TrainerState {
        TrainerState {
            global_step,
            ..Default::default()
        }
    }

    #[test]
    fn test_monitor_checks_every_interval() {
        let mut monitor = MemoryMonitor::with_probe(7.5, Box::new(|| usage(9.0)));
        for step in 1..=25 {
            monitor.on_step_end(&state(step));
        }
        // steps 10 and 20
        assert_eq!(monitor.warnings(), 2);
    }

    #[test]
    fn test_monitor_quiet_under_limit() {
        let mut monitor = MemoryMonitor::with_probe(7.5, Box::new(|| usage(3.2)));
        monitor.on_step_end(&state(10));
        assert_eq!(monitor.warnings(), 0);
    }
}
