// Learning-rate schedule

/// Linear warmup from zero to `base_lr`, then linear decay to zero at
/// `total_steps`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearWarmup {
    pub base_lr: f64,
    pub warmup_steps: usize,
    pub total_steps: usize,
}

impl LinearWarmup {
    pub fn new(base_lr: f64, warmup_steps: usize, total_steps: usize) -> Self {
        Self {
            base_lr,
            warmup_steps,
            total_steps,
        }
    }

    /// Learning rate for the optimizer step with index `step` (0-based)
    pub fn lr_at(&self, step: usize) -> f64 {
        if step < self.warmup_steps {
            return self.base_lr * step as f64 / self.warmup_steps.max(1) as f64;
        }
        let decay_steps = self.total_steps.saturating_sub(self.warmup_steps).max(1);
        let remaining = self.total_steps.saturating_sub(step);
        self.base_lr * (remaining as f64 / decay_steps as f64).max(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warmup_then_decay() {
        let schedule = LinearWarmup::new(1e-3, 10, 110);
        assert_eq!(schedule.lr_at(0), 0.0);
        assert!((schedule.lr_at(5) - 5e-4).abs() < 1e-12);
        assert!((schedule.lr_at(10) - 1e-3).abs() < 1e-12);
        assert!((schedule.lr_at(60) - 5e-4).abs() < 1e-12);
        assert_eq!(schedule.lr_at(110), 0.0);
        assert_eq!(schedule.lr_at(500), 0.0);
    }

    #[test]
    fn test_no_warmup_starts_at_base() {
        let schedule = LinearWarmup::new(0.1, 0, 4);
        assert_eq!(schedule.lr_at(0), 0.1);
        assert!((schedule.lr_at(2) - 0.05).abs() < 1e-12);
    }

    #[test]
    fn test_warmup_longer_than_run() {
        // decay never starts; lr keeps ramping until the run ends
        let schedule = LinearWarmup::new(1.0, 50, 20);
        assert!((schedule.lr_at(10) - 0.2).abs() < 1e-12);
        assert!(schedule.lr_at(19) < 1.0);
    }
}
