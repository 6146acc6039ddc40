//! Robust loss functions.

/// Huber loss on the residual norm.
///
/// With `s = |r|^2` and width `delta`: `rho(s) = s` inside the width and
/// `2 delta |r| - delta^2` outside.
#[derive(Debug, Clone, Copy)]
pub struct HuberLoss {
    pub delta: f64,
}

impl HuberLoss {
    pub fn new(delta: f64) -> Self {
        Self { delta }
    }

    pub fn rho(&self, s: f64) -> f64 {
        let norm = s.sqrt();
        if norm <= self.delta {
            s
        } else {
            2.0 * self.delta * norm - self.delta * self.delta
        }
    }

    /// IRLS weight applied to the residual's normal-equation contribution.
    pub fn weight(&self, s: f64) -> f64 {
        let norm = s.sqrt();
        if norm <= self.delta {
            1.0
        } else {
            self.delta / norm
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_huber_is_quadratic_inside() {
        let h = HuberLoss::new(2.0);
        assert_relative_eq!(h.rho(1.0), 1.0);
        assert_relative_eq!(h.weight(1.0), 1.0);
    }

    #[test]
    fn test_huber_is_linear_outside() {
        let h = HuberLoss::new(2.0);
        // |r| = 4
        assert_relative_eq!(h.rho(16.0), 12.0);
        assert_relative_eq!(h.weight(16.0), 0.5);
    }

    #[test]
    fn test_huber_continuous_at_width() {
        let h = HuberLoss::new(1.5);
        let s = 1.5 * 1.5;
        assert_relative_eq!(h.rho(s), h.rho(s + 1e-12), epsilon = 1e-9);
    }
}
