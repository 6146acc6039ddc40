//! Nonlinear least-squares problem definition.
//!
//! A `Problem` is a set of parameter blocks (each either free or fixed) and
//! residual blocks that read a list of parameter blocks. Residuals are
//! expected to be whitened by their cost function, so the squared norm of a
//! residual is its Mahalanobis distance.

use nalgebra::DVector;

use super::robust::HuberLoss;

pub type BlockId = usize;
pub type ResidualId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResidualKind {
    Projection,
    Inertial,
    Prior,
}

/// A whitened residual function over a list of parameter blocks.
pub trait CostFunction: Send + Sync {
    fn dim(&self) -> usize;

    /// `blocks[k]` holds the current values of the k-th block this residual
    /// was registered with.
    fn evaluate(&self, blocks: &[&[f64]]) -> DVector<f64>;
}

pub(crate) struct ParameterBlock {
    pub values: Vec<f64>,
    pub fixed: bool,
}

pub(crate) struct ResidualBlock {
    pub kind: ResidualKind,
    pub blocks: Vec<BlockId>,
    pub cost: Box<dyn CostFunction>,
    pub loss: Option<HuberLoss>,
    pub conditioning: bool,
}

impl ResidualBlock {
    pub fn evaluate_with(&self, values: &[&[f64]]) -> DVector<f64> {
        self.cost.evaluate(values)
    }
}

#[derive(Default)]
pub struct Problem {
    pub(crate) blocks: Vec<ParameterBlock>,
    pub(crate) residuals: Vec<ResidualBlock>,
}

impl Problem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_block(&mut self, values: &[f64], fixed: bool) -> BlockId {
        self.blocks.push(ParameterBlock {
            values: values.to_vec(),
            fixed,
        });
        self.blocks.len() - 1
    }

    pub fn set_fixed(&mut self, id: BlockId, fixed: bool) {
        self.blocks[id].fixed = fixed;
    }

    pub fn is_fixed(&self, id: BlockId) -> bool {
        self.blocks[id].fixed
    }

    pub fn block(&self, id: BlockId) -> &[f64] {
        &self.blocks[id].values
    }

    pub fn set_block(&mut self, id: BlockId, values: &[f64]) {
        self.blocks[id].values.copy_from_slice(values);
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn num_residuals(&self) -> usize {
        self.residuals.len()
    }

    /// Registers a residual. `conditioning` marks residuals that carry
    /// information from fixed poses into the free window.
    pub fn add_residual(
        &mut self,
        kind: ResidualKind,
        blocks: Vec<BlockId>,
        cost: Box<dyn CostFunction>,
        loss: Option<HuberLoss>,
        conditioning: bool,
    ) -> ResidualId {
        self.residuals.push(ResidualBlock {
            kind,
            blocks,
            cost,
            loss,
            conditioning,
        });
        self.residuals.len() - 1
    }

    pub fn residual_kind(&self, id: ResidualId) -> ResidualKind {
        self.residuals[id].kind
    }

    /// Offsets of free blocks in the stacked free-parameter vector.
    pub(crate) fn free_layout(&self) -> (Vec<Option<usize>>, usize) {
        let mut offsets = Vec::with_capacity(self.blocks.len());
        let mut total = 0;
        for block in &self.blocks {
            if block.fixed {
                offsets.push(None);
            } else {
                offsets.push(Some(total));
                total += block.values.len();
            }
        }
        (offsets, total)
    }

    pub fn num_free_params(&self) -> usize {
        self.free_layout().1
    }

    /// Evaluates a residual at the current parameter values.
    pub fn evaluate_residual(&self, id: ResidualId) -> DVector<f64> {
        let residual = &self.residuals[id];
        let values: Vec<&[f64]> = residual
            .blocks
            .iter()
            .map(|&b| self.blocks[b].values.as_slice())
            .collect();
        residual.evaluate_with(&values)
    }

    /// Robustified total cost `sum rho(|r|^2)`.
    pub fn total_cost(&self) -> f64 {
        (0..self.residuals.len())
            .map(|id| {
                let s = self.evaluate_residual(id).norm_squared();
                match &self.residuals[id].loss {
                    Some(loss) => loss.rho(s),
                    None => s,
                }
            })
            .sum()
    }

    pub(crate) fn free_values(&self, offsets: &[Option<usize>], total: usize) -> DVector<f64> {
        let mut x = DVector::zeros(total);
        for (block, offset) in self.blocks.iter().zip(offsets) {
            if let Some(o) = offset {
                x.as_mut_slice()[*o..*o + block.values.len()].copy_from_slice(&block.values);
            }
        }
        x
    }

    pub(crate) fn set_free_values(&mut self, offsets: &[Option<usize>], x: &DVector<f64>) {
        for (block, offset) in self.blocks.iter_mut().zip(offsets) {
            if let Some(o) = offset {
                let n = block.values.len();
                block.values.copy_from_slice(&x.as_slice()[*o..*o + n]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Offset(f64);

    impl CostFunction for Offset {
        fn dim(&self) -> usize {
            1
        }

        fn evaluate(&self, blocks: &[&[f64]]) -> DVector<f64> {
            DVector::from_element(1, blocks[0][0] - self.0)
        }
    }

    #[test]
    fn test_free_layout_skips_fixed_blocks() {
        let mut p = Problem::new();
        let a = p.add_block(&[1.0, 2.0], false);
        let _b = p.add_block(&[3.0], true);
        let c = p.add_block(&[4.0, 5.0, 6.0], false);
        let (offsets, total) = p.free_layout();
        assert_eq!(total, 5);
        assert_eq!(offsets[a], Some(0));
        assert_eq!(offsets[1], None);
        assert_eq!(offsets[c], Some(2));
    }

    #[test]
    fn test_free_values_roundtrip() {
        let mut p = Problem::new();
        p.add_block(&[1.0, 2.0], false);
        p.add_block(&[3.0], true);
        let (offsets, total) = p.free_layout();
        let mut x = p.free_values(&offsets, total);
        x[1] = 7.0;
        p.set_free_values(&offsets, &x);
        assert_eq!(p.block(0), &[1.0, 7.0]);
        assert_eq!(p.block(1), &[3.0]);
    }

    #[test]
    fn test_total_cost() {
        let mut p = Problem::new();
        let a = p.add_block(&[3.0], false);
        p.add_residual(ResidualKind::Prior, vec![a], Box::new(Offset(1.0)), None, false);
        assert_eq!(p.total_cost(), 4.0);
    }
}
