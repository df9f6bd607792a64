//! Numerical utilities shared by the covariance predictor and the fusion engine.
//!
//! Covariance matrices drift out of symmetry and can pick up slightly negative variances
//! under repeated floating-point updates. The helpers here restore the invariants instead
//! of treating the drift as a fault: [`symmetrize`] averages a matrix with its transpose
//! and [`condition_covariance`] additionally clamps the diagonal to a non-negative floor.
//!
//! [`HRow`] is the sparse measurement-Jacobian row used throughout the sequential fusion
//! path. Every measurement model here touches at most eight states, so a row is stored as
//! fixed-capacity index/value pairs and the gain computation iterates only the stored
//! terms instead of a dense 24-vector.

use crate::state::NUM_STATES;
use nalgebra::{SMatrix, SVector};

/// Maximum number of non-zero entries in a measurement Jacobian row. The widest rows
/// (sideslip and lateral drag) carry rotation error, velocity, and wind terms: eight.
pub const MAX_JACOBIAN_TERMS: usize = 8;

/// Return the symmetric part of a square matrix, `0.5 * (M + Mᵀ)`.
pub fn symmetrize<const D: usize>(m: &SMatrix<f64, D, D>) -> SMatrix<f64, D, D> {
    0.5 * (m + m.transpose())
}

/// Restore covariance invariants in place: symmetrize, then clamp every diagonal entry to
/// at least `floor`. Returns `true` if any diagonal entry needed clamping, so the caller
/// can log the recovery.
pub fn condition_covariance<const D: usize>(p: &mut SMatrix<f64, D, D>, floor: f64) -> bool {
    let sym = symmetrize(p);
    p.copy_from(&sym);
    let mut clamped = false;
    for i in 0..D {
        if !(p[(i, i)] >= floor) {
            p[(i, i)] = floor;
            clamped = true;
        }
    }
    clamped
}

/// A sparse measurement Jacobian row over the 24-state vector.
///
/// Stores `(state index, partial derivative)` pairs in insertion order. Indices are not
/// deduplicated; models write each state at most once.
#[derive(Clone, Copy, Debug)]
pub struct HRow {
    len: usize,
    idx: [usize; MAX_JACOBIAN_TERMS],
    val: [f64; MAX_JACOBIAN_TERMS],
}

impl Default for HRow {
    fn default() -> Self {
        Self::new()
    }
}

impl HRow {
    /// An empty row (all partials zero).
    pub fn new() -> HRow {
        HRow {
            len: 0,
            idx: [0; MAX_JACOBIAN_TERMS],
            val: [0.0; MAX_JACOBIAN_TERMS],
        }
    }

    /// Build a row from explicit `(index, value)` terms.
    pub fn from_terms(terms: &[(usize, f64)]) -> HRow {
        let mut row = HRow::new();
        for &(index, value) in terms {
            row.push(index, value);
        }
        row
    }

    /// Append one partial derivative. Panics if the row is full or the index is out of
    /// range; both are programming errors in a measurement model, not runtime conditions.
    pub fn push(&mut self, index: usize, value: f64) {
        assert!(self.len < MAX_JACOBIAN_TERMS, "jacobian row capacity exceeded");
        assert!(index < NUM_STATES, "state index out of range");
        self.idx[self.len] = index;
        self.val[self.len] = value;
        self.len += 1;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Iterate the stored `(index, value)` terms.
    pub fn iter(&self) -> impl Iterator<Item = (usize, f64)> + '_ {
        (0..self.len).map(move |i| (self.idx[i], self.val[i]))
    }

    /// Sparse dot product with a dense vector, `h · v`.
    pub fn dot(&self, v: &SVector<f64, NUM_STATES>) -> f64 {
        let mut sum = 0.0;
        for (index, value) in self.iter() {
            sum += value * v[index];
        }
        sum
    }

    /// `P · hᵀ` accumulated column by column; the workhorse of the scalar gain.
    pub fn mul_covariance(
        &self,
        p: &SMatrix<f64, NUM_STATES, NUM_STATES>,
    ) -> SVector<f64, NUM_STATES> {
        let mut pht: SVector<f64, NUM_STATES> = SVector::zeros();
        for (index, value) in self.iter() {
            pht += value * p.column(index);
        }
        pht
    }

    /// True when every stored partial is finite.
    pub fn is_finite(&self) -> bool {
        self.iter().all(|(_, value)| value.is_finite())
    }

    /// Expand to a dense row vector. Test and debugging aid.
    pub fn dense(&self) -> SVector<f64, NUM_STATES> {
        let mut row: SVector<f64, NUM_STATES> = SVector::zeros();
        for (index, value) in self.iter() {
            row[index] += value;
        }
        row
    }
}
