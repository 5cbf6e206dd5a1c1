use std::sync::Arc;

use arrow::{
    array::{
        Array, ArrayBuilder, ArrayRef, FixedSizeListBuilder, Float64Builder, StructArray,
        UInt64Builder,
    },
    datatypes::Field,
};

use crate::{
    abc::{AbcError, Result},
    pmc::{PmcTrace, StepRecord},
};

/// Collects per-round statistics of a PMC run into arrow columns.
pub struct StepTraceBuilder {
    dim: usize,
    round: UInt64Builder,
    epsilon: Float64Builder,
    next_epsilon: Float64Builder,
    n_accepted: UInt64Builder,
    n_total: UInt64Builder,
    failures: UInt64Builder,
    acceptance_rate: Float64Builder,
    ess: Float64Builder,
    alpha: Float64Builder,
    posterior_mean: FixedSizeListBuilder<Float64Builder>,
}

impl StepTraceBuilder {
    pub fn new(dim: usize) -> Self {
        Self::with_capacity(dim, 0)
    }

    pub fn with_capacity(dim: usize, capacity: usize) -> Self {
        let items = Float64Builder::with_capacity(capacity * dim);
        Self {
            dim,
            round: UInt64Builder::with_capacity(capacity),
            epsilon: Float64Builder::with_capacity(capacity),
            next_epsilon: Float64Builder::with_capacity(capacity),
            n_accepted: UInt64Builder::with_capacity(capacity),
            n_total: UInt64Builder::with_capacity(capacity),
            failures: UInt64Builder::with_capacity(capacity),
            acceptance_rate: Float64Builder::with_capacity(capacity),
            ess: Float64Builder::with_capacity(capacity),
            alpha: Float64Builder::with_capacity(capacity),
            posterior_mean: FixedSizeListBuilder::with_capacity(items, dim as _, capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.round.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn append_step(&mut self, step: &StepRecord) -> Result<()> {
        let accepted = step.accepted();
        if accepted.dim() != self.dim {
            return Err(AbcError::DimensionMismatch {
                expected: self.dim,
                found: accepted.dim(),
            });
        }
        self.round.append_value(step.round() as u64);
        self.epsilon.append_value(step.epsilon());
        self.next_epsilon.append_value(step.next_epsilon());
        self.n_accepted.append_value(step.n_accepted() as u64);
        self.n_total.append_value(step.n_total() as u64);
        self.failures.append_value(step.failures() as u64);
        self.acceptance_rate.append_value(step.acceptance_rate());
        self.ess.append_value(step.ess());
        self.alpha.append_value(step.alpha());
        self.posterior_mean
            .values()
            .append_slice(&accepted.posterior_mean());
        self.posterior_mean.append(true);
        Ok(())
    }

    pub fn finalize(self) -> StructArray {
        let Self {
            mut round,
            mut epsilon,
            mut next_epsilon,
            mut n_accepted,
            mut n_total,
            mut failures,
            mut acceptance_rate,
            mut ess,
            mut alpha,
            mut posterior_mean,
            ..
        } = self;

        to_struct(vec![
            ("round", ArrayBuilder::finish(&mut round)),
            ("epsilon", ArrayBuilder::finish(&mut epsilon)),
            ("next_epsilon", ArrayBuilder::finish(&mut next_epsilon)),
            ("n_accepted", ArrayBuilder::finish(&mut n_accepted)),
            ("n_total", ArrayBuilder::finish(&mut n_total)),
            ("failures", ArrayBuilder::finish(&mut failures)),
            ("acceptance_rate", ArrayBuilder::finish(&mut acceptance_rate)),
            ("ess", ArrayBuilder::finish(&mut ess)),
            ("alpha", ArrayBuilder::finish(&mut alpha)),
            ("posterior_mean", ArrayBuilder::finish(&mut posterior_mean)),
        ])
    }

    /// The columns collected so far, without consuming the builder.
    pub fn inspect(&self) -> StructArray {
        to_struct(vec![
            ("round", ArrayBuilder::finish_cloned(&self.round)),
            ("epsilon", ArrayBuilder::finish_cloned(&self.epsilon)),
            ("next_epsilon", ArrayBuilder::finish_cloned(&self.next_epsilon)),
            ("n_accepted", ArrayBuilder::finish_cloned(&self.n_accepted)),
            ("n_total", ArrayBuilder::finish_cloned(&self.n_total)),
            ("failures", ArrayBuilder::finish_cloned(&self.failures)),
            (
                "acceptance_rate",
                ArrayBuilder::finish_cloned(&self.acceptance_rate),
            ),
            ("ess", ArrayBuilder::finish_cloned(&self.ess)),
            ("alpha", ArrayBuilder::finish_cloned(&self.alpha)),
            (
                "posterior_mean",
                ArrayBuilder::finish_cloned(&self.posterior_mean),
            ),
        ])
    }
}

fn to_struct(columns: Vec<(&str, ArrayRef)>) -> StructArray {
    let (fields, arrays): (Vec<_>, Vec<_>) = columns
        .into_iter()
        .map(|(name, array)| {
            let field = Arc::new(Field::new(name, array.data_type().clone(), false));
            (field, array)
        })
        .unzip();
    StructArray::new(fields.into(), arrays, None)
}

impl PmcTrace {
    /// One row per round: tolerances, acceptance statistics and the posterior
    /// mean of the accepted population.
    pub fn to_arrow(&self) -> Result<StructArray> {
        let dim = self.last().map_or(0, |step| step.accepted().dim());
        let mut builder = StepTraceBuilder::with_capacity(dim, self.len());
        for step in self.steps.iter() {
            builder.append_step(step)?;
        }
        Ok(builder.finalize())
    }
}
