//! Enrollment aggregation: several captures in, one template out.
//!
//! The template is the per-dimension arithmetic mean (centroid) of the
//! capture descriptors. Unweighted on purpose; no capture is trusted more
//! than another.

use crate::types::{Capture, Descriptor, DimensionMismatch, IdentityId, Template};
use chrono::Utc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AggregateError {
    #[error("insufficient captures: got {got}, need at least {required}")]
    InsufficientCaptures { got: usize, required: usize },
    #[error(transparent)]
    DimensionMismatch(#[from] DimensionMismatch),
}

/// Turns capture sets into templates of a fixed dimension.
#[derive(Debug, Clone, Copy)]
pub struct Aggregator {
    descriptor_len: usize,
    min_captures: usize,
}

impl Aggregator {
    pub fn new(descriptor_len: usize, min_captures: usize) -> Self {
        Self {
            descriptor_len,
            min_captures,
        }
    }

    /// Average `captures` into a template for `identity_id`.
    ///
    /// Captures are read in the order given (temporal order when called
    /// from a session); the result does not depend on it.
    pub fn aggregate(
        &self,
        identity_id: &IdentityId,
        captures: &[Capture],
    ) -> Result<Template, AggregateError> {
        if captures.len() < self.min_captures {
            return Err(AggregateError::InsufficientCaptures {
                got: captures.len(),
                required: self.min_captures,
            });
        }
        for capture in captures {
            capture.descriptor.check_len(self.descriptor_len)?;
        }

        // Accumulate in f64 so identical inputs average back to themselves exactly.
        let mut sums = vec![0f64; self.descriptor_len];
        for capture in captures {
            for (sum, &v) in sums.iter_mut().zip(capture.descriptor.values.iter()) {
                *sum += v as f64;
            }
        }
        let k = captures.len() as f64;
        let values = sums.into_iter().map(|s| (s / k) as f32).collect();

        Ok(Template {
            identity_id: identity_id.clone(),
            descriptor: Descriptor::new(values),
            created_at: Utc::now(),
            source_capture_count: captures.len(),
        })
    }
}
