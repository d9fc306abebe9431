//! Per-instance accumulation for batch detectors.
//!
//! Each detector instance owns one buffer behind its own lock. Events for
//! different instances never contend; the map lock is only held long
//! enough to find or create an instance's slot.
//!
//! ```text
//! Empty --push--> Accumulating --push (rows >= target)--> Flushing --> Empty
//! ```
//!
//! The buffer is taken out of the slot before the flushed batch is handed
//! back, so a failed dispatch never leaks rows into the next cycle.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::array::CanonicalArray;
use crate::error::GatewayError;

/// Outcome of adding one event to a buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum Accumulated {
    /// Below target; the event produces no reply.
    Pending { rows: usize },
    /// Target reached; the whole batch, buffer already reset.
    Ready(CanonicalArray),
}

/// Buffer of one detector instance.
#[derive(Debug)]
pub struct AccumulationState {
    buffer: Option<CanonicalArray>,
    target_size: usize,
}

impl AccumulationState {
    pub fn new(target_size: usize) -> Self {
        Self {
            buffer: None,
            target_size: target_size.max(1),
        }
    }

    pub fn rows(&self) -> usize {
        self.buffer.as_ref().map_or(0, CanonicalArray::rows)
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_none()
    }

    /// Appends `rows` along axis 0. On a shape or dtype mismatch the
    /// buffer is left as it was.
    pub fn push(&mut self, rows: CanonicalArray) -> Result<Accumulated, GatewayError> {
        let merged = match self.buffer.take() {
            None => rows,
            Some(buffer) => match buffer.concat_rows(&rows) {
                Ok(merged) => merged,
                Err(e) => {
                    self.buffer = Some(buffer);
                    return Err(e);
                }
            },
        };

        if merged.rows() >= self.target_size {
            Ok(Accumulated::Ready(merged))
        } else {
            let rows = merged.rows();
            self.buffer = Some(merged);
            Ok(Accumulated::Pending { rows })
        }
    }
}

/// All accumulation buffers of the process, keyed by instance.
#[derive(Debug)]
pub struct Accumulators {
    target_size: usize,
    instances: DashMap<String, Arc<Mutex<AccumulationState>>>,
}

impl Accumulators {
    pub fn new(target_size: usize) -> Self {
        Self {
            target_size: target_size.max(1),
            instances: DashMap::new(),
        }
    }

    pub fn target_size(&self) -> usize {
        self.target_size
    }

    fn slot(&self, instance: &str) -> Arc<Mutex<AccumulationState>> {
        if let Some(slot) = self.instances.get(instance) {
            return Arc::clone(slot.value());
        }
        let slot = self
            .instances
            .entry(instance.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(AccumulationState::new(self.target_size))));
        Arc::clone(slot.value())
    }

    /// Pushes rows into `instance`'s buffer. The read and reset happen
    /// under the instance lock.
    pub fn push(&self, instance: &str, rows: CanonicalArray) -> Result<Accumulated, GatewayError> {
        let slot = self.slot(instance);
        let mut state = slot.lock();
        let outcome = state.push(rows)?;
        debug!(
            instance,
            buffered = state.rows(),
            target = self.target_size,
            ready = matches!(outcome, Accumulated::Ready(_)),
            "Accumulated event"
        );
        Ok(outcome)
    }

    pub fn buffered_rows(&self, instance: &str) -> usize {
        self.instances
            .get(instance)
            .map_or(0, |slot| slot.value().lock().rows())
    }
}
