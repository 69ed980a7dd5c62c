use crate::oracle::{Trace, TraceEnd};

/// Captures the cost and input size observed during the most recent run.
///
/// The engine resets the observer before every oracle call so a cost
/// reported by one run can never be attributed to the next. Guided runs pin
/// their input size up front through [`CostObserver::pin_input_size`]; the
/// materializer reads it back to size variable-length encodings.
#[derive(Debug, Default, Clone)]
pub struct CostObserver {
    last_cost: Option<f64>,
    last_input_size: Option<usize>,
}

impl CostObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the observer to its neutral state.
    pub fn reset(&mut self) {
        self.last_cost = None;
        self.last_input_size = None;
    }

    pub fn pin_input_size(&mut self, input_size: usize) {
        self.last_input_size = Some(input_size);
    }

    /// Takes what the run reported. A pinned input size is only replaced
    /// when the trace carries its own.
    pub fn observe(&mut self, trace: &Trace) {
        if let TraceEnd::Terminated { cost } = trace.end {
            self.last_cost = cost;
        }
        if trace.input_size.is_some() {
            self.last_input_size = trace.input_size;
        }
    }

    pub fn last_cost(&self) -> Option<f64> {
        self.last_cost
    }

    pub fn last_input_size(&self) -> Option<usize> {
        self.last_input_size
    }
}
