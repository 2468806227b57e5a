use std::cell::{Cell, RefCell};
use std::rc::Rc;

use serde_json::Value;

use salbridge_api::Sample;

struct GateState {
    field: String,
    enabled_values: Vec<Value>,
    matching: Cell<bool>,
    requested: Cell<bool>,
    on_change: RefCell<Option<Box<dyn FnMut(bool)>>>,
}

impl GateState {
    fn enabled(&self) -> bool {
        self.matching.get() && self.requested.get()
    }

    fn update(&self, apply: impl FnOnce(&GateState)) {
        let before = self.enabled();
        apply(self);
        let after = self.enabled();
        if before != after {
            if let Ok(mut slot) = self.on_change.try_borrow_mut() {
                if let Some(on_change) = slot.as_mut() {
                    on_change(after);
                }
            }
        }
    }
}

/// Enables a control while a state field holds one of the listed values
/// and the operator asked for it, e.g. a button that is live only while
/// `detailedState` is `PARKED` or `RAISED`.
#[derive(Clone)]
pub struct FieldGate {
    state: Rc<GateState>,
}

impl FieldGate {
    pub fn new(field: impl Into<String>, enabled_values: Vec<Value>) -> Self {
        Self {
            state: Rc::new(GateState {
                field: field.into(),
                enabled_values,
                matching: Cell::new(false),
                requested: Cell::new(true),
                on_change: RefCell::new(None),
            }),
        }
    }

    /// Subscriber callback for the topic carrying the field.
    pub fn callback(&self) -> impl FnMut(&Sample) + 'static {
        let state = self.state.clone();
        move |sample: &Sample| {
            let matching = sample
                .get(&state.field)
                .is_some_and(|value| state.enabled_values.contains(value));
            state.update(|s| s.matching.set(matching));
        }
    }

    /// Operator side of the gate.
    pub fn set_requested(&self, requested: bool) {
        self.state.update(|s| s.requested.set(requested));
    }

    pub fn is_enabled(&self) -> bool {
        self.state.enabled()
    }

    /// Called with the new value whenever [`is_enabled`](Self::is_enabled) flips.
    pub fn on_change<F>(&self, callback: F)
    where
        F: FnMut(bool) + 'static,
    {
        *self.state.on_change.borrow_mut() = Some(Box::new(callback));
    }
}
