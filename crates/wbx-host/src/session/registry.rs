//! Registration-ordered callback slots.

/// Ordered list of host callback addresses owned by one session.
///
/// A callback's slot is the position of its first registration. Slots are
/// handed out in order and never reused, because the engine resolves a
/// callback's module-visible address by slot.
#[derive(Debug, Clone, Default)]
pub struct CallbackRegistry {
    callbacks: Vec<usize>,
}

impl CallbackRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `callback`, returning the slot it resolves to.
    ///
    /// Registering an address again consumes a fresh slot, but resolution
    /// keeps using the first one.
    pub fn register(&mut self, callback: usize) -> usize {
        self.callbacks.push(callback);
        self.slot_of(callback).unwrap_or(self.callbacks.len() - 1)
    }

    /// Slot of the first registration of `callback`.
    pub fn slot_of(&self, callback: usize) -> Option<usize> {
        self.callbacks.iter().position(|&cb| cb == callback)
    }

    /// Callback occupying `slot`.
    pub fn get(&self, slot: usize) -> Option<usize> {
        self.callbacks.get(slot).copied()
    }

    /// Number of slots handed out.
    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    /// Whether nothing was registered.
    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    /// Registered addresses in slot order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.callbacks.iter().copied()
    }
}
