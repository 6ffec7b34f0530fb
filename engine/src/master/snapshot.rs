use std::collections::HashMap;

use broker::types::Position;

/// The master account's trading state captured at a single instant.
///
/// Tickets are unique within a snapshot by construction (keyed map). The
/// engine retains at most two snapshots: the shadow (previous tick) and the
/// one currently being processed.
#[derive(Debug, Clone, Default)]
pub struct MasterSnapshot {
    pub positions: HashMap<u64, Position>,
    /// Pending limit orders are observed for visibility only; they are
    /// never replicated.
    pub pending_orders: u32,
    pub captured_at_ms: u64,
}

impl MasterSnapshot {
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}
