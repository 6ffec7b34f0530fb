pub mod sizing;
pub mod worker;

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::master::diff::CopyEvent;

/// One tick's ordered replication work, fanned out to every active follower.
#[derive(Clone)]
pub struct TickJob {
    pub seq: u64,
    pub events: Arc<Vec<CopyEvent>>,
    /// Completion signal back to the control loop. If a worker dies mid-job
    /// the sender is dropped unsent, which still unblocks the tick monitor.
    pub done: mpsc::Sender<TickReport>,
}

#[derive(Debug, Clone, Copy)]
pub struct TickReport {
    pub account_id: u64,
    pub ok: bool,
}
