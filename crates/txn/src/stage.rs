//! Transaction stages
//!
//! ```text
//! NONE --begin--> WORK --commit--> ONCOMMIT --> FINALLY --> NONE
//!                   |
//!                   +---abort----> ONABORT ---> FINALLY --> NONE
//! ```
//!
//! The stage is per thread. Allocation and free under the transactional
//! protocol are only legal in `WORK`.

use crate::scope;
use std::fmt;

/// Stage of the calling thread's transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TxStage {
    /// No transaction is active
    #[default]
    None,
    /// Mutations are permitted
    Work,
    /// All work succeeded; commit callbacks are running
    OnCommit,
    /// Work failed or was aborted
    OnAbort,
    /// Cleanup point, reached on both outcomes
    Finally,
}

impl TxStage {
    /// True only for `WORK`
    pub fn is_work(&self) -> bool {
        matches!(self, TxStage::Work)
    }
}

impl fmt::Display for TxStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TxStage::None => "NONE",
            TxStage::Work => "WORK",
            TxStage::OnCommit => "ONCOMMIT",
            TxStage::OnAbort => "ONABORT",
            TxStage::Finally => "FINALLY",
        };
        f.write_str(name)
    }
}

/// Stage of the calling thread
pub fn current_stage() -> TxStage {
    scope::stage()
}
