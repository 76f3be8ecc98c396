//! Queue levels.
//!
//! Records carry a queue level and a tick counter for a multilevel
//! feedback policy. Selection is plain round-robin over the table today;
//! nothing ages, boosts or demotes records yet.

/// Feedback queue level, highest priority first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum QueueLevel {
    #[default]
    Top = 0,
    Middle = 1,
    Bottom = 2,
}

impl QueueLevel {
    /// Numeric level (0 = top).
    pub fn level(self) -> usize {
        self as usize
    }

    /// Ticks a record may run at this level before losing the CPU.
    pub fn time_quantum(self) -> u64 {
        2 * self.level() as u64 + 4
    }

    /// The next lower level.
    pub fn lower(self) -> Self {
        match self {
            QueueLevel::Top => QueueLevel::Middle,
            QueueLevel::Middle | QueueLevel::Bottom => QueueLevel::Bottom,
        }
    }
}
