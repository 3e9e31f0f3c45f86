use std::collections::HashMap;

use wildmesh_core::NodeId;

/// Sequence numbers remembered per source.
pub const WINDOW: u32 = 64;

/// How an arriving sequence number relates to what was already seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceClass {
    /// Newer than anything seen from this source.
    Fresh,
    /// Older than the newest, but not seen before.
    Reordered,
    Duplicate,
    /// The source restarted: its window was reset and the frame is fresh.
    Restarted,
}

#[derive(Debug, Clone, Copy)]
struct Window {
    boot: u32,
    highest: u32,
    /// Bit `n` set means `highest - n` was seen.
    seen: u64,
}

/// Sliding-window duplicate and reorder detection, one window per source.
#[derive(Debug, Default)]
pub struct SequenceTracker {
    windows: HashMap<NodeId, Window>,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify and record `sequence` from `source` in its boot `boot`.
    ///
    /// A new boot value resets the window. So does a number further behind
    /// than the window, for senders that predate boot values.
    pub fn observe(&mut self, source: NodeId, boot: u32, sequence: u32) -> SequenceClass {
        let fresh = Window {
            boot,
            highest: sequence,
            seen: 1,
        };
        let Some(w) = self.windows.get_mut(&source) else {
            self.windows.insert(source, fresh);
            return SequenceClass::Fresh;
        };

        if w.boot != boot {
            *w = fresh;
            return SequenceClass::Restarted;
        }

        if sequence > w.highest {
            let shift = sequence - w.highest;
            w.seen = if shift >= WINDOW { 1 } else { (w.seen << shift) | 1 };
            w.highest = sequence;
            return SequenceClass::Fresh;
        }

        let behind = w.highest - sequence;
        if behind >= WINDOW {
            *w = fresh;
            return SequenceClass::Restarted;
        }

        let bit = 1u64 << behind;
        if w.seen & bit != 0 {
            SequenceClass::Duplicate
        } else {
            w.seen |= bit;
            SequenceClass::Reordered
        }
    }
}
