use serde::{Deserialize, Serialize};

/// Block size used when `block_allocation_target_bytes` is zero.
pub const DEFAULT_BLOCK_TARGET_BYTES: usize = 2 * 1024 * 1024;

/// Engine tuning knobs, deserializable from deployment configuration.
///
/// Unset fields take the engine defaults, and a zero
/// `block_allocation_target_bytes` explicitly requests the default block
/// size.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Target block size in bytes; zero means [`DEFAULT_BLOCK_TARGET_BYTES`].
    pub block_allocation_target_bytes: usize,
    /// Permit variable-width string columns inlined in the tuple.
    pub allow_inline_strings: bool,
    /// Elastic index build throttle: tuples visited per `stream_more` call.
    pub tuples_per_call: usize,
    /// Fraction of a block's slots that must be free before forced
    /// compaction considers it a drain source.
    pub compaction_threshold_ratio: f64,
    /// Permit forced compaction to drain blocks that are pending snapshot,
    /// stashing pre-images so the snapshot output is unaffected.
    pub allow_pending_moves: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            block_allocation_target_bytes: 0,
            allow_inline_strings: false,
            tuples_per_call: 1024,
            compaction_threshold_ratio: 0.5,
            allow_pending_moves: false,
        }
    }
}

impl EngineConfig {
    /// The effective block size.
    pub fn resolved_block_target_bytes(&self) -> usize {
        if self.block_allocation_target_bytes == 0 {
            DEFAULT_BLOCK_TARGET_BYTES
        } else {
            self.block_allocation_target_bytes
        }
    }

    /// The compaction threshold expressed in slots for a block of
    /// `capacity` slots, at least one.
    pub(crate) fn compaction_threshold_slots(&self, capacity: u32) -> u32 {
        let ratio = self.compaction_threshold_ratio.clamp(0.0, 1.0);
        ((capacity as f64 * ratio).ceil() as u32).max(1)
    }
}
