#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ScanLimits {
    /// Upper bound on the unconsumed remainder a cursor may carry between reads.
    pub max_pending_bytes: usize,
}

impl Default for ScanLimits {
    fn default() -> Self {
        Self {
            max_pending_bytes: 8 * 1024 * 1024,
        }
    }
}
