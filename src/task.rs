/// 1-based node id, as seen by callers of the route calculators
pub type NodeId = usize;

/// the byte span repaired in the current cycle
/// Calculators rescale it into the part a single task is responsible for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Payload {
    /// the offset of the first byte
    pub offset: u64,
    /// the total size in bytes
    pub size: u64,
}

impl Payload {
    pub fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }
}

/// one concrete transfer instruction for a node
/// A zero `size` means the node has nothing to do for the task,
/// the other fields are meaningless in that case.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RepairTask {
    /// the node the data is sent to
    pub target_id: NodeId,
    /// the bandwidth share of this transfer, in bandwidth units
    pub bandwidth: u64,
    /// the offset of the byte range to transfer
    pub offset: u64,
    /// the size of the byte range to transfer
    pub size: u64,
    /// the nodes whose data has to be received and combined before sending
    pub source_ids: Vec<NodeId>,
}

impl RepairTask {
    /// the "nothing to do" answer
    pub fn idle() -> Self {
        Self::default()
    }

    pub fn is_idle(&self) -> bool {
        self.size == 0
    }
}
