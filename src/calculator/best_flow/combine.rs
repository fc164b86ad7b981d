use std::collections::BTreeSet;

use super::{FlowChunk, Round};
use crate::calculator::segment::coalesce;

impl Round {
    /// Sweep the capacity from left to right and cut it wherever a task or an upload starts or ends.
    /// Each window becomes a chunk with a fixed set of participants,
    /// adjacent windows of the same owner and participants are merged.
    pub(super) fn combine_and_translate(&mut self) -> Vec<FlowChunk> {
        for node in self.nodes.iter_mut() {
            node.uploads = coalesce(&node.uploads);
        }

        let capacity = self.capacity;
        let mut cuts = BTreeSet::from([0, capacity]);
        let segments = self
            .tasks
            .iter()
            .chain(self.nodes.iter().flat_map(|n| n.uploads.iter()));
        for segment in segments {
            cuts.insert(segment.start.min(capacity));
            cuts.insert(segment.end.min(capacity));
        }
        let cuts: Vec<u64> = cuts.into_iter().collect();

        let mut chunks: Vec<FlowChunk> = Vec::new();
        for window in cuts.windows(2) {
            let (start, end) = (window[0], window[1]);
            let task = self.tasks.partition_point(|t| t.end <= start);
            let Some(&owner) = self.owners.get(task) else {
                log::warn!("no task covers [{}, {})", start, end);
                continue;
            };
            let mut participants = vec![false; self.nodes.len()];
            for node in &self.nodes {
                participants[node.id] = node.id == self.target
                    || node
                        .uploads
                        .iter()
                        .any(|s| s.task == task && s.start <= start && s.end >= end);
            }
            if let Some(last) = chunks.last_mut() {
                if last.end == start && last.owner == owner && last.participants == participants {
                    last.end = end;
                    continue;
                }
            }
            chunks.push(FlowChunk {
                owner,
                start,
                end,
                participants,
            });
        }

        for chunk in &chunks {
            let count = chunk.participant_count();
            if count != self.k + 1 {
                log::warn!(
                    "chunk [{}, {}) of node {} has {} participants, expected {}",
                    chunk.start,
                    chunk.end,
                    chunk.owner + 1,
                    count,
                    self.k + 1
                );
            }
        }
        chunks
    }
}
