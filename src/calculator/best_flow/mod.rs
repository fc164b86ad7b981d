//! BestFlow, a single stage repair plan.
//!
//! The capacity is split into download tasks, one per helper (the target takes the rest),
//! laid end to end over `[0, capacity)`. Every byte of a task has to be sent by `k` distinct
//! nodes, the owner of the task being one of them. The uploads are handed out greedily and
//! finally cut into chunks, each one with a fixed set of participants.

use super::{
    node_index, scale_span, segment::Segment, usable_bandwidths, water_fill, RouteCalculator,
    SizingPolicy,
};
use crate::{
    bandwidth::Bandwidth,
    task::{NodeId, Payload, RepairTask},
};

mod assign;
mod combine;

use assign::RemainTask;

#[derive(Debug, Clone, Default)]
struct Node {
    id: usize,
    upload: u64,
    download: u64,
    /// the download range of this node, empty if it downloads nothing
    task: Segment,
    /// what this node sends, tagged by task
    uploads: Vec<Segment>,
}

/// a piece of the final plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FlowChunk {
    /// the node downloading this piece
    pub owner: usize,
    pub start: u64,
    pub end: u64,
    /// whether each node takes part, by node index
    pub participants: Vec<bool>,
}

impl FlowChunk {
    pub fn participant_count(&self) -> usize {
        self.participants.iter().filter(|p| **p).count()
    }
}

#[derive(Debug, Clone, Default)]
struct FlowPlan {
    target: usize,
    capacity: u64,
    chunks: Vec<FlowChunk>,
}

pub struct BestFlow {
    k: usize,
    n: usize,
    policy: SizingPolicy,
    min_bandwidth: u64,
    plan: FlowPlan,
}

impl BestFlow {
    pub fn new(k: usize, n: usize, policy: SizingPolicy, min_bandwidth: u64) -> Self {
        Self {
            k,
            n,
            policy,
            min_bandwidth,
            plan: FlowPlan::default(),
        }
    }

    #[cfg(test)]
    pub(crate) fn chunks(&self) -> &[FlowChunk] {
        &self.plan.chunks
    }
}

/// the working state of one cycle
struct Round {
    k: usize,
    target: usize,
    capacity: u64,
    /// in id order until the tasks are distributed, in upload priority order afterwards
    nodes: Vec<Node>,
    /// the download ranges laid end to end over `[0, capacity)`, indexed by task id
    tasks: Vec<Segment>,
    /// the node index owning each task
    owners: Vec<usize>,
    /// the sourcing progress of each task
    remains: Vec<RemainTask>,
}

impl Round {
    fn new(k: usize, target: usize, bandwidths: &[Bandwidth]) -> Self {
        let nodes = bandwidths
            .iter()
            .enumerate()
            .map(|(id, bw)| Node {
                id,
                upload: bw.upload,
                download: bw.download,
                ..Default::default()
            })
            .collect();
        Self {
            k,
            target,
            capacity: 0,
            nodes,
            tasks: vec![],
            owners: vec![],
            remains: vec![],
        }
    }

    /// Find the capacity: the water-filled upload share, bounded by the target's download,
    /// then folded with the download limits until no helper uploads more than the capacity.
    fn analyze_bandwidth(&mut self) {
        let uploads: Vec<u64> = self.nodes.iter().map(|n| n.upload).collect();
        // the nodes are still in id order here
        let mut capacity =
            water_fill::fair_share(&uploads, self.k).min(self.nodes[self.target].download);
        let relay = (self.k - 1) as u64;
        loop {
            let (mut sum, mut max_upload) = (0u64, 0u64);
            for node in self.nodes.iter_mut() {
                if node.id != self.target {
                    node.upload = node.upload.min(capacity);
                    node.download = node.download.min(node.upload.saturating_mul(relay));
                    max_upload = max_upload.max(node.upload);
                }
                sum = sum.saturating_add(node.download);
            }
            capacity = capacity.min(sum / self.k as u64);
            if max_upload <= capacity {
                break;
            }
        }
        self.capacity = capacity;
    }

    /// Size the download task of every helper, the target takes whatever is left.
    /// The nodes end up in upload priority order, and the tasks are laid out in that order.
    fn distribute_tasks(&mut self, policy: SizingPolicy) {
        let target = self.target;
        let capacity = self.capacity;
        let relay = (self.k - 1) as u64;

        self.nodes.sort_by(|a, b| {
            (b.id == target)
                .cmp(&(a.id == target))
                .then(b.download.cmp(&a.download))
                .then(b.upload.cmp(&a.upload))
                .then(a.id.cmp(&b.id))
        });
        let sum_download = self.nodes[1..]
            .iter()
            .fold(0u64, |sum, n| sum.saturating_add(n.download));
        let mut remain = capacity;
        for node in self.nodes.iter_mut().skip(1) {
            if remain == 0 {
                break;
            }
            let greedy = (node.download / relay).saturating_add(1);
            let size = match policy {
                SizingPolicy::Greedy => greedy,
                SizingPolicy::Even => {
                    let share = if sum_download == 0 {
                        0
                    } else {
                        ((node.download as u128 * capacity as u128 / sum_download as u128) as u64)
                            .saturating_add(1)
                    };
                    if share.saturating_mul(relay) > node.download {
                        greedy
                    } else {
                        share
                    }
                }
            };
            // the own task is always self-served, so it never outgrows the upload
            let size = if node.download == 0 {
                0
            } else {
                size.min(remain).min(node.upload)
            };
            node.task = Segment::new(0, 0, size);
            remain -= size;
        }
        if remain > 0 {
            self.nodes[0].task = Segment::new(0, 0, remain);
        }

        // the more upload is left after serving the own task, the earlier a node is assigned
        let spare = |n: &Node| n.upload as i128 - n.task.size() as i128;
        self.nodes.sort_by(|a, b| {
            (b.id == target)
                .cmp(&(a.id == target))
                .then(spare(b).cmp(&spare(a)))
                .then(b.upload.cmp(&a.upload))
                .then(a.id.cmp(&b.id))
        });
        let mut offset = 0;
        for node in self.nodes.iter_mut() {
            if node.task.is_empty() {
                continue;
            }
            node.task.task = self.tasks.len();
            node.task.shift(offset);
            offset = node.task.end;
            self.owners.push(node.id);
            self.tasks.push(node.task);
        }
        log::trace!(
            "distributed {} tasks over capacity {}: {:?}",
            self.tasks.len(),
            capacity,
            self.tasks
        );
    }
}

impl RouteCalculator for BestFlow {
    fn calculate_route(&mut self, bandwidths: &[Bandwidth], target_id: NodeId) -> usize {
        self.plan = FlowPlan::default();
        if self.k < 2 || self.k >= self.n {
            log::warn!("best flow cannot run with k = {} over {} nodes", self.k, self.n);
            return 0;
        }
        let Some(target) = node_index(target_id, self.n) else {
            log::warn!(
                "target {} is out of the cluster of {} nodes",
                target_id,
                self.n
            );
            return 0;
        };
        let Some(bandwidths) = usable_bandwidths(bandwidths, self.n, target, self.min_bandwidth)
        else {
            return 0;
        };

        let mut round = Round::new(self.k, target, &bandwidths);
        round.analyze_bandwidth();
        if round.capacity == 0 || round.capacity < self.min_bandwidth {
            log::debug!(
                "best flow: capacity {} is below the threshold {}",
                round.capacity,
                self.min_bandwidth
            );
            return 0;
        }
        round.distribute_tasks(self.policy);
        round.assign_uploads();
        let chunks = round.combine_and_translate();
        if chunks.is_empty() {
            return 0;
        }
        log::debug!(
            "best flow: capacity {}, {} chunks for target {}",
            round.capacity,
            chunks.len(),
            target_id
        );
        self.plan = FlowPlan {
            target,
            capacity: round.capacity,
            chunks,
        };
        1
    }

    fn task_number(&self, stage: usize) -> usize {
        if stage == 0 {
            self.plan.chunks.len()
        } else {
            0
        }
    }

    fn fill_task(&self, stage: usize, task: usize, node_id: NodeId, payload: Payload) -> RepairTask {
        if stage != 0 {
            return RepairTask::idle();
        }
        let (Some(node), Some(chunk)) = (node_index(node_id, self.n), self.plan.chunks.get(task))
        else {
            return RepairTask::idle();
        };
        if !chunk.participants[node] {
            return RepairTask::idle();
        }

        let target = self.plan.target;
        let (target_id, source_ids) = if node == chunk.owner {
            // the owner combines what the helpers send and forwards it to the target
            let sources = chunk
                .participants
                .iter()
                .enumerate()
                .filter(|&(i, &p)| p && i != target && i != node)
                .map(|(i, _)| i + 1)
                .collect();
            (target + 1, sources)
        } else if node == target {
            (target + 1, vec![chunk.owner + 1])
        } else {
            (chunk.owner + 1, vec![])
        };
        let (offset, size) = scale_span(chunk.start, chunk.end, self.plan.capacity, payload);
        RepairTask {
            target_id,
            bandwidth: chunk.end - chunk.start,
            offset,
            size,
            source_ids,
        }
    }

    fn capacity(&self) -> u64 {
        self.plan.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calculator::segment::free_ranges;
    use pretty_assertions::assert_eq;
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use test_log::test;

    fn uniform(n: usize, upload: u64, download: u64) -> Vec<Bandwidth> {
        vec![Bandwidth::new(upload, download); n]
    }

    fn assert_tiles(flow: &BestFlow) {
        let chunks = flow.chunks();
        let capacity = flow.capacity();
        assert_eq!(chunks.first().map(|c| c.start), Some(0));
        assert_eq!(chunks.last().map(|c| c.end), Some(capacity));
        for pair in chunks.windows(2) {
            assert!(pair[0].start < pair[0].end);
            assert_eq!(pair[0].end, pair[1].start);
        }
        assert_eq!(
            free_ranges(0..capacity, chunks.iter().map(|c| c.start..c.end)),
            vec![]
        );
    }

    #[test]
    fn test_greedy_single_owner() {
        let mut flow = BestFlow::new(2, 4, SizingPolicy::Greedy, 1);
        let bandwidths = [
            Bandwidth::new(0, 10),
            Bandwidth::new(10, 10),
            Bandwidth::new(10, 10),
            Bandwidth::new(10, 10),
        ];
        assert_eq!(flow.calculate_route(&bandwidths, 1), 1);
        assert_eq!(flow.capacity(), 10);
        assert_eq!(
            flow.chunks(),
            &[FlowChunk {
                owner: 1,
                start: 0,
                end: 10,
                participants: vec![true, true, true, false],
            }]
        );
        assert_eq!(flow.task_number(0), 1);

        let payload = Payload::new(0, 1000);
        let owner = flow.fill_task(0, 0, 2, payload);
        assert_eq!(
            owner,
            RepairTask {
                target_id: 1,
                bandwidth: 10,
                offset: 0,
                size: 1000,
                source_ids: vec![3],
            }
        );
        let helper = flow.fill_task(0, 0, 3, payload);
        assert_eq!(helper.target_id, 2);
        assert_eq!(helper.source_ids, Vec::<NodeId>::new());
        let target = flow.fill_task(0, 0, 1, payload);
        assert_eq!(target.target_id, 1);
        assert_eq!(target.source_ids, vec![2]);
        assert!(flow.fill_task(0, 0, 4, payload).is_idle());
    }

    #[test]
    fn test_even_distribution() {
        let mut flow = BestFlow::new(2, 4, SizingPolicy::Even, 1);
        let mut bandwidths = uniform(4, 10, 10);
        bandwidths[0].upload = 0;
        assert_eq!(flow.calculate_route(&bandwidths, 1), 1);
        assert_eq!(flow.capacity(), 10);
        let layout: Vec<_> = flow
            .chunks()
            .iter()
            .map(|c| (c.owner, c.start, c.end, c.participant_count()))
            .collect();
        assert_eq!(layout, vec![(3, 0, 2, 3), (1, 2, 6, 3), (2, 6, 10, 3)]);
        assert_eq!(
            flow.chunks()[2].participants,
            vec![true, false, true, true]
        );

        let payload = Payload::new(0, 1000);
        let helper = flow.fill_task(0, 1, 4, payload);
        assert_eq!(
            helper,
            RepairTask {
                target_id: 2,
                bandwidth: 4,
                offset: 200,
                size: 400,
                source_ids: vec![],
            }
        );
        let owner = flow.fill_task(0, 1, 2, payload);
        assert_eq!(owner.target_id, 1);
        assert_eq!(owner.source_ids, vec![4]);
        assert!(flow.fill_task(0, 1, 3, payload).is_idle());
    }

    #[test]
    fn test_sub_threshold_helpers_are_dropped() {
        let mut flow = BestFlow::new(2, 4, SizingPolicy::Greedy, 1);
        let bandwidths = [
            Bandwidth::new(0, 10),
            Bandwidth::new(10, 0),
            Bandwidth::new(10, 0),
            Bandwidth::new(10, 0),
        ];
        // every helper lacks download, nothing is left to repair with
        assert_eq!(flow.calculate_route(&bandwidths, 1), 0);
        assert_eq!(flow.capacity(), 0);
        assert_eq!(flow.task_number(0), 0);

        // a single slow helper is left out, the rest still works
        let mut bandwidths = uniform(5, 10, 10);
        bandwidths[3] = Bandwidth::new(10, 4);
        let mut flow = BestFlow::new(2, 5, SizingPolicy::Greedy, 5);
        assert_eq!(flow.calculate_route(&bandwidths, 1), 1);
        for chunk in flow.chunks() {
            assert!(!chunk.participants[3]);
        }
        for task in 0..flow.task_number(0) {
            let payload = Payload::new(0, 100);
            assert!(flow.fill_task(0, task, 4, payload).is_idle());
            for node in 1..=5 {
                let task = flow.fill_task(0, task, node, payload);
                assert!(!task.source_ids.contains(&4));
                if !task.is_idle() {
                    assert_ne!(task.target_id, 4);
                }
            }
        }
    }

    #[test]
    fn test_target_upload_is_ignored() {
        let mut flow = BestFlow::new(2, 3, SizingPolicy::Greedy, 0);
        let bandwidths = [
            Bandwidth::new(1000, 10),
            Bandwidth::new(10, 10),
            Bandwidth::new(0, 0),
        ];
        // a single helper can never satisfy k = 2 on its own
        assert_eq!(flow.calculate_route(&bandwidths, 1), 0);
    }

    #[test]
    fn test_idempotent_and_recomputed() {
        let mut flow = BestFlow::new(3, 7, SizingPolicy::Even, 1);
        let bandwidths: Vec<_> = (0..7u64)
            .map(|i| Bandwidth::new(20 + i * 7, 30 + i * 5))
            .collect();
        assert_eq!(flow.calculate_route(&bandwidths, 4), 1);
        let first = flow.chunks().to_vec();
        let capacity = flow.capacity();
        assert_eq!(flow.calculate_route(&bandwidths, 4), 1);
        assert_eq!(flow.chunks(), first.as_slice());
        assert_eq!(flow.capacity(), capacity);
        assert_tiles(&flow);

        // an infeasible cycle drops the previous plan
        assert_eq!(flow.calculate_route(&uniform(7, 0, 0), 4), 0);
        assert_eq!(flow.task_number(0), 0);
        assert!(flow.fill_task(0, 0, 4, Payload::new(0, 10)).is_idle());
    }

    #[test]
    fn test_random_plans_tile_the_capacity() {
        let mut rng = StdRng::seed_from_u64(7);
        for round in 0..200 {
            let n = rng.gen_range(3..12);
            let k = rng.gen_range(2..n);
            let target_id = rng.gen_range(1..=n);
            let policy = if round % 2 == 0 {
                SizingPolicy::Even
            } else {
                SizingPolicy::Greedy
            };
            let bandwidths: Vec<_> = (0..n)
                .map(|_| Bandwidth::new(rng.gen_range(0..500), rng.gen_range(0..500)))
                .collect();
            let mut flow = BestFlow::new(k, n, policy, 10);
            if flow.calculate_route(&bandwidths, target_id) == 0 {
                assert_eq!(flow.capacity(), 0);
                continue;
            }
            assert!(flow.capacity() <= bandwidths[target_id - 1].download);
            assert_tiles(&flow);
            for chunk in flow.chunks() {
                assert!(chunk.participants[target_id - 1]);
                assert!(chunk.participants[chunk.owner]);
                for (id, bw) in bandwidths.iter().enumerate() {
                    if id != target_id - 1 && (bw.upload < 10 || bw.download < 10) {
                        assert!(!chunk.participants[id]);
                    }
                }
            }
            // the byte ranges handed to the target cover the payload exactly once
            let payload = Payload::new(64, 1 << 20);
            let mut next = payload.offset;
            for task in 0..flow.task_number(0) {
                let task = flow.fill_task(0, task, target_id, payload);
                assert_eq!(task.offset, next);
                next += task.size;
            }
            assert_eq!(next, payload.offset + payload.size);
        }
    }

    /// the bytes a node sends over the whole plan, in capacity units
    fn sent(flow: &BestFlow, node: usize) -> u64 {
        flow.chunks()
            .iter()
            .filter(|c| c.participants[node])
            .map(|c| c.end - c.start)
            .sum()
    }

    #[test]
    fn test_helpers_send_within_their_upload() {
        let mut flow = BestFlow::new(2, 5, SizingPolicy::Greedy, 10);
        let bandwidths = [
            Bandwidth::new(416, 465),
            Bandwidth::new(94, 497),
            Bandwidth::new(54, 368),
            Bandwidth::new(216, 287),
            Bandwidth::new(427, 401),
        ];
        assert_eq!(flow.calculate_route(&bandwidths, 2), 1);
        assert_eq!(flow.capacity(), 497);
        assert_tiles(&flow);
        // the greedy share of the first helper is one byte over its upload
        assert!(sent(&flow, 0) > 0);
        assert!(sent(&flow, 0) <= 416);

        let mut rng = StdRng::seed_from_u64(0x0b5e);
        for round in 0..500 {
            let n = rng.gen_range(3..10);
            let k = rng.gen_range(2..n);
            let target = rng.gen_range(0..n);
            let policy = if round % 2 == 0 {
                SizingPolicy::Greedy
            } else {
                SizingPolicy::Even
            };
            let bandwidths: Vec<_> = (0..n)
                .map(|_| Bandwidth::new(rng.gen_range(0..500), rng.gen_range(0..500)))
                .collect();
            let mut flow = BestFlow::new(k, n, policy, 10);
            if flow.calculate_route(&bandwidths, target + 1) == 0 {
                continue;
            }
            for (id, bw) in bandwidths.iter().enumerate() {
                if id != target {
                    assert!(sent(&flow, id) <= bw.upload, "{bandwidths:?} {k} {target}");
                }
            }
        }
    }

    #[test]
    fn test_saturated_bandwidths() {
        let bandwidths = vec![Bandwidth::new(u64::MAX, u64::MAX); 3];
        for policy in [SizingPolicy::Greedy, SizingPolicy::Even] {
            let mut flow = BestFlow::new(2, 3, policy, 1);
            assert_eq!(flow.calculate_route(&bandwidths, 1), 1);
            assert_eq!(flow.capacity(), u64::MAX / 2);
            assert_tiles(&flow);
            let payload = Payload::new(0, 1 << 30);
            let mut next = 0;
            for task in 0..flow.task_number(0) {
                let task = flow.fill_task(0, task, 1, payload);
                assert_eq!(task.offset, next);
                next += task.size;
            }
            assert_eq!(next, payload.size);
        }
    }

    #[test]
    fn test_balanced_cluster_has_k_sources_per_chunk() {
        for (n, k) in [(4, 2), (6, 4), (9, 6), (12, 3)] {
            for policy in [SizingPolicy::Even, SizingPolicy::Greedy] {
                let mut flow = BestFlow::new(k, n, policy, 1);
                let mut bandwidths = uniform(n, 120, 120);
                bandwidths[0].upload = 0;
                assert_eq!(flow.calculate_route(&bandwidths, 1), 1);
                assert_tiles(&flow);
                for chunk in flow.chunks() {
                    assert_eq!(chunk.participant_count(), k + 1, "{n} {k} {policy:?}");
                }
            }
        }
    }
}
