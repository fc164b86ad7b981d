//! EvaPipe, a pipelined repair plan.
//!
//! The bandwidths are quantized into units of `base`, and the plan is made of `max_bw` slots
//! of one unit each. In every slot `k` helpers upload, and they form a tree rooted at the target:
//! a helper downloading `d` units in a slot combines what `d` other helpers send before forwarding.

use std::{cmp::Reverse, collections::VecDeque};

use super::{node_index, usable_bandwidths, water_fill, RouteCalculator};
use crate::{
    bandwidth::Bandwidth,
    task::{NodeId, Payload, RepairTask},
};

#[derive(Debug, Clone, Default)]
struct PipePlan {
    base: u64,
    /// per slot, the node each uploader sends to, `None` for the nodes taking no part
    recipients: Vec<Vec<Option<usize>>>,
}

pub struct EvaPipe {
    k: usize,
    n: usize,
    task_num: usize,
    min_bandwidth: u64,
    plan: PipePlan,
}

/// Cap the bandwidths by the max bandwidth of a cycle, and return it.
/// A helper unable to upload has no use for its download.
fn analyze_bandwidth(bandwidths: &mut [Bandwidth], k: usize, target: usize) -> u64 {
    for (id, bw) in bandwidths.iter_mut().enumerate() {
        if id != target && bw.upload == 0 {
            bw.download = 0;
        }
    }
    let uploads: Vec<u64> = bandwidths.iter().map(|bw| bw.upload).collect();
    let downloads = bandwidths
        .iter()
        .fold(0u64, |sum, bw| sum.saturating_add(bw.download));
    let max_bw = water_fill::fair_share(&uploads, k)
        .min(downloads / k as u64)
        .min(bandwidths[target].download);
    for bw in bandwidths.iter_mut() {
        bw.upload = bw.upload.min(max_bw);
    }
    max_bw
}

/// A quantized cycle: the bandwidths in units of `base`, and the slot count.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Quantized {
    base: u64,
    slots: u64,
    units: Vec<Bandwidth>,
}

/// Find the largest unit size leaving at least `task_num` slots.
fn quantize(bandwidths: &[Bandwidth], k: usize, target: usize, task_num: usize) -> Option<Quantized> {
    let mut raw = bandwidths.to_vec();
    let max_bw = analyze_bandwidth(&mut raw, k, target);
    let task_num = task_num as u64;
    let mut base = max_bw / task_num;
    while base > 0 {
        let mut units: Vec<Bandwidth> = raw
            .iter()
            .map(|bw| Bandwidth::new(bw.upload / base, bw.download / base))
            .collect();
        let slots = analyze_bandwidth(&mut units, k, target);
        if slots == 0 {
            return None;
        }
        if slots >= task_num {
            return Some(Quantized { base, slots, units });
        }
        base -= 1;
    }
    None
}

/// the slot assignment of one cycle, in units
struct SlotTable {
    k: u64,
    target: usize,
    /// whether a node uploads in a slot, by node then slot
    /// The target is marked in every slot, but does not count as an uploader.
    uploads: Vec<Vec<bool>>,
    /// how many units a node downloads in a slot, by node then slot
    downloads: Vec<Vec<u64>>,
    up_left: Vec<u64>,
    down_left: Vec<u64>,
    slot_ups: Vec<u64>,
    slot_downs: Vec<u64>,
    up_missing: u64,
    down_missing: u64,
}

impl SlotTable {
    fn new(units: &[Bandwidth], k: usize, target: usize, slots: usize) -> Self {
        let n = units.len();
        let mut uploads = vec![vec![false; slots]; n];
        uploads[target] = vec![true; slots];
        let up_left = units
            .iter()
            .enumerate()
            .map(|(id, bw)| {
                if id == target {
                    0
                } else {
                    bw.upload.min(slots as u64)
                }
            })
            .collect();
        let missing = k as u64 * slots as u64;
        Self {
            k: k as u64,
            target,
            uploads,
            downloads: vec![vec![0; slots]; n],
            up_left,
            down_left: units.iter().map(|bw| bw.download).collect(),
            slot_ups: vec![0; slots],
            slot_downs: vec![0; slots],
            up_missing: missing,
            down_missing: missing,
        }
    }

    fn slots(&self) -> usize {
        self.slot_ups.len()
    }

    fn is_complete(&self) -> bool {
        self.up_missing == 0 && self.down_missing == 0
    }

    /// Let every node take the emptiest slots, the target first,
    /// then the nodes whose download exceeds their upload the most.
    fn first_pass(&mut self) {
        let target = self.target;
        let mut order: Vec<usize> = (0..self.up_left.len()).collect();
        // the target goes first, otherwise helpers may take every download unit of a slot
        order.sort_by_key(|&i| {
            (
                i == target,
                self.down_left[i] as i128 - self.up_left[i] as i128,
                self.down_left[i],
                Reverse(i),
            )
        });
        let mut queue = VecDeque::from(order);
        while self.up_missing > 0 {
            let Some(node) = queue.pop_back() else {
                break;
            };
            let placed = self.place_uploads(node) + self.place_downloads(node);
            if placed > 0 && self.down_left[node] > 0 {
                queue.push_front(node);
            }
        }
    }

    fn place_uploads(&mut self, node: usize) -> u64 {
        let mut slots: Vec<usize> = (0..self.slots()).collect();
        slots.sort_by_key(|&s| (self.slot_ups[s], s));
        let mut placed = 0;
        for slot in slots {
            if self.up_left[node] == 0 || self.slot_ups[slot] >= self.k {
                break;
            }
            if self.uploads[node][slot] {
                continue;
            }
            self.uploads[node][slot] = true;
            self.slot_ups[slot] += 1;
            self.up_left[node] -= 1;
            self.up_missing -= 1;
            placed += 1;
        }
        placed
    }

    /// download one unit at a time, into the emptiest slot the node uploads in
    fn place_downloads(&mut self, node: usize) -> u64 {
        let mut placed = 0;
        while self.down_left[node] > 0 {
            let Some(slot) = (0..self.slots())
                .filter(|&s| self.uploads[node][s] && self.slot_downs[s] < self.k)
                .min_by_key(|&s| (self.slot_downs[s], s))
            else {
                break;
            };
            self.add_downloads(node, slot, 1);
            placed += 1;
        }
        placed
    }

    fn add_downloads(&mut self, node: usize, slot: usize, units: u64) {
        self.downloads[node][slot] += units;
        self.slot_downs[slot] += units;
        self.down_left[node] -= units;
        self.down_missing -= units;
    }

    /// Fill the slots still short of downloads, moving leaf uploaders out of the way.
    fn second_pass(&mut self) {
        let mut needy: Vec<usize> = (0..self.down_left.len())
            .filter(|&i| self.down_left[i] > 0)
            .collect();
        needy.sort_by_key(|&i| (self.down_left[i] as i128 - self.up_left[i] as i128, i));
        while self.down_missing > 0 {
            let Some(node) = needy.pop() else {
                break;
            };
            while self.down_left[node] > 0 {
                let Some(slot) = (0..self.slots()).min_by_key(|&s| (self.slot_downs[s], s)) else {
                    break;
                };
                if self.slot_downs[slot] >= self.k || !self.displace(node, slot) {
                    break;
                }
                let added = (self.k - self.slot_downs[slot]).min(self.down_left[node]);
                self.add_downloads(node, slot, added);
            }
            if self.down_left[node] > 0 {
                break;
            }
        }
    }

    /// Make `node` an uploader of `slot` by replacing a leaf uploader of it.
    /// Without upload left, the node hands one of its own leaf slots over to the replaced one.
    fn displace(&mut self, node: usize, slot: usize) -> bool {
        if self.uploads[node][slot] {
            return true;
        }
        let leaves: Vec<usize> = (0..self.uploads.len())
            .filter(|&o| {
                o != self.target
                    && o != node
                    && self.uploads[o][slot]
                    && self.downloads[o][slot] == 0
            })
            .collect();
        for other in leaves {
            if self.up_left[node] > 0 {
                self.up_left[node] -= 1;
                self.up_left[other] += 1;
            } else {
                let Some(spare) = (0..self.slots()).find(|&j| {
                    !self.uploads[other][j]
                        && self.uploads[node][j]
                        && self.downloads[node][j] == 0
                }) else {
                    continue;
                };
                self.uploads[node][spare] = false;
                self.uploads[other][spare] = true;
            }
            self.uploads[other][slot] = false;
            self.uploads[node][slot] = true;
            log::trace!(
                "node {} replaces node {} in slot {}",
                node + 1,
                other + 1,
                slot
            );
            return true;
        }
        false
    }

    /// Turn every slot into a tree rooted at the target.
    /// The uploaders are ranked target first, then by downloads, and each one takes its
    /// senders from the front of the ranks not taken yet.
    fn recipients(&self) -> Option<Vec<Vec<Option<usize>>>> {
        let n = self.uploads.len();
        let mut plan = Vec::with_capacity(self.slots());
        for slot in 0..self.slots() {
            let mut ranks: Vec<usize> = (0..n).filter(|&i| self.uploads[i][slot]).collect();
            ranks.sort_by_key(|&i| (i != self.target, Reverse(self.downloads[i][slot]), i));
            let mut recipients = vec![None; n];
            recipients[self.target] = Some(self.target);
            let mut popped = 0;
            for (j, &receiver) in ranks.iter().enumerate() {
                for _ in 0..self.downloads[receiver][slot] {
                    popped += 1;
                    if popped <= j {
                        return None;
                    }
                    let sender = *ranks.get(popped)?;
                    recipients[sender] = Some(receiver);
                }
            }
            if popped + 1 != ranks.len() {
                return None;
            }
            plan.push(recipients);
        }
        Some(plan)
    }
}

impl EvaPipe {
    pub fn new(k: usize, n: usize, task_num: usize, min_bandwidth: u64) -> Self {
        Self {
            k,
            n,
            task_num,
            min_bandwidth,
            plan: PipePlan::default(),
        }
    }

    /// the byte range of a slot: an equal share of the payload, the last slot takes the rest
    fn slot_span(&self, slot: usize, payload: Payload) -> (u64, u64) {
        let slots = self.plan.recipients.len() as u64;
        let share = payload.size / slots;
        let offset = payload.offset + share * slot as u64;
        if slot as u64 + 1 == slots {
            (offset, payload.offset + payload.size - offset)
        } else {
            (offset, share)
        }
    }
}

impl RouteCalculator for EvaPipe {
    fn calculate_route(&mut self, bandwidths: &[Bandwidth], target_id: NodeId) -> usize {
        self.plan = PipePlan::default();
        if self.k == 0 || self.k >= self.n || self.task_num == 0 {
            log::warn!(
                "eva pipe cannot run with k = {} and {} slots over {} nodes",
                self.k,
                self.task_num,
                self.n
            );
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
        let Some(mut usable) = usable_bandwidths(bandwidths, self.n, target, self.min_bandwidth)
        else {
            return 0;
        };

        let max_bw = analyze_bandwidth(&mut usable, self.k, target);
        if max_bw == 0 || max_bw < self.min_bandwidth {
            log::debug!(
                "eva pipe: max bandwidth {} is below the threshold {}",
                max_bw,
                self.min_bandwidth
            );
            return 0;
        }
        let Some(Quantized { base, slots, units }) =
            quantize(&usable, self.k, target, self.task_num)
        else {
            log::debug!(
                "eva pipe: max bandwidth {} cannot be split into {} slots",
                max_bw,
                self.task_num
            );
            return 0;
        };

        let mut table = SlotTable::new(&units, self.k, target, slots as usize);
        table.first_pass();
        table.second_pass();
        if !table.is_complete() {
            log::debug!(
                "eva pipe: {} uploads and {} downloads left unassigned",
                table.up_missing,
                table.down_missing
            );
            return 0;
        }
        let Some(recipients) = table.recipients() else {
            log::warn!("eva pipe: the slot assignment does not form a tree");
            return 0;
        };
        log::debug!(
            "eva pipe: {} slots of {} for target {}",
            slots,
            base,
            target_id
        );
        self.plan = PipePlan {
            base,
            recipients,
        };
        1
    }

    fn task_number(&self, stage: usize) -> usize {
        if stage == 0 {
            self.plan.recipients.len()
        } else {
            0
        }
    }

    fn fill_task(&self, stage: usize, task: usize, node_id: NodeId, payload: Payload) -> RepairTask {
        if stage != 0 {
            return RepairTask::idle();
        }
        let (Some(node), Some(recipients)) =
            (node_index(node_id, self.n), self.plan.recipients.get(task))
        else {
            return RepairTask::idle();
        };
        let Some(recipient) = recipients[node] else {
            return RepairTask::idle();
        };
        let source_ids = recipients
            .iter()
            .enumerate()
            .filter(|&(i, r)| i != node && *r == Some(node))
            .map(|(i, _)| i + 1)
            .collect();
        let (offset, size) = self.slot_span(task, payload);
        RepairTask {
            target_id: recipient + 1,
            bandwidth: self.plan.base,
            offset,
            size,
            source_ids,
        }
    }

    fn capacity(&self) -> u64 {
        self.plan
            .base
            .saturating_mul(self.plan.recipients.len() as u64)
    }
}
