//! the upload assignment of BestFlow

use std::{
    cmp::Ordering,
    collections::{BTreeSet, VecDeque},
};

use super::Round;
use crate::calculator::segment::{carve, Segment};

/// the sourcing progress of a task
#[derive(Debug, Clone, Copy)]
pub(super) struct RemainTask {
    /// the unsourced part of the current layer
    task: Segment,
    /// how many more distinct uploaders the task needs
    remain: usize,
}

/// the order in which a node picks the tasks to upload for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Pick {
    remain: usize,
    /// the owner of the task has been assigned already
    passed: bool,
    id: usize,
}

impl Ord for Pick {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .remain
            .cmp(&self.remain)
            .then(other.passed.cmp(&self.passed))
            .then_with(|| {
                if self.passed {
                    self.id.cmp(&other.id)
                } else {
                    other.id.cmp(&self.id)
                }
            })
    }
}

impl PartialOrd for Pick {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct PickQueue {
    picks: BTreeSet<Pick>,
    cursor: usize,
}

impl PickQueue {
    fn new(remains: &[RemainTask], cursor: usize) -> Self {
        let picks = remains
            .iter()
            .enumerate()
            .map(|(id, r)| Pick {
                remain: r.remain,
                passed: id < cursor,
                id,
            })
            .collect();
        Self { picks, cursor }
    }

    fn update(&mut self, id: usize, old: usize, new: usize) {
        let passed = id < self.cursor;
        self.picks.remove(&Pick {
            remain: old,
            passed,
            id,
        });
        self.picks.insert(Pick {
            remain: new,
            passed,
            id,
        });
    }
}

impl Round {
    /// Hand out the uploads node by node, in priority order.
    /// `cursor` is the task id of the next node owning a task.
    pub(super) fn assign_uploads(&mut self) {
        self.remains = self
            .tasks
            .iter()
            .map(|&task| RemainTask {
                task,
                remain: self.k,
            })
            .collect();
        let mut cursor = 0;
        for pos in 0..self.nodes.len() {
            let has_task = !self.nodes[pos].task.is_empty();
            self.assign_node(pos, cursor);
            if has_task {
                cursor += 1;
            }
        }
    }

    fn assign_node(&mut self, pos: usize, cursor: usize) {
        let own = self.nodes[pos].task;
        let has_task = !own.is_empty();
        let mut upload = self.nodes[pos].upload;
        if has_task && self.nodes[pos].id != self.target {
            // a helper always sources its own task
            self.remains[own.task].remain = self.remains[own.task].remain.saturating_sub(1);
            self.nodes[pos].uploads.push(own);
            upload = upload.saturating_sub(own.size());
        }

        let mut queue = PickQueue::new(&self.remains, cursor);
        while upload > 0 {
            let Some(claimed) = self.next_claim(pos, cursor, has_task, upload, &queue) else {
                break;
            };
            let id = claimed.task;
            upload -= claimed.size();
            self.nodes[pos].uploads.push(claimed);
            let remain = &mut self.remains[id];
            remain.task.start = claimed.end;
            if remain.task.is_empty() {
                // the layer is complete, start over for the next source
                remain.task.start = self.tasks[id].start;
                remain.remain -= 1;
                queue.update(id, remain.remain + 1, remain.remain);
            }
        }

        if has_task {
            self.exchange(pos, cursor, upload);
        }
    }

    /// the first slice the node can source, following the pick order
    fn next_claim(
        &self,
        pos: usize,
        cursor: usize,
        has_task: bool,
        upload: u64,
        queue: &PickQueue,
    ) -> Option<Segment> {
        for pick in &queue.picks {
            if pick.remain == 0 {
                break;
            }
            let id = pick.id;
            if id == cursor && has_task {
                continue;
            }
            // the last layer of a task whose owner is still to come is left to the owner
            if pick.remain == 1 && ((has_task && id > cursor) || (!has_task && id >= cursor)) {
                continue;
            }
            let mut pending = self.remains[id].task;
            let claimed = pending.claim_prefix(&self.nodes[pos].uploads, upload);
            if !claimed.is_empty() {
                return Some(claimed);
            }
        }
        None
    }

    /// Trade spare upload of the node at `pos` for the last layer of its own task.
    ///
    /// When both the own task and the next one miss exactly one source, a prior node
    /// sourcing the next task hands a slice of it over and sources the own task instead.
    /// The node takes the handed-over slice, so the next task keeps its sources.
    fn exchange(&mut self, pos: usize, cursor: usize, upload: u64) {
        let next = cursor + 1;
        if upload == 0
            || next >= self.tasks.len()
            || self.remains[cursor].remain != 1
            || self.remains[next].remain != 1
        {
            return;
        }

        let mut pending = self.remains[cursor].task;
        pending.end = pending.start + pending.size().min(upload);
        let mut wanted = VecDeque::new();
        let mut left = pending.size();
        for remain in &self.remains[next..] {
            if left == 0 {
                break;
            }
            let mut slice = remain.task;
            slice.end = slice.start + slice.size().min(left);
            left -= slice.size();
            if !slice.is_empty() {
                wanted.push_back(slice);
            }
        }

        while !pending.is_empty() {
            let Some(front) = wanted.front().copied() else {
                break;
            };
            let Some((prior, handover)) = self.find_swap(pos, &pending, &front) else {
                break;
            };
            let relief = Segment::new(pending.task, pending.start, pending.start + handover.size());
            pending.start = relief.end;
            let uploads = &mut self.nodes[prior].uploads;
            uploads.push(relief);
            carve(uploads, &handover);
            self.nodes[pos].uploads.push(handover);
            log::trace!(
                "node {} takes {:?} over from node {} for {:?}",
                self.nodes[pos].id + 1,
                handover,
                self.nodes[prior].id + 1,
                relief
            );

            if let Some(front) = wanted.front_mut() {
                if front.task == handover.task {
                    front.start = front.start.max(handover.end);
                }
                if front.is_empty() {
                    wanted.pop_front();
                }
            }
        }

        let remain = &mut self.remains[cursor];
        remain.task.start = pending.start;
        if remain.task.is_empty() {
            remain.task.start = self.tasks[cursor].start;
            remain.remain -= 1;
        }
    }

    /// find a prior node able to source the front of `pending` in exchange for a slice of `front`
    fn find_swap(&self, pos: usize, pending: &Segment, front: &Segment) -> Option<(usize, Segment)> {
        for prior in 0..pos {
            let held = &self.nodes[prior].uploads;
            let mut tcross = pending.first_overlap(held);
            let kcross = front.first_overlap(held);
            if tcross.size() >= pending.size() || kcross.is_empty() {
                continue;
            }
            if !tcross.is_empty() {
                // the prior node has to be free at the front of pending
                if tcross.start == pending.start || kcross.start != front.start {
                    continue;
                }
                tcross.end = pending.end;
            }
            let size = (pending.size() - tcross.size()).min(kcross.size());
            let handover = Segment::new(kcross.task, kcross.start, kcross.start + size);
            if handover.overlaps(&self.nodes[pos].uploads) {
                continue;
            }
            return Some((prior, handover));
        }
        None
    }
}
