//! The route calculators.
//!
//! A repair cycle starts with [`RouteCalculator::calculate_route`], which rebuilds the plan from the
//! current bandwidths. Afterwards every node asks, task by task, what it has to send.
//! The plan of the last cycle stays queryable until the next cycle replaces it.

use crate::{
    bandwidth::Bandwidth,
    task::{NodeId, Payload, RepairTask},
};

mod best_flow;
mod builder;
mod eva_pipe;
mod router;
mod segment;
mod water_fill;

pub use best_flow::BestFlow;
pub use builder::*;
pub use eva_pipe::EvaPipe;
pub use router::RepairRouter;

/// the contract shared by all repair route strategies
pub trait RouteCalculator {
    /// Recompute the plan for the node `target_id` (1-based) from `bandwidths` (indexed by 0-based node id).
    /// It returns the number of stages of the new plan, 0 if the cycle is infeasible.
    fn calculate_route(&mut self, bandwidths: &[Bandwidth], target_id: NodeId) -> usize;

    /// the number of tasks in the given stage
    fn task_number(&self, stage: usize) -> usize;

    /// What the node `node_id` (1-based) has to do for the given task.
    /// `payload` is the byte span repaired in this cycle.
    /// An idle task (zero size) is returned if the node takes no part, or the query is out of range.
    fn fill_task(&self, stage: usize, task: usize, node_id: NodeId, payload: Payload)
        -> RepairTask;

    /// the total bandwidth of the current plan, 0 if infeasible
    fn capacity(&self) -> u64;
}

pub type AnyCalculator = Box<dyn RouteCalculator + Send + Sync>;

/// convert a 1-based node id into a node index, if it is inside the cluster
fn node_index(node_id: NodeId, n: usize) -> Option<usize> {
    if node_id == 0 || node_id > n {
        None
    } else {
        Some(node_id - 1)
    }
}

/// Copy the bandwidths of the cycle, leaving out what cannot take part.
/// Nodes (other than the target) below the threshold are zeroed,
/// and the target never uploads, because it holds nothing to send.
fn usable_bandwidths(
    bandwidths: &[Bandwidth],
    n: usize,
    target: usize,
    min_bandwidth: u64,
) -> Option<Vec<Bandwidth>> {
    if bandwidths.len() < n {
        log::warn!(
            "expected bandwidths of {} nodes, got {}",
            n,
            bandwidths.len()
        );
        return None;
    }
    let usable = bandwidths[..n]
        .iter()
        .enumerate()
        .map(|(id, bw)| {
            if id == target {
                Bandwidth::new(0, bw.download)
            } else if bw.upload < min_bandwidth || bw.download < min_bandwidth {
                log::trace!("node {} is below the threshold: {:?}", id + 1, bw);
                Bandwidth::default()
            } else {
                *bw
            }
        })
        .collect();
    Some(usable)
}

/// rescale the part `[start, end)` of `[0, total)` onto the payload span
fn scale_span(start: u64, end: u64, total: u64, payload: Payload) -> (u64, u64) {
    if total == 0 {
        return (payload.offset, 0);
    }
    let scale = |v: u64| (v as u128 * payload.size as u128 / total as u128) as u64;
    let (start, end) = (scale(start), scale(end));
    (payload.offset + start, end - start)
}
