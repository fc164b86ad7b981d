use super::AnyCalculator;
use crate::{
    bandwidth::{BandwidthError, BandwidthSource},
    task::{NodeId, Payload, RepairTask},
};

/// A calculator bound to its bandwidth source and to the node under repair.
/// Each `refresh` starts a new repair cycle.
pub struct RepairRouter<S> {
    calculator: AnyCalculator,
    source: S,
    n: usize,
    target: NodeId,
}

impl<S: BandwidthSource> RepairRouter<S> {
    pub(crate) fn new(calculator: AnyCalculator, source: S, n: usize, target: NodeId) -> Self {
        Self {
            calculator,
            source,
            n,
            target,
        }
    }

    pub fn target(&self) -> NodeId {
        self.target
    }

    /// Sample the bandwidths and recompute the routes.
    /// Returns the number of stages of the new plan, 0 if the cycle is infeasible.
    pub fn refresh(&mut self) -> Result<usize, BandwidthError> {
        let bandwidths = self.source.sample(self.n)?;
        let stages = self.calculator.calculate_route(&bandwidths, self.target);
        log::debug!(
            "repair cycle for node {}: {} stage(s), capacity {}",
            self.target,
            stages,
            self.calculator.capacity()
        );
        Ok(stages)
    }

    pub fn task_number(&self, stage: usize) -> usize {
        self.calculator.task_number(stage)
    }

    pub fn fill_task(
        &self,
        stage: usize,
        task: usize,
        node_id: NodeId,
        payload: Payload,
    ) -> RepairTask {
        self.calculator.fill_task(stage, task, node_id, payload)
    }

    pub fn capacity(&self) -> u64 {
        self.calculator.capacity()
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        bandwidth::{Bandwidth, BandwidthError, BandwidthFile, StaticBandwidths},
        calculator::{Algorithm, RouteCalculatorBuilder, SizingPolicy},
        task::Payload,
    };
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use test_log::test;

    fn builder() -> RouteCalculatorBuilder {
        RouteCalculatorBuilder::new()
            .k(2)
            .cluster_size(4)
            .target(1)
            .min_bandwidth(1)
            .algorithm(Algorithm::BestFlow(SizingPolicy::Greedy))
    }

    #[test]
    fn test_refresh_from_static_source() {
        let source = StaticBandwidths::from(vec![
            Bandwidth::new(0, 10),
            Bandwidth::new(10, 10),
            Bandwidth::new(10, 10),
            Bandwidth::new(10, 10),
        ]);
        let mut router = builder().router(source).unwrap();
        assert_eq!(router.target(), 1);
        assert_eq!(router.refresh().unwrap(), 1);
        assert_eq!(router.capacity(), 10);
        assert_eq!(router.task_number(0), 1);
        let task = router.fill_task(0, 0, 1, Payload::new(0, 1000));
        assert_eq!(task.target_id, 1);
        assert_eq!(task.size, 1000);
    }

    #[test]
    fn test_refresh_follows_the_file() -> anyhow::Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        writeln!(file, "0 10\n10 10\n10 10\n10 10")?;
        let mut router = builder().router(BandwidthFile::new(file.path()))?;
        assert_eq!(router.refresh()?, 1);
        assert_eq!(router.capacity(), 10);

        // the helpers fall below the threshold, the previous plan is dropped
        let mut file = file.reopen()?;
        file.set_len(0)?;
        writeln!(file, "0 10\n0 0\n0 0\n0 0")?;
        assert_eq!(router.refresh()?, 0);
        assert_eq!(router.capacity(), 0);
        assert_eq!(router.task_number(0), 0);
        Ok(())
    }

    #[test]
    fn test_refresh_error() {
        let source = StaticBandwidths::from(vec![Bandwidth::new(10, 10)]);
        let mut router = builder().router(source).unwrap();
        assert!(matches!(
            router.refresh(),
            Err(BandwidthError::Insufficient { .. })
        ));
    }
}
