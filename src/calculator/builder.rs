use std::str::FromStr;

use super::{AnyCalculator, BestFlow, EvaPipe, RepairRouter};
use crate::{bandwidth::BandwidthSource, task::NodeId};

/// how BestFlow sizes the download task of each helper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SizingPolicy {
    /// proportional to the share of the helper's download in the total download
    Even,
    /// as much as the helper's download can take, `download / (k - 1) + 1`
    #[default]
    Greedy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    /// a single stage plan
    BestFlow(SizingPolicy),
    /// a pipelined plan, split into at least `task_num` slots
    EvaPipe { task_num: usize },
}

/// The construction-time settings of a route calculator.
/// It can be parsed from an algorithm descriptor line:
///
/// - `b 5 <k> <n> <rid> <even:0|1> <min_bw>` for BestFlow
/// - `v 4 <k> <n> <rid> <task_num>` for EvaPipe
///
/// The second field is the count of the parameters that follow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteConfig {
    /// the source-diversity requirement
    pub k: usize,
    /// the cluster size
    pub n: usize,
    /// the 1-based id of the node under repair
    pub target: NodeId,
    pub algorithm: Algorithm,
    /// nodes (other than the target) below this budget are left out
    pub min_bandwidth: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseConfigError {
    #[error("empty algorithm descriptor")]
    Empty,
    #[error("unknown algorithm `{0}`")]
    UnknownAlgorithm(String),
    #[error("algorithm `{algorithm}` takes {expected} parameters, got {got}")]
    ParameterCount {
        algorithm: String,
        expected: usize,
        got: usize,
    },
    #[error("invalid parameter `{name}`: {value:?}")]
    InvalidParameter { name: &'static str, value: String },
}

fn parse_field<T: FromStr>(name: &'static str, value: &str) -> Result<T, ParseConfigError> {
    value
        .parse()
        .map_err(|_| ParseConfigError::InvalidParameter {
            name,
            value: value.to_string(),
        })
}

impl FromStr for RouteConfig {
    type Err = ParseConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.split_whitespace().collect();
        let Some((&name, rest)) = fields.split_first() else {
            return Err(ParseConfigError::Empty);
        };
        let expected = match name {
            "b" => 5,
            "v" => 4,
            _ => return Err(ParseConfigError::UnknownAlgorithm(name.to_string())),
        };
        let Some((&declared, params)) = rest.split_first() else {
            return Err(ParseConfigError::ParameterCount {
                algorithm: name.to_string(),
                expected,
                got: 0,
            });
        };
        let declared: usize = parse_field("count", declared)?;
        if declared != expected || params.len() != expected {
            return Err(ParseConfigError::ParameterCount {
                algorithm: name.to_string(),
                expected,
                got: params.len(),
            });
        }
        let k = parse_field("k", params[0])?;
        let n = parse_field("n", params[1])?;
        let target = parse_field("rid", params[2])?;
        let (algorithm, min_bandwidth) = match name {
            "b" => {
                let policy = match params[3] {
                    "0" => SizingPolicy::Greedy,
                    "1" => SizingPolicy::Even,
                    other => {
                        return Err(ParseConfigError::InvalidParameter {
                            name: "even",
                            value: other.to_string(),
                        })
                    }
                };
                (
                    Algorithm::BestFlow(policy),
                    parse_field("min_bw", params[4])?,
                )
            }
            _ => (
                Algorithm::EvaPipe {
                    task_num: parse_field("task_num", params[3])?,
                },
                0,
            ),
        };
        Ok(Self {
            k,
            n,
            target,
            algorithm,
            min_bandwidth,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("field validation failed: {0}")]
    FieldValidationFailed(String),
}

#[derive(Debug, Clone, Default)]
pub struct RouteCalculatorBuilder {
    k: Option<usize>,
    n: Option<usize>,
    target: Option<NodeId>,
    algorithm: Option<Algorithm>,
    min_bandwidth: u64,
}

impl From<RouteConfig> for RouteCalculatorBuilder {
    fn from(config: RouteConfig) -> Self {
        Self {
            k: Some(config.k),
            n: Some(config.n),
            target: Some(config.target),
            algorithm: Some(config.algorithm),
            min_bandwidth: config.min_bandwidth,
        }
    }
}

impl RouteCalculatorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// set the source-diversity requirement
    pub fn k(mut self, k: usize) -> Self {
        self.k = Some(k);
        self
    }

    /// set the cluster size
    pub fn cluster_size(mut self, n: usize) -> Self {
        self.n = Some(n);
        self
    }

    /// set the 1-based id of the node under repair, only required by the router
    pub fn target(mut self, target: NodeId) -> Self {
        self.target = Some(target);
        self
    }

    pub fn algorithm(mut self, algorithm: Algorithm) -> Self {
        self.algorithm = Some(algorithm);
        self
    }

    /// set the usability threshold
    pub fn min_bandwidth(mut self, min_bandwidth: u64) -> Self {
        self.min_bandwidth = min_bandwidth;
        self
    }

    fn validate(&self) -> Result<(usize, usize, Algorithm), BuildError> {
        let fail = |msg: String| Err(BuildError::FieldValidationFailed(msg));
        let Some(k) = self.k else {
            return fail("k is not set".to_string());
        };
        let Some(n) = self.n else {
            return fail("cluster size is not set".to_string());
        };
        let Some(algorithm) = self.algorithm else {
            return fail("algorithm is not set".to_string());
        };
        if k == 0 {
            return fail("k must be at least 1".to_string());
        }
        if k >= n {
            return fail(format!("k ({k}) must be smaller than the cluster size ({n})"));
        }
        if let Some(target) = self.target {
            if target == 0 || target > n {
                return fail(format!("target {target} is out of the cluster 1..={n}"));
            }
        }
        match algorithm {
            Algorithm::BestFlow(_) if k < 2 => {
                return fail("BestFlow needs k of at least 2".to_string());
            }
            Algorithm::EvaPipe { task_num: 0 } => {
                return fail("EvaPipe needs at least one slot".to_string());
            }
            _ => {}
        }
        Ok((k, n, algorithm))
    }

    pub fn build(self) -> Result<AnyCalculator, BuildError> {
        let (k, n, algorithm) = self.validate()?;
        let calculator: AnyCalculator = match algorithm {
            Algorithm::BestFlow(policy) => {
                Box::new(BestFlow::new(k, n, policy, self.min_bandwidth))
            }
            Algorithm::EvaPipe { task_num } => {
                Box::new(EvaPipe::new(k, n, task_num, self.min_bandwidth))
            }
        };
        Ok(calculator)
    }

    /// build the calculator and bind it to a bandwidth source
    pub fn router<S: BandwidthSource>(self, source: S) -> Result<RepairRouter<S>, BuildError> {
        let Some(target) = self.target else {
            return Err(BuildError::FieldValidationFailed(
                "target is not set".to_string(),
            ));
        };
        let n = self.n.unwrap_or_default();
        let calculator = self.build()?;
        Ok(RepairRouter::new(calculator, source, n, target))
    }
}
