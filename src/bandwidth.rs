//! the bandwidth budgets of the cluster nodes, and where they come from

use std::{
    fs,
    path::{Path, PathBuf},
};

/// the upload/download budget of a node in the current cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Bandwidth {
    pub upload: u64,
    pub download: u64,
}

impl Bandwidth {
    pub fn new(upload: u64, download: u64) -> Self {
        Self { upload, download }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BandwidthError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("malformed bandwidth entry at line {line}: {reason}")]
    Parse { line: usize, reason: String },
    #[error("expected bandwidths of {expected} nodes, got {got}")]
    Insufficient { expected: usize, got: usize },
}

/// A source of bandwidth measurements.
/// The measuring itself happens elsewhere, a source only hands out the latest numbers.
pub trait BandwidthSource {
    /// Sample the bandwidths of `n` nodes, indexed by 0-based node id
    fn sample(&mut self, n: usize) -> Result<Vec<Bandwidth>, BandwidthError>;
}

/// a fixed set of bandwidths, mostly useful for tests and replays
#[derive(Debug, Clone, Default)]
pub struct StaticBandwidths(pub Vec<Bandwidth>);

impl BandwidthSource for StaticBandwidths {
    fn sample(&mut self, n: usize) -> Result<Vec<Bandwidth>, BandwidthError> {
        if self.0.len() < n {
            return Err(BandwidthError::Insufficient {
                expected: n,
                got: self.0.len(),
            });
        }
        Ok(self.0[..n].to_vec())
    }
}

impl From<Vec<Bandwidth>> for StaticBandwidths {
    fn from(value: Vec<Bandwidth>) -> Self {
        Self(value)
    }
}

/// A bandwidth file, re-read on every sample.
/// Each line holds the `upload download` pair of one node, in node id order.
/// Blank lines and `#` comments are skipped.
#[derive(Debug, Clone)]
pub struct BandwidthFile {
    path: PathBuf,
}

impl BandwidthFile {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BandwidthSource for BandwidthFile {
    fn sample(&mut self, n: usize) -> Result<Vec<Bandwidth>, BandwidthError> {
        let content = fs::read_to_string(&self.path)?;
        let bandwidths = parse_bandwidths(&content)?;
        log::trace!(
            "read {} bandwidth entries from {}",
            bandwidths.len(),
            self.path.display()
        );
        if bandwidths.len() < n {
            return Err(BandwidthError::Insufficient {
                expected: n,
                got: bandwidths.len(),
            });
        }
        Ok(bandwidths.into_iter().take(n).collect())
    }
}

/// parse the `upload download` lines of a bandwidth file
pub fn parse_bandwidths(content: &str) -> Result<Vec<Bandwidth>, BandwidthError> {
    let mut bandwidths = Vec::new();
    for (idx, raw) in content.lines().enumerate() {
        let line = match raw.split_once('#') {
            Some((data, _)) => data,
            None => raw,
        }
        .trim();
        if line.is_empty() {
            continue;
        }
        let parse_err = |reason: String| BandwidthError::Parse {
            line: idx + 1,
            reason,
        };
        let fields: Vec<&str> = line.split_whitespace().collect();
        let [upload, download] = fields.as_slice() else {
            return Err(parse_err(format!(
                "expected `upload download`, got {} fields",
                fields.len()
            )));
        };
        let upload = upload
            .parse::<u64>()
            .map_err(|e| parse_err(format!("upload {upload:?}: {e}")))?;
        let download = download
            .parse::<u64>()
            .map_err(|e| parse_err(format!("download {download:?}: {e}")))?;
        bandwidths.push(Bandwidth { upload, download });
    }
    Ok(bandwidths)
}
