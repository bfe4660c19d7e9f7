//! Restart record of the IB method
//!
//! Only the state that cannot be rebuilt from the input and the Lagrangian
//! data itself is written: kernel choices, ghost widths, flow-meter totals
//! and the source/sink point sets.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{IbError, IbResult};
use crate::sources::LevelSources;

/// Version of the record layout written by this build.
pub const IB_METHOD_VERSION: u32 = 1;

/// Serialized IB method state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestartRecord {
    /// Layout version.
    pub version: u32,
    /// Interpolation kernel name.
    pub interp_kernel_fcn: String,
    /// Spreading kernel name.
    pub spread_kernel_fcn: String,
    /// Ghost width per axis.
    pub ghosts: Vec<usize>,
    /// Flow meter names.
    pub instrument_names: Vec<String>,
    /// Accumulated volume through each meter.
    pub total_flow_volume: Vec<f64>,
    /// Number of sources per level.
    pub n_src: Vec<usize>,
    /// Source data per level.
    pub sources: Vec<LevelSources>,
    /// Whether net sources are cancelled at the boundary.
    pub normalize_source_strength: bool,
}

impl RestartRecord {
    /// Write the record as JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> IbResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Read a record and check its version on behalf of `object_name`.
    pub fn load(path: impl AsRef<Path>, object_name: &str) -> IbResult<Self> {
        let contents = fs::read_to_string(path)?;
        let record: RestartRecord = serde_json::from_str(&contents)?;
        record.check_version(object_name)?;
        Ok(record)
    }

    /// Fail unless the record was written with [`IB_METHOD_VERSION`].
    pub fn check_version(&self, object_name: &str) -> IbResult<()> {
        if self.version != IB_METHOD_VERSION {
            return Err(IbError::RestartVersionMismatch {
                object: object_name.to_string(),
                expected: IB_METHOD_VERSION,
                found: self.version,
            });
        }
        Ok(())
    }

    /// Per-level sources with the count written for each level.
    pub fn level_sources(&self) -> IbResult<Vec<LevelSources>> {
        if self.n_src.len() != self.sources.len() {
            return Err(IbError::Config(format!(
                "restart record lists {} source counts for {} levels",
                self.n_src.len(),
                self.sources.len()
            )));
        }
        for (ln, (n, level)) in self.n_src.iter().zip(&self.sources).enumerate() {
            if level.len() != *n || level.positions.len() != *n || level.radii.len() != *n || level.pressures.len() != *n {
                return Err(IbError::Config(format!(
                    "restart record holds inconsistent source data on level {}",
                    ln
                )));
            }
        }
        Ok(self.sources.clone())
    }
}
