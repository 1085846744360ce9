// Run-time options for the virtual machine.

use std::fs::File;
use std::path::Path;

use ron::de::from_reader;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::machine::DEFAULT_MEMORY_SIZE;

#[derive(Deserialize, Debug, Clone)]
pub struct VmConfig {
    // Words of data memory.
    pub memory_size: usize,
    // Abort the run after this many cycles; None runs to completion.
    pub max_cycles: Option<u64>,
    // Emit a trace line per executed instruction.
    pub trace: bool,
}

impl Default for VmConfig {
    fn default() -> VmConfig {
        VmConfig {
            memory_size: DEFAULT_MEMORY_SIZE,
            max_cycles: None,
            trace: false,
        }
    }
}

pub fn load(path: impl AsRef<Path>) -> Result<VmConfig> {
    let reader = File::open(path)?;
    let config: VmConfig =
        from_reader(reader).map_err(|e| Error::io(format!("bad config: {}", e)))?;
    Ok(config)
}
