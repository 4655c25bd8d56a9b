//! Tail-call chain manager
//!
//! A chain is an ordered dispatch table: a program-array map whose slot at
//! stage index `i` holds the file descriptor of the stage program. The
//! chain takes exclusive ownership of the package's program-array map;
//! stage programs stay owned by the package and are referenced here by id
//! only.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use aya::maps::{Map, MapData, ProgramArray};
use aya::programs::Program;
use log::{debug, info};

use crate::loader::LoadedPackage;
use crate::manifest::ChainDef;

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("chain entry program not defined")]
    EntryUndefined,
    #[error("entry program {0} not present")]
    EntryMissing(String),
    #[error("program array map {0} not found in package")]
    ProgArrayMissing(String),
    #[error("map {0} is not a program array")]
    NotProgArray(String),
    #[error("program array {name} holds {have} slots, chain needs {need}")]
    ProgArrayTooSmall {
        name: String,
        have: u32,
        need: u32,
    },
    #[error("stage program {0} not present")]
    StageMissing(String),
    #[error("wire stage {index}: {source}")]
    StageWire {
        index: u32,
        source: aya::maps::MapError,
    },
    #[error("program {id} has no kernel handle: {source}")]
    ProgramFd {
        id: String,
        source: aya::programs::ProgramError,
    },
    #[error("chain {0} not found")]
    NotFound(String),
}

/// One populated slot of a chain.
#[derive(Debug, Clone)]
pub struct ChainStage {
    pub index: u32,
    pub program_id: String,
}

/// A wired chain. Owns the program-array map; borrows the stage programs
/// from the package for the duration of each wiring call only.
#[derive(Debug)]
pub struct Chain {
    pub id: String,
    pub entry: String,
    pub stages: Vec<ChainStage>,
    prog_array: Map,
}

pub struct ChainManager {
    chains: HashMap<String, Chain>,
}

impl ChainManager {
    pub fn new() -> Self {
        Self {
            chains: HashMap::new(),
        }
    }

    /// Wire the package's chain: take the program-array map, write each
    /// stage program's fd into its slot, and record the chain under a
    /// generated id. Any failure releases the map and leaves no record.
    pub fn wire_chain(
        &mut self,
        pkg: &mut LoadedPackage,
        def: &ChainDef,
    ) -> Result<String, ChainError> {
        if def.entry.is_empty() {
            return Err(ChainError::EntryUndefined);
        }
        if !pkg.has_program(&def.entry) {
            return Err(ChainError::EntryMissing(def.entry.clone()));
        }

        let need = def.stages.len() as u32 + 1;
        if let Some(map_def) = pkg.manifest.map(&def.prog_array) {
            if map_def.max_entries < need {
                return Err(ChainError::ProgArrayTooSmall {
                    name: def.prog_array.clone(),
                    have: map_def.max_entries,
                    need,
                });
            }
        }

        let mut map = pkg
            .take_map(&def.prog_array)
            .ok_or_else(|| ChainError::ProgArrayMissing(def.prog_array.clone()))?;

        let mut stages = Vec::with_capacity(def.stages.len());
        {
            let mut slots: ProgramArray<&mut MapData> = ProgramArray::try_from(&mut map)
                .map_err(|_| ChainError::NotProgArray(def.prog_array.clone()))?;

            for stage in &def.stages {
                let program = pkg
                    .program(&stage.id)
                    .ok_or_else(|| ChainError::StageMissing(stage.id.clone()))?;
                let fd = program.fd().map_err(|source| ChainError::ProgramFd {
                    id: stage.id.clone(),
                    source,
                })?;
                slots
                    .set(stage.index, fd, 0)
                    .map_err(|source| ChainError::StageWire {
                        index: stage.index,
                        source,
                    })?;
                stages.push(ChainStage {
                    index: stage.index,
                    program_id: stage.id.clone(),
                });
            }
        }

        let id = generate_chain_id(&pkg.manifest.metadata.name);
        info!("wired chain {id} with {} stages", stages.len());
        self.chains.insert(
            id.clone(),
            Chain {
                id: id.clone(),
                entry: def.entry.clone(),
                stages,
                prog_array: map,
            },
        );
        pkg.chain_id = Some(id.clone());
        Ok(id)
    }

    /// Overwrite a single slot with a replacement program. No other slot
    /// is touched; there is no atomic rotation across slots.
    pub fn hot_swap_stage(
        &mut self,
        chain_id: &str,
        index: u32,
        new_id: &str,
        program: &Program,
    ) -> Result<(), ChainError> {
        let chain = self
            .chains
            .get_mut(chain_id)
            .ok_or_else(|| ChainError::NotFound(chain_id.to_string()))?;

        let fd = program.fd().map_err(|source| ChainError::ProgramFd {
            id: new_id.to_string(),
            source,
        })?;

        let mut slots: ProgramArray<&mut MapData> = ProgramArray::try_from(&mut chain.prog_array)
            .map_err(|_| ChainError::NotProgArray(chain_id.to_string()))?;
        slots
            .set(index, fd, 0)
            .map_err(|source| ChainError::StageWire { index, source })?;

        for stage in &mut chain.stages {
            if stage.index == index {
                stage.program_id = new_id.to_string();
                break;
            }
        }
        debug!("chain {chain_id} slot {index} now runs {new_id}");
        Ok(())
    }

    pub fn get_chain(&self, id: &str) -> Result<&Chain, ChainError> {
        self.chains
            .get(id)
            .ok_or_else(|| ChainError::NotFound(id.to_string()))
    }

    /// Release the chain's program array and drop the record. Stage
    /// programs belong to the package and are left untouched.
    pub fn delete_chain(&mut self, id: &str) {
        if self.chains.remove(id).is_some() {
            debug!("deleted chain {id}");
        }
    }
}

impl Default for ChainManager {
    fn default() -> Self {
        Self::new()
    }
}

fn generate_chain_id(package_name: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("chain-{package_name}-{nanos}")
}
