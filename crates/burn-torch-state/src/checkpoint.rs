//! Checkpoint directories in the `save_pretrained` layout.
//!
//! A directory holds either one weight file or a sharded set described by an index:
//!
//! ```text
//! model.safetensors                 single safetensors file
//! model.safetensors.index.json      {"weight_map": {"<tensor>": "<shard file>", ...}}
//! pytorch_model.bin                 single torch.save archive
//! pytorch_model.bin.index.json      same index, pointing at torch.save shards
//! ```

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::format;
use alloc::string::String;
use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::file::read_file;
use crate::pytorch::PytorchReader;
use crate::safetensors::SafetensorsFile;
use crate::tensor::Tensor;

/// File names probed by [`load_checkpoint`], in order.
pub const CHECKPOINT_NAMES: [&str; 4] = [
    "model.safetensors",
    "model.safetensors.index.json",
    "pytorch_model.bin",
    "pytorch_model.bin.index.json",
];

const INDEX_SUFFIX: &str = ".index.json";

#[derive(Deserialize)]
struct ShardIndex {
    weight_map: BTreeMap<String, String>,
}

/// Load the module state stored in a checkpoint directory.
///
/// With `name = None` the first of [`CHECKPOINT_NAMES`] present in `dir` is used. An explicit
/// `name` must be a bare file name inside `dir`; point it at the `.index.json` file to load a
/// sharded checkpoint.
pub fn load_checkpoint(
    dir: impl AsRef<Path>,
    name: Option<&str>,
) -> Result<BTreeMap<String, Tensor>> {
    let dir = dir.as_ref();
    let name = match name {
        Some(name) => {
            check_file_name(name)?;
            name
        }
        None => CHECKPOINT_NAMES
            .into_iter()
            .find(|name| dir.join(name).is_file())
            .ok_or_else(|| Error::UnsupportedFormat {
                reason: format!(
                    "no checkpoint found in {}, expected one of {CHECKPOINT_NAMES:?}",
                    dir.display()
                ),
            })?,
    };

    log::debug!("Loading checkpoint {name} from {}", dir.display());
    if name.ends_with(INDEX_SUFFIX) {
        load_sharded(dir, name)
    } else {
        load_file(&dir.join(name))
    }
}

fn load_file(path: &Path) -> Result<BTreeMap<String, Tensor>> {
    if path.extension().is_some_and(|ext| ext == "safetensors") {
        SafetensorsFile::open(path)?.load_all()
    } else {
        PytorchReader::open(path)?.tensors(None)
    }
}

fn load_sharded(dir: &Path, index_name: &str) -> Result<BTreeMap<String, Tensor>> {
    let data = read_file(&dir.join(index_name))?;
    let index: ShardIndex = serde_json::from_slice(&data).map_err(|e| Error::UnsupportedFormat {
        reason: format!("invalid shard index {index_name}: {e}"),
    })?;

    let shards: BTreeSet<&str> = index.weight_map.values().map(String::as_str).collect();
    log::debug!(
        "Shard index lists {} tensors in {} files",
        index.weight_map.len(),
        shards.len()
    );

    let mut tensors = BTreeMap::new();
    for shard in shards {
        check_file_name(shard)?;
        let loaded = load_file(&dir.join(shard))?;
        for (name, tensor) in loaded {
            // Only take what the index assigns to this shard.
            if index.weight_map.get(&name).is_some_and(|owner| owner == shard) {
                tensors.insert(name, tensor);
            } else {
                log::trace!("Ignoring '{name}' in shard {shard}, not listed in the index");
            }
        }
    }

    match index.weight_map.keys().find(|name| !tensors.contains_key(*name)) {
        Some(name) => Err(Error::StorageNotFound { key: name.clone() }),
        None => Ok(tensors),
    }
}

fn check_file_name(name: &str) -> Result<()> {
    let bare = !name.is_empty()
        && !name.contains(['/', '\\'])
        && name != "."
        && name != "..";
    if bare {
        Ok(())
    } else {
        Err(Error::UnsupportedFormat {
            reason: format!("checkpoint name '{name}' must be a file name, not a path"),
        })
    }
}
