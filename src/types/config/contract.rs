use std::collections::HashMap;
use std::path::Path;

use alloy_primitives::Address;
use anyhow::{bail, Context};
use serde::Deserialize;

/// A contract the engine can scan. Events and functions are given as
/// human-readable signatures, e.g.
/// `"Transfer(address indexed from, address indexed to, uint256 value)"`.
#[derive(Debug, Clone, Deserialize)]
pub struct ContractConfig {
    pub address: Address,
    #[serde(default)]
    pub events: Vec<String>,
    #[serde(default)]
    pub functions: Vec<String>,
}

pub type Contracts = HashMap<String, ContractConfig>;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ContractsOrPath {
    Inline(Contracts),
    Path(String),
}

pub fn load_contracts_from_path(base_dir: &Path, path: &str) -> anyhow::Result<Contracts> {
    let full_path = base_dir.join(path);

    if full_path.is_dir() {
        load_contracts_from_dir(&full_path)
    } else {
        load_contracts_from_file(&full_path)
    }
}

fn load_contracts_from_file(path: &Path) -> anyhow::Result<Contracts> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to load contracts file at {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse contracts file at {}", path.display()))
}

fn load_contracts_from_dir(path: &Path) -> anyhow::Result<Contracts> {
    let mut entries: Vec<_> = std::fs::read_dir(path)
        .with_context(|| format!("Failed to read contracts directory at {}", path.display()))?
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.path()
                .extension()
                .map(|ext| ext == "json")
                .unwrap_or(false)
        })
        .collect();

    entries.sort_by_key(|e| e.path());

    let mut merged = Contracts::new();
    for entry in entries {
        let contracts = load_contracts_from_file(&entry.path())?;
        for key in contracts.keys() {
            if merged.contains_key(key) {
                bail!("Duplicate contract key '{}' found in {}", key, path.display());
            }
        }
        merged.extend(contracts);
    }

    Ok(merged)
}
