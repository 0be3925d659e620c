//! Validator name inventory.
//!
//! Names come from a `index: name` YAML mapping and are mirrored into the database so the
//! explorer can join them against persisted epochs.

use crate::database::{Database, Error as DbError};
use parking_lot::RwLock;
use slog::{info, o, Logger};
use std::collections::HashMap;
use std::fs::File;

pub struct ValidatorNames {
    names: RwLock<HashMap<u64, String>>,
    log: Logger,
}

impl ValidatorNames {
    pub fn new(log: Logger) -> Self {
        ValidatorNames {
            names: RwLock::new(HashMap::new()),
            log: log.new(o!("service" => "validator_names")),
        }
    }

    /// Non-blocking lookup; returns `None` while a reload holds the map.
    pub fn get(&self, index: u64) -> Option<String> {
        self.names.try_read()?.get(&index).cloned()
    }

    pub fn len(&self) -> usize {
        self.names.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.read().is_empty()
    }

    /// Replace the in-memory inventory with the mapping in the YAML file at `path`.
    pub fn load_from_yaml(&self, path: &str) -> Result<(), String> {
        let file = File::open(path)
            .map_err(|e| format!("Error opening validator names file: {:?}", e))?;
        let names: HashMap<u64, String> = serde_yaml::from_reader(file)
            .map_err(|e| format!("Error parsing validator names: {:?}", e))?;

        info!(self.log, "Loaded validator names"; "count" => names.len(), "file" => path);
        *self.names.write() = names;
        Ok(())
    }

    /// Mirror the inventory into the database: upsert current names, delete vanished ones.
    pub fn update_db(&self, database: &Database) -> Result<(), DbError> {
        let names = self.names.read().clone();

        let stale: Vec<u64> = database
            .get_validator_names()?
            .into_iter()
            .filter(|(index, _)| !names.contains_key(index))
            .map(|(index, _)| index)
            .collect();

        let rows: Vec<(u64, String)> = names.into_iter().collect();
        database.with_transaction(|txn| {
            Database::insert_validator_names(txn, &rows)?;
            Database::delete_validator_names(txn, &stale)
        })
    }
}
