//! SQLite-backed persistence for the explorer view.
//!
//! Holds the denormalized rows the read-only frontend consumes: one row per finalized epoch,
//! one per block, validator names and a small JSON key/value table for indexer state. All
//! multi-row writes go through a single transaction.

use crate::types::{Hash256, Slot};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension, Transaction};
use serde::{de::DeserializeOwned, Serialize};
use std::fmt;
use std::time::Duration;

type Pool = r2d2::Pool<SqliteConnectionManager>;

/// A single connection serialises all database access, which also keeps `:memory:` databases
/// coherent across pool checkouts.
pub const POOL_SIZE: u32 = 1;
#[cfg(not(test))]
pub const CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);
#[cfg(test)]
pub const CONNECTION_TIMEOUT: Duration = Duration::from_millis(100);

/// Key of the synchronizer progress record in `explorer_state`.
pub const SYNC_STATE_KEY: &str = "indexer.syncstate";

#[derive(Debug)]
pub enum Error {
    Sql(rusqlite::Error),
    Pool(r2d2::Error),
    Json(serde_json::Error),
    Corrupted(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Sql(e)
    }
}

impl From<r2d2::Error> for Error {
    fn from(e: r2d2::Error) -> Self {
        Error::Pool(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Json(e)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    Canonical,
    Orphaned,
}

impl BlockStatus {
    fn as_i64(self) -> i64 {
        match self {
            BlockStatus::Canonical => 0,
            BlockStatus::Orphaned => 1,
        }
    }

    fn from_i64(value: i64) -> Result<Self, Error> {
        match value {
            0 => Ok(BlockStatus::Canonical),
            1 => Ok(BlockStatus::Orphaned),
            other => Err(Error::Corrupted(format!("unknown block status {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpochRow {
    pub epoch: u64,
    pub dependent_root: Hash256,
    pub validator_count: u64,
    pub validator_balance: u64,
    pub eligible_amount: u64,
    pub vote_counts: bool,
    pub target_votes: u64,
    pub head_votes: u64,
    pub total_votes: u64,
    pub block_count: u64,
    pub attestation_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRow {
    pub root: Hash256,
    pub slot: u64,
    pub parent_root: Hash256,
    pub proposer: u64,
    pub status: BlockStatus,
    pub attestation_count: u64,
}

#[derive(Clone)]
pub struct Database {
    conn_pool: Pool,
}

impl Database {
    /// Open (and if necessary create) the database at `path`. `:memory:` is supported for
    /// tests.
    pub fn open(path: &str) -> Result<Self, Error> {
        let manager = if path == ":memory:" {
            SqliteConnectionManager::memory()
        } else {
            SqliteConnectionManager::file(path)
        };
        let manager = manager.with_init(|conn| conn.pragma_update(None, "foreign_keys", &true));
        let conn_pool = r2d2::Pool::builder()
            .max_size(POOL_SIZE)
            .connection_timeout(CONNECTION_TIMEOUT)
            .build(manager)?;

        let database = Database { conn_pool };
        database.create_tables()?;
        Ok(database)
    }

    pub fn in_memory() -> Result<Self, Error> {
        Self::open(":memory:")
    }

    fn create_tables(&self) -> Result<(), Error> {
        let conn = self.conn_pool.get()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS explorer_state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS epochs (
                epoch INTEGER PRIMARY KEY,
                dependent_root BLOB NOT NULL,
                validator_count INTEGER NOT NULL,
                validator_balance INTEGER NOT NULL,
                eligible_amount INTEGER NOT NULL,
                vote_counts INTEGER NOT NULL,
                target_votes INTEGER NOT NULL,
                head_votes INTEGER NOT NULL,
                total_votes INTEGER NOT NULL,
                block_count INTEGER NOT NULL,
                attestation_count INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS blocks (
                root BLOB PRIMARY KEY,
                slot INTEGER NOT NULL,
                parent_root BLOB NOT NULL,
                proposer INTEGER NOT NULL,
                status INTEGER NOT NULL,
                attestation_count INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS blocks_slot ON blocks (slot);
            CREATE TABLE IF NOT EXISTS validator_names (
                validator_index INTEGER PRIMARY KEY,
                name TEXT NOT NULL
            );",
        )?;
        Ok(())
    }

    /// Run `apply` inside a transaction, committing on success.
    pub fn with_transaction<T>(
        &self,
        apply: impl FnOnce(&Transaction) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let mut conn = self.conn_pool.get()?;
        let txn = conn.transaction()?;
        let result = apply(&txn)?;
        txn.commit()?;
        Ok(result)
    }

    pub fn set_explorer_state<T: Serialize>(
        txn: &Transaction,
        key: &str,
        value: &T,
    ) -> Result<(), Error> {
        let value = serde_json::to_string(value)?;
        txn.execute(
            "INSERT OR REPLACE INTO explorer_state (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn get_explorer_state<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, Error> {
        let conn = self.conn_pool.get()?;
        let value: Option<String> = conn
            .query_row(
                "SELECT value FROM explorer_state WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        match value {
            Some(value) => Ok(Some(serde_json::from_str(&value)?)),
            None => Ok(None),
        }
    }

    pub fn insert_epoch(txn: &Transaction, row: &EpochRow) -> Result<(), Error> {
        txn.execute(
            "INSERT OR REPLACE INTO epochs (epoch, dependent_root, validator_count,
                validator_balance, eligible_amount, vote_counts, target_votes, head_votes,
                total_votes, block_count, attestation_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                row.epoch as i64,
                row.dependent_root.as_bytes(),
                row.validator_count as i64,
                row.validator_balance as i64,
                row.eligible_amount as i64,
                row.vote_counts,
                row.target_votes as i64,
                row.head_votes as i64,
                row.total_votes as i64,
                row.block_count as i64,
                row.attestation_count as i64,
            ],
        )?;
        Ok(())
    }

    pub fn get_epoch(&self, epoch: u64) -> Result<Option<EpochRow>, Error> {
        let conn = self.conn_pool.get()?;
        conn.query_row(
            "SELECT epoch, dependent_root, validator_count, validator_balance,
                eligible_amount, vote_counts, target_votes, head_votes, total_votes,
                block_count, attestation_count
             FROM epochs WHERE epoch = ?1",
            params![epoch as i64],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Vec<u8>>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, bool>(5)?,
                    row.get::<_, i64>(6)?,
                    row.get::<_, i64>(7)?,
                    row.get::<_, i64>(8)?,
                    row.get::<_, i64>(9)?,
                    row.get::<_, i64>(10)?,
                ))
            },
        )
        .optional()?
        .map(
            |(
                epoch,
                dependent_root,
                validator_count,
                validator_balance,
                eligible_amount,
                vote_counts,
                target_votes,
                head_votes,
                total_votes,
                block_count,
                attestation_count,
            )| {
                Ok(EpochRow {
                    epoch: epoch as u64,
                    dependent_root: hash256_from_bytes(&dependent_root)?,
                    validator_count: validator_count as u64,
                    validator_balance: validator_balance as u64,
                    eligible_amount: eligible_amount as u64,
                    vote_counts,
                    target_votes: target_votes as u64,
                    head_votes: head_votes as u64,
                    total_votes: total_votes as u64,
                    block_count: block_count as u64,
                    attestation_count: attestation_count as u64,
                })
            },
        )
        .transpose()
    }

    pub fn insert_block(txn: &Transaction, row: &BlockRow) -> Result<(), Error> {
        txn.execute(
            "INSERT OR REPLACE INTO blocks (root, slot, parent_root, proposer, status,
                attestation_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                row.root.as_bytes(),
                row.slot as i64,
                row.parent_root.as_bytes(),
                row.proposer as i64,
                row.status.as_i64(),
                row.attestation_count as i64,
            ],
        )?;
        Ok(())
    }

    pub fn get_block(&self, root: Hash256) -> Result<Option<BlockRow>, Error> {
        let conn = self.conn_pool.get()?;
        conn.query_row(
            "SELECT root, slot, parent_root, proposer, status, attestation_count
             FROM blocks WHERE root = ?1",
            params![root.as_bytes()],
            |row| {
                Ok((
                    row.get::<_, Vec<u8>>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, i64>(5)?,
                ))
            },
        )
        .optional()?
        .map(
            |(root, slot, parent_root, proposer, status, attestation_count)| {
                Ok(BlockRow {
                    root: hash256_from_bytes(&root)?,
                    slot: slot as u64,
                    parent_root: hash256_from_bytes(&parent_root)?,
                    proposer: proposer as u64,
                    status: BlockStatus::from_i64(status)?,
                    attestation_count: attestation_count as u64,
                })
            },
        )
        .transpose()
    }

    pub fn update_block_status(
        txn: &Transaction,
        root: Hash256,
        status: BlockStatus,
    ) -> Result<(), Error> {
        txn.execute(
            "UPDATE blocks SET status = ?2 WHERE root = ?1",
            params![root.as_bytes(), status.as_i64()],
        )?;
        Ok(())
    }

    /// The root of the highest-slot canonical block strictly before `slot`.
    pub fn get_highest_root_before_slot(&self, slot: Slot) -> Result<Option<Hash256>, Error> {
        let conn = self.conn_pool.get()?;
        let root: Option<Vec<u8>> = conn
            .query_row(
                "SELECT root FROM blocks WHERE slot < ?1 AND status = 0
                 ORDER BY slot DESC LIMIT 1",
                params![slot.as_u64() as i64],
                |row| row.get(0),
            )
            .optional()?;
        root.map(|root| hash256_from_bytes(&root)).transpose()
    }

    pub fn insert_validator_names(
        txn: &Transaction,
        names: &[(u64, String)],
    ) -> Result<(), Error> {
        let mut stmt = txn.prepare(
            "INSERT OR REPLACE INTO validator_names (validator_index, name) VALUES (?1, ?2)",
        )?;
        for (index, name) in names {
            stmt.execute(params![*index as i64, name])?;
        }
        Ok(())
    }

    pub fn delete_validator_names(txn: &Transaction, indices: &[u64]) -> Result<(), Error> {
        let mut stmt = txn.prepare("DELETE FROM validator_names WHERE validator_index = ?1")?;
        for index in indices {
            stmt.execute(params![*index as i64])?;
        }
        Ok(())
    }

    pub fn get_validator_names(&self) -> Result<Vec<(u64, String)>, Error> {
        let conn = self.conn_pool.get()?;
        let mut stmt =
            conn.prepare("SELECT validator_index, name FROM validator_names ORDER BY validator_index")?;
        let rows = stmt
            .query_map(params![], |row| {
                Ok((row.get::<_, i64>(0)? as u64, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn hash256_from_bytes(bytes: &[u8]) -> Result<Hash256, Error> {
    if bytes.len() == 32 {
        Ok(Hash256::from_slice(bytes))
    } else {
        Err(Error::Corrupted(format!(
            "expected 32 byte root, got {}",
            bytes.len()
        )))
    }
}
