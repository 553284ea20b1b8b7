//! Persistent ledger backed by SQLite.
//!
//! Each settlement is one `BEGIN IMMEDIATE` transaction: the write lock is
//! taken before the nonce is read, so two processes sharing the file cannot
//! both pass the replay check. `consumed_nonces` has a `(payer, nonce)`
//! primary key as a second line of defence.
//!
//! Trait methods run on tokio's blocking pool, so a caller's timeout still
//! fires while a commit waits on SQLite's write lock. A commit abandoned that
//! way may still land once the lock frees.
//!
//! Addresses are stored as lowercase `0x` hex, amounts as decimal text.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use alloy::primitives::{keccak256, Address, B256, U256};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use crate::error::{RegistryError, SettlementError};
use crate::ledger::Ledger;
use crate::registry::{AgentIdentity, FeedbackEntry, IdentityRegistry, Service};
use crate::PaymentBundle;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS agents (
        agent_id TEXT PRIMARY KEY,
        seq INTEGER NOT NULL UNIQUE,
        owner TEXT NOT NULL,
        worker TEXT,
        metadata_uri TEXT NOT NULL DEFAULT '',
        tx_count INTEGER NOT NULL DEFAULT 0
    );
    CREATE TABLE IF NOT EXISTS services (
        agent_id TEXT NOT NULL,
        idx INTEGER NOT NULL,
        name TEXT NOT NULL,
        price TEXT NOT NULL,
        active INTEGER NOT NULL DEFAULT 1,
        PRIMARY KEY (agent_id, idx)
    );
    CREATE TABLE IF NOT EXISTS balances (
        account TEXT PRIMARY KEY,
        amount TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS consumed_nonces (
        payer TEXT NOT NULL,
        nonce BLOB NOT NULL,
        PRIMARY KEY (payer, nonce)
    );
    CREATE TABLE IF NOT EXISTS feedback (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        agent_id TEXT NOT NULL,
        payer TEXT NOT NULL,
        score INTEGER NOT NULL,
        service_tag BLOB NOT NULL,
        file_uri TEXT NOT NULL,
        payment_nonce BLOB NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_feedback_agent ON feedback(agent_id);
    CREATE TABLE IF NOT EXISTS settlements (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        handle BLOB NOT NULL UNIQUE,
        agent_id TEXT NOT NULL,
        payer TEXT NOT NULL,
        worker TEXT NOT NULL,
        amount TEXT NOT NULL,
        nonce BLOB NOT NULL
    );
    PRAGMA journal_mode=WAL;
";

fn addr_key(address: &Address) -> String {
    format!("{address:#x}")
}

fn decode_u256(text: &str) -> Result<U256, String> {
    U256::from_str_radix(text, 10).map_err(|e| format!("stored amount '{text}' is corrupt: {e}"))
}

fn decode_address(text: &str) -> Result<Address, String> {
    text.parse()
        .map_err(|e| format!("stored address '{text}' is corrupt: {e}"))
}

fn decode_b256(bytes: &[u8]) -> Result<B256, String> {
    B256::try_from(bytes).map_err(|_| format!("stored hash has {} bytes", bytes.len()))
}

fn unavailable(e: rusqlite::Error) -> SettlementError {
    SettlementError::LedgerUnavailable(e.to_string())
}

fn registry_unavailable(e: rusqlite::Error) -> RegistryError {
    RegistryError::Unavailable(e.to_string())
}

/// How long a statement waits for another connection's write lock before
/// failing with `SQLITE_BUSY`.
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

fn lock(conn: &Mutex<Connection>) -> MutexGuard<'_, Connection> {
    match conn.lock() {
        Ok(c) => c,
        Err(poisoned) => {
            tracing::error!("ledger mutex poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

/// SQLite ledger. Survives restarts; safe to share one file between
/// processes.
pub struct SqliteLedger {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteLedger {
    /// Open (or create) a ledger database at `path`.
    ///
    /// On Unix the file is restricted to 0600: it holds balances and the
    /// payment history of every payer.
    pub fn open(path: &str) -> Result<Self, rusqlite::Error> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(SCHEMA)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) =
                std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            {
                tracing::warn!(
                    path = %path,
                    error = %e,
                    "failed to set ledger database file permissions to 0600"
                );
            }
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        lock(&self.conn)
    }

    /// Run `f` against the connection on the blocking pool.
    async fn blocking<T, E, F>(&self, f: F, failed: fn(String) -> E) -> Result<T, E>
    where
        F: FnOnce(&mut Connection) -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || f(&mut lock(&conn)))
            .await
            .unwrap_or_else(|e| Err(failed(format!("ledger task failed: {e}"))))
    }

    /// Credit `account`. Test and demo funding only.
    pub fn mint(&self, account: Address, amount: U256) -> Result<(), SettlementError> {
        let mut conn = self.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(unavailable)?;
        let balance = read_balance(&tx, &account)?.saturating_add(amount);
        write_balance(&tx, &account, balance)?;
        tx.commit().map_err(unavailable)
    }

    /// Register a new agent owned by `owner`; returns its id. Ids are issued
    /// monotonically starting at 0.
    pub fn register_agent(&self, owner: Address, metadata_uri: &str) -> Result<U256, RegistryError> {
        let mut conn = self.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(registry_unavailable)?;
        let seq: i64 = tx
            .query_row("SELECT COUNT(*) FROM agents", [], |row| row.get(0))
            .map_err(registry_unavailable)?;
        let agent_id = U256::from(seq as u64);
        tx.execute(
            "INSERT INTO agents (agent_id, seq, owner, metadata_uri) VALUES (?1, ?2, ?3, ?4)",
            params![agent_id.to_string(), seq, addr_key(&owner), metadata_uri],
        )
        .map_err(registry_unavailable)?;
        tx.commit().map_err(registry_unavailable)?;

        tracing::info!(agent_id = %agent_id, owner = %owner, "agent registered");
        Ok(agent_id)
    }

    fn owner_of(conn: &Connection, agent_id: U256) -> Result<Address, RegistryError> {
        let owner: Option<String> = conn
            .query_row(
                "SELECT owner FROM agents WHERE agent_id = ?1",
                [agent_id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(registry_unavailable)?;
        let owner = owner.ok_or(RegistryError::AgentNotFound(agent_id))?;
        decode_address(&owner).map_err(RegistryError::Unavailable)
    }

    fn ensure_owner(conn: &Connection, agent_id: U256, caller: Address) -> Result<(), RegistryError> {
        if Self::owner_of(conn, agent_id)? != caller {
            return Err(RegistryError::NotAgentOwner(caller));
        }
        Ok(())
    }

    /// Delegate payments and attestations for `agent_id` to `worker`. Owner only.
    pub fn set_worker(
        &self,
        agent_id: U256,
        caller: Address,
        worker: Address,
    ) -> Result<(), RegistryError> {
        if worker == Address::ZERO {
            return Err(RegistryError::InvalidWorker);
        }
        let conn = self.lock();
        Self::ensure_owner(&conn, agent_id, caller)?;
        conn.execute(
            "UPDATE agents SET worker = ?1 WHERE agent_id = ?2",
            params![addr_key(&worker), agent_id.to_string()],
        )
        .map_err(registry_unavailable)?;
        tracing::info!(agent_id = %agent_id, worker = %worker, "worker address set");
        Ok(())
    }

    /// Append a service. Owner only. Returns its index.
    pub fn add_service(
        &self,
        agent_id: U256,
        caller: Address,
        name: &str,
        price: U256,
    ) -> Result<usize, RegistryError> {
        let mut conn = self.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(registry_unavailable)?;
        Self::ensure_owner(&tx, agent_id, caller)?;
        let idx: i64 = tx
            .query_row(
                "SELECT COUNT(*) FROM services WHERE agent_id = ?1",
                [agent_id.to_string()],
                |row| row.get(0),
            )
            .map_err(registry_unavailable)?;
        tx.execute(
            "INSERT INTO services (agent_id, idx, name, price, active) VALUES (?1, ?2, ?3, ?4, 1)",
            params![agent_id.to_string(), idx, name, price.to_string()],
        )
        .map_err(registry_unavailable)?;
        tx.commit().map_err(registry_unavailable)?;
        Ok(idx as usize)
    }

    /// Toggle a service on or off. Owner only.
    pub fn set_service_active(
        &self,
        agent_id: U256,
        caller: Address,
        index: usize,
        active: bool,
    ) -> Result<(), RegistryError> {
        let conn = self.lock();
        Self::ensure_owner(&conn, agent_id, caller)?;
        let updated = conn
            .execute(
                "UPDATE services SET active = ?1 WHERE agent_id = ?2 AND idx = ?3",
                params![active, agent_id.to_string(), index as i64],
            )
            .map_err(registry_unavailable)?;
        if updated == 0 {
            return Err(RegistryError::ServiceNotFound(index));
        }
        Ok(())
    }

    /// Snapshot of an agent's registry entry.
    pub fn agent(&self, agent_id: U256) -> Result<Option<AgentIdentity>, RegistryError> {
        let conn = self.lock();
        let row: Option<(String, Option<String>, String, i64)> = conn
            .query_row(
                "SELECT owner, worker, metadata_uri, tx_count FROM agents WHERE agent_id = ?1",
                [agent_id.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()
            .map_err(registry_unavailable)?;
        let Some((owner, worker, metadata_uri, tx_count)) = row else {
            return Ok(None);
        };
        Ok(Some(AgentIdentity {
            agent_id,
            owner: decode_address(&owner).map_err(RegistryError::Unavailable)?,
            worker: worker
                .as_deref()
                .map(decode_address)
                .transpose()
                .map_err(RegistryError::Unavailable)?,
            metadata_uri,
            services: read_services(&conn, agent_id)?,
            tx_count: tx_count as u64,
        }))
    }

    /// The agent's reputation log, oldest first.
    pub fn feedback(&self, agent_id: U256) -> Result<Vec<FeedbackEntry>, RegistryError> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare(
                "SELECT payer, score, service_tag, file_uri, payment_nonce
                 FROM feedback WHERE agent_id = ?1 ORDER BY id",
            )
            .map_err(registry_unavailable)?;
        let rows = stmt
            .query_map([agent_id.to_string()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, u8>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Vec<u8>>(4)?,
                ))
            })
            .map_err(registry_unavailable)?;

        let mut entries = Vec::new();
        for row in rows {
            let (payer, score, tag, file_uri, nonce) = row.map_err(registry_unavailable)?;
            entries.push(FeedbackEntry {
                payer: decode_address(&payer).map_err(RegistryError::Unavailable)?,
                score,
                service_tag: decode_b256(&tag).map_err(RegistryError::Unavailable)?,
                file_uri,
                payment_nonce: decode_b256(&nonce).map_err(RegistryError::Unavailable)?,
            });
        }
        Ok(entries)
    }
}

fn commit(
    conn: &mut Connection,
    bundle: &PaymentBundle,
    worker: Address,
) -> Result<B256, SettlementError> {
    let auth = &bundle.authorization;
    let agent_key = bundle.agent_id.to_string();
    let payer_key = addr_key(&auth.payer);

    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(unavailable)?;

    let current: Option<Option<String>> = tx
        .query_row(
            "SELECT worker FROM agents WHERE agent_id = ?1",
            [&agent_key],
            |row| row.get(0),
        )
        .optional()
        .map_err(unavailable)?;
    if current.flatten().as_deref() != Some(addr_key(&worker).as_str()) {
        return Err(SettlementError::InvalidAttestationSignature);
    }

    let consumed = tx
        .query_row(
            "SELECT 1 FROM consumed_nonces WHERE payer = ?1 AND nonce = ?2",
            params![payer_key, auth.nonce.as_slice()],
            |_| Ok(()),
        )
        .optional()
        .map_err(unavailable)?
        .is_some();
    if consumed {
        return Err(SettlementError::NonceReplay);
    }

    let payer_balance = read_balance(&tx, &auth.payer)?;
    let debited =
        payer_balance
            .checked_sub(auth.amount)
            .ok_or(SettlementError::InsufficientBalance {
                payer: auth.payer,
                required: auth.amount,
            })?;
    if worker != auth.payer {
        let credited = read_balance(&tx, &worker)?
            .checked_add(auth.amount)
            .ok_or_else(|| {
                SettlementError::InternalInvariantViolation("worker balance overflow".into())
            })?;
        write_balance(&tx, &auth.payer, debited)?;
        write_balance(&tx, &worker, credited)?;
    }

    tx.execute(
        "INSERT INTO consumed_nonces (payer, nonce) VALUES (?1, ?2)",
        params![payer_key, auth.nonce.as_slice()],
    )
    .map_err(|e| match e {
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            SettlementError::NonceReplay
        }
        other => unavailable(other),
    })?;

    tx.execute(
        "INSERT INTO feedback (agent_id, payer, score, service_tag, file_uri, payment_nonce)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            agent_key,
            payer_key,
            bundle.score,
            bundle.service_tag.as_slice(),
            bundle.file_uri,
            auth.nonce.as_slice()
        ],
    )
    .map_err(unavailable)?;

    let updated = tx
        .execute(
            "UPDATE agents SET tx_count = tx_count + 1 WHERE agent_id = ?1",
            [&agent_key],
        )
        .map_err(unavailable)?;
    if updated != 1 {
        return Err(SettlementError::InternalInvariantViolation(format!(
            "agent {agent_key} vanished during commit"
        )));
    }

    let seq: i64 = tx
        .query_row("SELECT COUNT(*) FROM settlements", [], |row| row.get(0))
        .map_err(unavailable)?;
    let mut preimage = Vec::with_capacity(20 + 32 + 8);
    preimage.extend_from_slice(auth.payer.as_slice());
    preimage.extend_from_slice(auth.nonce.as_slice());
    preimage.extend_from_slice(&(seq as u64 + 1).to_be_bytes());
    let handle = keccak256(preimage);

    tx.execute(
        "INSERT INTO settlements (handle, agent_id, payer, worker, amount, nonce)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            handle.as_slice(),
            agent_key,
            payer_key,
            addr_key(&worker),
            auth.amount.to_string(),
            auth.nonce.as_slice()
        ],
    )
    .map_err(unavailable)?;

    tx.commit().map_err(unavailable)?;
    Ok(handle)
}

fn read_balance(conn: &Connection, account: &Address) -> Result<U256, SettlementError> {
    let stored: Option<String> = conn
        .query_row(
            "SELECT amount FROM balances WHERE account = ?1",
            [addr_key(account)],
            |row| row.get(0),
        )
        .optional()
        .map_err(unavailable)?;
    match stored {
        Some(text) => decode_u256(&text).map_err(SettlementError::InternalInvariantViolation),
        None => Ok(U256::ZERO),
    }
}

fn write_balance(conn: &Connection, account: &Address, amount: U256) -> Result<(), SettlementError> {
    conn.execute(
        "INSERT INTO balances (account, amount) VALUES (?1, ?2)
         ON CONFLICT(account) DO UPDATE SET amount = excluded.amount",
        params![addr_key(account), amount.to_string()],
    )
    .map_err(unavailable)?;
    Ok(())
}

fn read_services(conn: &Connection, agent_id: U256) -> Result<Vec<Service>, RegistryError> {
    let mut stmt = conn
        .prepare("SELECT name, price, active FROM services WHERE agent_id = ?1 ORDER BY idx")
        .map_err(registry_unavailable)?;
    let rows = stmt
        .query_map([agent_id.to_string()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, bool>(2)?,
            ))
        })
        .map_err(registry_unavailable)?;

    let mut services = Vec::new();
    for row in rows {
        let (name, price, active) = row.map_err(registry_unavailable)?;
        services.push(Service {
            name,
            price: decode_u256(&price).map_err(RegistryError::Unavailable)?,
            active,
        });
    }
    Ok(services)
}

impl Ledger for SqliteLedger {
    async fn settle_and_log(
        &self,
        bundle: &PaymentBundle,
        worker: Address,
    ) -> Result<B256, SettlementError> {
        let bundle = bundle.clone();
        self.blocking(
            move |conn| commit(conn, &bundle, worker),
            SettlementError::LedgerUnavailable,
        )
        .await
    }

    async fn is_nonce_consumed(&self, payer: Address, nonce: B256) -> Result<bool, SettlementError> {
        self.blocking(
            move |conn| {
                let found = conn
                    .query_row(
                        "SELECT 1 FROM consumed_nonces WHERE payer = ?1 AND nonce = ?2",
                        params![addr_key(&payer), nonce.as_slice()],
                        |_| Ok(()),
                    )
                    .optional()
                    .map_err(unavailable)?;
                Ok(found.is_some())
            },
            SettlementError::LedgerUnavailable,
        )
        .await
    }

    async fn balance_of(&self, account: Address) -> Result<U256, SettlementError> {
        self.blocking(
            move |conn| read_balance(conn, &account),
            SettlementError::LedgerUnavailable,
        )
        .await
    }
}

impl IdentityRegistry for SqliteLedger {
    async fn get_worker(&self, agent_id: U256) -> Result<Option<Address>, RegistryError> {
        self.blocking(
            move |conn| {
                let worker: Option<Option<String>> = conn
                    .query_row(
                        "SELECT worker FROM agents WHERE agent_id = ?1",
                        [agent_id.to_string()],
                        |row| row.get(0),
                    )
                    .optional()
                    .map_err(registry_unavailable)?;
                worker
                    .flatten()
                    .as_deref()
                    .map(decode_address)
                    .transpose()
                    .map_err(RegistryError::Unavailable)
            },
            RegistryError::Unavailable,
        )
        .await
    }

    async fn get_services(&self, agent_id: U256) -> Result<Vec<Service>, RegistryError> {
        self.blocking(
            move |conn| read_services(conn, agent_id),
            RegistryError::Unavailable,
        )
        .await
    }

    async fn get_tx_count(&self, agent_id: U256) -> Result<u64, RegistryError> {
        self.blocking(
            move |conn| {
                let count: Option<i64> = conn
                    .query_row(
                        "SELECT tx_count FROM agents WHERE agent_id = ?1",
                        [agent_id.to_string()],
                        |row| row.get(0),
                    )
                    .optional()
                    .map_err(registry_unavailable)?;
                Ok(count.unwrap_or(0) as u64)
            },
            RegistryError::Unavailable,
        )
        .await
    }
}
