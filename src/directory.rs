//! Concurrent client directory.
//!
//! Maps client keys to the records of logged-in clients. Storage is a flat
//! array bounded by the maximum client count; every operation is a linear
//! scan over the live entries, and removal fills the hole with the last
//! entry. Order among entries carries no meaning.
//!
//! Lookups share a `ReaderPreferringLock` and never wait for each other;
//! inserts and removes take it exclusively. A steady stream of overlapping
//! lookups can therefore hold off a pending insert or remove.

use crate::connection::Connection;
use crate::protocol::client_key;
use crate::sync::ReaderPreferringLock;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Anything stored in a `Directory`.
pub trait Keyed {
    fn key(&self) -> u64;
}

/// A message published by a client.
#[derive(Debug, Clone)]
pub struct Publication {
    /// Global publication order across all clients.
    pub seq: u64,
    pub date: DateTime<Utc>,
    pub body: String,
}

/// Social state of a client, touched only by command handlers.
#[derive(Debug, Default)]
pub struct Profile {
    pub publications: Vec<Publication>,
    /// Keys of the clients this one follows, itself excluded.
    pub followed: Vec<u64>,
    /// Number of clients following this one.
    pub followers: usize,
}

/// One logged-in client.
#[derive(Debug)]
pub struct ClientRecord {
    pub key: u64,
    pub name: String,
    /// Reply channel; closed when the record leaves the directory.
    pub connection: Connection,
    pub profile: Mutex<Profile>,
}

impl ClientRecord {
    pub fn new(name: &str, connection: Connection) -> Self {
        Self {
            key: client_key(name),
            name: name.to_string(),
            connection,
            profile: Mutex::new(Profile::default()),
        }
    }
}

impl Keyed for ClientRecord {
    fn key(&self) -> u64 {
        self.key
    }
}

/// Directory operation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DirectoryError {
    #[error("key {0} already in use")]
    DuplicateKey(u64),
    #[error("maximum number of clients reached ({0})")]
    Full(usize),
    #[error("no client with key {0}")]
    NotFound(u64),
}

/// Fixed-capacity keyed table shared by every session and worker.
pub struct Directory<T> {
    entries: ReaderPreferringLock<Vec<Arc<T>>>,
    capacity: usize,
}

/// The directory of logged-in clients.
pub type ClientDirectory = Directory<ClientRecord>;

impl<T: Keyed> Directory<T> {
    /// Create a directory holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: ReaderPreferringLock::new(Vec::with_capacity(capacity)),
            capacity,
        }
    }

    /// Find the entry registered under `key`.
    pub fn lookup(&self, key: u64) -> Option<Arc<T>> {
        let entries = self.entries.read();
        entries.iter().find(|e| e.key() == key).cloned()
    }

    /// Register a new entry.
    ///
    /// Fails if the table is full or an entry with the same key is live;
    /// the directory is left unchanged in both cases.
    pub fn insert(&self, entry: Arc<T>) -> Result<(), DirectoryError> {
        let key = entry.key();
        let mut entries = self.entries.write();

        if entries.len() == self.capacity {
            warn!(capacity = self.capacity, "Maximum number of clients reached");
            return Err(DirectoryError::Full(self.capacity));
        }
        if entries.iter().any(|e| e.key() == key) {
            warn!(key, "Key already in use");
            return Err(DirectoryError::DuplicateKey(key));
        }

        entries.push(entry);
        debug!(key, live = entries.len(), "Registered client");
        Ok(())
    }

    /// Unregister and return the entry under `key`.
    pub fn remove(&self, key: u64) -> Result<Arc<T>, DirectoryError> {
        let mut entries = self.entries.write();

        let Some(pos) = entries.iter().position(|e| e.key() == key) else {
            warn!(key, "No client found");
            return Err(DirectoryError::NotFound(key));
        };

        let entry = entries.swap_remove(pos);
        debug!(key, live = entries.len(), "Unregistered client");
        Ok(entry)
    }

    /// Clones of every live entry, taken under a single read.
    pub fn snapshot(&self) -> Vec<Arc<T>> {
        self.entries.read().clone()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of live entries.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Keys of the live entries, in storage order.
    #[cfg(test)]
    pub fn keys(&self) -> Vec<u64> {
        self.entries.read().iter().map(|e| e.key()).collect()
    }
}
