//! Storage for authors, document capabilities and entries.
//!
//! Everything is persisted in a [`redb`] database. Memory nodes use redb's in-memory
//! backend so there is a single code path. Entries of a document are additionally kept in
//! an ordered in-memory index, loaded on first use, that the set reconciliation runs on.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    path::Path,
    sync::Arc,
};

use parking_lot::RwLock;
use rand_core::CryptoRngCore;
use redb::{
    Database, MultimapTableDefinition, ReadableTable, TableDefinition,
    backends::InMemoryBackend,
};
use tracing::{debug, trace};

use super::{
    Author, AuthorId, Capability, CapabilityKind, NamespaceId, NamespaceSecret, Query, SignedEntry,
    entry::EntryKey,
    ranger::{self, Fingerprint, Range, fingerprint_of},
};
use crate::{
    blobs::Hash,
    error::{Error, Result},
};

/// Table: Authors
/// Key:   `[u8; 32]` # AuthorId
/// Value: `[u8; 32]` # Author
const AUTHORS_TABLE: TableDefinition<&[u8; 32], &[u8; 32]> = TableDefinition::new("authors-1");

/// Table: Namespaces
/// Key:   `[u8; 32]`       # NamespaceId
/// Value: `(u8, [u8; 32])` # (CapabilityKind, NamespaceSecret or NamespaceId)
const NAMESPACES_TABLE: TableDefinition<&[u8; 32], (u8, &[u8; 32])> =
    TableDefinition::new("namespaces-2");

/// Multimap: Records
/// Key:    `[u8; 32]` # NamespaceId
/// Values: `&[u8]`    # postcard encoded SignedEntry
const RECORDS_TABLE: MultimapTableDefinition<&[u8; 32], &[u8]> =
    MultimapTableDefinition::new("records-1");

/// Table: Settings
/// Key:   `&str`
/// Value: `&[u8]`
const SETTINGS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("settings-1");

const DEFAULT_AUTHOR_KEY: &str = "default-author";

type Index = BTreeMap<EntryKey, SignedEntry>;

/// Manages the documents and authors of a node.
#[derive(Debug, Clone)]
pub struct Store {
    db: Arc<Database>,
    index: Arc<RwLock<HashMap<NamespaceId, Arc<RwLock<Index>>>>>,
}

impl Store {
    /// Creates a store that lives in memory only.
    pub fn memory() -> Result<Self> {
        let db = Database::builder().create_with_backend(InMemoryBackend::new())?;
        Self::new_impl(db)
    }

    /// Opens or creates a store at `path`.
    pub fn persistent(path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::create(path)?;
        Self::new_impl(db)
    }

    fn new_impl(db: Database) -> Result<Self> {
        // Setup all tables
        let write_tx = db.begin_write()?;
        {
            let _table = write_tx.open_multimap_table(RECORDS_TABLE)?;
            let _table = write_tx.open_table(NAMESPACES_TABLE)?;
            let _table = write_tx.open_table(AUTHORS_TABLE)?;
            let _table = write_tx.open_table(SETTINGS_TABLE)?;
        }
        write_tx.commit()?;

        Ok(Store {
            db: Arc::new(db),
            index: Default::default(),
        })
    }

    /// Generates a new author, using the passed in randomness.
    pub fn new_author<R: CryptoRngCore + ?Sized>(&self, rng: &mut R) -> Result<Author> {
        let author = Author::new(rng);
        self.import_author(author.clone())?;
        Ok(author)
    }

    /// Inserts an author.
    pub fn import_author(&self, author: Author) -> Result<()> {
        let write_tx = self.db.begin_write()?;
        {
            let mut author_table = write_tx.open_table(AUTHORS_TABLE)?;
            author_table.insert(author.id().as_bytes(), &author.to_bytes())?;
        }
        write_tx.commit()?;
        Ok(())
    }

    /// Gets an author.
    pub fn get_author(&self, author_id: &AuthorId) -> Result<Option<Author>> {
        let read_tx = self.db.begin_read()?;
        let author_table = read_tx.open_table(AUTHORS_TABLE)?;
        let Some(author) = author_table.get(author_id.as_bytes())? else {
            return Ok(None);
        };
        Ok(Some(Author::from_bytes(author.value())))
    }

    /// Lists the ids of all authors.
    pub fn list_authors(&self) -> Result<Vec<AuthorId>> {
        let read_tx = self.db.begin_read()?;
        let author_table = read_tx.open_table(AUTHORS_TABLE)?;
        let mut out = Vec::new();
        for item in author_table.iter()? {
            let (id, _) = item?;
            out.push(AuthorId::from_bytes(*id.value()));
        }
        Ok(out)
    }

    /// Deletes an author.
    pub fn delete_author(&self, author_id: &AuthorId) -> Result<()> {
        let write_tx = self.db.begin_write()?;
        {
            let mut author_table = write_tx.open_table(AUTHORS_TABLE)?;
            author_table.remove(author_id.as_bytes())?;
        }
        write_tx.commit()?;
        Ok(())
    }

    /// Gets the default author, if one was set.
    pub fn get_default_author(&self) -> Result<Option<AuthorId>> {
        let read_tx = self.db.begin_read()?;
        let table = read_tx.open_table(SETTINGS_TABLE)?;
        let Some(value) = table.get(DEFAULT_AUTHOR_KEY)? else {
            return Ok(None);
        };
        let bytes: [u8; 32] = value
            .value()
            .try_into()
            .map_err(|_| Error::storage("corrupt default author"))?;
        Ok(Some(AuthorId::from_bytes(bytes)))
    }

    /// Sets the default author. The author must exist.
    pub fn set_default_author(&self, author_id: AuthorId) -> Result<()> {
        if self.get_author(&author_id)?.is_none() {
            return Err(Error::not_found(format!("author {}", author_id.fmt_short())));
        }
        let write_tx = self.db.begin_write()?;
        {
            let mut table = write_tx.open_table(SETTINGS_TABLE)?;
            table.insert(DEFAULT_AUTHOR_KEY, author_id.as_bytes().as_slice())?;
        }
        write_tx.commit()?;
        Ok(())
    }

    /// Creates a new document with a random namespace.
    pub fn new_namespace<R: CryptoRngCore + ?Sized>(&self, rng: &mut R) -> Result<NamespaceId> {
        let secret = NamespaceSecret::new(rng);
        let id = secret.id();
        self.import_namespace(Capability::Write(secret))?;
        Ok(id)
    }

    /// Stores a capability, merging it with an existing one for the same namespace.
    ///
    /// Returns the kind of capability now held.
    pub fn import_namespace(&self, capability: Capability) -> Result<CapabilityKind> {
        let id = capability.id();
        let write_tx = self.db.begin_write()?;
        let kind = {
            let mut table = write_tx.open_table(NAMESPACES_TABLE)?;
            let existing = table
                .get(id.as_bytes())?
                .map(|v| decode_capability(id, v.value()))
                .transpose()?;
            let capability = match existing {
                Some(mut existing) => {
                    existing.merge(capability);
                    existing
                }
                None => capability,
            };
            let (kind, bytes) = encode_capability(&capability);
            table.insert(id.as_bytes(), (kind, &bytes))?;
            capability.kind()
        };
        write_tx.commit()?;
        debug!(namespace = %id.fmt_short(), %kind, "imported namespace");
        Ok(kind)
    }

    /// Gets the capability held for a namespace.
    pub fn get_capability(&self, id: &NamespaceId) -> Result<Option<Capability>> {
        let read_tx = self.db.begin_read()?;
        let table = read_tx.open_table(NAMESPACES_TABLE)?;
        let Some(value) = table.get(id.as_bytes())? else {
            return Ok(None);
        };
        Ok(Some(decode_capability(*id, value.value())?))
    }

    /// Lists all namespaces with the capability held.
    pub fn list_namespaces(&self) -> Result<Vec<(NamespaceId, CapabilityKind)>> {
        let read_tx = self.db.begin_read()?;
        let table = read_tx.open_table(NAMESPACES_TABLE)?;
        let mut out = Vec::new();
        for item in table.iter()? {
            let (id, value) = item?;
            let id = NamespaceId::from_bytes(*id.value());
            out.push((id, decode_capability(id, value.value())?.kind()));
        }
        Ok(out)
    }

    /// Removes a namespace and all its entries.
    pub fn remove_namespace(&self, id: &NamespaceId) -> Result<()> {
        let write_tx = self.db.begin_write()?;
        let existed = {
            let mut records = write_tx.open_multimap_table(RECORDS_TABLE)?;
            records.remove_all(id.as_bytes())?;
            let mut namespaces = write_tx.open_table(NAMESPACES_TABLE)?;
            namespaces.remove(id.as_bytes())?.is_some()
        };
        write_tx.commit()?;
        self.index.write().remove(id);
        if !existed {
            return Err(Error::not_found(format!("document {}", id.fmt_short())));
        }
        Ok(())
    }

    fn namespace_index(&self, namespace: NamespaceId) -> Result<Arc<RwLock<Index>>> {
        if let Some(index) = self.index.read().get(&namespace) {
            return Ok(index.clone());
        }
        let mut map = self.index.write();
        if let Some(index) = map.get(&namespace) {
            return Ok(index.clone());
        }
        let read_tx = self.db.begin_read()?;
        let records = read_tx.open_multimap_table(RECORDS_TABLE)?;
        let mut index = Index::new();
        for value in records.get(namespace.as_bytes())? {
            let value = value?;
            let entry: SignedEntry = postcard::from_bytes(value.value()).map_err(Error::storage)?;
            index.insert(entry.sort_key(), entry);
        }
        trace!(namespace = %namespace.fmt_short(), len = index.len(), "loaded entries");
        let index = Arc::new(RwLock::new(index));
        map.insert(namespace, index.clone());
        Ok(index)
    }

    /// Inserts an entry. The entry must already be verified.
    ///
    /// Returns `false` if the entry was already present.
    pub fn insert_entry(&self, entry: SignedEntry) -> Result<bool> {
        let namespace = entry.namespace();
        let index = self.namespace_index(namespace)?;
        let mut index = index.write();
        let key = entry.sort_key();
        if index.contains_key(&key) {
            return Ok(false);
        }
        let bytes = postcard::to_stdvec(&entry).map_err(Error::storage)?;
        let write_tx = self.db.begin_write()?;
        {
            let mut records = write_tx.open_multimap_table(RECORDS_TABLE)?;
            records.insert(namespace.as_bytes(), bytes.as_slice())?;
        }
        write_tx.commit()?;
        index.insert(key, entry);
        Ok(true)
    }

    /// Runs a query against the entries of a namespace.
    pub fn get_many(&self, namespace: NamespaceId, query: &Query) -> Result<Vec<SignedEntry>> {
        let index = self.namespace_index(namespace)?;
        let index = index.read();
        let entries: Box<dyn Iterator<Item = &SignedEntry>> = match query.key_filter() {
            super::KeyFilter::Any => Box::new(index.values()),
            super::KeyFilter::Exact(key) | super::KeyFilter::Prefix(key) => Box::new(
                index
                    .range(EntryKey::first_for_key(key.clone())..)
                    .map(|(_, v)| v)
                    .take_while(|e| e.key().starts_with(key)),
            ),
        };
        Ok(query.apply(entries))
    }

    /// Number of entries in a namespace.
    pub fn entry_count(&self, namespace: NamespaceId) -> Result<usize> {
        Ok(self.namespace_index(namespace)?.read().len())
    }

    /// Content hashes referenced by entries of any document.
    pub fn content_hashes(&self) -> Result<BTreeSet<Hash>> {
        let mut out = BTreeSet::new();
        for (namespace, _) in self.list_namespaces()? {
            let index = self.namespace_index(namespace)?;
            out.extend(index.read().values().map(|e| e.content_hash()));
        }
        Ok(out)
    }

    /// A view on one namespace the set reconciliation can run against.
    pub fn replica_store(&self, namespace: NamespaceId) -> ReplicaStore {
        ReplicaStore {
            store: self.clone(),
            namespace,
        }
    }
}

fn encode_capability(capability: &Capability) -> (u8, [u8; 32]) {
    match capability {
        Capability::Write(secret) => (CapabilityKind::Write as u8, secret.to_bytes()),
        Capability::Read(id) => (CapabilityKind::Read as u8, id.to_bytes()),
    }
}

fn decode_capability(id: NamespaceId, (kind, bytes): (u8, &[u8; 32])) -> Result<Capability> {
    let capability = match kind {
        k if k == CapabilityKind::Write as u8 => {
            Capability::Write(NamespaceSecret::from_bytes(bytes))
        }
        k if k == CapabilityKind::Read as u8 => Capability::Read(NamespaceId::from_bytes(*bytes)),
        _ => return Err(Error::storage(format!("invalid capability kind {kind}"))),
    };
    if capability.id() != id {
        return Err(Error::storage("capability does not match namespace"));
    }
    Ok(capability)
}

/// The entries of one namespace, as seen by the set reconciliation.
#[derive(Debug, Clone)]
pub struct ReplicaStore {
    store: Store,
    namespace: NamespaceId,
}

impl ReplicaStore {
    /// The namespace.
    pub fn namespace(&self) -> NamespaceId {
        self.namespace
    }
}

impl ranger::Store<SignedEntry> for ReplicaStore {
    fn get_first(&self) -> Result<EntryKey> {
        let index = self.store.namespace_index(self.namespace)?;
        let index = index.read();
        Ok(index.keys().next().cloned().unwrap_or_default())
    }

    fn get_fingerprint(&self, range: &Range<EntryKey>) -> Result<Fingerprint> {
        let index = self.store.namespace_index(self.namespace)?;
        let index = index.read();
        Ok(fingerprint_of(ranger::btree::range(&index, range)))
    }

    fn get_range(&self, range: &Range<EntryKey>) -> Result<Vec<SignedEntry>> {
        let index = self.store.namespace_index(self.namespace)?;
        let index = index.read();
        Ok(ranger::btree::range(&index, range).cloned().collect())
    }

    fn put(&mut self, entry: SignedEntry) -> Result<bool> {
        self.store.insert_entry(entry)
    }
}
