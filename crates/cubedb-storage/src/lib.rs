//! File-backed persistence for cubedb: snapshot + write-ahead journal.
//!
//! A [`FileStore`] owns one directory:
//!
//! - `snapshot.cbdb` — 4-byte magic `CBDB`, little-endian `u32` format
//!   version, then the bincode-encoded [`DatabaseSnapshot`];
//! - `journal.wal` — length-prefixed bincode [`JournalRecord`]s, fsynced on
//!   append.
//!
//! Opening a database loads the snapshot (if any) and replays the journal on
//! top of it. Journal records between a `BeginBatch` without a matching
//! `CommitBatch` and the end of the file belong to an interrupted area
//! operation and are discarded on replay. [`FileStore::checkpoint`] writes a
//! fresh snapshot and truncates the journal.
//!
//! The store implements [`PersistenceHook`], so a [`Database`] attached to it
//! journals every fact write and committed structure change as it happens.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;

use cubedb_core::{
    Database, DatabaseSnapshot, EngineConfig, JournalRecord, MemberId, PersistenceHook,
    StructureChange, ENGINE_VERSION,
};

const SNAPSHOT_MAGIC: &[u8; 4] = b"CBDB";
const SNAPSHOT_FORMAT: u32 = 1;
const SNAPSHOT_FILE: &str = "snapshot.cbdb";
const JOURNAL_FILE: &str = "journal.wal";

/// Directory-backed snapshot + journal store.
pub struct FileStore {
    dir: PathBuf,
    journal: Mutex<File>,
}

impl FileStore {
    /// Open (or create) a store directory.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating store directory {}", dir.display()))?;
        let journal = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(dir.join(JOURNAL_FILE))?;
        Ok(Self {
            dir,
            journal: Mutex::new(journal),
        })
    }

    /// Load the persisted state: snapshot plus journal replay.
    ///
    /// Attach the store *after* loading, otherwise replayed writes would be
    /// re-journaled:
    ///
    /// ```ignore
    /// let store = Arc::new(FileStore::open(dir)?);
    /// let db = store.load(EngineConfig::default())?;
    /// db.attach_persistence(store.clone());
    /// ```
    pub fn load(&self, config: EngineConfig) -> Result<Option<Database>> {
        let Some(snapshot) = self.load_snapshot()? else {
            return Ok(None);
        };
        let mut db = Database::restore(&snapshot, config)?;
        self.replay_journal(&mut |record| db.apply_journal_record(record))?;
        Ok(Some(db))
    }

    /// Write a fresh snapshot of `db` and truncate the journal.
    pub fn checkpoint(&self, db: &Database) -> Result<()> {
        self.save_snapshot(&db.snapshot())?;
        let mut journal = self.journal.lock();
        journal.set_len(0)?;
        journal.seek(SeekFrom::Start(0))?;
        journal.sync_data()?;
        Ok(())
    }

    /// Size of the journal in bytes, for checkpoint policies.
    pub fn journal_len(&self) -> Result<u64> {
        Ok(self.journal.lock().metadata()?.len())
    }

    fn snapshot_path(&self) -> PathBuf {
        self.dir.join(SNAPSHOT_FILE)
    }

    fn append(&self, record: &JournalRecord) -> Result<()> {
        let payload = bincode::serialize(record)?;
        let mut journal = self.journal.lock();
        journal.write_all(&(payload.len() as u32).to_le_bytes())?;
        journal.write_all(&payload)?;
        journal.sync_data()?;
        Ok(())
    }
}

impl PersistenceHook for FileStore {
    fn begin_batch(&self) -> Result<()> {
        self.append(&JournalRecord::BeginBatch)
    }

    fn append_fact_write(
        &self,
        cube: &str,
        address: &[MemberId],
        value: Option<f64>,
    ) -> Result<()> {
        self.append(&JournalRecord::FactWrite {
            cube: cube.to_string(),
            address: address.iter().map(|id| id.raw()).collect(),
            value,
        })
    }

    fn append_structure_change(&self, change: &StructureChange) -> Result<()> {
        self.append(&JournalRecord::Structure(change.clone()))
    }

    fn commit_batch(&self) -> Result<()> {
        self.append(&JournalRecord::CommitBatch)
    }

    fn save_snapshot(&self, snapshot: &DatabaseSnapshot) -> Result<()> {
        let payload = bincode::serialize(snapshot)?;
        let tmp = self.dir.join(format!("{SNAPSHOT_FILE}.tmp"));
        {
            let mut file = File::create(&tmp)?;
            file.write_all(SNAPSHOT_MAGIC)?;
            file.write_all(&SNAPSHOT_FORMAT.to_le_bytes())?;
            file.write_all(&payload)?;
            file.sync_data()?;
        }
        std::fs::rename(&tmp, self.snapshot_path())?;
        Ok(())
    }

    fn load_snapshot(&self) -> Result<Option<DatabaseSnapshot>> {
        let path = self.snapshot_path();
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        if bytes.len() < 8 || &bytes[0..4] != SNAPSHOT_MAGIC {
            bail!("{} is not a cubedb snapshot", path.display());
        }
        let format = u32::from_le_bytes(bytes[4..8].try_into().expect("length checked"));
        if format != SNAPSHOT_FORMAT {
            bail!(
                "unsupported snapshot format {format} in {} (engine {ENGINE_VERSION} reads \
                 format {SNAPSHOT_FORMAT})",
                path.display()
            );
        }
        let snapshot: DatabaseSnapshot = bincode::deserialize(&bytes[8..])?;
        Ok(Some(snapshot))
    }

    fn replay_journal(&self, apply: &mut dyn FnMut(JournalRecord) -> Result<()>) -> Result<()> {
        let mut records = Vec::new();
        {
            let mut journal = self.journal.lock();
            journal.seek(SeekFrom::Start(0))?;
            loop {
                let mut len_bytes = [0u8; 4];
                match journal.read_exact(&mut len_bytes) {
                    Ok(()) => {}
                    Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => break,
                    Err(err) => return Err(err.into()),
                }
                let len = u32::from_le_bytes(len_bytes) as usize;
                let mut payload = vec![0u8; len];
                match journal.read_exact(&mut payload) {
                    Ok(()) => {}
                    Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                        // Torn tail write from a crash mid-append.
                        tracing::warn!("discarding truncated journal tail");
                        break;
                    }
                    Err(err) => return Err(err.into()),
                }
                match bincode::deserialize::<JournalRecord>(&payload) {
                    Ok(record) => records.push(record),
                    Err(err) => {
                        tracing::warn!(error = %err, "discarding undecodable journal tail");
                        break;
                    }
                }
            }
            journal.seek(SeekFrom::End(0))?;
        }

        // Drop an open batch with no commit marker: those writes belong to
        // an interrupted area operation.
        if let Some(open) = records
            .iter()
            .rposition(|r| matches!(r, JournalRecord::BeginBatch))
        {
            let committed = records[open..]
                .iter()
                .any(|r| matches!(r, JournalRecord::CommitBatch));
            if !committed {
                tracing::warn!(
                    dropped = records.len() - open,
                    "discarding uncommitted journal batch"
                );
                records.truncate(open);
            }
        }

        for record in records {
            apply(record)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn build_db() -> Database {
        let mut db = Database::new("sales").unwrap();
        db.add_dimension("years").unwrap();
        {
            let mut edit = db.edit_dimension("years").unwrap();
            edit.add_member("2021", None, 1.0).unwrap();
            edit.add_member("2022", None, 1.0).unwrap();
            db.commit_dimension(edit).unwrap();
        }
        db.add_dimension("regions").unwrap();
        {
            let mut edit = db.edit_dimension("regions").unwrap();
            edit.add_member("Total", None, 1.0).unwrap();
            edit.add_member("North", Some("Total"), 1.0).unwrap();
            edit.add_member("South", Some("Total"), 1.0).unwrap();
            db.commit_dimension(edit).unwrap();
        }
        db.add_cube("sales", &["years", "regions"]).unwrap();
        db
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();

        let db = build_db();
        let cube = db.cube("sales").unwrap();
        cube.set(&["2021", "North"], 400.0).unwrap();
        cube.set(&["2021", "South"], 200.0).unwrap();

        store.save_snapshot(&db.snapshot()).unwrap();
        let restored = store.load(EngineConfig::default()).unwrap().unwrap();
        let cube = restored.cube("sales").unwrap();
        assert_eq!(cube.get_numeric(&["2021", "North"]).unwrap(), 400.0);
        assert_eq!(cube.get_numeric(&["2021", "Total"]).unwrap(), 600.0);
    }

    #[test]
    fn test_journal_replay_on_top_of_snapshot() {
        let dir = tempdir().unwrap();

        {
            let store = Arc::new(FileStore::open(dir.path()).unwrap());
            let db = build_db();
            store.save_snapshot(&db.snapshot()).unwrap();
            db.attach_persistence(store.clone());

            let cube = db.cube("sales").unwrap();
            cube.set(&["2021", "North"], 400.0).unwrap();
            cube.set(&["2022", "South"], 70.0).unwrap();
            cube.erase(&["2022", "South"]).unwrap();
        }

        let store = FileStore::open(dir.path()).unwrap();
        let db = store.load(EngineConfig::default()).unwrap().unwrap();
        let cube = db.cube("sales").unwrap();
        assert_eq!(cube.get_numeric(&["2021", "North"]).unwrap(), 400.0);
        assert_eq!(cube.get_numeric(&["2022", "South"]).unwrap(), 0.0);
        assert_eq!(cube.fact_count(), 1);
    }

    #[test]
    fn test_structure_change_replay() {
        let dir = tempdir().unwrap();

        {
            let store = Arc::new(FileStore::open(dir.path()).unwrap());
            let mut db = build_db();
            store.save_snapshot(&db.snapshot()).unwrap();
            db.attach_persistence(store.clone());

            // Journaled after the snapshot: a new member and a fact on it.
            let mut edit = db.edit_dimension("regions").unwrap();
            edit.add_member("West", Some("Total"), 1.0).unwrap();
            db.commit_dimension(edit).unwrap();
            let cube = db.cube("sales").unwrap();
            cube.set(&["2021", "West"], 30.0).unwrap();
            db.add_dimension("scrap").unwrap();
            db.remove_dimension("scrap").unwrap();
        }

        let store = FileStore::open(dir.path()).unwrap();
        let db = store.load(EngineConfig::default()).unwrap().unwrap();
        let cube = db.cube("sales").unwrap();
        assert_eq!(cube.get_numeric(&["2021", "West"]).unwrap(), 30.0);
        assert_eq!(cube.get_numeric(&["2021", "Total"]).unwrap(), 30.0);
        assert!(db.dimension("scrap").is_err());
    }

    #[test]
    fn test_uncommitted_batch_is_discarded() {
        let dir = tempdir().unwrap();

        {
            let store = Arc::new(FileStore::open(dir.path()).unwrap());
            let db = build_db();
            store.save_snapshot(&db.snapshot()).unwrap();

            store
                .append_fact_write(
                    "sales",
                    &[MemberId::new(0), MemberId::new(1)],
                    Some(11.0),
                )
                .unwrap();
            // An area batch that never committed.
            store.begin_batch().unwrap();
            store
                .append_fact_write(
                    "sales",
                    &[MemberId::new(1), MemberId::new(1)],
                    Some(99.0),
                )
                .unwrap();
        }

        let store = FileStore::open(dir.path()).unwrap();
        let db = store.load(EngineConfig::default()).unwrap().unwrap();
        let cube = db.cube("sales").unwrap();
        assert_eq!(cube.fact_count(), 1);
    }

    #[test]
    fn test_checkpoint_truncates_journal() {
        let dir = tempdir().unwrap();
        let store = Arc::new(FileStore::open(dir.path()).unwrap());
        let db = build_db();
        db.attach_persistence(store.clone());

        let cube = db.cube("sales").unwrap();
        cube.set(&["2021", "North"], 1.0).unwrap();
        assert!(store.journal_len().unwrap() > 0);

        store.checkpoint(&db).unwrap();
        assert_eq!(store.journal_len().unwrap(), 0);

        let reopened = FileStore::open(dir.path()).unwrap();
        let db = reopened.load(EngineConfig::default()).unwrap().unwrap();
        assert_eq!(
            db.cube("sales").unwrap().get_numeric(&["2021", "North"]).unwrap(),
            1.0
        );
    }

    #[test]
    fn test_bad_magic_rejected() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(SNAPSHOT_FILE), b"NOPE0000rest").unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        assert!(store.load_snapshot().is_err());
    }
}
