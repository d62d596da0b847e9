use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn, Span};

use super::callback::SyncIoCallback;
use super::file::{IoCallback, SequentialFile, SequentialFileFactory};
use super::record::{Decoded, FileHeader, Record, FREE_FILE_ID, HEADER_SIZE};
use super::{JournalError, JournalResult};

const COMPACT_SUFFIX: &str = "cmp";

#[derive(Debug, Clone)]
pub struct JournalConfig {
    pub file_size: u64,
    /// Files kept around (data plus free) instead of being deleted.
    pub min_files: usize,
    pub file_prefix: String,
    pub file_extension: String,
    /// Automatic compaction needs at least this many data files; 0 turns it off.
    pub compact_min_files: usize,
    /// ...and live data below this percentage of their capacity.
    pub compact_percentage: u32,
}

impl JournalConfig {
    pub fn new(file_prefix: &str, file_extension: &str) -> Self {
        Self {
            file_prefix: file_prefix.to_string(),
            file_extension: file_extension.to_string(),
            ..Self::default()
        }
    }
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            file_size: 10 * 1024 * 1024,
            min_files: 2,
            file_prefix: "relaymq-data".to_string(),
            file_extension: "rmq".to_string(),
            compact_min_files: 10,
            compact_percentage: 30,
        }
    }
}

/// A live record as returned by [`Journal::load`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordInfo {
    pub id: u64,
    pub user_type: u8,
    pub data: Bytes,
    pub is_update: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedTransaction {
    pub tx_id: u64,
    pub data: Bytes,
    pub records: Vec<RecordInfo>,
    pub deletes: Vec<u64>,
}

#[derive(Debug, Default)]
pub struct LoadedJournal {
    /// Each live record's ADD followed by its UPDATEs, in journal order.
    pub records: Vec<RecordInfo>,
    /// Prepared transactions. They stay open until committed or rolled back.
    pub prepared: Vec<PreparedTransaction>,
    pub max_id: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct JournalStats {
    pub data_files: usize,
    pub free_files: usize,
    pub current_file_id: u64,
    pub live_records: usize,
    pub live_bytes: u64,
    pub open_transactions: usize,
    pub appended_records: u64,
    pub bytes_written: u64,
    pub reclaimed_files: u64,
    pub compactions: u64,
}

#[derive(Debug, Clone, Copy)]
struct Position {
    file_id: u64,
    offset: u64,
    /// Padded size.
    size: u64,
}

#[derive(Debug)]
struct DataFile {
    file: Arc<dyn SequentialFile>,
    live: usize,
    live_bytes: u64,
}

#[derive(Debug)]
enum TxOp {
    Add { id: u64, position: Position },
    Update { id: u64, position: Position },
    Delete { id: u64 },
}

#[derive(Debug, Default)]
struct PendingTx {
    ops: Vec<TxOp>,
    /// Files holding this transaction's records; reclaim skips them.
    files: HashSet<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Stopped,
    Started,
    Loaded,
}

#[derive(Debug)]
struct JournalState {
    phase: Phase,
    /// Data files by file id; the highest id is the current file.
    files: BTreeMap<u64, DataFile>,
    free: VecDeque<Arc<dyn SequentialFile>>,
    next_file_id: u64,
    next_name_seq: u64,
    records: HashMap<u64, Vec<Position>>,
    transactions: HashMap<u64, PendingTx>,
    appended_records: u64,
    bytes_written: u64,
    reclaimed_files: u64,
    compactions: u64,
}

impl JournalState {
    fn new() -> Self {
        Self {
            phase: Phase::Stopped,
            files: BTreeMap::new(),
            free: VecDeque::new(),
            next_file_id: 1,
            next_name_seq: 1,
            records: HashMap::new(),
            transactions: HashMap::new(),
            appended_records: 0,
            bytes_written: 0,
            reclaimed_files: 0,
            compactions: 0,
        }
    }

    fn ensure_loaded(&self) -> JournalResult<()> {
        match self.phase {
            Phase::Loaded => Ok(()),
            _ => Err(JournalError::InvalidState("loaded")),
        }
    }

    fn current(&self) -> Option<(u64, &Arc<dyn SequentialFile>)> {
        self.files
            .iter()
            .next_back()
            .map(|(id, data)| (*id, &data.file))
    }

    fn count(&mut self, position: Position) {
        if let Some(file) = self.files.get_mut(&position.file_id) {
            file.live += 1;
            file.live_bytes += position.size;
        }
    }

    fn uncount(&mut self, position: Position) {
        if let Some(file) = self.files.get_mut(&position.file_id) {
            file.live = file.live.saturating_sub(1);
            file.live_bytes = file.live_bytes.saturating_sub(position.size);
        }
    }

    fn add(&mut self, id: u64, position: Position) {
        if let Some(previous) = self.records.insert(id, vec![position]) {
            for old in previous {
                self.uncount(old);
            }
        }
        self.count(position);
    }

    fn update(&mut self, id: u64, position: Position) {
        if let Some(positions) = self.records.get_mut(&id) {
            positions.push(position);
            self.count(position);
        }
    }

    fn delete(&mut self, id: u64) {
        if let Some(positions) = self.records.remove(&id) {
            for position in positions {
                self.uncount(position);
            }
        }
    }

    /// Rejects appends that refer to records or transactions that do not exist.
    fn check(&self, record: &Record) -> JournalResult<()> {
        match record {
            Record::Update { id, .. } | Record::Delete { id } => {
                if !self.records.contains_key(id) {
                    return Err(JournalError::UnknownRecord(*id));
                }
            }
            Record::UpdateTx { tx_id, id, .. } | Record::DeleteTx { tx_id, id } => {
                let added_in_tx = self.transactions.get(tx_id).is_some_and(|tx| {
                    tx.ops
                        .iter()
                        .any(|op| matches!(op, TxOp::Add { id: added, .. } if added == id))
                });
                if !added_in_tx && !self.records.contains_key(id) {
                    return Err(JournalError::UnknownRecord(*id));
                }
            }
            Record::Commit { tx_id } | Record::Rollback { tx_id } => {
                if !self.transactions.contains_key(tx_id) {
                    return Err(JournalError::UnknownTransaction(*tx_id));
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Applies a written record to the in-memory index.
    fn apply(&mut self, record: &Record, position: Position) {
        match record {
            Record::Add { id, .. } => self.add(*id, position),
            Record::Update { id, .. } => self.update(*id, position),
            Record::Delete { id } => self.delete(*id),
            Record::AddTx { tx_id, id, .. } => {
                let tx = self.transactions.entry(*tx_id).or_default();
                tx.ops.push(TxOp::Add { id: *id, position });
                tx.files.insert(position.file_id);
            }
            Record::UpdateTx { tx_id, id, .. } => {
                let tx = self.transactions.entry(*tx_id).or_default();
                tx.ops.push(TxOp::Update { id: *id, position });
                tx.files.insert(position.file_id);
            }
            Record::DeleteTx { tx_id, id } => {
                let tx = self.transactions.entry(*tx_id).or_default();
                tx.ops.push(TxOp::Delete { id: *id });
                tx.files.insert(position.file_id);
            }
            Record::Prepare { tx_id, .. } => {
                let tx = self.transactions.entry(*tx_id).or_default();
                tx.files.insert(position.file_id);
            }
            Record::Commit { tx_id } => {
                if let Some(tx) = self.transactions.remove(tx_id) {
                    for op in tx.ops {
                        match op {
                            TxOp::Add { id, position } => self.add(id, position),
                            TxOp::Update { id, position } => self.update(id, position),
                            TxOp::Delete { id } => self.delete(id),
                        }
                    }
                }
            }
            Record::Rollback { tx_id } => {
                self.transactions.remove(tx_id);
            }
        }
    }

    fn pinned_files(&self) -> HashSet<u64> {
        self.transactions
            .values()
            .flat_map(|tx| tx.files.iter().copied())
            .collect()
    }
}

/// Record-level view of replay, kept only while loading.
#[derive(Debug, Default)]
struct Replay {
    live: HashMap<u64, ReplayedRecord>,
    transactions: HashMap<u64, Vec<ReplayOp>>,
    prepared: HashMap<u64, Bytes>,
    max_id: u64,
}

#[derive(Debug)]
struct ReplayedRecord {
    order: (u64, u64),
    user_type: u8,
    data: Bytes,
    updates: Vec<(u8, Bytes)>,
}

#[derive(Debug)]
enum ReplayOp {
    Add { id: u64, order: (u64, u64), user_type: u8, data: Bytes },
    Update { id: u64, user_type: u8, data: Bytes },
    Delete { id: u64 },
}

impl Replay {
    fn record(&mut self, record: &Record, position: Position) {
        let order = (position.file_id, position.offset);
        match record.clone() {
            Record::Add { id, user_type, data } => self.add(id, order, user_type, data),
            Record::Update { id, user_type, data } => self.update(id, user_type, data),
            Record::Delete { id } => {
                self.live.remove(&id);
            }
            Record::AddTx {
                tx_id,
                id,
                user_type,
                data,
            } => self.op(tx_id, ReplayOp::Add { id, order, user_type, data }),
            Record::UpdateTx {
                tx_id,
                id,
                user_type,
                data,
            } => self.op(tx_id, ReplayOp::Update { id, user_type, data }),
            Record::DeleteTx { tx_id, id } => self.op(tx_id, ReplayOp::Delete { id }),
            Record::Prepare { tx_id, data } => {
                self.transactions.entry(tx_id).or_default();
                self.prepared.insert(tx_id, data);
            }
            Record::Commit { tx_id } => {
                self.prepared.remove(&tx_id);
                for op in self.transactions.remove(&tx_id).unwrap_or_default() {
                    match op {
                        ReplayOp::Add {
                            id,
                            order,
                            user_type,
                            data,
                        } => self.add(id, order, user_type, data),
                        ReplayOp::Update { id, user_type, data } => self.update(id, user_type, data),
                        ReplayOp::Delete { id } => {
                            self.live.remove(&id);
                        }
                    }
                }
            }
            Record::Rollback { tx_id } => {
                self.prepared.remove(&tx_id);
                self.transactions.remove(&tx_id);
            }
        }
    }

    fn add(&mut self, id: u64, order: (u64, u64), user_type: u8, data: Bytes) {
        self.max_id = self.max_id.max(id);
        self.live.insert(
            id,
            ReplayedRecord {
                order,
                user_type,
                data,
                updates: Vec::new(),
            },
        );
    }

    fn update(&mut self, id: u64, user_type: u8, data: Bytes) {
        if let Some(record) = self.live.get_mut(&id) {
            record.updates.push((user_type, data));
        }
    }

    fn op(&mut self, tx_id: u64, op: ReplayOp) {
        if let ReplayOp::Add { id, .. } = &op {
            self.max_id = self.max_id.max(*id);
        }
        self.transactions.entry(tx_id).or_default().push(op);
    }
}

/// Append-only journal of typed records over a set of fixed size files.
///
/// Appends go to the current file and rotate to a fresh (or recycled)
/// file when a record does not fit. The index remembers where every live
/// record and its updates sit so that files with nothing live can be
/// reclaimed and live records can be compacted into new files.
pub struct Journal {
    config: JournalConfig,
    factory: Arc<dyn SequentialFileFactory>,
    state: Mutex<JournalState>,
    span: Span,
}

impl fmt::Debug for Journal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Journal")
            .field("prefix", &self.config.file_prefix)
            .field("directory", &self.factory.directory())
            .finish()
    }
}

impl Journal {
    pub fn new(
        config: JournalConfig,
        factory: Arc<dyn SequentialFileFactory>,
        parent: &Span,
    ) -> JournalResult<Self> {
        let header_block = factory.calculate_block_size(HEADER_SIZE) as u64;
        if config.file_size < header_block * 2 {
            return Err(JournalError::InvalidConfig(format!(
                "file size {} is too small",
                config.file_size
            )));
        }
        if config.file_prefix.is_empty() || config.file_extension.is_empty() {
            return Err(JournalError::InvalidConfig(
                "file prefix and extension must not be empty".into(),
            ));
        }
        let span = tracing::info_span!(parent: parent, "journal", prefix = %config.file_prefix);
        Ok(Self {
            config,
            factory,
            state: Mutex::new(JournalState::new()),
            span,
        })
    }

    pub fn config(&self) -> &JournalConfig {
        &self.config
    }

    pub fn factory(&self) -> &Arc<dyn SequentialFileFactory> {
        &self.factory
    }

    pub fn start(&self) -> JournalResult<()> {
        let mut st = self.state.lock();
        if st.phase != Phase::Stopped {
            return Err(JournalError::InvalidState("stopped"));
        }
        self.factory.start();
        st.phase = Phase::Started;
        Ok(())
    }

    pub fn is_loaded(&self) -> bool {
        self.state.lock().phase == Phase::Loaded
    }

    /// Closes every file. The journal can be started and loaded again.
    pub fn stop(&self) -> JournalResult<()> {
        let mut st = self.state.lock();
        if st.phase == Phase::Stopped {
            return Ok(());
        }
        for data in st.files.values() {
            data.file.close()?;
        }
        for file in &st.free {
            file.close()?;
        }
        self.factory.stop();
        *st = JournalState::new();
        debug!(parent: &self.span, "journal stopped");
        Ok(())
    }

    fn header_block(&self) -> u64 {
        self.factory.calculate_block_size(HEADER_SIZE) as u64
    }

    fn data_name(&self, seq: u64) -> String {
        format!(
            "{}-{}.{}",
            self.config.file_prefix, seq, self.config.file_extension
        )
    }

    fn compact_extension(&self) -> String {
        format!("{}.{}", self.config.file_extension, COMPACT_SUFFIX)
    }

    fn write_header(&self, file: &Arc<dyn SequentialFile>, file_id: u64) -> JournalResult<()> {
        let block = self.header_block() as usize;
        let mut buffer = self.factory.new_buffer(block);
        FileHeader::new(file_id, self.factory.alignment()).encode(&mut buffer);
        buffer.resize(block, 0);
        file.set_position(0);
        file.write(buffer, true, None)?;
        file.sync()?;
        file.set_position(block as u64);
        Ok(())
    }

    fn create_file(&self, st: &mut JournalState, name: String) -> JournalResult<Arc<dyn SequentialFile>> {
        let file = self.factory.create_sequential_file(&name);
        file.open()?;
        file.fill(0, self.config.file_size, 0)?;
        st.next_name_seq += 1;
        Ok(file)
    }

    /// Makes a recycled or brand new file the current one.
    fn open_next_file(&self, st: &mut JournalState) -> JournalResult<()> {
        let file = match st.free.pop_front() {
            Some(file) => file,
            None => {
                let name = self.data_name(st.next_name_seq);
                self.create_file(st, name)?
            }
        };
        let file_id = st.next_file_id;
        st.next_file_id += 1;
        self.write_header(&file, file_id)?;
        debug!(parent: &self.span, file_id, file = %file.file_name(), "opened journal file");
        st.files.insert(
            file_id,
            DataFile {
                file,
                live: 0,
                live_bytes: 0,
            },
        );
        Ok(())
    }

    /// Hands a file back to the free pool, or deletes it when the pool is full.
    fn release_file(&self, st: &mut JournalState, file: Arc<dyn SequentialFile>) -> JournalResult<()> {
        if !file.is_broken() && st.free.len() + st.files.len() < self.config.min_files {
            self.write_header(&file, FREE_FILE_ID)?;
            st.free.push_back(file);
        } else {
            file.delete()?;
        }
        Ok(())
    }

    fn write_record(
        &self,
        st: &mut JournalState,
        record: &Record,
        sync: bool,
        callback: Option<Arc<dyn IoCallback>>,
    ) -> JournalResult<(Position, Option<Arc<SyncIoCallback>>)> {
        let size = self.factory.calculate_block_size(record.encoded_size());
        let capacity = self.config.file_size - self.header_block();
        if size as u64 > capacity {
            return Err(JournalError::RecordTooLarge {
                size,
                max: capacity,
            });
        }

        let fits = st.current().is_some_and(|(_, file)| {
            !file.is_broken() && file.position() + size as u64 <= self.config.file_size
        });
        if !fits {
            if let Some((file_id, file)) = st.current() {
                if file.is_broken() {
                    warn!(
                        parent: &self.span,
                        file_id,
                        file = %file.file_name(),
                        "journal file failed a write, moving to the next one"
                    );
                } else {
                    // Records of the full file must be on disk before anything lands in the next one.
                    file.sync()?;
                }
            }
            self.open_next_file(st)?;
        }
        let (file_id, file) = match st.current() {
            Some((id, file)) => (id, file.clone()),
            None => return Err(JournalError::InvalidState("loaded")),
        };

        let mut buffer = self.factory.new_buffer(size);
        record.encode(file_id, &mut buffer);
        buffer.resize(size, 0);

        let (callback, waiter) = match callback {
            Some(callback) => (Some(callback), None),
            None if sync && self.factory.supports_callbacks() => {
                let waiter = Arc::new(SyncIoCallback::new());
                (Some(waiter.clone() as Arc<dyn IoCallback>), Some(waiter))
            }
            None => (None, None),
        };
        let offset = file.position();
        file.write(buffer, sync, callback)?;

        st.appended_records += 1;
        st.bytes_written += size as u64;
        Ok((
            Position {
                file_id,
                offset,
                size: size as u64,
            },
            waiter,
        ))
    }

    fn append(
        &self,
        record: Record,
        sync: bool,
        callback: Option<Arc<dyn IoCallback>>,
    ) -> JournalResult<()> {
        let waiter = {
            let mut st = self.state.lock();
            st.ensure_loaded()?;
            st.check(&record)?;
            let (position, waiter) = self.write_record(&mut st, &record, sync, callback)?;
            st.apply(&record, position);
            if matches!(
                record,
                Record::Delete { .. } | Record::Commit { .. } | Record::Rollback { .. }
            ) {
                self.reclaim_locked(&mut st)?;
                self.maybe_compact(&mut st);
            }
            waiter
        };
        // Wait outside the lock so other appends keep flowing.
        if let Some(waiter) = waiter {
            waiter.wait()?;
        }
        Ok(())
    }

    // ─── Non-transactional records ───────────────────────────

    pub fn append_add_record(&self, id: u64, user_type: u8, data: Bytes, sync: bool) -> JournalResult<()> {
        self.append(Record::Add { id, user_type, data }, sync, None)
    }

    pub fn append_add_record_with_callback(
        &self,
        id: u64,
        user_type: u8,
        data: Bytes,
        sync: bool,
        callback: Arc<dyn IoCallback>,
    ) -> JournalResult<()> {
        self.append(Record::Add { id, user_type, data }, sync, Some(callback))
    }

    pub fn append_update_record(&self, id: u64, user_type: u8, data: Bytes, sync: bool) -> JournalResult<()> {
        self.append(Record::Update { id, user_type, data }, sync, None)
    }

    pub fn append_update_record_with_callback(
        &self,
        id: u64,
        user_type: u8,
        data: Bytes,
        sync: bool,
        callback: Arc<dyn IoCallback>,
    ) -> JournalResult<()> {
        self.append(Record::Update { id, user_type, data }, sync, Some(callback))
    }

    pub fn append_delete_record(&self, id: u64, sync: bool) -> JournalResult<()> {
        self.append(Record::Delete { id }, sync, None)
    }

    pub fn append_delete_record_with_callback(
        &self,
        id: u64,
        sync: bool,
        callback: Arc<dyn IoCallback>,
    ) -> JournalResult<()> {
        self.append(Record::Delete { id }, sync, Some(callback))
    }

    // ─── Transactions ────────────────────────────────────────
    // Transactional records are never synced on their own; the
    // prepare/commit record that ends the transaction is.

    pub fn append_add_record_transactional(
        &self,
        tx_id: u64,
        id: u64,
        user_type: u8,
        data: Bytes,
    ) -> JournalResult<()> {
        let record = Record::AddTx {
            tx_id,
            id,
            user_type,
            data,
        };
        self.append(record, false, None)
    }

    pub fn append_update_record_transactional(
        &self,
        tx_id: u64,
        id: u64,
        user_type: u8,
        data: Bytes,
    ) -> JournalResult<()> {
        let record = Record::UpdateTx {
            tx_id,
            id,
            user_type,
            data,
        };
        self.append(record, false, None)
    }

    pub fn append_delete_record_transactional(&self, tx_id: u64, id: u64) -> JournalResult<()> {
        self.append(Record::DeleteTx { tx_id, id }, false, None)
    }

    pub fn append_prepare_record(&self, tx_id: u64, data: Bytes, sync: bool) -> JournalResult<()> {
        self.append(Record::Prepare { tx_id, data }, sync, None)
    }

    pub fn append_commit_record(&self, tx_id: u64, sync: bool) -> JournalResult<()> {
        self.append(Record::Commit { tx_id }, sync, None)
    }

    pub fn append_commit_record_with_callback(
        &self,
        tx_id: u64,
        sync: bool,
        callback: Arc<dyn IoCallback>,
    ) -> JournalResult<()> {
        self.append(Record::Commit { tx_id }, sync, Some(callback))
    }

    pub fn append_rollback_record(&self, tx_id: u64, sync: bool) -> JournalResult<()> {
        self.append(Record::Rollback { tx_id }, sync, None)
    }

    // ─── Reclaim & compaction ────────────────────────────────

    /// Frees the oldest data files while they hold nothing live and no
    /// open transaction. Returns the number of files freed.
    pub fn perform_reclaim(&self) -> JournalResult<usize> {
        let mut st = self.state.lock();
        st.ensure_loaded()?;
        self.reclaim_locked(&mut st)
    }

    fn reclaim_locked(&self, st: &mut JournalState) -> JournalResult<usize> {
        let pinned = st.pinned_files();
        let current = st.current().map(|(id, _)| id);
        let mut reclaimed = 0;
        loop {
            let candidate = match st.files.iter().next() {
                Some((id, data))
                    if Some(*id) != current && data.live == 0 && !pinned.contains(id) =>
                {
                    *id
                }
                _ => break,
            };
            if let Some(data) = st.files.remove(&candidate) {
                debug!(parent: &self.span, file_id = candidate, file = %data.file.file_name(), "reclaiming journal file");
                self.release_file(st, data.file)?;
                reclaimed += 1;
            }
        }
        st.reclaimed_files += reclaimed as u64;
        Ok(reclaimed)
    }

    fn maybe_compact(&self, st: &mut JournalState) {
        if self.config.compact_min_files == 0
            || st.files.len() < self.config.compact_min_files
            || !st.transactions.is_empty()
        {
            return;
        }
        let capacity = st.files.len() as u64 * self.config.file_size;
        let live: u64 = st.files.values().map(|f| f.live_bytes).sum();
        if live * 100 >= capacity * u64::from(self.config.compact_percentage) {
            return;
        }
        if let Err(e) = self.compact_locked(st) {
            warn!(parent: &self.span, error = %e, "automatic compaction failed");
        }
    }

    /// Rewrites every live record into fresh files and releases the old ones.
    pub fn compact(&self) -> JournalResult<()> {
        let mut st = self.state.lock();
        st.ensure_loaded()?;
        self.compact_locked(&mut st)
    }

    fn read_record(&self, st: &JournalState, position: Position) -> JournalResult<Record> {
        let file = st
            .files
            .get(&position.file_id)
            .map(|data| data.file.clone())
            .ok_or_else(|| JournalError::Corruption(format!("file {} is gone", position.file_id)))?;
        let mut buf = vec![0u8; position.size as usize];
        let n = file.read(position.offset, &mut buf)?;
        match Record::decode(&buf[..n], position.file_id) {
            Decoded::Record(record, _) => Ok(record),
            other => Err(JournalError::Corruption(format!(
                "unreadable record at {}:{}: {other:?}",
                position.file_id, position.offset
            ))),
        }
    }

    fn compact_locked(&self, st: &mut JournalState) -> JournalResult<()> {
        if !st.transactions.is_empty() {
            return Err(JournalError::TransactionsPending(st.transactions.len()));
        }
        let mut live: Vec<(u64, Vec<Position>)> = st
            .records
            .iter()
            .map(|(id, positions)| (*id, positions.clone()))
            .collect();
        live.sort_by_key(|(_, positions)| {
            positions
                .first()
                .map(|p| (p.file_id, p.offset))
                .unwrap_or_default()
        });

        let compact_ext = self.compact_extension();
        let mut compacted: BTreeMap<u64, DataFile> = BTreeMap::new();
        let mut index: HashMap<u64, Vec<Position>> = HashMap::with_capacity(live.len());
        let mut target: Option<(u64, Arc<dyn SequentialFile>)> = None;

        for (id, positions) in live {
            for position in positions {
                let record = match self.read_record(st, position)? {
                    Record::Add { id, user_type, data } | Record::AddTx { id, user_type, data, .. } => {
                        Record::Add { id, user_type, data }
                    }
                    Record::Update { id, user_type, data }
                    | Record::UpdateTx { id, user_type, data, .. } => Record::Update { id, user_type, data },
                    other => {
                        return Err(JournalError::Corruption(format!(
                            "index points at a {:?} record",
                            other.kind()
                        )))
                    }
                };
                let size = self.factory.calculate_block_size(record.encoded_size()) as u64;
                let full = target
                    .as_ref()
                    .map_or(true, |(_, file)| file.position() + size > self.config.file_size);
                if full {
                    let file_id = st.next_file_id;
                    st.next_file_id += 1;
                    let name = format!(
                        "{}-{}.{}",
                        self.config.file_prefix, st.next_name_seq, compact_ext
                    );
                    let file = self.create_file(st, name)?;
                    self.write_header(&file, file_id)?;
                    compacted.insert(
                        file_id,
                        DataFile {
                            file: file.clone(),
                            live: 0,
                            live_bytes: 0,
                        },
                    );
                    target = Some((file_id, file));
                }
                let Some((file_id, file)) = target.as_ref() else {
                    return Err(JournalError::InvalidState("compacting"));
                };
                let mut buffer = self.factory.new_buffer(size as usize);
                record.encode(*file_id, &mut buffer);
                buffer.resize(size as usize, 0);
                let offset = file.position();
                file.write(buffer, false, None)?;
                index.entry(id).or_default().push(Position {
                    file_id: *file_id,
                    offset,
                    size,
                });
                if let Some(data) = compacted.get_mut(file_id) {
                    data.live += 1;
                    data.live_bytes += size;
                }
            }
        }

        if compacted.is_empty() {
            let file_id = st.next_file_id;
            st.next_file_id += 1;
            let name = format!("{}-{}.{}", self.config.file_prefix, st.next_name_seq, compact_ext);
            let file = self.create_file(st, name)?;
            self.write_header(&file, file_id)?;
            compacted.insert(
                file_id,
                DataFile {
                    file,
                    live: 0,
                    live_bytes: 0,
                },
            );
        }

        for data in compacted.values() {
            data.file.sync()?;
        }
        for data in compacted.values() {
            let name = data.file.file_name();
            let final_name = name
                .strip_suffix(&format!(".{COMPACT_SUFFIX}"))
                .unwrap_or(&name)
                .to_string();
            data.file.rename_to(&final_name)?;
        }

        let old = std::mem::replace(&mut st.files, compacted);
        st.records = index;
        let released = old.len();
        for (_, data) in old {
            self.release_file(st, data.file)?;
        }
        st.compactions += 1;
        info!(
            parent: &self.span,
            files = st.files.len(),
            released,
            live_records = st.records.len(),
            "journal compacted"
        );
        Ok(())
    }

    // ─── Replay ──────────────────────────────────────────────

    /// Replays every journal file and opens the journal for appends.
    pub fn load(&self) -> JournalResult<LoadedJournal> {
        let mut st = self.state.lock();
        if st.phase != Phase::Started {
            return Err(JournalError::InvalidState("started"));
        }
        self.factory.create_dirs()?;

        for name in self.factory.list_files(&self.compact_extension())? {
            warn!(parent: &self.span, file = %name, "removing leftover of interrupted compaction");
            self.factory.create_sequential_file(&name).delete()?;
        }

        let block = self.header_block() as usize;
        let mut data_files: Vec<(u64, Arc<dyn SequentialFile>)> = Vec::new();
        for name in self.factory.list_files(&self.config.file_extension)? {
            if let Some(seq) = self.parse_seq(&name) {
                st.next_name_seq = st.next_name_seq.max(seq + 1);
            }
            let file = self.factory.create_sequential_file(&name);
            file.open()?;
            let mut header = vec![0u8; HEADER_SIZE];
            let n = file.read(0, &mut header)?;
            match FileHeader::decode(&header[..n]) {
                Ok(header) if header.is_free() => st.free.push_back(file),
                Ok(header) => data_files.push((header.file_id, file)),
                Err(e) => {
                    warn!(parent: &self.span, file = %name, error = %e, "unreadable file header, recycling file");
                    self.write_header(&file, FREE_FILE_ID)?;
                    st.free.push_back(file);
                }
            }
        }
        data_files.sort_by_key(|(file_id, _)| *file_id);

        let mut replay = Replay::default();
        for (file_id, file) in data_files {
            st.next_file_id = st.next_file_id.max(file_id + 1);
            st.files.insert(
                file_id,
                DataFile {
                    file: file.clone(),
                    live: 0,
                    live_bytes: 0,
                },
            );
            let mut buf = vec![0u8; file.size()? as usize];
            let n = file.read(0, &mut buf)?;
            buf.truncate(n);

            let mut offset = block;
            while offset < buf.len() {
                match Record::decode(&buf[offset..], file_id) {
                    Decoded::Record(record, size) => {
                        let size = self.factory.calculate_block_size(size);
                        let position = Position {
                            file_id,
                            offset: offset as u64,
                            size: size as u64,
                        };
                        st.apply(&record, position);
                        replay.record(&record, position);
                        offset += size;
                    }
                    Decoded::End | Decoded::Foreign(_) => break,
                    Decoded::Invalid(reason) => {
                        warn!(parent: &self.span, file = %file.file_name(), offset, reason, "stopping replay of file at invalid record");
                        break;
                    }
                }
            }
            file.set_position(offset as u64);
        }

        let mut prepared = Vec::new();
        let open: Vec<u64> = replay.transactions.keys().copied().collect();
        for tx_id in open {
            let ops = replay.transactions.remove(&tx_id).unwrap_or_default();
            match replay.prepared.remove(&tx_id) {
                Some(data) => {
                    let mut records = Vec::new();
                    let mut deletes = Vec::new();
                    for op in ops {
                        match op {
                            ReplayOp::Add { id, user_type, data, .. } => records.push(RecordInfo {
                                id,
                                user_type,
                                data,
                                is_update: false,
                            }),
                            ReplayOp::Update { id, user_type, data } => records.push(RecordInfo {
                                id,
                                user_type,
                                data,
                                is_update: true,
                            }),
                            ReplayOp::Delete { id } => deletes.push(id),
                        }
                    }
                    prepared.push(PreparedTransaction {
                        tx_id,
                        data,
                        records,
                        deletes,
                    });
                }
                None => {
                    warn!(parent: &self.span, tx_id, records = ops.len(), "discarding incomplete transaction");
                    st.transactions.remove(&tx_id);
                }
            }
        }
        prepared.sort_by_key(|tx| tx.tx_id);

        if st.files.is_empty() {
            self.open_next_file(&mut st)?;
        }
        while st.free.len() + st.files.len() < self.config.min_files {
            let name = self.data_name(st.next_name_seq);
            let file = self.create_file(&mut st, name)?;
            self.write_header(&file, FREE_FILE_ID)?;
            st.free.push_back(file);
        }

        let mut live: Vec<(u64, ReplayedRecord)> = replay.live.into_iter().collect();
        live.sort_by_key(|(_, record)| record.order);
        let mut records = Vec::with_capacity(live.len());
        for (id, record) in live {
            records.push(RecordInfo {
                id,
                user_type: record.user_type,
                data: record.data,
                is_update: false,
            });
            for (user_type, data) in record.updates {
                records.push(RecordInfo {
                    id,
                    user_type,
                    data,
                    is_update: true,
                });
            }
        }

        st.phase = Phase::Loaded;
        info!(
            parent: &self.span,
            data_files = st.files.len(),
            free_files = st.free.len(),
            live_records = st.records.len(),
            prepared = prepared.len(),
            "journal loaded"
        );
        Ok(LoadedJournal {
            records,
            prepared,
            max_id: replay.max_id,
        })
    }

    fn parse_seq(&self, name: &str) -> Option<u64> {
        name.strip_prefix(&self.config.file_prefix)?
            .strip_prefix('-')?
            .strip_suffix(&format!(".{}", self.config.file_extension))?
            .parse()
            .ok()
    }

    // ─── Introspection ───────────────────────────────────────

    pub fn contains(&self, id: u64) -> bool {
        self.state.lock().records.contains_key(&id)
    }

    pub fn stats(&self) -> JournalStats {
        let st = self.state.lock();
        JournalStats {
            data_files: st.files.len(),
            free_files: st.free.len(),
            current_file_id: st.current().map(|(id, _)| id).unwrap_or(FREE_FILE_ID),
            live_records: st.records.len(),
            live_bytes: st.files.values().map(|f| f.live_bytes).sum(),
            open_transactions: st.transactions.len(),
            appended_records: st.appended_records,
            bytes_written: st.bytes_written,
            reclaimed_files: st.reclaimed_files,
            compactions: st.compactions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::async_file::AsyncSequentialFileFactory;
    use crate::journal::sync_file::SyncSequentialFileFactory;
    use crate::journal::file::{BufferCallback, GENERIC_IO_ERROR};
    use bytes::BytesMut;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::tempdir;

    fn small_config() -> JournalConfig {
        JournalConfig {
            file_size: 1024,
            min_files: 2,
            compact_min_files: 0,
            ..JournalConfig::new("test-data", "tst")
        }
    }

    fn open(dir: &Path, config: JournalConfig) -> (Journal, LoadedJournal) {
        let factory = Arc::new(SyncSequentialFileFactory::new(dir));
        let journal = Journal::new(config, factory, &Span::none()).unwrap();
        journal.start().unwrap();
        let loaded = journal.load().unwrap();
        (journal, loaded)
    }

    fn payload(n: u8) -> Bytes {
        Bytes::from(vec![n; 100])
    }

    #[test]
    fn records_survive_restart() {
        let dir = tempdir().unwrap();
        {
            let (journal, loaded) = open(dir.path(), small_config());
            assert!(loaded.records.is_empty());
            journal.append_add_record(1, 7, payload(1), true).unwrap();
            journal.append_add_record(2, 7, payload(2), false).unwrap();
            journal.append_update_record(1, 8, Bytes::from_static(b"upd"), false).unwrap();
            journal.append_delete_record(2, true).unwrap();
            journal.stop().unwrap();
        }
        let (_journal, loaded) = open(dir.path(), small_config());
        assert_eq!(loaded.records.len(), 2);
        assert_eq!(loaded.records[0].id, 1);
        assert!(!loaded.records[0].is_update);
        assert_eq!(loaded.records[1].user_type, 8);
        assert!(loaded.records[1].is_update);
        assert_eq!(loaded.max_id, 2);
    }

    #[test]
    fn unknown_ids_are_rejected() {
        let dir = tempdir().unwrap();
        let (journal, _) = open(dir.path(), small_config());
        assert!(matches!(
            journal.append_update_record(9, 1, payload(0), false),
            Err(JournalError::UnknownRecord(9))
        ));
        assert!(matches!(
            journal.append_delete_record(9, false),
            Err(JournalError::UnknownRecord(9))
        ));
        assert!(matches!(
            journal.append_commit_record(3, false),
            Err(JournalError::UnknownTransaction(3))
        ));
    }

    #[test]
    fn appends_require_load() {
        let dir = tempdir().unwrap();
        let factory = Arc::new(SyncSequentialFileFactory::new(dir.path()));
        let journal = Journal::new(small_config(), factory, &Span::none()).unwrap();
        assert!(journal.append_add_record(1, 1, payload(1), false).is_err());
        assert!(journal.load().is_err());
    }

    #[test]
    fn transactions_replay_by_outcome() {
        let dir = tempdir().unwrap();
        {
            let (journal, _) = open(dir.path(), small_config());
            journal.append_add_record(1, 1, payload(1), false).unwrap();

            journal.append_add_record_transactional(10, 2, 1, payload(2)).unwrap();
            journal.append_delete_record_transactional(10, 1).unwrap();
            journal.append_commit_record(10, true).unwrap();

            journal.append_add_record_transactional(11, 3, 1, payload(3)).unwrap();
            journal.append_rollback_record(11, true).unwrap();

            journal.append_add_record_transactional(12, 4, 1, payload(4)).unwrap();
            journal.append_prepare_record(12, Bytes::from_static(b"xid"), true).unwrap();

            // Never finished.
            journal.append_add_record_transactional(13, 5, 1, payload(5)).unwrap();
            journal.stop().unwrap();
        }
        let (journal, loaded) = open(dir.path(), small_config());
        let ids: Vec<u64> = loaded.records.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![2]);
        assert_eq!(loaded.prepared.len(), 1);
        assert_eq!(loaded.prepared[0].tx_id, 12);
        assert_eq!(loaded.prepared[0].data, Bytes::from_static(b"xid"));
        assert_eq!(loaded.prepared[0].records[0].id, 4);
        assert_eq!(journal.stats().open_transactions, 1);

        journal.append_rollback_record(12, true).unwrap();
        assert_eq!(journal.stats().open_transactions, 0);
    }

    #[test]
    fn rotation_and_reclaim() {
        let dir = tempdir().unwrap();
        let (journal, _) = open(dir.path(), small_config());
        for id in 1..=30 {
            journal.append_add_record(id, 1, payload(id as u8), false).unwrap();
        }
        let before = journal.stats();
        assert!(before.data_files >= 3, "{before:?}");

        for id in 1..=29 {
            journal.append_delete_record(id, false).unwrap();
        }
        let after = journal.stats();
        assert!(after.data_files < before.data_files, "{after:?}");
        assert!(after.reclaimed_files > 0);
        assert_eq!(after.live_records, 1);
        assert!(after.free_files + after.data_files >= 2);
        journal.stop().unwrap();

        let (_journal, loaded) = open(dir.path(), small_config());
        assert_eq!(loaded.records.len(), 1);
        assert_eq!(loaded.records[0].id, 30);
    }

    #[test]
    fn open_transaction_pins_its_files() {
        let dir = tempdir().unwrap();
        let (journal, _) = open(dir.path(), small_config());
        journal.append_add_record_transactional(1, 100, 1, payload(0)).unwrap();
        for id in 1..=20 {
            journal.append_add_record(id, 1, payload(0), false).unwrap();
            journal.append_delete_record(id, false).unwrap();
        }
        let pinned = journal.stats();
        assert!(pinned.data_files >= 2);
        assert_eq!(pinned.reclaimed_files, 0);

        journal.append_commit_record(1, true).unwrap();
        assert!(journal.contains(100));
        assert_eq!(journal.stats().reclaimed_files, 0);
    }

    #[test]
    fn compaction_rewrites_live_records() {
        let dir = tempdir().unwrap();
        {
            let (journal, _) = open(dir.path(), small_config());
            for id in 1..=40 {
                journal.append_add_record(id, 1, payload(id as u8), false).unwrap();
            }
            journal.append_update_record(5, 2, Bytes::from_static(b"five"), false).unwrap();
            for id in (1..=40).filter(|id| id % 10 != 5) {
                journal.append_delete_record(id, false).unwrap();
            }
            let before = journal.stats();

            journal.compact().unwrap();
            let after = journal.stats();
            assert_eq!(after.compactions, 1);
            assert_eq!(after.live_records, 4);
            assert!(after.data_files <= before.data_files);
            assert!(dir
                .path()
                .read_dir()
                .unwrap()
                .all(|e| !e.unwrap().file_name().to_string_lossy().ends_with(".cmp")));

            journal.append_add_record(99, 1, payload(9), true).unwrap();
            journal.stop().unwrap();
        }
        let (_journal, loaded) = open(dir.path(), small_config());
        let ids: Vec<u64> = loaded.records.iter().filter(|r| !r.is_update).map(|r| r.id).collect();
        assert_eq!(ids, vec![5, 15, 25, 35, 99]);
        assert!(loaded
            .records
            .iter()
            .any(|r| r.id == 5 && r.is_update && r.data == Bytes::from_static(b"five")));
    }

    #[test]
    fn compaction_refused_with_open_transactions() {
        let dir = tempdir().unwrap();
        let (journal, _) = open(dir.path(), small_config());
        journal.append_add_record_transactional(1, 1, 1, payload(1)).unwrap();
        assert!(matches!(
            journal.compact(),
            Err(JournalError::TransactionsPending(1))
        ));
    }

    #[test]
    fn automatic_compaction_triggers() {
        let dir = tempdir().unwrap();
        let config = JournalConfig {
            compact_min_files: 3,
            compact_percentage: 50,
            ..small_config()
        };
        let (journal, _) = open(dir.path(), config.clone());
        journal.append_add_record(1000, 1, payload(0), false).unwrap();
        for id in 1..=40 {
            journal.append_add_record(id, 1, payload(0), false).unwrap();
        }
        for id in 1..=40 {
            journal.append_delete_record(id, false).unwrap();
        }
        assert!(journal.stats().compactions >= 1);
        journal.stop().unwrap();
        let (_journal, loaded) = open(dir.path(), config);
        assert_eq!(loaded.records.len(), 1);
        assert_eq!(loaded.records[0].id, 1000);
    }

    #[test]
    fn replay_stops_at_torn_record() {
        let dir = tempdir().unwrap();
        {
            let (journal, _) = open(dir.path(), small_config());
            journal.append_add_record(1, 1, payload(1), true).unwrap();
            journal.append_add_record(2, 1, payload(2), true).unwrap();
            journal.stop().unwrap();
        }
        // Corrupt the second record's payload.
        let name = "test-data-1.tst";
        let path = dir.path().join(name);
        let mut bytes = std::fs::read(&path).unwrap();
        let second = 16 + Record::Add { id: 1, user_type: 1, data: payload(1) }.encoded_size() + 30;
        bytes[second] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();

        let (journal, loaded) = open(dir.path(), small_config());
        assert_eq!(loaded.records.len(), 1);
        assert_eq!(loaded.records[0].id, 1);
        // Appends continue after the last good record.
        journal.append_add_record(3, 1, payload(3), true).unwrap();
        journal.stop().unwrap();
        let (_journal, loaded) = open(dir.path(), small_config());
        let ids: Vec<u64> = loaded.records.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn async_files_round_trip() {
        let dir = tempdir().unwrap();
        let config = JournalConfig {
            file_size: 16 * 1024,
            ..small_config()
        };
        let load = |dir: &Path| {
            let factory = Arc::new(AsyncSequentialFileFactory::new(dir, 16, 4096));
            let journal = Journal::new(config.clone(), factory, &Span::none()).unwrap();
            journal.start().unwrap();
            let loaded = journal.load().unwrap();
            (journal, loaded)
        };
        {
            let (journal, _) = load(dir.path());
            for id in 1..=50 {
                journal.append_add_record(id, 1, payload(id as u8), id % 10 == 0).unwrap();
            }
            let done = Arc::new(SyncIoCallback::new());
            journal
                .append_delete_record_with_callback(1, true, done.clone())
                .unwrap();
            done.wait().unwrap();
            journal.stop().unwrap();
        }
        let (_journal, loaded) = load(dir.path());
        assert_eq!(loaded.records.len(), 49);
        assert_eq!(loaded.records[0].id, 2);
        assert_eq!(loaded.records[48].data, payload(50));
    }

    /// Wraps a real file. When armed, the next write fails after the
    /// position has already moved past it, the way a queued write fails
    /// once later ones are lined up behind it.
    #[derive(Debug)]
    struct FlakyFile {
        inner: Arc<dyn SequentialFile>,
        fail_next: Arc<AtomicBool>,
        broken: AtomicBool,
    }

    impl SequentialFile for FlakyFile {
        fn file_name(&self) -> String {
            self.inner.file_name()
        }

        fn path(&self) -> std::path::PathBuf {
            self.inner.path()
        }

        fn open(&self) -> JournalResult<()> {
            self.inner.open()
        }

        fn is_open(&self) -> bool {
            self.inner.is_open()
        }

        fn close(&self) -> JournalResult<()> {
            self.inner.close()
        }

        fn alignment(&self) -> usize {
            self.inner.alignment()
        }

        fn fill(&self, position: u64, size: u64, fill: u8) -> JournalResult<()> {
            self.inner.fill(position, size, fill)
        }

        fn size(&self) -> JournalResult<u64> {
            self.inner.size()
        }

        fn position(&self) -> u64 {
            self.inner.position()
        }

        fn set_position(&self, position: u64) {
            self.inner.set_position(position)
        }

        fn write(
            &self,
            buffer: BytesMut,
            sync: bool,
            callback: Option<Arc<dyn IoCallback>>,
        ) -> JournalResult<()> {
            if self.fail_next.swap(false, Ordering::AcqRel) {
                self.inner
                    .set_position(self.inner.position() + buffer.len() as u64);
                self.broken.store(true, Ordering::Release);
                if let Some(callback) = callback {
                    callback.on_error(GENERIC_IO_ERROR, "disk went away");
                }
                return Err(JournalError::Io(std::io::Error::other("disk went away")));
            }
            self.inner.write(buffer, sync, callback)
        }

        fn read(&self, position: u64, buf: &mut [u8]) -> JournalResult<usize> {
            self.inner.read(position, buf)
        }

        fn sync(&self) -> JournalResult<()> {
            self.inner.sync()
        }

        fn rename_to(&self, new_name: &str) -> JournalResult<()> {
            self.inner.rename_to(new_name)
        }

        fn delete(&self) -> JournalResult<()> {
            self.inner.delete()
        }

        fn set_buffer_callback(&self, callback: Option<Arc<dyn BufferCallback>>) {
            self.inner.set_buffer_callback(callback)
        }

        fn is_broken(&self) -> bool {
            self.broken.load(Ordering::Acquire)
        }
    }

    #[derive(Debug)]
    struct FlakyFactory {
        inner: SyncSequentialFileFactory,
        fail_next: Arc<AtomicBool>,
    }

    impl SequentialFileFactory for FlakyFactory {
        fn directory(&self) -> &Path {
            self.inner.directory()
        }

        fn create_sequential_file(&self, name: &str) -> Arc<dyn SequentialFile> {
            Arc::new(FlakyFile {
                inner: self.inner.create_sequential_file(name),
                fail_next: self.fail_next.clone(),
                broken: AtomicBool::new(false),
            })
        }

        fn list_files(&self, extension: &str) -> JournalResult<Vec<String>> {
            self.inner.list_files(extension)
        }

        fn supports_callbacks(&self) -> bool {
            false
        }

        fn set_io_error_listener(&self, listener: Arc<dyn crate::journal::IoErrorListener>) {
            self.inner.set_io_error_listener(listener)
        }

        fn on_io_error(&self, code: i32, message: &str, file: &str) {
            self.inner.on_io_error(code, message, file)
        }

        fn new_buffer(&self, size: usize) -> BytesMut {
            self.inner.new_buffer(size)
        }

        fn release_buffer(&self, buffer: BytesMut) {
            self.inner.release_buffer(buffer)
        }

        fn alignment(&self) -> usize {
            self.inner.alignment()
        }
    }

    #[test]
    fn appends_after_a_failed_write_move_to_a_new_file() {
        let dir = tempdir().unwrap();
        let fail_next = Arc::new(AtomicBool::new(false));
        {
            let factory = Arc::new(FlakyFactory {
                inner: SyncSequentialFileFactory::new(dir.path()),
                fail_next: fail_next.clone(),
            });
            let journal = Journal::new(small_config(), factory, &Span::none()).unwrap();
            journal.start().unwrap();
            journal.load().unwrap();

            journal.append_add_record(1, 7, payload(1), true).unwrap();
            let first_file = journal.stats().current_file_id;
            fail_next.store(true, Ordering::Release);
            assert!(journal.append_add_record(2, 7, payload(2), true).is_err());
            journal.append_add_record(3, 7, payload(3), true).unwrap();
            assert!(journal.stats().current_file_id > first_file);
            journal.stop().unwrap();
        }
        let (_journal, loaded) = open(dir.path(), small_config());
        let ids: Vec<u64> = loaded.records.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 3]);
    }
}
