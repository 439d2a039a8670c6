//! Log-bloom section index
//!
//! The chain is cut into sections of `section_size` blocks. For every finished
//! section the [`BloomIndexer`] stores 2048 bit-vectors, one per bloom bit,
//! where bit `i` of vector `b` is set when block `i` of the section has bloom
//! bit `b` set. Filter queries then only need to fetch and AND three vectors
//! per section, which the [`BloomDispatcher`] does on a worker pool.

use crate::blockchain::{bloom_bits, BlockChain, Bloom, ChainHeadEvent, Header, BLOOM_BIT_LENGTH};
use crate::crypto::{hash_to_hex, Hash};
use crate::error::ChainError;
use crate::persistence::{Batch, ChainDb};
use crate::rawdb;
use crossbeam_channel::{bounded, select, Receiver, Sender};
use parking_lot::Mutex;
use rayon::prelude::*;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Pending retrievals the dispatcher queue holds before submitters block.
const RETRIEVAL_QUEUE: usize = 256;

/// Builds one section's bit-vectors from its headers' blooms.
pub fn section_bits(blooms: &[Bloom]) -> Vec<Vec<u8>> {
    let bytes = (blooms.len() + 7) / 8;
    (0..BLOOM_BIT_LENGTH)
        .into_par_iter()
        .map(|bit| {
            let mut vector = vec![0u8; bytes];
            for (i, bloom) in blooms.iter().enumerate() {
                if bloom.test_bit(bit) {
                    vector[i / 8] |= 0x80 >> (i % 8);
                }
            }
            vector
        })
        .collect()
}

struct IndexerState {
    sections: u64,
    head: Hash,
}

pub struct BloomIndexer {
    db: Arc<dyn ChainDb>,
    section_size: u64,
    confirms: u64,
    state: Mutex<IndexerState>,
    quit: Mutex<Option<Sender<()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl BloomIndexer {
    pub fn new(db: Arc<dyn ChainDb>, section_size: u64, confirms: u64) -> Result<Arc<Self>, ChainError> {
        if section_size == 0 {
            return Err(ChainError::Configuration("bloom section size must be positive".to_string()));
        }
        let sections = rawdb::read_valid_sections(db.as_ref())?;
        let head = match sections {
            0 => [0u8; 32],
            n => rawdb::read_section_head(db.as_ref(), n - 1)?.unwrap_or_default(),
        };
        Ok(Arc::new(BloomIndexer {
            db,
            section_size,
            confirms,
            state: Mutex::new(IndexerState { sections, head }),
            quit: Mutex::new(None),
            handle: Mutex::new(None),
        }))
    }

    pub fn section_size(&self) -> u64 {
        self.section_size
    }

    /// Number of indexed sections and the head hash of the last one.
    pub fn sections(&self) -> (u64, Hash) {
        let state = self.state.lock();
        (state.sections, state.head)
    }

    /// Attaches the indexer to `chain` and follows its head on a background thread.
    pub fn start(self: &Arc<Self>, chain: &BlockChain) -> Result<(), ChainError> {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return Err(ChainError::Lifecycle("bloom indexer already started".to_string()));
        }
        let events = chain.subscribe_chain_head();
        let head = chain.current_block().header;
        let (quit_tx, quit_rx) = bounded::<()>(0);
        let indexer = self.clone();
        let spawned = thread::Builder::new()
            .name("bloom-indexer".to_string())
            .spawn(move || indexer.event_loop(head, events, quit_rx))?;
        *self.quit.lock() = Some(quit_tx);
        *handle = Some(spawned);
        Ok(())
    }

    fn event_loop(&self, head: Header, events: Receiver<ChainHeadEvent>, quit: Receiver<()>) {
        self.new_head(&head);
        loop {
            select! {
                recv(events) -> event => match event {
                    Ok(event) => self.new_head(&event.block.header),
                    Err(_) => return,
                },
                recv(quit) -> _ => return,
            }
        }
    }

    fn new_head(&self, head: &Header) {
        if let Err(e) = self.process(head) {
            warn!("Bloom section processing failed: {}", e);
        }
    }

    /// Rolls back sections invalidated by a reorg or rewind, then indexes
    /// every confirmed section below `head`.
    pub fn process(&self, head: &Header) -> Result<(), ChainError> {
        let db = self.db.as_ref();
        let mut stored = rawdb::read_valid_sections(db)?;
        let before = stored;

        let mut batch = Batch::new();
        while stored > 0 {
            let last = stored * self.section_size - 1;
            let section_head = rawdb::read_section_head(db, stored - 1)?;
            let canonical = rawdb::read_canonical_hash(db, last)?;
            if last <= head.number && section_head.is_some() && section_head == canonical {
                break;
            }
            stored -= 1;
            rawdb::batch_delete_section_head(&mut batch, stored);
        }
        if stored != before {
            rawdb::batch_write_valid_sections(&mut batch, stored);
            db.write_batch(batch)?;
            warn!("Bloom index rolled back: sections {} -> {}", before, stored);
            self.set_state(stored)?;
        }

        let target = if head.number + 1 > self.confirms {
            (head.number + 1 - self.confirms) / self.section_size
        } else {
            0
        };
        for section in stored..target {
            self.index_section(section)?;
        }
        Ok(())
    }

    fn index_section(&self, section: u64) -> Result<(), ChainError> {
        let db = self.db.as_ref();
        let first = section * self.section_size;
        let mut blooms = Vec::with_capacity(self.section_size as usize);
        let mut section_head = [0u8; 32];
        for number in first..first + self.section_size {
            let hash = rawdb::read_canonical_hash(db, number)?.ok_or_else(|| {
                ChainError::DatabaseError(format!("canonical block #{} unknown", number))
            })?;
            let header = rawdb::read_header(db, &hash)?.ok_or_else(|| {
                ChainError::DatabaseError(format!("block #{} [{}] not found", number, hash_to_hex(&hash)))
            })?;
            blooms.push(header.bloom);
            section_head = hash;
        }

        let mut batch = Batch::new();
        for (bit, vector) in section_bits(&blooms).iter().enumerate() {
            rawdb::batch_write_bloom_bits(&mut batch, bit as u32, section, &section_head, vector);
        }
        rawdb::batch_write_section_head(&mut batch, section, &section_head);
        rawdb::batch_write_valid_sections(&mut batch, section + 1);
        db.write_batch(batch)?;

        debug!("Processed bloom section {} head {}", section, hash_to_hex(&section_head));
        let mut state = self.state.lock();
        state.sections = section + 1;
        state.head = section_head;
        Ok(())
    }

    fn set_state(&self, sections: u64) -> Result<(), ChainError> {
        let head = match sections {
            0 => [0u8; 32],
            n => rawdb::read_section_head(self.db.as_ref(), n - 1)?.unwrap_or_default(),
        };
        let mut state = self.state.lock();
        state.sections = sections;
        state.head = head;
        Ok(())
    }

    /// Stops following the chain and joins the indexing thread.
    pub fn close(&self) {
        self.quit.lock().take();
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                warn!("Bloom indexer thread panicked");
            }
            debug!("Bloom indexer closed");
        }
    }
}

/// Request for the bit-vectors of one bloom bit across several sections.
pub struct Retrieval {
    pub bit: u32,
    pub sections: Vec<u64>,
    pub reply: Sender<Result<Vec<Vec<u8>>, ChainError>>,
}

pub struct BloomDispatcher {
    db: Arc<dyn ChainDb>,
    sender: Mutex<Option<Sender<Retrieval>>>,
    receiver: Receiver<Retrieval>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl BloomDispatcher {
    pub fn new(db: Arc<dyn ChainDb>) -> Self {
        let (sender, receiver) = bounded(RETRIEVAL_QUEUE);
        BloomDispatcher {
            db,
            sender: Mutex::new(Some(sender)),
            receiver,
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Spawns one retrieval worker per core.
    pub fn start(&self) -> Result<(), ChainError> {
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            return Ok(());
        }
        let threads = num_cpus::get();
        for id in 0..threads {
            let db = self.db.clone();
            let requests = self.receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("bloom-worker-{}", id))
                .spawn(move || {
                    for request in requests.iter() {
                        let result = Self::retrieve(db.as_ref(), request.bit, &request.sections);
                        let _ = request.reply.send(result);
                    }
                })?;
            workers.push(handle);
        }
        info!("Started bloom retrieval workers: {}", threads);
        Ok(())
    }

    fn retrieve(db: &dyn ChainDb, bit: u32, sections: &[u64]) -> Result<Vec<Vec<u8>>, ChainError> {
        sections
            .iter()
            .map(|section| {
                let head = rawdb::read_section_head(db, *section)?.ok_or_else(|| {
                    ChainError::BloomRetrieval(format!("section {} is not indexed", section))
                })?;
                rawdb::read_bloom_bits(db, bit, *section, &head)?.ok_or_else(|| {
                    ChainError::BloomRetrieval(format!("bit {} of section {} missing", bit, section))
                })
            })
            .collect()
    }

    pub fn submit(&self, retrieval: Retrieval) -> Result<(), ChainError> {
        let sender = self
            .sender
            .lock()
            .clone()
            .ok_or_else(|| ChainError::BloomRetrieval("dispatcher closed".to_string()))?;
        sender
            .send(retrieval)
            .map_err(|_| ChainError::BloomRetrieval("dispatcher closed".to_string()))
    }

    /// Blocking convenience around [`submit`](Self::submit).
    pub fn retrieve_bit(&self, bit: u32, sections: Vec<u64>) -> Result<Vec<Vec<u8>>, ChainError> {
        let (reply, result) = bounded(1);
        self.submit(Retrieval { bit, sections, reply })?;
        result
            .recv()
            .map_err(|_| ChainError::BloomRetrieval("retrieval dropped".to_string()))?
    }

    /// Closes the queue. Workers drain what is already queued, then exit and are joined.
    pub fn close(&self) {
        self.sender.lock().take();
        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for worker in workers {
            if worker.join().is_err() {
                warn!("Bloom retrieval worker panicked");
            }
        }
    }
}

/// Turns indexed bit-vectors into candidate block numbers for a filter.
pub struct BloomMatcher {
    dispatcher: Arc<BloomDispatcher>,
    section_size: u64,
}

impl BloomMatcher {
    pub fn new(dispatcher: Arc<BloomDispatcher>, section_size: u64) -> Self {
        BloomMatcher {
            dispatcher,
            section_size,
        }
    }

    /// Blocks in `[from, to]` within the first `indexed` sections whose bloom
    /// may contain `data`.
    pub fn matches(&self, data: &[u8], from: u64, to: u64, indexed: u64) -> Result<Vec<u64>, ChainError> {
        if indexed == 0 || from > to {
            return Ok(Vec::new());
        }
        let first = from / self.section_size;
        let last = (to / self.section_size).min(indexed - 1);
        if first > last {
            return Ok(Vec::new());
        }
        let sections: Vec<u64> = (first..=last).collect();

        let mut combined: Option<Vec<Vec<u8>>> = None;
        for bit in bloom_bits(data) {
            let vectors = self.dispatcher.retrieve_bit(bit, sections.clone())?;
            combined = Some(match combined {
                None => vectors,
                Some(mut acc) => {
                    for (a, v) in acc.iter_mut().zip(vectors.iter()) {
                        for (x, y) in a.iter_mut().zip(v.iter()) {
                            *x &= *y;
                        }
                    }
                    acc
                }
            });
        }

        let mut numbers = Vec::new();
        for (section, vector) in sections.iter().zip(combined.unwrap_or_default()) {
            for (i, byte) in vector.iter().enumerate() {
                for j in 0..8 {
                    if byte & (0x80 >> j) != 0 {
                        let number = section * self.section_size + (i * 8 + j) as u64;
                        if number >= from && number <= to {
                            numbers.push(number);
                        }
                    }
                }
            }
        }
        Ok(numbers)
    }
}
