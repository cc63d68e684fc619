use super::*;

/// Reference records waiting for the listener. Sized so hand-offs never
/// block the producer in practice; a full channel degrades to spooling.
const CHANNEL_CAPACITY: usize = 1024;

/// One pre-allocated anonymous memory mapping with a word cursor.
#[derive(Debug)]
pub struct Mapping {
  bytes: MmapMut,
  used_words: usize,
}

impl Mapping {
  /// Encode one stack and its records. Returns `false` without writing
  /// anything when the remaining space is insufficient.
  fn append(
    &mut self,
    stack: &[u64],
    records: &[Record],
    defs: &DefinitionRegistry,
  ) -> bool {
    let offset = self.used_words * WORD_BYTES;
    let mut writer = WordWriter::new(&mut self.bytes[offset..]);

    let needed = STACK_HEADER_WORDS
      + stack.len()
      + records.len() * EVENT_WORDS;

    if !writer.fits(needed) {
      return false;
    }

    writer.encode_stack(stack);

    for record in records {
      writer.encode_event(record, defs.kind(record.def));
    }

    self.used_words += writer.words_written();
    true
  }

  #[must_use]
  fn contents(&self) -> &[u8] {
    &self.bytes[..self.used_words * WORD_BYTES]
  }

  /// # Panics
  ///
  /// Panics when the anonymous mapping cannot be allocated; losing capture
  /// backing store is fatal.
  #[must_use]
  fn create(len: usize) -> Self {
    let bytes = MmapOptions::new()
      .len(len.max(WORD_BYTES * (STACK_HEADER_WORDS + EVENT_WORDS)))
      .map_anon()
      .expect("anonymous mapping allocation failed");

    Self {
      bytes,
      used_words: 0,
    }
  }

  fn reset(&mut self) {
    self.used_words = 0;
  }
}

/// Hand-off of a full mapping by reference. The consumer reads `bytes` and
/// then returns the mapping to the producer's ring via `release` (or by
/// dropping the reference).
#[derive(Debug)]
pub struct MemRef {
  free: Arc<ArrayQueue<Mapping>>,
  mapping: Option<Mapping>,
  words: usize,
}

impl MemRef {
  #[must_use]
  pub fn bytes(&self) -> &[u8] {
    self
      .mapping
      .as_ref()
      .map_or(&[], |mapping| &mapping.bytes[..self.words * WORD_BYTES])
  }

  /// Return the mapping to the free list: O(1), never allocates, and safe
  /// to call after the originating pool has been destroyed because the
  /// free list is shared by reference.
  pub fn release(mut self) {
    self.put_back();
  }

  fn put_back(&mut self) {
    if let Some(mut mapping) = self.mapping.take() {
      mapping.reset();
      let _ = self.free.push(mapping);
    }
  }

  #[must_use]
  pub fn words(&self) -> usize {
    self.words
  }
}

impl Drop for MemRef {
  fn drop(&mut self) {
    self.put_back();
  }
}

/// Reference records handed from a pool to the coordinator.
#[derive(Debug)]
pub enum PoolMessage {
  /// End of stream; the pool will send nothing further.
  End,
  /// Spooled copy of a mapping; read and discard.
  File { file: File, words: usize },
  /// Zero-copy mapping hand-off.
  Mem(MemRef),
}

struct PoolInner {
  active: Mapping,
  finished: bool,
  free: Arc<ArrayQueue<Mapping>>,
}

/// Producer-side buffering in front of the coordinator.
///
/// `push` must stay callable from asynchronous signal handlers and from
/// code holding arbitrary third-party locks: it never heap-allocates,
/// never blocks on the consumer, and degrades to file spooling plus
/// cooperative self-pacing when the consumer falls behind.
pub struct CollectionPool {
  buffered: bool,
  defs: Arc<DefinitionRegistry>,
  inner: Mutex<PoolInner>,
  name: Arc<str>,
  pace_pushes: u32,
  sender: Sender<PoolMessage>,
  /// Whether several threads push into this pool. The locking path is
  /// uniform either way: an unshared pool has a single writer, so its
  /// mutex is uncontended and push stays wait-free in practice.
  shared: bool,
  slow: AtomicU32,
}

impl CollectionPool {
  /// Flush pending data, emit the end-of-stream marker, and stop accepting
  /// pushes. Unbuffered pools drop their mappings immediately.
  pub fn finish(&self) {
    let mut inner = self.lock_inner();

    if inner.finished {
      return;
    }

    self.flush_locked(&mut inner);
    inner.finished = true;

    let _ = self.sender.try_send(PoolMessage::End);

    if !self.buffered {
      while inner.free.pop().is_some() {}
    }
  }

  /// Hand the current mapping to the consumer and switch to a free one, or
  /// spool it to a backing file when the ring is exhausted.
  pub fn flush(&self) {
    let mut inner = self.lock_inner();
    self.flush_locked(&mut inner);
  }

  fn flush_locked(&self, inner: &mut PoolInner) {
    if inner.active.used_words == 0 {
      return;
    }

    if self.buffered {
      if let Some(next) = inner.free.pop() {
        let full = std::mem::replace(&mut inner.active, next);
        let words = full.used_words;

        let handoff = PoolMessage::Mem(MemRef {
          free: Arc::clone(&inner.free),
          mapping: Some(full),
          words,
        });

        match self.sender.try_send(handoff) {
          Ok(()) => {
            // Consumer reachable again; stop pacing.
            self.slow.store(0, Ordering::Release);
          }
          Err(TrySendError::Full(PoolMessage::Mem(stalled))) => {
            self.spool(stalled.bytes(), stalled.words());
          }
          Err(_) => {}
        }

        return;
      }
    }

    let words = inner.active.used_words;
    self.spool(inner.active.contents(), words);
    inner.active.reset();
  }

  #[must_use]
  pub fn is_shared(&self) -> bool {
    self.shared
  }

  fn lock_inner(&self) -> MutexGuard<'_, PoolInner> {
    match self.inner.lock() {
      Ok(guard) => guard,
      Err(err) => err.into_inner(),
    }
  }

  #[must_use]
  pub fn name(&self) -> &str {
    &self.name
  }

  #[must_use]
  pub fn new(
    name: &str,
    buffered: bool,
    shared: bool,
    defs: Arc<DefinitionRegistry>,
    config: &ProfilerConfig,
  ) -> (Self, Receiver<PoolMessage>) {
    let ring = if buffered {
      config.mapping_ring.max(2)
    } else {
      1
    };

    let free = Arc::new(ArrayQueue::new(ring));

    for _ in 1..ring {
      let _ = free.push(Mapping::create(config.mapping_bytes));
    }

    let (sender, receiver) = bounded(CHANNEL_CAPACITY);

    let pool = Self {
      buffered,
      defs,
      inner: Mutex::new(PoolInner {
        active: Mapping::create(config.mapping_bytes),
        finished: false,
        free,
      }),
      name: Arc::<str>::from(name),
      pace_pushes: config.pace_pushes,
      sender,
      shared,
      slow: AtomicU32::new(0),
    };

    (pool, receiver)
  }

  fn pace(&self) {
    if self.slow.load(Ordering::Acquire) == 0 {
      return;
    }

    let _ = self
      .slow
      .fetch_update(Ordering::AcqRel, Ordering::Acquire, |remaining| {
        remaining.checked_sub(1)
      });

    thread::yield_now();
  }

  /// Append one stack and its records to the active mapping, flushing
  /// synchronously first when the remaining space is insufficient.
  pub fn push(&self, stack: &[u64], records: &[Record]) {
    self.pace();

    let mut inner = self.lock_inner();

    if inner.finished {
      return;
    }

    if inner.active.append(stack, records, &self.defs) {
      return;
    }

    self.flush_locked(&mut inner);

    if !inner.active.append(stack, records, &self.defs) {
      warn!(
        "pool {}: push larger than a whole mapping was dropped",
        self.name
      );
    }
  }

  /// Degraded path: copy the words to a fresh backing file and hand over a
  /// file reference instead. Strictly more expensive than a mapping
  /// hand-off, so subsequent pushes self-pace until the consumer catches
  /// up.
  ///
  /// # Panics
  ///
  /// Panics when the spool file cannot be created or written.
  fn spool(&self, bytes: &[u8], words: usize) {
    let mut file = tempfile().expect("spool file creation failed");
    file.write_all(bytes).expect("spool file write failed");
    file.rewind().expect("spool file rewind failed");

    debug!("pool {}: spooled {} words to backing file", self.name, words);

    if self
      .sender
      .try_send(PoolMessage::File { file, words })
      .is_err()
    {
      warn!("pool {}: consumer gone, spooled words dropped", self.name);
    }

    self.slow.store(self.pace_pushes, Ordering::Release);
  }
}

impl std::fmt::Debug for CollectionPool {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CollectionPool")
      .field("buffered", &self.buffered)
      .field("name", &self.name)
      .field("shared", &self.shared)
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::record::CounterKind;

  fn small_config() -> ProfilerConfig {
    let mut config = ProfilerConfig::default();
    config.mapping_bytes = 40 * WORD_BYTES;
    config.mapping_ring = 2;
    config
  }

  fn registry_with_calls() -> (Arc<DefinitionRegistry>, DefId) {
    let defs = Arc::new(DefinitionRegistry::new());
    let calls = defs.register("CALLS", CounterKind::Tick);
    (defs, calls)
  }

  #[test]
  fn flush_hands_the_mapping_over_without_copying() {
    let (defs, calls) = registry_with_calls();
    let (pool, receiver) =
      CollectionPool::new("test", true, false, defs, &small_config());

    pool.push(&[0x100, 0x200], &[Record::new(RecordKind::COUNT, calls)]);
    pool.flush();

    let message = receiver.try_recv().expect("hand-off expected");

    let PoolMessage::Mem(mem) = message else {
      panic!("expected a mapping reference");
    };

    let records: Vec<WireRecord> = RecordReader::new(mem.bytes())
      .map(|record| record.expect("valid record"))
      .collect();

    assert_eq!(records[0], WireRecord::Stack(vec![0x100, 0x200]));
    assert!(matches!(
      records[1],
      WireRecord::Event {
        tag: WireTag::Tick,
        ..
      }
    ));

    mem.release();

    // The reclaimed mapping keeps the ring serviceable.
    pool.push(&[0x300], &[Record::new(RecordKind::COUNT, calls)]);
    pool.flush();
    assert!(matches!(
      receiver.try_recv(),
      Ok(PoolMessage::Mem(_))
    ));
  }

  #[test]
  fn exhausted_ring_spools_to_a_file_and_paces() {
    let (defs, calls) = registry_with_calls();
    let (pool, receiver) =
      CollectionPool::new("test", true, false, defs, &small_config());

    // Two flushes without a consumer release: the second finds no free
    // mapping and must degrade.
    pool.push(&[0x1], &[Record::new(RecordKind::COUNT, calls)]);
    pool.flush();
    pool.push(&[0x2], &[Record::new(RecordKind::COUNT, calls)]);
    pool.flush();

    assert!(matches!(receiver.try_recv(), Ok(PoolMessage::Mem(_))));

    let PoolMessage::File { mut file, words } =
      receiver.try_recv().expect("spool expected")
    else {
      panic!("expected a file reference");
    };

    assert!(words > 0);

    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes).expect("readable spool");
    assert_eq!(bytes.len(), words * WORD_BYTES);

    let first = RecordReader::new(&bytes)
      .next()
      .expect("record")
      .expect("valid");
    assert_eq!(first, WireRecord::Stack(vec![0x2]));

    // Degraded mode pacing is armed and drains per push.
    assert!(pool.slow.load(Ordering::Acquire) > 0);
    pool.push(&[0x3], &[Record::new(RecordKind::COUNT, calls)]);
    assert_eq!(
      pool.slow.load(Ordering::Acquire),
      pool.pace_pushes - 1
    );
  }

  #[test]
  fn unbuffered_pools_always_spool() {
    let (defs, calls) = registry_with_calls();
    let (pool, receiver) =
      CollectionPool::new("test", false, false, defs, &small_config());

    pool.push(&[0x1], &[Record::new(RecordKind::COUNT, calls)]);
    pool.flush();

    assert!(matches!(
      receiver.try_recv(),
      Ok(PoolMessage::File { .. })
    ));
  }

  #[test]
  fn finish_flushes_and_marks_end_of_stream() {
    let (defs, calls) = registry_with_calls();
    let (pool, receiver) =
      CollectionPool::new("test", true, false, defs, &small_config());

    pool.push(&[0x1], &[Record::new(RecordKind::COUNT, calls)]);
    pool.finish();

    assert!(matches!(receiver.try_recv(), Ok(PoolMessage::Mem(_))));
    assert!(matches!(receiver.try_recv(), Ok(PoolMessage::End)));

    // Pushes after finish are ignored.
    pool.push(&[0x2], &[Record::new(RecordKind::COUNT, calls)]);
    assert!(receiver.try_recv().is_err());
  }
}
