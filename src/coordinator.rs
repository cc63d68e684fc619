use super::*;

/// Hard cap on registered instrumentation modules.
pub const MAX_MODULES: usize = 8;

/// Handle to a registered instrumentation module.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ModuleId(usize);

/// How a module's collection pools are shaped.
#[derive(Debug, Clone, Copy)]
pub struct PoolPolicy {
  /// Buffered pools hand whole mappings to the listener; unbuffered pools
  /// spool every flush through a backing file.
  pub buffered: bool,
  /// Shared modules use one pool for every thread; unshared modules get a
  /// pool per pushing thread.
  pub shared: bool,
}

impl Default for PoolPolicy {
  fn default() -> Self {
    Self {
      buffered: true,
      shared: false,
    }
  }
}

/// Lifecycle of a registered module. Registration is the activation;
/// shutdown moves every module through `Draining` to `Closed`, after which
/// its pools collect nothing.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ModulePhase {
  Active,
  Draining,
  Closed,
}

struct ModuleState {
  name: Arc<str>,
  phase: ModulePhase,
  policy: PoolPolicy,
  shared_pool: Option<Arc<CollectionPool>>,
}

struct StreamState {
  done: bool,
  receiver: Receiver<PoolMessage>,
}

struct ThreadEntry {
  context: u64,
  pools: Vec<Option<Arc<CollectionPool>>>,
}

thread_local! {
  static THREAD_POOLS: RefCell<Vec<ThreadEntry>> =
    const { RefCell::new(Vec::new()) };
}

struct ContextInner {
  config: ProfilerConfig,
  defs: Arc<DefinitionRegistry>,
  dumping: AtomicBool,
  /// Enable nesting depth; pushes are accepted while it is positive.
  enabled: AtomicI64,
  /// Process-unique identity keying the per-thread pool registry. An
  /// allocation address would alias after drop-and-reallocate.
  key: u64,
  listener: Mutex<Option<JoinHandle<()>>>,
  master: Mutex<TraceBuffer>,
  modules: Mutex<Vec<ModuleState>>,
  quitting: AtomicBool,
  resolver: Option<Arc<dyn SymbolResolver>>,
  streams: Mutex<Vec<StreamState>>,
}

impl ContextInner {
  /// Replay one encoded stream chunk into the scratch buffer, then fold
  /// the scratch into the master tree.
  fn absorb(&self, scratch: &mut TraceBuffer, bytes: &[u8]) {
    scratch.reset();

    let mut stack: Vec<u64> = Vec::new();

    for record in RecordReader::new(bytes) {
      match record {
        Ok(WireRecord::Stack(frames)) => stack = frames,
        Ok(WireRecord::Event {
          amount,
          def,
          resource,
          tag,
          ticks,
        }) => {
          let record = record_from_event(tag, def, amount, ticks, resource);
          scratch.push_extend(&stack, &[record]);
        }
        Ok(WireRecord::End) => break,
        Err(err) => {
          warn!("malformed pool stream, rest of chunk dropped: {err}");
          break;
        }
      }
    }

    let mut master = self.lock_master();
    master.merge(scratch);
  }

  /// Poll every open stream once. Returns whether any message arrived.
  fn drain_streams(
    &self,
    scratch: &mut TraceBuffer,
    spool_buf: &mut Vec<u8>,
  ) -> bool {
    let mut streams = lock_poisoned(&self.streams);
    let mut progressed = false;

    for stream in streams.iter_mut() {
      loop {
        match stream.receiver.try_recv() {
          Ok(PoolMessage::Mem(mem)) => {
            self.absorb(scratch, mem.bytes());
            mem.release();
            progressed = true;
          }
          Ok(PoolMessage::File { mut file, words }) => {
            spool_buf.clear();
            spool_buf.resize(words * WORD_BYTES, 0);

            match file.read_exact(spool_buf) {
              Ok(()) => self.absorb(scratch, spool_buf),
              Err(err) => warn!("unreadable spool file skipped: {err}"),
            }

            progressed = true;
          }
          Ok(PoolMessage::End) => {
            stream.done = true;
            progressed = true;
            break;
          }
          Err(TryRecvError::Disconnected) => {
            // The owning pool was dropped without finish; whatever sat in
            // its active mapping is gone.
            stream.done = true;
            break;
          }
          Err(TryRecvError::Empty) => break,
        }
      }
    }

    streams.retain(|stream| !stream.done);
    progressed
  }

  fn lock_master(&self) -> MutexGuard<'_, TraceBuffer> {
    lock_poisoned(&self.master)
  }

  fn open_streams(&self) -> usize {
    lock_poisoned(&self.streams).len()
  }
}

fn lock_poisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  match mutex.lock() {
    Ok(guard) => guard,
    Err(err) => err.into_inner(),
  }
}

fn listener_loop(inner: Arc<ContextInner>) {
  let options = BufferOptions {
    grow: true,
    max_depth: inner.config.max_stack_depth,
    resource_buckets: inner.config.resource_buckets,
    track_resources: inner.config.track_resources,
  };

  let capacity = inner
    .config
    .buffer_slots
    .max(TraceBuffer::minimum_capacity(&options));

  // Symbol folding happens once, here; the master only ever sees folded
  // addresses.
  let mut scratch = TraceBuffer::setup(
    capacity,
    options,
    Arc::clone(&inner.defs),
    inner.resolver.clone(),
  );

  let mut spool_buf: Vec<u8> = Vec::new();
  let mut deadline: Option<Instant> = None;

  loop {
    let progressed = inner.drain_streams(&mut scratch, &mut spool_buf);

    if inner.quitting.load(Ordering::Acquire) {
      let open = inner.open_streams();

      if open == 0 {
        break;
      }

      let limit = *deadline
        .get_or_insert_with(|| Instant::now() + inner.config.shutdown_grace);

      if Instant::now() >= limit {
        warn!("shutdown grace expired, abandoning {open} open streams");
        break;
      }
    }

    if !progressed {
      thread::sleep(inner.config.poll_interval);
    }
  }

  debug!("listener drained and stopped");
}

/// Owning handle to one profiler instance.
///
/// Clones share the same state. A context owns the master trace buffer, the
/// module table, and the listener thread that folds pool streams into the
/// master; producers only ever touch their own collection pools.
#[derive(Clone)]
pub struct ProfilerContext {
  inner: Arc<ContextInner>,
}

impl ProfilerContext {
  #[must_use]
  pub fn builder() -> ContextBuilder {
    ContextBuilder::new()
  }

  fn context_key(&self) -> u64 {
    self.inner.key
  }

  fn create_pool(
    &self,
    name: &Arc<str>,
    policy: PoolPolicy,
  ) -> Arc<CollectionPool> {
    let (pool, receiver) = CollectionPool::new(
      name,
      policy.buffered,
      policy.shared,
      Arc::clone(&self.inner.defs),
      &self.inner.config,
    );

    lock_poisoned(&self.inner.streams).push(StreamState {
      done: false,
      receiver,
    });

    debug!("pool {name} attached");
    Arc::new(pool)
  }

  #[must_use]
  pub fn definitions(&self) -> &Arc<DefinitionRegistry> {
    &self.inner.defs
  }

  /// Write the merged profile to `writer`. Re-entrant calls return
  /// immediately so a crash handler cannot recurse into a half-written
  /// dump.
  pub fn dump(&self, writer: &mut dyn io::Write) -> Result<(), DumpError> {
    if self.inner.dumping.swap(true, Ordering::AcqRel) {
      return Ok(());
    }

    let result = self.dump_settled(writer, write_dump);
    self.inner.dumping.store(false, Ordering::Release);
    result
  }

  fn dump_settled(
    &self,
    writer: &mut dyn io::Write,
    write: fn(
      &TraceBuffer,
      &DefinitionRegistry,
      Option<&dyn SymbolResolver>,
      &DumpMeta,
      &mut dyn io::Write,
    ) -> Result<(), DumpError>,
  ) -> Result<(), DumpError> {
    self.flush_pools();

    // Give the listener a chance to fold the flushed mappings first.
    if lock_poisoned(&self.inner.listener).is_some() {
      thread::sleep(self.inner.config.poll_interval * 2);
    }

    let meta = DumpMeta {
      pid: std::process::id(),
      program: self.inner.config.program_name.clone(),
      timer_resolution: self.inner.config.timer_resolution,
    };

    let master = self.inner.lock_master();

    write(
      &master,
      &self.inner.defs,
      self.inner.resolver.as_deref(),
      &meta,
      writer,
    )
  }

  /// JSON rendition of the merged profile.
  pub fn export_json(
    &self,
    writer: &mut dyn io::Write,
  ) -> Result<(), DumpError> {
    if self.inner.dumping.swap(true, Ordering::AcqRel) {
      return Ok(());
    }

    let result = self.dump_settled(writer, write_json);
    self.inner.dumping.store(false, Ordering::Release);
    result
  }

  /// Finish this thread's pools for this context. Call before a pushing
  /// thread exits; otherwise the data still sitting in its active mappings
  /// is lost.
  pub fn exit_thread(&self) {
    let key = self.context_key();

    THREAD_POOLS.with(|cell| {
      let mut entries = cell.borrow_mut();

      if let Some(position) =
        entries.iter().position(|entry| entry.context == key)
      {
        let entry = entries.swap_remove(position);

        for pool in entry.pools.into_iter().flatten() {
          pool.finish();
        }
      }
    });
  }

  /// Flush shared pools and this thread's pools without finishing them.
  fn flush_pools(&self) {
    for state in lock_poisoned(&self.inner.modules).iter() {
      if let Some(pool) = &state.shared_pool {
        pool.flush();
      }
    }

    let key = self.context_key();

    THREAD_POOLS.with(|cell| {
      for entry in cell.borrow().iter() {
        if entry.context == key {
          for pool in entry.pools.iter().flatten() {
            pool.flush();
          }
        }
      }
    });
  }

  /// Whether the context still accepts registrations and pool creation;
  /// false once `shutdown` has begun.
  #[must_use]
  pub fn is_active(&self) -> bool {
    !self.inner.quitting.load(Ordering::Acquire)
  }

  #[must_use]
  pub fn is_enabled(&self) -> bool {
    self.inner.enabled.load(Ordering::Acquire) > 0
  }

  #[must_use]
  pub fn module_phase(&self, module: ModuleId) -> Option<ModulePhase> {
    lock_poisoned(&self.inner.modules)
      .get(module.0)
      .map(|state| state.phase)
  }

  /// Suspend collection until the returned guard is dropped. Pauses nest;
  /// collection resumes when the last guard goes away.
  #[must_use]
  pub fn pause(&self) -> PauseGuard {
    self.inner.enabled.fetch_sub(1, Ordering::AcqRel);

    PauseGuard {
      inner: Arc::clone(&self.inner),
    }
  }

  fn pool(&self, module: ModuleId) -> Option<Arc<CollectionPool>> {
    let (name, policy, shared) = {
      let modules = lock_poisoned(&self.inner.modules);
      let state = modules.get(module.0)?;

      if state.phase != ModulePhase::Active {
        return None;
      }

      (
        Arc::clone(&state.name),
        state.policy,
        state.shared_pool.clone(),
      )
    };

    if policy.shared {
      return shared;
    }

    let key = self.context_key();

    THREAD_POOLS.with(|cell| {
      let mut entries = cell.borrow_mut();

      let index = match entries.iter().position(|entry| entry.context == key)
      {
        Some(index) => index,
        None => {
          entries.push(ThreadEntry {
            context: key,
            pools: Vec::new(),
          });
          entries.len() - 1
        }
      };

      let entry = &mut entries[index];

      if entry.pools.len() <= module.0 {
        entry.pools.resize_with(module.0 + 1, || None);
      }

      if entry.pools[module.0].is_none() {
        entry.pools[module.0] = Some(self.create_pool(&name, policy));
      }

      entry.pools[module.0].clone()
    })
  }

  /// Record one sample against the module's pool. Dropped silently while
  /// collection is paused.
  pub fn push(&self, module: ModuleId, stack: &[u64], records: &[Record]) {
    if !self.is_enabled() {
      return;
    }

    if let Some(pool) = self.pool(module) {
      pool.push(stack, records);
    }
  }

  /// Register an instrumentation module. Registration against a context
  /// that already shut down yields an inert module that collects nothing.
  ///
  /// # Panics
  ///
  /// Panics when the module table is already at `MAX_MODULES`.
  pub fn register_module(&self, name: &str, policy: PoolPolicy) -> ModuleId {
    let mut modules = lock_poisoned(&self.inner.modules);

    assert!(
      modules.len() < MAX_MODULES,
      "module table is full ({MAX_MODULES} modules)"
    );

    let name: Arc<str> = Arc::from(name);

    if self.inner.quitting.load(Ordering::Acquire) {
      warn!("module {name} registered after shutdown; it stays closed");

      modules.push(ModuleState {
        name,
        phase: ModulePhase::Closed,
        policy,
        shared_pool: None,
      });

      return ModuleId(modules.len() - 1);
    }

    let shared_pool = if policy.shared {
      Some(self.create_pool(&name, policy))
    } else {
      None
    };

    modules.push(ModuleState {
      name,
      phase: ModulePhase::Active,
      policy,
      shared_pool,
    });

    ModuleId(modules.len() - 1)
  }

  /// Stop collection, drain every stream, and write the exit dump when one
  /// is configured. Idempotent.
  pub fn shutdown(&self) {
    self.inner.enabled.store(0, Ordering::Release);

    for state in lock_poisoned(&self.inner.modules).iter_mut() {
      if state.phase == ModulePhase::Active {
        state.phase = ModulePhase::Draining;
      }
    }

    self.exit_thread();

    for state in lock_poisoned(&self.inner.modules).iter() {
      if let Some(pool) = &state.shared_pool {
        pool.finish();
      }
    }

    self.inner.quitting.store(true, Ordering::Release);

    let handle = lock_poisoned(&self.inner.listener).take();

    if let Some(handle) = handle {
      if handle.join().is_err() {
        warn!("listener thread panicked during shutdown");
      }
    }

    for state in lock_poisoned(&self.inner.modules).iter_mut() {
      state.phase = ModulePhase::Closed;
    }

    if let Some(path) = self.inner.config.dump_path.clone() {
      match fs::File::create(&path) {
        Ok(mut file) => {
          if let Err(err) = self.dump(&mut file) {
            warn!("exit dump to {} failed: {err}", path.display());
          }
        }
        Err(err) => {
          warn!("exit dump file {} not created: {err}", path.display());
        }
      }
    }
  }

  /// Run a closure against the merged master tree.
  pub fn with_master<T>(&self, f: impl FnOnce(&TraceBuffer) -> T) -> T {
    f(&self.inner.lock_master())
  }
}

impl std::fmt::Debug for ProfilerContext {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ProfilerContext")
      .field("enabled", &self.is_enabled())
      .finish_non_exhaustive()
  }
}

/// Collection stays suspended while any of these is alive.
pub struct PauseGuard {
  inner: Arc<ContextInner>,
}

impl std::fmt::Debug for PauseGuard {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("PauseGuard").finish_non_exhaustive()
  }
}

impl Drop for PauseGuard {
  fn drop(&mut self) {
    self.inner.enabled.fetch_add(1, Ordering::AcqRel);
  }
}

static INSTALLED: OnceLock<ProfilerContext> = OnceLock::new();

static NEXT_CONTEXT_KEY: AtomicU64 = AtomicU64::new(0);

/// Install a process-wide context. Returns `false` when one is already
/// installed.
pub fn install(context: ProfilerContext) -> bool {
  INSTALLED.set(context).is_ok()
}

/// The process-wide context, when one was installed.
#[must_use]
pub fn current() -> Option<&'static ProfilerContext> {
  INSTALLED.get()
}

/// Configures and starts a `ProfilerContext`.
#[derive(Default)]
pub struct ContextBuilder {
  config: ProfilerConfig,
  resolver: Option<Arc<dyn SymbolResolver>>,
}

impl ContextBuilder {
  #[must_use]
  pub fn buffer_slots(mut self, slots: usize) -> Self {
    self.config.buffer_slots = slots;
    self
  }

  /// Start the context: the master buffer is allocated and the listener
  /// thread begins polling.
  #[must_use]
  pub fn build(self) -> ProfilerContext {
    let options = BufferOptions {
      grow: true,
      max_depth: self.config.max_stack_depth,
      resource_buckets: self.config.resource_buckets,
      track_resources: self.config.track_resources,
    };

    let capacity = self
      .config
      .buffer_slots
      .max(TraceBuffer::minimum_capacity(&options));

    let defs = Arc::new(DefinitionRegistry::new());
    let enabled = i64::from(self.config.start_enabled);

    let master =
      TraceBuffer::setup(capacity, options, Arc::clone(&defs), None);

    let inner = Arc::new(ContextInner {
      config: self.config,
      defs,
      dumping: AtomicBool::new(false),
      enabled: AtomicI64::new(enabled),
      key: NEXT_CONTEXT_KEY.fetch_add(1, Ordering::Relaxed),
      listener: Mutex::new(None),
      master: Mutex::new(master),
      modules: Mutex::new(Vec::new()),
      quitting: AtomicBool::new(false),
      resolver: self.resolver,
      streams: Mutex::new(Vec::new()),
    });

    let for_listener = Arc::clone(&inner);
    let handle = thread::Builder::new()
      .name("tracepool-listener".into())
      .spawn(move || listener_loop(for_listener))
      .expect("listener thread spawn failed");

    *lock_poisoned(&inner.listener) = Some(handle);

    ProfilerContext { inner }
  }

  #[must_use]
  pub fn config(mut self, config: ProfilerConfig) -> Self {
    self.config = config;
    self
  }

  #[must_use]
  pub fn dump_path(mut self, path: impl Into<PathBuf>) -> Self {
    self.config.dump_path = Some(path.into());
    self
  }

  #[must_use]
  pub fn max_stack_depth(mut self, depth: usize) -> Self {
    self.config.max_stack_depth = depth.max(1);
    self
  }

  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  #[must_use]
  pub fn poll_interval(mut self, interval: Duration) -> Self {
    self.config.poll_interval = interval;
    self
  }

  #[must_use]
  pub fn resolver(mut self, resolver: Arc<dyn SymbolResolver>) -> Self {
    self.resolver = Some(resolver);
    self
  }

  #[must_use]
  pub fn shutdown_grace(mut self, grace: Duration) -> Self {
    self.config.shutdown_grace = grace;
    self
  }

  #[must_use]
  pub fn start_enabled(mut self, enabled: bool) -> Self {
    self.config.start_enabled = enabled;
    self
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::record::CounterKind;

  fn fast_context() -> ProfilerContext {
    ContextBuilder::new()
      .poll_interval(Duration::from_millis(1))
      .build()
  }

  fn wait_for<T>(
    mut check: impl FnMut() -> Option<T>,
    what: &str,
  ) -> T {
    let deadline = Instant::now() + Duration::from_secs(5);

    loop {
      if let Some(value) = check() {
        return value;
      }

      assert!(Instant::now() < deadline, "timed out waiting for {what}");
      thread::sleep(Duration::from_millis(1));
    }
  }

  #[test]
  fn pauses_nest() {
    let context = ContextBuilder::new()
      .poll_interval(Duration::from_millis(1))
      .start_enabled(true)
      .build();

    assert!(context.is_enabled());

    let outer = context.pause();
    let inner = context.pause();
    assert!(!context.is_enabled());
    assert!(format!("{outer:?}").contains("PauseGuard"));

    drop(inner);
    assert!(!context.is_enabled());

    drop(outer);
    assert!(context.is_enabled());

    context.shutdown();
  }

  #[test]
  fn pushes_reach_the_master_tree() {
    let context = fast_context();
    let module = context.register_module("demo", PoolPolicy::default());
    let calls = context.definitions().register("CALLS", CounterKind::Tick);

    for _ in 0..3 {
      context.push(
        module,
        &[0x100, 0x200],
        &[Record::new(RecordKind::COUNT, calls).amount(1)],
      );
    }

    context.exit_thread();

    let ticks = wait_for(
      || {
        context.with_master(|master| {
          let node = master.node_by_path(&[0x100, 0x200])?;
          master.counter_by_def(node, calls).map(|c| c.ticks)
        })
      },
      "listener merge",
    );

    assert_eq!(ticks, 3);
    context.shutdown();
  }

  #[test]
  fn paused_pushes_are_dropped() {
    let context = fast_context();
    let module = context.register_module("demo", PoolPolicy::default());
    let calls = context.definitions().register("CALLS", CounterKind::Tick);

    let guard = context.pause();
    context.push(module, &[0x100], &[Record::new(RecordKind::COUNT, calls)]);
    drop(guard);

    context.shutdown();

    context.with_master(|master| {
      assert!(master.children(master.root()).is_empty());
    });
  }

  #[test]
  fn shared_pools_collect_from_many_threads() {
    let context = fast_context();

    let module = context.register_module(
      "shared",
      PoolPolicy {
        buffered: true,
        shared: true,
      },
    );

    let calls = context.definitions().register("CALLS", CounterKind::Tick);

    let workers: Vec<_> = (0..2)
      .map(|_| {
        let context = context.clone();
        thread::spawn(move || {
          context.push(
            module,
            &[0x100],
            &[Record::new(RecordKind::COUNT, calls)],
          );
        })
      })
      .collect();

    for worker in workers {
      worker.join().expect("worker");
    }

    context.shutdown();

    let ticks = context.with_master(|master| {
      let node = master.node_by_path(&[0x100]).expect("node");
      master.counter_by_def(node, calls).expect("counter").ticks
    });

    assert_eq!(ticks, 2);
  }

  #[test]
  fn modules_close_on_shutdown_and_late_registration_is_inert() {
    let context = fast_context();
    let early = context.register_module("early", PoolPolicy::default());
    assert_eq!(context.module_phase(early), Some(ModulePhase::Active));
    assert!(context.is_active());

    context.shutdown();

    assert!(!context.is_active());
    assert_eq!(context.module_phase(early), Some(ModulePhase::Closed));

    let late = context.register_module("late", PoolPolicy::default());
    assert_eq!(context.module_phase(late), Some(ModulePhase::Closed));

    let calls = context.definitions().register("CALLS", CounterKind::Tick);
    context.push(late, &[0x100], &[Record::new(RecordKind::COUNT, calls)]);

    context.with_master(|master| {
      assert!(master.children(master.root()).is_empty());
    });
  }

  #[test]
  fn shutdown_abandons_stuck_streams_after_grace() {
    let context = ContextBuilder::new()
      .poll_interval(Duration::from_millis(1))
      .shutdown_grace(Duration::from_millis(50))
      .build();

    let module = context.register_module("stuck", PoolPolicy::default());
    let calls = context.definitions().register("CALLS", CounterKind::Tick);

    // The worker creates a pool stream and then neither flushes nor exits,
    // so its stream stays open across shutdown.
    let (ready_tx, ready_rx) = bounded::<()>(1);
    let (done_tx, done_rx) = bounded::<()>(1);

    let worker = {
      let context = context.clone();
      thread::spawn(move || {
        context.push(
          module,
          &[0x100],
          &[Record::new(RecordKind::COUNT, calls)],
        );
        ready_tx.send(()).expect("ready");
        let _ = done_rx.recv();
      })
    };

    ready_rx.recv().expect("worker ready");

    let started = Instant::now();
    context.shutdown();
    assert!(
      started.elapsed() < Duration::from_secs(2),
      "shutdown hung past the grace period"
    );

    done_tx.send(()).expect("release worker");
    worker.join().expect("worker");
  }

  #[test]
  fn contexts_keep_thread_pools_separate() {
    let first = fast_context();
    let second = fast_context();

    let module_a = first.register_module("demo", PoolPolicy::default());
    let module_b = second.register_module("demo", PoolPolicy::default());

    let calls_a = first.definitions().register("CALLS", CounterKind::Tick);
    let calls_b = second.definitions().register("CALLS", CounterKind::Tick);

    first.push(module_a, &[0x100], &[Record::new(RecordKind::COUNT, calls_a)]);
    second.push(module_b, &[0x200], &[Record::new(RecordKind::COUNT, calls_b)]);

    first.exit_thread();
    second.exit_thread();
    first.shutdown();
    second.shutdown();

    first.with_master(|master| {
      assert!(master.node_by_path(&[0x100]).is_some());
      assert!(master.node_by_path(&[0x200]).is_none());
    });

    second.with_master(|master| {
      assert!(master.node_by_path(&[0x200]).is_some());
      assert!(master.node_by_path(&[0x100]).is_none());
    });
  }

  #[test]
  fn cross_pool_acquire_release_cancels() {
    let context = fast_context();
    let module = context.register_module("heap", PoolPolicy::default());
    let mem = context
      .definitions()
      .register("MEM", CounterKind::TickPeak);

    let acquire =
      Record::new(RecordKind::COUNT.with(RecordKind::ACQUIRE), mem)
        .amount(128)
        .resource(0x7000);

    context.push(module, &[0x100], &[acquire]);
    context.exit_thread();

    wait_for(
      || {
        context
          .with_master(|master| master.live_resource_count() == 1)
          .then_some(())
      },
      "acquire merge",
    );

    // The release arrives through a different pool instance.
    let release = Record::new(RecordKind::RELEASE, mem).resource(0x7000);
    context.push(module, &[], &[release]);
    context.exit_thread();

    context.shutdown();

    context.with_master(|master| {
      assert_eq!(master.live_resource_count(), 0);
      assert_eq!(master.placeholder_count(), 0);

      let node = master.node_by_path(&[0x100]).expect("node");
      let counter = master.counter_by_def(node, mem).expect("counter");
      assert_eq!(counter.value, 0);
      assert_eq!(counter.peak, 128);
    });
  }
}
