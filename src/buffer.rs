use std::{
  collections::{HashMap, HashSet},
  sync::Arc,
};

use log::debug;
use nohash_hasher::BuildNoHashHasher;

use crate::arena::{
  Arena, Counter, CounterId, NodeId, Resource, ResourceId, ResourceState,
  StackNode,
};
use crate::record::{
  CounterKind, DefId, DefinitionRegistry, Record, RecordKind,
};
use crate::symbol::SymbolResolver;

/// Slots that must remain pushable beyond one full-depth stack for the
/// records attached to it.
const RECORD_HEADROOM: usize = 8;

/// Layout choices fixed at `setup` time.
#[derive(Debug, Clone)]
pub struct BufferOptions {
  /// Whether `push_extend` may grow the buffer. Scratch buffers attached to
  /// a single pool mapping are fixed-capacity; the master buffer grows.
  pub grow: bool,
  /// Hard cap on stored stack depth; deeper stacks are silently truncated
  /// to their innermost frames.
  pub max_depth: usize,
  pub resource_buckets: usize,
  pub track_resources: bool,
}

impl Default for BufferOptions {
  fn default() -> Self {
    Self {
      grow: false,
      max_depth: 32,
      resource_buckets: 256,
      track_resources: true,
    }
  }
}

/// Call-tree-indexed store of counters and live-resource records.
///
/// All internal references are typed indices into a relocatable arena, so a
/// buffer can be moved or grown without fix-up. A buffer is mutated by one
/// owner at a time; concurrency lives in the pool and coordinator layers.
#[derive(Debug)]
pub struct TraceBuffer {
  pub(crate) arena: Arena,
  buckets: Vec<Option<ResourceId>>,
  pub(crate) defs: Arc<DefinitionRegistry>,
  options: BufferOptions,
  resolver: Option<Arc<dyn SymbolResolver>>,
  root: NodeId,
  sym_cache: HashMap<u64, u64, BuildNoHashHasher<u64>>,
}

impl TraceBuffer {
  /// Insert one call stack (caller first, innermost frame last) and apply
  /// each record to the terminal node.
  ///
  /// Returns `false` when the buffer lacks space for the worst-case slot
  /// demand of this push; nothing is modified in that case and the caller
  /// must grow (`push_extend`) or flush.
  pub fn push(&mut self, stack: &[u64], records: &[Record]) -> bool {
    let stack = &stack[stack.len().saturating_sub(self.options.max_depth)..];

    if self.free_slots() < push_cost(stack.len(), records) {
      return false;
    }

    let mut node = self.root;

    for &addr in stack {
      let folded = self.fold(addr);
      node = self.ensure_child(node, folded);
    }

    for record in records {
      self.apply_record(node, record, None);
    }

    true
  }

  /// `push` with the grow-and-retry loop. Growth never discards data that is
  /// already in the buffer.
  ///
  /// # Panics
  ///
  /// Panics when the buffer is full and growth is disabled; per the error
  /// taxonomy a capture buffer that can neither hold nor grow is fatal.
  pub fn push_extend(&mut self, stack: &[u64], records: &[Record]) {
    while !self.push(stack, records) {
      assert!(
        self.options.grow,
        "trace buffer exhausted and growth is disabled"
      );
      self.extend();
    }
  }

  /// Double the slot budget.
  fn extend(&mut self) {
    let current = self.arena.capacity();
    self.arena.grow(current.max(1));
  }

  pub(crate) fn ensure_free(&mut self, slots: usize) {
    while self.free_slots() < slots {
      assert!(
        self.options.grow,
        "trace buffer exhausted and growth is disabled"
      );
      self.extend();
    }
  }

  pub(crate) fn apply_record(
    &mut self,
    node: NodeId,
    record: &Record,
    merge_fresh: Option<&HashSet<(DefId, u64)>>,
  ) {
    if record.kind.contains(RecordKind::ACQUIRE) {
      self.acquire(node, record, merge_fresh);
    } else if record.kind.contains(RecordKind::RELEASE) {
      let _ = self.release(record);
    } else if record.kind.contains(RecordKind::COUNT) {
      let counter = self.counter_for(node, record.def);
      self.bump(counter, record.amount, record.ticks);
    }
  }

  fn acquire(
    &mut self,
    node: NodeId,
    record: &Record,
    merge_fresh: Option<&HashSet<(DefId, u64)>>,
  ) {
    if self.buckets.is_empty() {
      // Resource tracking disabled; count the acquisition only.
      let counter = self.counter_for(node, record.def);
      self.bump(counter, record.amount, record.ticks);
      return;
    }

    if let Some(live) = self.find_resource(record.def, record.resource, true) {
      debug!(
        "resource {:#x} reacquired while still live, superseding the leak",
        record.resource
      );
      self.cancel_live(live);
    }

    if let Some(fresh) = merge_fresh {
      // A placeholder that predates this merge is the release half of this
      // acquire: per-resource ordering says an id cannot be acquired again
      // after that release, so the pair annihilates. Placeholders inserted
      // by this merge's own first phase describe earlier resource instances
      // and are exempt.
      if !fresh.contains(&(record.def, record.resource)) {
        if let Some(placeholder) =
          self.find_resource(record.def, record.resource, false)
        {
          self.unlink_from_bucket(placeholder);
          self.arena.free_resource(placeholder);
          return;
        }
      }
    }

    let counter = self.counter_for(node, record.def);
    let head = self.arena.counter(counter).resources;

    let resource = self
      .arena
      .alloc_resource(Resource {
        bucket_next: None,
        def: record.def,
        id: record.resource,
        next: head,
        prev: None,
        size: record.amount,
        state: ResourceState::Live(counter),
      })
      .expect("push cost reserved a resource slot");

    if let Some(head) = head {
      self.arena.resource_mut(head).prev = Some(resource);
    }

    self.arena.counter_mut(counter).resources = Some(resource);
    self.bucket_insert_front(resource);
    self.bump(counter, record.amount, record.ticks);
  }

  /// Cancel a matching live resource, or record a stack-less placeholder so
  /// a later merge can attribute the release. Returns the placeholder when
  /// one was inserted.
  pub(crate) fn release(&mut self, record: &Record) -> Option<ResourceId> {
    if self.buckets.is_empty() {
      return None;
    }

    if let Some(live) = self.find_resource(record.def, record.resource, true) {
      self.cancel_live(live);
      return None;
    }

    if self
      .find_resource(record.def, record.resource, false)
      .is_some()
    {
      // At most one placeholder per id and definition; the duplicate is a
      // pre-profiling free and is dropped.
      return None;
    }

    let placeholder = self
      .arena
      .alloc_resource(Resource {
        bucket_next: None,
        def: record.def,
        id: record.resource,
        next: None,
        prev: None,
        size: record.amount,
        state: ResourceState::Released,
      })
      .expect("push cost reserved a resource slot");

    // Bucket order invariant: acquires in front, releases behind them.
    self.bucket_insert_back(placeholder);

    Some(placeholder)
  }

  fn cancel_live(&mut self, id: ResourceId) {
    let resource = self.arena.resource(id).clone();

    let ResourceState::Live(counter) = resource.state else {
      panic!("live-resource cancellation hit a non-live slot");
    };

    // The owning counter comes from the resource back-reference; release
    // sites often have no call tree of their own.
    {
      let counter = self.arena.counter_mut(counter);
      counter.value = counter.value.saturating_sub(resource.size);
      counter.ticks = counter.ticks.saturating_sub(1);
    }

    match resource.prev {
      Some(prev) => self.arena.resource_mut(prev).next = resource.next,
      None => self.arena.counter_mut(counter).resources = resource.next,
    }

    if let Some(next) = resource.next {
      self.arena.resource_mut(next).prev = resource.prev;
    }

    self.unlink_from_bucket(id);
    self.arena.free_resource(id);
  }

  fn bump(&mut self, id: CounterId, amount: u64, ticks: u64) {
    let kind = self.defs.kind(self.arena.counter(id).def);
    let counter = self.arena.counter_mut(id);

    counter.ticks = counter.ticks.saturating_add(ticks);

    match kind {
      CounterKind::Max => counter.value = counter.value.max(amount),
      CounterKind::Tick => {
        counter.value = counter.value.saturating_add(amount);
      }
      CounterKind::TickPeak => {
        counter.value = counter.value.saturating_add(amount);
        counter.peak = counter.peak.max(counter.value);
      }
    }
  }

  /// Find or create the child of `parent` for an already-folded address,
  /// keeping the sibling list address-sorted.
  pub(crate) fn ensure_child(&mut self, parent: NodeId, addr: u64) -> NodeId {
    let mut prev = None;
    let mut cursor = self.arena.node(parent).first_child;

    while let Some(current) = cursor {
      let node = self.arena.node(current);

      if node.addr == addr {
        return current;
      }

      if node.addr > addr {
        break;
      }

      prev = Some(current);
      cursor = node.next_sibling;
    }

    let mut node = StackNode::new(addr);
    node.next_sibling = cursor;

    let created = self
      .arena
      .alloc_node(node)
      .expect("push cost reserved a node slot");

    match prev {
      Some(prev) => self.arena.node_mut(prev).next_sibling = Some(created),
      None => self.arena.node_mut(parent).first_child = Some(created),
    }

    created
  }

  pub(crate) fn counter_for(&mut self, node: NodeId, def: DefId) -> CounterId {
    let mut cursor = self.arena.node(node).first_counter;

    while let Some(current) = cursor {
      let counter = self.arena.counter(current);

      if counter.def == def {
        return current;
      }

      cursor = counter.next;
    }

    let head = self.arena.node(node).first_counter;

    let created = self
      .arena
      .alloc_counter(Counter {
        def,
        next: head,
        owner: node,
        peak: 0,
        resources: None,
        ticks: 0,
        value: 0,
      })
      .expect("push cost reserved a counter slot");

    self.arena.node_mut(node).first_counter = Some(created);
    created
  }

  fn fold(&mut self, addr: u64) -> u64 {
    let Some(resolver) = self.resolver.clone() else {
      return addr;
    };

    if let Some(&start) = self.sym_cache.get(&addr) {
      return start;
    }

    let start = resolver
      .resolve(addr)
      .map_or(addr, |info| info.start);

    self.sym_cache.insert(addr, start);
    start
  }

  fn bucket_of(&self, def: DefId, id: u64) -> usize {
    ((id ^ u64::from(def)) % self.buckets.len() as u64) as usize
  }

  fn bucket_insert_front(&mut self, id: ResourceId) {
    let resource = self.arena.resource(id);
    let bucket = self.bucket_of(resource.def, resource.id);
    self.arena.resource_mut(id).bucket_next = self.buckets[bucket];
    self.buckets[bucket] = Some(id);
  }

  fn bucket_insert_back(&mut self, id: ResourceId) {
    let resource = self.arena.resource(id);
    let bucket = self.bucket_of(resource.def, resource.id);
    self.arena.resource_mut(id).bucket_next = None;

    let mut cursor = self.buckets[bucket];

    let Some(mut last) = cursor else {
      self.buckets[bucket] = Some(id);
      return;
    };

    while let Some(current) = cursor {
      last = current;
      cursor = self.arena.resource(current).bucket_next;
    }

    self.arena.resource_mut(last).bucket_next = Some(id);
  }

  fn unlink_from_bucket(&mut self, id: ResourceId) {
    let resource = self.arena.resource(id);
    let bucket = self.bucket_of(resource.def, resource.id);
    let next = resource.bucket_next;

    let mut cursor = self.buckets[bucket];

    if cursor == Some(id) {
      self.buckets[bucket] = next;
      return;
    }

    while let Some(current) = cursor {
      if self.arena.resource(current).bucket_next == Some(id) {
        self.arena.resource_mut(current).bucket_next = next;
        return;
      }

      cursor = self.arena.resource(current).bucket_next;
    }

    panic!("resource hash bucket lost an entry it should contain");
  }

  fn find_resource(
    &self,
    def: DefId,
    id: u64,
    live: bool,
  ) -> Option<ResourceId> {
    let mut cursor = self.buckets[self.bucket_of(def, id)];

    while let Some(current) = cursor {
      let resource = self.arena.resource(current);

      if resource.def == def && resource.id == id {
        match (live, resource.state) {
          (true, ResourceState::Live(_)) => return Some(current),
          (false, ResourceState::Released) => return Some(current),
          _ => {}
        }
      }

      cursor = resource.bucket_next;
    }

    None
  }

  #[must_use]
  pub fn capacity(&self) -> usize {
    self.arena.capacity()
  }

  #[must_use]
  pub fn children(&self, node: NodeId) -> Vec<NodeId> {
    let mut children = Vec::new();
    let mut cursor = self.arena.node(node).first_child;

    while let Some(current) = cursor {
      children.push(current);
      cursor = self.arena.node(current).next_sibling;
    }

    children
  }

  #[must_use]
  pub fn counter(&self, id: CounterId) -> &Counter {
    self.arena.counter(id)
  }

  #[must_use]
  pub fn counter_by_def(&self, node: NodeId, def: DefId) -> Option<&Counter> {
    let mut cursor = self.arena.node(node).first_counter;

    while let Some(current) = cursor {
      let counter = self.arena.counter(current);

      if counter.def == def {
        return Some(counter);
      }

      cursor = counter.next;
    }

    None
  }

  #[must_use]
  pub fn counters(&self, node: NodeId) -> Vec<CounterId> {
    let mut counters = Vec::new();
    let mut cursor = self.arena.node(node).first_counter;

    while let Some(current) = cursor {
      counters.push(current);
      cursor = self.arena.counter(current).next;
    }

    counters
  }

  #[must_use]
  pub fn find_child(&self, parent: NodeId, addr: u64) -> Option<NodeId> {
    let mut cursor = self.arena.node(parent).first_child;

    while let Some(current) = cursor {
      let node = self.arena.node(current);

      if node.addr == addr {
        return Some(current);
      }

      cursor = node.next_sibling;
    }

    None
  }

  #[must_use]
  pub fn free_slots(&self) -> usize {
    self.arena.free_slots()
  }

  #[must_use]
  pub fn live_resource_count(&self) -> usize {
    self
      .arena
      .resources()
      .filter(|(_, r)| matches!(r.state, ResourceState::Live(_)))
      .count()
  }

  #[must_use]
  pub fn live_resources(&self, counter: CounterId) -> Vec<ResourceId> {
    let mut resources = Vec::new();
    let mut cursor = self.arena.counter(counter).resources;

    while let Some(current) = cursor {
      resources.push(current);
      cursor = self.arena.resource(current).next;
    }

    resources
  }

  /// The smallest slot budget that fits one full-depth push.
  #[must_use]
  pub fn minimum_capacity(options: &BufferOptions) -> usize {
    1 + options.max_depth + RECORD_HEADROOM
  }

  #[must_use]
  pub fn node(&self, id: NodeId) -> &StackNode {
    self.arena.node(id)
  }

  /// Walk already-folded addresses from the root.
  #[must_use]
  pub fn node_by_path(&self, path: &[u64]) -> Option<NodeId> {
    let mut node = self.root;

    for &addr in path {
      node = self.find_child(node, addr)?;
    }

    Some(node)
  }

  #[must_use]
  pub fn placeholder_count(&self) -> usize {
    self
      .arena
      .resources()
      .filter(|(_, r)| r.state == ResourceState::Released)
      .count()
  }

  /// Reinitialize in place for reuse, keeping capacity, options, and the
  /// symbol cache.
  pub fn reset(&mut self) {
    self.arena.reset();

    for bucket in &mut self.buckets {
      *bucket = None;
    }

    self.root = self
      .arena
      .alloc_node(StackNode::new(0))
      .expect("minimum capacity fits the root sentinel");
  }

  #[must_use]
  pub fn resource(&self, id: ResourceId) -> &Resource {
    self.arena.resource(id)
  }

  #[must_use]
  pub fn root(&self) -> NodeId {
    self.root
  }

  /// Initialize a fresh buffer.
  ///
  /// # Panics
  ///
  /// Panics when `capacity` cannot fit one full-depth push; an undersized
  /// capture buffer is fatal.
  #[must_use]
  pub fn setup(
    capacity: usize,
    options: BufferOptions,
    defs: Arc<DefinitionRegistry>,
    resolver: Option<Arc<dyn SymbolResolver>>,
  ) -> Self {
    assert!(
      capacity >= Self::minimum_capacity(&options),
      "trace buffer capacity {capacity} below minimum {}",
      Self::minimum_capacity(&options)
    );

    let buckets = if options.track_resources {
      vec![None; options.resource_buckets.max(1)]
    } else {
      Vec::new()
    };

    let mut arena = Arena::new(capacity);

    let root = arena
      .alloc_node(StackNode::new(0))
      .expect("minimum capacity fits the root sentinel");

    Self {
      arena,
      buckets,
      defs,
      options,
      resolver,
      root,
      sym_cache: HashMap::with_hasher(BuildNoHashHasher::default()),
    }
  }

  /// Sum of `ticks` for `def` over a node and all of its descendants.
  #[must_use]
  pub fn subtree_ticks(&self, node: NodeId, def: DefId) -> u64 {
    let own = self
      .counter_by_def(node, def)
      .map_or(0, |counter| counter.ticks);

    self
      .children(node)
      .into_iter()
      .fold(own, |sum, child| {
        sum.saturating_add(self.subtree_ticks(child, def))
      })
  }
}

/// Worst-case slot demand of one push: a node per frame, a counter per
/// record, and a resource per acquire or release.
fn push_cost(depth: usize, records: &[Record]) -> usize {
  let resources = records
    .iter()
    .filter(|record| {
      record.kind.contains(RecordKind::ACQUIRE)
        || record.kind.contains(RecordKind::RELEASE)
    })
    .count();

  depth + records.len() + resources
}
