use crate::record::DefId;

/// Index of a call-tree vertex in the tree/counter area.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct NodeId(u32);

/// Index of a counter in the tree/counter area.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct CounterId(u32);

/// Index of a resource in the resource area.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct ResourceId(u32);

impl NodeId {
  #[must_use]
  pub fn index(self) -> usize {
    self.0 as usize
  }
}

impl CounterId {
  #[must_use]
  pub fn index(self) -> usize {
    self.0 as usize
  }
}

impl ResourceId {
  #[must_use]
  pub fn index(self) -> usize {
    self.0 as usize
  }
}

/// One call-tree vertex. Siblings are kept address-sorted so lookups and
/// merges are deterministic.
#[derive(Debug, Clone, PartialEq)]
pub struct StackNode {
  pub addr: u64,
  pub first_child: Option<NodeId>,
  pub first_counter: Option<CounterId>,
  pub next_sibling: Option<NodeId>,
}

impl StackNode {
  #[must_use]
  pub fn new(addr: u64) -> Self {
    Self {
      addr,
      first_child: None,
      first_counter: None,
      next_sibling: None,
    }
  }
}

/// One (stack node, definition) accumulator.
#[derive(Debug, Clone, PartialEq)]
pub struct Counter {
  pub def: DefId,
  pub next: Option<CounterId>,
  pub owner: NodeId,
  pub peak: u64,
  pub resources: Option<ResourceId>,
  pub ticks: u64,
  pub value: u64,
}

/// Whether a resource slot records a live acquisition, a release that is
/// still waiting for its acquire (a placeholder), or nothing at all.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ResourceState {
  /// Recycled slot sitting on the free list.
  Free,
  /// Live acquisition owned by a counter.
  Live(CounterId),
  /// Release observed with no matching acquire in this buffer.
  Released,
}

/// One tracked live allocation or handle.
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
  pub bucket_next: Option<ResourceId>,
  pub def: DefId,
  pub id: u64,
  pub next: Option<ResourceId>,
  pub prev: Option<ResourceId>,
  pub size: u64,
  pub state: ResourceState,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Slot {
  Counter(Counter),
  Node(StackNode),
}

/// Relocatable pool of typed slots.
///
/// The tree/counter area and the resource area share one slot budget and
/// grow toward each other; every cross-reference is a typed index, so the
/// whole pool survives relocation (a `Vec` reallocation) with zero fix-up.
#[derive(Debug, PartialEq)]
pub struct Arena {
  capacity: usize,
  free_head: Option<ResourceId>,
  high: Vec<Slot>,
  low: Vec<Resource>,
  recycled: usize,
}

impl Arena {
  pub fn alloc_counter(&mut self, counter: Counter) -> Option<CounterId> {
    if self.free_slots() == 0 {
      return None;
    }

    let id = CounterId(slot_index(self.high.len()));
    self.high.push(Slot::Counter(counter));
    Some(id)
  }

  pub fn alloc_node(&mut self, node: StackNode) -> Option<NodeId> {
    if self.free_slots() == 0 {
      return None;
    }

    let id = NodeId(slot_index(self.high.len()));
    self.high.push(Slot::Node(node));
    Some(id)
  }

  pub fn alloc_resource(&mut self, resource: Resource) -> Option<ResourceId> {
    if let Some(id) = self.free_head {
      self.free_head = self.low[id.index()].bucket_next;
      self.recycled -= 1;
      self.low[id.index()] = resource;
      return Some(id);
    }

    if self.free_slots() == 0 {
      return None;
    }

    let id = ResourceId(slot_index(self.low.len()));
    self.low.push(resource);
    Some(id)
  }

  #[must_use]
  pub fn capacity(&self) -> usize {
    self.capacity
  }

  #[must_use]
  pub fn counter(&self, id: CounterId) -> &Counter {
    match &self.high[id.index()] {
      Slot::Counter(counter) => counter,
      Slot::Node(_) => panic!("counter id {id:?} addresses a node slot"),
    }
  }

  #[must_use]
  pub fn counter_mut(&mut self, id: CounterId) -> &mut Counter {
    match &mut self.high[id.index()] {
      Slot::Counter(counter) => counter,
      Slot::Node(_) => panic!("counter id {id:?} addresses a node slot"),
    }
  }

  #[must_use]
  pub fn counter_slots(&self) -> usize {
    self
      .high
      .iter()
      .filter(|slot| matches!(slot, Slot::Counter(_)))
      .count()
  }

  /// Return a resource slot to the free list. The caller must have unlinked
  /// it from its bucket and live list already.
  pub fn free_resource(&mut self, id: ResourceId) {
    let head = self.free_head;
    let slot = &mut self.low[id.index()];
    slot.bucket_next = head;
    slot.next = None;
    slot.prev = None;
    slot.state = ResourceState::Free;
    self.free_head = Some(id);
    self.recycled += 1;
  }

  #[must_use]
  pub fn free_slots(&self) -> usize {
    let used = self.high.len() + self.low.len() - self.recycled;
    self.capacity.saturating_sub(used)
  }

  /// Grow the slot budget. Relocation of the backing storage is safe because
  /// all stored references are indices.
  pub fn grow(&mut self, extra: usize) {
    self.capacity += extra;
  }

  #[must_use]
  pub fn new(capacity: usize) -> Self {
    Self {
      capacity,
      free_head: None,
      high: Vec::new(),
      low: Vec::new(),
      recycled: 0,
    }
  }

  #[must_use]
  pub fn node(&self, id: NodeId) -> &StackNode {
    match &self.high[id.index()] {
      Slot::Node(node) => node,
      Slot::Counter(_) => panic!("node id {id:?} addresses a counter slot"),
    }
  }

  #[must_use]
  pub fn node_mut(&mut self, id: NodeId) -> &mut StackNode {
    match &mut self.high[id.index()] {
      Slot::Node(node) => node,
      Slot::Counter(_) => panic!("node id {id:?} addresses a counter slot"),
    }
  }

  #[must_use]
  pub fn node_slots(&self) -> usize {
    self
      .high
      .iter()
      .filter(|slot| matches!(slot, Slot::Node(_)))
      .count()
  }

  /// Reinitialize in place, keeping the current slot budget.
  pub fn reset(&mut self) {
    self.free_head = None;
    self.high.clear();
    self.low.clear();
    self.recycled = 0;
  }

  #[must_use]
  pub fn resource(&self, id: ResourceId) -> &Resource {
    &self.low[id.index()]
  }

  #[must_use]
  pub fn resource_mut(&mut self, id: ResourceId) -> &mut Resource {
    &mut self.low[id.index()]
  }

  /// All resource slots in area order, earliest first. Recycled slots are
  /// included; callers filter on state.
  pub fn resources(&self) -> impl Iterator<Item = (ResourceId, &Resource)> {
    self
      .low
      .iter()
      .enumerate()
      .map(|(index, resource)| (ResourceId(slot_index(index)), resource))
  }
}

fn slot_index(index: usize) -> u32 {
  u32::try_from(index).expect("arena exceeds u32 slot index range")
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn areas_share_one_budget() {
    let mut arena = Arena::new(3);

    assert!(arena.alloc_node(StackNode::new(0)).is_some());
    assert!(
      arena
        .alloc_resource(Resource {
          bucket_next: None,
          def: 0,
          id: 1,
          next: None,
          prev: None,
          size: 8,
          state: ResourceState::Released,
        })
        .is_some()
    );
    assert!(arena.alloc_node(StackNode::new(1)).is_some());
    assert_eq!(arena.free_slots(), 0);
    assert!(arena.alloc_node(StackNode::new(2)).is_none());
  }

  #[test]
  fn freed_resources_are_recycled() {
    let mut arena = Arena::new(2);
    arena.alloc_node(StackNode::new(0)).expect("node");

    let resource = Resource {
      bucket_next: None,
      def: 0,
      id: 7,
      next: None,
      prev: None,
      size: 16,
      state: ResourceState::Released,
    };

    let first = arena.alloc_resource(resource.clone()).expect("resource");
    arena.free_resource(first);
    assert_eq!(arena.free_slots(), 1);

    let second = arena.alloc_resource(resource).expect("recycled");
    assert_eq!(first, second);
  }

  #[test]
  #[should_panic(expected = "addresses a node slot")]
  fn counter_accessor_checks_slot_variant() {
    let mut arena = Arena::new(4);
    let node = arena.alloc_node(StackNode::new(0)).expect("node");
    let _ = arena.counter(CounterId(node.index() as u32));
  }
}
