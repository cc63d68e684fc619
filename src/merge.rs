use super::*;

use crate::record::DefId;

impl TraceBuffer {
  /// Fold a flushed or foreign buffer into this one.
  ///
  /// The processing order is mandatory. First every still-present release
  /// placeholder in `other` is replayed as a release record: those stand
  /// for resources that were live before `other` started and must cancel an
  /// acquire recorded earlier in this buffer. Only then is `other`'s call
  /// tree walked depth-first, replaying counts and still-live resources.
  /// This two-phase discipline makes acquire/release pairs that were split
  /// across buffer boundaries cancel correctly in either merge order.
  pub fn merge(&mut self, other: &TraceBuffer) {
    let mut fresh: HashSet<(DefId, u64)> = HashSet::new();

    let placeholders: Vec<(DefId, u64, u64)> = other
      .arena
      .resources()
      .filter(|(_, resource)| resource.state == ResourceState::Released)
      .map(|(_, resource)| (resource.def, resource.id, resource.size))
      .collect();

    for (def, id, size) in placeholders {
      self.ensure_free(1);

      let record = Record::new(RecordKind::RELEASE, def)
        .amount(size)
        .resource(id);

      if self.release(&record).is_some() {
        // Inserted rather than cancelled: remember it so this merge's own
        // second phase does not mistake it for an older release.
        fresh.insert((def, id));
      }
    }

    let mut work = vec![(other.root(), self.root())];

    while let Some((theirs, ours)) = work.pop() {
      self.merge_counters(other, theirs, ours, &fresh);

      for child in other.children(theirs) {
        let addr = other.node(child).addr;
        self.ensure_free(1);
        let target = self.ensure_child(ours, addr);
        work.push((child, target));
      }
    }
  }

  fn merge_counters(
    &mut self,
    other: &TraceBuffer,
    theirs: NodeId,
    ours: NodeId,
    fresh: &HashSet<(DefId, u64)>,
  ) {
    for id in other.counters(theirs) {
      let counter = other.counter(id).clone();
      let kind = self.defs.kind(counter.def);

      let live: Vec<(u64, u64)> = other
        .live_resources(id)
        .into_iter()
        .map(|rid| {
          let resource = other.resource(rid);
          (resource.id, resource.size)
        })
        .collect();

      let live_count = live.len() as u64;
      let live_sum: u64 = live.iter().map(|(_, size)| *size).sum();

      self.ensure_free(1);
      let target = self.counter_for(ours, counter.def);

      // Replay the counter totals minus the live-resource contribution as a
      // plain count; the live resources follow as an acquire snapshot.
      {
        let folded = self.arena.counter_mut(target);

        match kind {
          CounterKind::Max => {
            folded.ticks = folded.ticks.saturating_add(counter.ticks);
            folded.value = folded.value.max(counter.value);
          }
          CounterKind::Tick | CounterKind::TickPeak => {
            folded.ticks = folded
              .ticks
              .saturating_add(counter.ticks.saturating_sub(live_count));
            folded.value = folded
              .value
              .saturating_add(counter.value.saturating_sub(live_sum));
          }
        }
      }

      for (resource, size) in live {
        self.ensure_free(2);

        let record =
          Record::new(RecordKind::COUNT.with(RecordKind::ACQUIRE), counter.def)
            .amount(size)
            .resource(resource);

        self.apply_record(ours, &record, Some(fresh));
      }

      // Peak is recomputed after the placeholder releases of phase one have
      // already lowered `value`, so a merged peak can under-report a true
      // concurrent peak. Known imprecision; kept deliberately.
      if kind == CounterKind::TickPeak {
        let folded = self.arena.counter_mut(target);
        folded.peak = folded.peak.max(counter.peak).max(folded.value);
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::record::{CounterKind, DefinitionRegistry};
  use std::sync::Arc;

  fn fresh_buffer(defs: &Arc<DefinitionRegistry>) -> TraceBuffer {
    let options = BufferOptions {
      grow: true,
      max_depth: 8,
      resource_buckets: 16,
      track_resources: true,
    };

    TraceBuffer::setup(64, options, Arc::clone(defs), None)
  }

  fn acquire(def: DefId, id: u64, size: u64) -> Record {
    Record::new(RecordKind::COUNT.with(RecordKind::ACQUIRE), def)
      .amount(size)
      .resource(id)
  }

  #[test]
  fn cross_buffer_release_cancels_in_either_order() {
    let defs = Arc::new(DefinitionRegistry::new());
    let mem = defs.register("MEM", CounterKind::TickPeak);

    let mut a = fresh_buffer(&defs);
    assert!(a.push(&[0x100], &[acquire(mem, 7, 100)]));

    let mut b = fresh_buffer(&defs);
    assert!(b.push(&[], &[Record::new(RecordKind::RELEASE, mem).resource(7)]));

    for order in [[&a, &b], [&b, &a]] {
      let mut master = fresh_buffer(&defs);

      for buffer in order {
        master.merge(buffer);
      }

      assert_eq!(master.live_resource_count(), 0);
      assert_eq!(master.placeholder_count(), 0);

      let node = master.node_by_path(&[0x100]).expect("node x");
      let counter = master.counter_by_def(node, mem).expect("counter");
      assert_eq!(counter.ticks, 0);
      assert_eq!(counter.value, 0);
    }
  }

  #[test]
  fn empty_merge_is_idempotent() {
    let defs = Arc::new(DefinitionRegistry::new());
    let calls = defs.register("CALLS", CounterKind::Tick);
    let mem = defs.register("MEM", CounterKind::Tick);

    let mut master = fresh_buffer(&defs);
    assert!(master.push(
      &[0x100, 0x200],
      &[Record::new(RecordKind::COUNT, calls).amount(1)]
    ));
    assert!(master.push(&[0x100], &[acquire(mem, 9, 32)]));

    let empty = fresh_buffer(&defs);

    let before = format!("{:?}", master.arena);
    master.merge(&empty);
    assert_eq!(format!("{:?}", master.arena), before);
  }

  #[test]
  fn counts_fold_into_matching_paths() {
    let defs = Arc::new(DefinitionRegistry::new());
    let calls = defs.register("CALLS", CounterKind::Tick);

    let mut master = fresh_buffer(&defs);
    let mut other = fresh_buffer(&defs);

    for buffer in [&mut master, &mut other] {
      assert!(buffer.push(
        &[0x100, 0x200],
        &[Record::new(RecordKind::COUNT, calls).amount(2)]
      ));
    }

    assert!(other.push(
      &[0x100, 0x300],
      &[Record::new(RecordKind::COUNT, calls).amount(1)]
    ));

    master.merge(&other);

    let shared = master.node_by_path(&[0x100, 0x200]).expect("shared");
    let counter = master.counter_by_def(shared, calls).expect("counter");
    assert_eq!(counter.ticks, 2);
    assert_eq!(counter.value, 4);

    let new = master.node_by_path(&[0x100, 0x300]).expect("new path");
    let counter = master.counter_by_def(new, calls).expect("counter");
    assert_eq!(counter.ticks, 1);
    assert_eq!(counter.value, 1);

    // Sibling order stays deterministic after the merge.
    let parent = master.node_by_path(&[0x100]).expect("parent");
    let addrs: Vec<u64> = master
      .children(parent)
      .into_iter()
      .map(|id| master.node(id).addr)
      .collect();
    assert_eq!(addrs, vec![0x200, 0x300]);
  }

  #[test]
  fn live_resources_survive_the_merge() {
    let defs = Arc::new(DefinitionRegistry::new());
    let mem = defs.register("MEM", CounterKind::TickPeak);

    let mut other = fresh_buffer(&defs);
    assert!(other.push(&[0x100], &[acquire(mem, 1, 40)]));
    assert!(other.push(&[0x100], &[acquire(mem, 2, 24)]));

    let mut master = fresh_buffer(&defs);
    master.merge(&other);

    assert_eq!(master.live_resource_count(), 2);

    let node = master.node_by_path(&[0x100]).expect("node");
    let counter = master.counter_by_def(node, mem).expect("counter");
    assert_eq!(counter.value, 64);
    assert_eq!(counter.ticks, 2);
    assert_eq!(counter.peak, 64);
  }

  #[test]
  fn same_buffer_release_then_reacquire_keeps_both_records() {
    let defs = Arc::new(DefinitionRegistry::new());
    let mem = defs.register("MEM", CounterKind::Tick);

    // The address was freed before profiling started and then reused by a
    // fresh allocation inside the same buffer; the placeholder and the live
    // resource describe different instances and must both survive.
    let mut other = fresh_buffer(&defs);
    assert!(other.push(&[], &[Record::new(RecordKind::RELEASE, mem).resource(7)]));
    assert!(other.push(&[0x100], &[acquire(mem, 7, 50)]));

    let mut master = fresh_buffer(&defs);
    master.merge(&other);

    assert_eq!(master.live_resource_count(), 1);
    assert_eq!(master.placeholder_count(), 1);
  }
}
