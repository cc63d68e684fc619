use std::sync::{
  Arc,
  atomic::{AtomicU32, Ordering},
};

use dashmap::DashMap;
use nohash_hasher::BuildNoHashHasher;

/// Unique identifier for a process-wide counter definition.
pub type DefId = u32;

/// How a counter folds incoming amounts.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum CounterKind {
  /// Keeps the largest single amount seen.
  Max,
  /// Sums amounts.
  Tick,
  /// Sums amounts while tracking the running maximum of the sum.
  TickPeak,
}

/// Named accumulator definition shared by every buffer in the process.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CounterDef {
  pub id: DefId,
  pub kind: CounterKind,
  pub name: Arc<str>,
}

/// Bitmask describing what a `Record` asks the buffer to do.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct RecordKind(u8);

impl RecordKind {
  pub const ACQUIRE: Self = Self(0b010);
  pub const COUNT: Self = Self(0b001);
  pub const RELEASE: Self = Self(0b100);

  #[must_use]
  pub fn contains(self, other: Self) -> bool {
    self.0 & other.0 == other.0
  }

  #[must_use]
  pub fn with(self, other: Self) -> Self {
    Self(self.0 | other.0)
  }
}

/// One unit of input pushed by instrumentation alongside a call stack.
#[derive(Debug, Clone, Copy)]
pub struct Record {
  pub amount: u64,
  pub def: DefId,
  pub kind: RecordKind,
  pub resource: u64,
  pub ticks: u64,
}

impl Record {
  #[must_use]
  pub fn amount(mut self, amount: u64) -> Self {
    self.amount = amount;
    self
  }

  #[must_use]
  pub fn new(kind: RecordKind, def: DefId) -> Self {
    Self {
      amount: 0,
      def,
      kind,
      resource: 0,
      ticks: 1,
    }
  }

  #[must_use]
  pub fn resource(mut self, resource: u64) -> Self {
    self.resource = resource;
    self
  }

  #[must_use]
  pub fn ticks(mut self, ticks: u64) -> Self {
    self.ticks = ticks;
    self
  }
}

/// Registry of counter definitions.
///
/// Definitions are process-wide singletons: the same `DefId` means the same
/// counter in every collection pool and every trace buffer, which is what
/// makes cross-buffer release placeholders resolvable during merge.
#[derive(Debug)]
pub struct DefinitionRegistry {
  by_id: DashMap<DefId, CounterDef, BuildNoHashHasher<DefId>>,
  by_name: DashMap<String, DefId>,
  next: AtomicU32,
}

impl Default for DefinitionRegistry {
  fn default() -> Self {
    Self {
      by_id: DashMap::with_hasher(BuildNoHashHasher::default()),
      by_name: DashMap::new(),
      next: AtomicU32::new(0),
    }
  }
}

impl DefinitionRegistry {
  #[must_use]
  pub fn get(&self, id: DefId) -> Option<CounterDef> {
    self.by_id.get(&id).map(|def| def.clone())
  }

  #[must_use]
  pub fn kind(&self, id: DefId) -> CounterKind {
    self
      .by_id
      .get(&id)
      .map_or(CounterKind::Tick, |def| def.kind)
  }

  #[must_use]
  pub fn len(&self) -> usize {
    self.by_id.len()
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.by_id.is_empty()
  }

  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  /// Register a definition by name, returning the existing id when the name
  /// was registered before. Ids are process-wide: every pool and buffer
  /// sharing this registry agrees on what a `DefId` means.
  pub fn register(&self, name: &str, kind: CounterKind) -> DefId {
    let id = *self
      .by_name
      .entry(name.to_string())
      .or_insert_with(|| self.next.fetch_add(1, Ordering::Relaxed));

    self.by_id.entry(id).or_insert_with(|| CounterDef {
      id,
      kind,
      name: Arc::<str>::from(name),
    });

    id
  }
}
