use super::*;

/// Header fields of a dump.
#[derive(Debug, Clone)]
pub struct DumpMeta {
  pub pid: u32,
  pub program: String,
  /// Timer resolution advertised to readers, in microseconds.
  pub timer_resolution: u32,
}

/// Failures while writing a dump.
#[derive(Debug)]
pub enum DumpError {
  Io(io::Error),
  Json(serde_json::Error),
}

impl Display for DumpError {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    match self {
      Self::Io(err) => write!(f, "dump write failed: {err}"),
      Self::Json(err) => write!(f, "dump serialization failed: {err}"),
    }
  }
}

impl std::error::Error for DumpError {
  fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
    match self {
      Self::Io(err) => Some(err),
      Self::Json(err) => Some(err),
    }
  }
}

impl From<io::Error> for DumpError {
  fn from(err: io::Error) -> Self {
    Self::Io(err)
  }
}

impl From<serde_json::Error> for DumpError {
  fn from(err: serde_json::Error) -> Self {
    Self::Json(err)
  }
}

/// First-seen id tables; later references abbreviate to the bare id.
#[derive(Default)]
struct DumpState {
  binaries: HashMap<String, u32>,
  counters: HashMap<DefId, u32>,
  symbols: HashMap<u64, u32>,
}

impl DumpState {
  fn binary_ref(&mut self, binary: &str, offset: u64) -> String {
    let next = self.binaries.len() as u32;

    match self.binaries.get(binary) {
      Some(&id) => format!("F{id}+{offset}"),
      None => {
        self.binaries.insert(binary.to_string(), next);
        format!("F{next}=({binary})+{offset}")
      }
    }
  }

  fn counter_ref(&mut self, def: DefId) -> (u32, bool) {
    let next = self.counters.len() as u32;

    match self.counters.get(&def) {
      Some(&id) => (id, false),
      None => {
        self.counters.insert(def, next);
        (next, true)
      }
    }
  }

  fn symbol_ref(
    &mut self,
    addr: u64,
    info: &SymbolInfo,
  ) -> String {
    let next = self.symbols.len() as u32;
    let offset = addr.saturating_sub(info.start);

    match self.symbols.get(&info.start) {
      Some(&id) => format!("FN{id}+{offset}"),
      None => {
        self.symbols.insert(info.start, next);
        let binary = self.binary_ref(&info.binary, info.binary_offset);
        format!("FN{next}=({binary} N=({}))+{offset}", info.name)
      }
    }
  }
}

fn symbol_for(
  resolver: Option<&dyn SymbolResolver>,
  addr: u64,
) -> SymbolInfo {
  resolver
    .and_then(|resolver| resolver.resolve(addr))
    .unwrap_or_else(|| SymbolInfo::unresolved(addr))
}

/// Write the line-oriented text dump.
///
/// One `P=(...)` header line, then one `C<depth>` line per call-tree node
/// in depth-first preorder. Symbols, binaries, and counter definitions are
/// spelled out the first time they appear and referenced by id afterwards,
/// which keeps dumps of large trees compact.
pub fn write_dump(
  buffer: &TraceBuffer,
  defs: &DefinitionRegistry,
  resolver: Option<&dyn SymbolResolver>,
  meta: &DumpMeta,
  writer: &mut dyn io::Write,
) -> Result<(), DumpError> {
  writeln!(
    writer,
    "P=(ID={} N=({}) T={})",
    meta.pid, meta.program, meta.timer_resolution
  )?;

  let mut state = DumpState::default();
  let mut work: Vec<(NodeId, usize)> = Vec::new();

  // The root is a sentinel and is not printed.
  for &child in buffer.children(buffer.root()).iter().rev() {
    work.push((child, 0));
  }

  while let Some((node, depth)) = work.pop() {
    let addr = buffer.node(node).addr;
    let info = symbol_for(resolver, addr);

    write!(writer, "C{depth} {}", state.symbol_ref(addr, &info))?;

    for id in buffer.counters(node) {
      let counter = buffer.counter(id);
      let name = counter_name(defs, counter.def);
      let (counter_id, first) = state.counter_ref(counter.def);

      if first {
        write!(
          writer,
          " V{counter_id}=({name}):({},{},{})",
          counter.ticks, counter.value, counter.peak
        )?;
      } else {
        write!(
          writer,
          " V{counter_id}:({},{},{})",
          counter.ticks, counter.value, counter.peak
        )?;
      }

      for rid in buffer.live_resources(id) {
        let resource = buffer.resource(rid);
        write!(writer, ";LK=({:#x},{})", resource.id, resource.size)?;
      }
    }

    writeln!(writer)?;

    for &child in buffer.children(node).iter().rev() {
      work.push((child, depth + 1));
    }
  }

  Ok(())
}

fn counter_name(defs: &DefinitionRegistry, def: DefId) -> String {
  defs
    .get(def)
    .map_or_else(|| format!("DEF{def}"), |def| def.name.to_string())
}

#[derive(Debug, Serialize)]
struct JsonProfile {
  pid: u32,
  program: String,
  roots: Vec<JsonNode>,
  timer_resolution: u32,
}

#[derive(Debug, Serialize)]
struct JsonNode {
  address: String,
  binary: String,
  children: Vec<JsonNode>,
  counters: Vec<JsonCounter>,
  name: String,
}

#[derive(Debug, Serialize)]
struct JsonCounter {
  live: Vec<JsonResource>,
  name: String,
  peak: u64,
  ticks: u64,
  value: u64,
}

#[derive(Debug, Serialize)]
struct JsonResource {
  id: String,
  size: u64,
}

fn json_node(
  buffer: &TraceBuffer,
  defs: &DefinitionRegistry,
  resolver: Option<&dyn SymbolResolver>,
  node: NodeId,
) -> JsonNode {
  let addr = buffer.node(node).addr;
  let info = symbol_for(resolver, addr);

  let counters = buffer
    .counters(node)
    .into_iter()
    .map(|id| {
      let counter = buffer.counter(id);

      let live = buffer
        .live_resources(id)
        .into_iter()
        .map(|rid| {
          let resource = buffer.resource(rid);
          JsonResource {
            id: format!("{:#x}", resource.id),
            size: resource.size,
          }
        })
        .collect();

      JsonCounter {
        live,
        name: counter_name(defs, counter.def),
        peak: counter.peak,
        ticks: counter.ticks,
        value: counter.value,
      }
    })
    .collect();

  let children = buffer
    .children(node)
    .into_iter()
    .map(|child| json_node(buffer, defs, resolver, child))
    .collect();

  JsonNode {
    address: format!("{addr:#x}"),
    binary: info.binary.to_string(),
    children,
    counters,
    name: info.name.to_string(),
  }
}

/// Write the same profile as pretty-printed JSON.
pub fn write_json(
  buffer: &TraceBuffer,
  defs: &DefinitionRegistry,
  resolver: Option<&dyn SymbolResolver>,
  meta: &DumpMeta,
  writer: &mut dyn io::Write,
) -> Result<(), DumpError> {
  let profile = JsonProfile {
    pid: meta.pid,
    program: meta.program.clone(),
    roots: buffer
      .children(buffer.root())
      .into_iter()
      .map(|child| json_node(buffer, defs, resolver, child))
      .collect(),
    timer_resolution: meta.timer_resolution,
  };

  serde_json::to_writer_pretty(&mut *writer, &profile)?;
  writeln!(writer)?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::record::CounterKind;
  use crate::symbol::testing::FakeResolver;

  fn sample_buffer() -> (TraceBuffer, Arc<DefinitionRegistry>) {
    let defs = Arc::new(DefinitionRegistry::new());
    let calls = defs.register("CALLS", CounterKind::Tick);
    let mem = defs.register("MEM", CounterKind::TickPeak);

    let mut buffer = TraceBuffer::setup(
      128,
      BufferOptions::default(),
      Arc::clone(&defs),
      None,
    );

    for _ in 0..3 {
      assert!(buffer.push(
        &[0x100],
        &[Record::new(RecordKind::COUNT, calls).amount(1)]
      ));
    }

    let acquire = Record::new(
      RecordKind::COUNT.with(RecordKind::ACQUIRE),
      mem,
    )
    .amount(64)
    .resource(0x7000);
    assert!(buffer.push(&[0x100, 0x200], &[acquire]));

    (buffer, defs)
  }

  fn meta() -> DumpMeta {
    DumpMeta {
      pid: 42,
      program: "demo".to_string(),
      timer_resolution: 100,
    }
  }

  #[test]
  fn text_dump_spells_definitions_once() {
    let (buffer, defs) = sample_buffer();

    let mut resolver = FakeResolver::new();
    resolver.insert(0x100, 0x100, "f", "/bin/demo");
    resolver.insert(0x200, 0x200, "g", "/bin/demo");

    let mut out = Vec::new();
    write_dump(&buffer, &defs, Some(&resolver), &meta(), &mut out)
      .expect("dump");

    let text = String::from_utf8(out).expect("utf8");
    let mut lines = text.lines();

    assert_eq!(lines.next(), Some("P=(ID=42 N=(demo) T=100)"));

    let top = lines.next().expect("top frame");
    assert!(top.starts_with("C0 FN0=("), "line was: {top}");
    assert!(top.contains("F0=(/bin/demo)+0"));
    assert!(top.contains("N=(f)"));
    assert!(top.contains("V0=(CALLS):(3,3,0)"));

    let child = lines.next().expect("child frame");
    assert!(child.starts_with("C1 FN1=("));
    // The binary was spelled out on the first line; only its id repeats.
    assert!(child.contains("F0+0"));
    assert!(!child.contains("/bin/demo"));
    assert!(child.contains("V1=(MEM):(1,64,64);LK=(0x7000,64)"));

    assert!(lines.next().is_none());
  }

  #[test]
  fn unresolved_addresses_still_dump() {
    let (buffer, defs) = sample_buffer();

    let mut out = Vec::new();
    write_dump(&buffer, &defs, None, &meta(), &mut out).expect("dump");

    let text = String::from_utf8(out).expect("utf8");
    assert!(text.contains("N=(0x100)"));
    assert!(text.contains("F0=(??)+0"));
  }

  #[test]
  fn json_export_carries_the_tree() {
    let (buffer, defs) = sample_buffer();

    let mut out = Vec::new();
    write_json(&buffer, &defs, None, &meta(), &mut out).expect("json");

    let profile: serde_json::Value =
      serde_json::from_slice(&out).expect("valid json");

    assert_eq!(profile["pid"], 42);
    assert_eq!(profile["roots"][0]["address"], "0x100");
    assert_eq!(profile["roots"][0]["counters"][0]["name"], "CALLS");
    assert_eq!(profile["roots"][0]["counters"][0]["ticks"], 3);

    let child = &profile["roots"][0]["children"][0];
    assert_eq!(child["counters"][0]["peak"], 64);
    assert_eq!(child["counters"][0]["live"][0]["size"], 64);
  }
}
