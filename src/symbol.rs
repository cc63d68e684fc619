use std::{ffi::c_void, sync::Arc};

/// Resolution of one call address.
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolInfo {
  /// Path of the binary the symbol lives in, when known.
  pub binary: Arc<str>,
  /// Offset of the symbol start within the binary.
  pub binary_offset: u64,
  pub name: Arc<str>,
  /// Address of the first instruction of the enclosing function. Call
  /// addresses are folded onto this so every return address inside one
  /// function collapses to one tree node.
  pub start: u64,
}

impl SymbolInfo {
  /// Placeholder used when no resolver is configured or resolution fails.
  #[must_use]
  pub fn unresolved(addr: u64) -> Self {
    Self {
      binary: Arc::<str>::from("??"),
      binary_offset: 0,
      name: Arc::<str>::from(format!("{addr:#x}")),
      start: addr,
    }
  }
}

/// Address-to-symbol lookup.
///
/// Symbol resolution proper is a platform concern and lives outside this
/// crate; implementations only need to answer "which function does this
/// address belong to". Results are memoized per call address by the trace
/// buffer, so a resolver may be arbitrarily slow.
pub trait SymbolResolver: Send + Sync {
  fn resolve(&self, addr: u64) -> Option<SymbolInfo>;
}

impl std::fmt::Debug for dyn SymbolResolver {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str("SymbolResolver")
  }
}

/// Default resolver backed by the `backtrace` crate.
///
/// Reports the source file as the binary path, which is the best the
/// portable API offers; module-accurate paths come from platform resolvers.
#[derive(Debug, Default)]
pub struct BacktraceResolver;

impl BacktraceResolver {
  #[must_use]
  pub fn new() -> Self {
    Self
  }
}

impl SymbolResolver for BacktraceResolver {
  fn resolve(&self, addr: u64) -> Option<SymbolInfo> {
    let mut resolved = None;

    backtrace::resolve(addr as *mut c_void, |symbol| {
      if resolved.is_some() {
        return;
      }

      let start = symbol.addr().map_or(addr, |ptr| ptr as u64);

      let name = symbol
        .name()
        .map(|name| format!("{name}"))
        .unwrap_or_else(|| format!("{addr:#x}"));

      let binary = symbol
        .filename()
        .and_then(|path| path.to_str())
        .unwrap_or("??");

      resolved = Some(SymbolInfo {
        binary: Arc::<str>::from(binary),
        binary_offset: 0,
        name: Arc::<str>::from(name),
        start,
      });
    });

    resolved
  }
}

#[cfg(test)]
pub(crate) mod testing {
  use super::*;
  use std::collections::HashMap;

  /// Table-driven resolver for tests.
  #[derive(Debug, Default)]
  pub struct FakeResolver {
    symbols: HashMap<u64, SymbolInfo>,
  }

  impl FakeResolver {
    pub fn insert(&mut self, addr: u64, start: u64, name: &str, binary: &str) {
      self.symbols.insert(
        addr,
        SymbolInfo {
          binary: Arc::<str>::from(binary),
          binary_offset: 0,
          name: Arc::<str>::from(name),
          start,
        },
      );
    }

    #[must_use]
    pub fn new() -> Self {
      Self::default()
    }
  }

  impl SymbolResolver for FakeResolver {
    fn resolve(&self, addr: u64) -> Option<SymbolInfo> {
      self.symbols.get(&addr).cloned()
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn unresolved_info_names_the_address() {
    let info = SymbolInfo::unresolved(0x1234);
    assert_eq!(info.name.as_ref(), "0x1234");
    assert_eq!(info.start, 0x1234);
    assert_eq!(info.binary.as_ref(), "??");
  }

  #[test]
  fn backtrace_resolver_handles_garbage_addresses() {
    let resolver = BacktraceResolver::new();
    // Address 1 is never mapped; resolution must not panic.
    let _ = resolver.resolve(1);
  }
}
