//! In-process execution profiler built around relocatable call-tree
//! buffers.
//!
//! Instrumentation pushes call stacks with attached records into per-thread
//! collection pools. Pools encode the data into pre-allocated memory
//! mappings and hand full mappings to a listener thread, which folds every
//! stream into one master call tree. The merged tree can be dumped as a
//! compact text protocol or as JSON.

mod arena;
mod buffer;
mod config;
mod coordinator;
mod dump;
mod merge;
mod pool;
mod record;
mod symbol;
mod wire;

use {
  crossbeam_channel::{
    Receiver, Sender, TryRecvError, TrySendError, bounded,
  },
  crossbeam_queue::ArrayQueue,
  log::{debug, warn},
  memmap2::{MmapMut, MmapOptions},
  serde::Serialize,
  std::{
    cell::RefCell,
    collections::{HashMap, HashSet},
    fmt::{self, Display, Formatter},
    fs::{self, File},
    io::{self, Read, Seek, Write},
    path::PathBuf,
    sync::{
      Arc, Mutex, MutexGuard, OnceLock,
      atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
  },
  tempfile::tempfile,
};

pub use {
  arena::{
    Counter, CounterId, NodeId, Resource, ResourceId, ResourceState,
    StackNode,
  },
  buffer::{BufferOptions, TraceBuffer},
  config::ProfilerConfig,
  coordinator::{
    ContextBuilder, MAX_MODULES, ModuleId, ModulePhase, PauseGuard,
    PoolPolicy, ProfilerContext, current, install,
  },
  dump::{DumpError, DumpMeta, write_dump, write_json},
  pool::{CollectionPool, MemRef, PoolMessage},
  record::{
    CounterDef, CounterKind, DefId, DefinitionRegistry, Record, RecordKind,
  },
  symbol::{BacktraceResolver, SymbolInfo, SymbolResolver},
  wire::{
    END_WORDS, EVENT_WORDS, RecordReader, STACK_HEADER_WORDS, WORD_BYTES,
    WireError, WireRecord, WireTag, WordWriter, record_from_event, tag_for,
  },
};
