//! Demo driver: records a synthetic workload and prints the dump.

use std::{io, time::Duration};

use tracepool::{
  ContextBuilder, CounterKind, PoolPolicy, Record, RecordKind,
};

fn main() {
  env_logger::init();

  let context = ContextBuilder::new()
    .poll_interval(Duration::from_millis(2))
    .build();

  tracepool::install(context.clone());

  let module = context.register_module("demo", PoolPolicy::default());
  let calls = context.definitions().register("CALLS", CounterKind::Tick);
  let heap = context
    .definitions()
    .register("HEAP", CounterKind::TickPeak);

  // Synthetic call tree: main -> parse -> alloc, leaking every other
  // allocation.
  let addr_main = 0x1000u64;
  let addr_parse = 0x2000u64;
  let addr_alloc = 0x3000u64;

  for i in 0..16u64 {
    context.push(
      module,
      &[addr_main, addr_parse],
      &[Record::new(RecordKind::COUNT, calls)],
    );

    let acquire =
      Record::new(RecordKind::COUNT.with(RecordKind::ACQUIRE), heap)
        .amount(32 + i)
        .resource(0x9000 + i);

    context.push(module, &[addr_main, addr_parse, addr_alloc], &[acquire]);

    if i % 2 == 0 {
      let release =
        Record::new(RecordKind::RELEASE, heap).resource(0x9000 + i);
      context.push(module, &[], &[release]);
    }
  }

  context.exit_thread();
  context.shutdown();

  let mut stdout = io::stdout().lock();

  if let Err(err) = context.dump(&mut stdout) {
    eprintln!("dump failed: {err}");
  }
}
