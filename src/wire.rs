use super::*;

/// Bytes per protocol word.
pub const WORD_BYTES: usize = 8;

/// Words in an END marker.
pub const END_WORDS: usize = 2;

/// Words in an event record.
pub const EVENT_WORDS: usize = 6;

/// Header words preceding the addresses of a STACK record.
pub const STACK_HEADER_WORDS: usize = 2;

/// Tags of the pool/coordinator wire protocol. Every record starts with a
/// `(word_count, tag, ...)` header triple. `FileRef` and `MemRef` identify
/// hand-off references and travel as `PoolMessage` variants rather than
/// in-stream words; they are never valid inside a mapping.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum WireTag {
  Acquire,
  End,
  FileRef,
  Max,
  MemRef,
  Release,
  Stack,
  Tick,
}

impl WireTag {
  #[must_use]
  pub fn from_word(word: u64) -> Option<Self> {
    match word {
      0 => Some(Self::End),
      1 => Some(Self::FileRef),
      2 => Some(Self::MemRef),
      3 => Some(Self::Stack),
      4 => Some(Self::Tick),
      5 => Some(Self::Max),
      6 => Some(Self::Acquire),
      7 => Some(Self::Release),
      _ => None,
    }
  }

  #[must_use]
  pub fn to_word(self) -> u64 {
    match self {
      Self::End => 0,
      Self::FileRef => 1,
      Self::MemRef => 2,
      Self::Stack => 3,
      Self::Tick => 4,
      Self::Max => 5,
      Self::Acquire => 6,
      Self::Release => 7,
    }
  }
}

/// Decoding failures. Streams come from foreign mappings and spool files;
/// malformed data is reported, not fatal.
#[derive(Debug)]
pub enum WireError {
  BadTag(u64),
  Truncated,
}

impl Display for WireError {
  fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
    match self {
      Self::BadTag(word) => write!(f, "unknown wire tag {word}"),
      Self::Truncated => write!(f, "wire record truncated"),
    }
  }
}

impl std::error::Error for WireError {}

/// One decoded record.
#[derive(Debug, Clone, PartialEq)]
pub enum WireRecord {
  End,
  Event {
    amount: u64,
    def: DefId,
    resource: u64,
    tag: WireTag,
    ticks: u64,
  },
  Stack(Vec<u64>),
}

/// Map a record onto its wire tag; plain counts carry the counter kind so
/// the consumer can tell TICK from MAX without a registry lookup.
#[must_use]
pub fn tag_for(record: &Record, kind: CounterKind) -> WireTag {
  if record.kind.contains(RecordKind::ACQUIRE) {
    WireTag::Acquire
  } else if record.kind.contains(RecordKind::RELEASE) {
    WireTag::Release
  } else if kind == CounterKind::Max {
    WireTag::Max
  } else {
    WireTag::Tick
  }
}

/// Rebuild a `Record` from a decoded event.
#[must_use]
pub fn record_from_event(
  tag: WireTag,
  def: DefId,
  amount: u64,
  ticks: u64,
  resource: u64,
) -> Record {
  let kind = match tag {
    WireTag::Acquire => RecordKind::COUNT.with(RecordKind::ACQUIRE),
    WireTag::Release => RecordKind::RELEASE,
    _ => RecordKind::COUNT,
  };

  Record::new(kind, def)
    .amount(amount)
    .ticks(ticks)
    .resource(resource)
}

/// Append-only word writer over a preallocated byte region. Never
/// allocates; the hot path checks `fits` before encoding.
#[derive(Debug)]
pub struct WordWriter<'a> {
  bytes: &'a mut [u8],
  words: usize,
}

impl<'a> WordWriter<'a> {
  pub fn encode_end(&mut self) {
    self.push(END_WORDS as u64);
    self.push(WireTag::End.to_word());
  }

  pub fn encode_event(&mut self, record: &Record, kind: CounterKind) {
    self.push(EVENT_WORDS as u64);
    self.push(tag_for(record, kind).to_word());
    self.push(u64::from(record.def));
    self.push(record.amount);
    self.push(record.ticks);
    self.push(record.resource);
  }

  pub fn encode_stack(&mut self, stack: &[u64]) {
    self.push((STACK_HEADER_WORDS + stack.len()) as u64);
    self.push(WireTag::Stack.to_word());

    for &addr in stack {
      self.push(addr);
    }
  }

  #[must_use]
  pub fn fits(&self, words: usize) -> bool {
    (self.words + words) * WORD_BYTES <= self.bytes.len()
  }

  #[must_use]
  pub fn new(bytes: &'a mut [u8]) -> Self {
    Self { bytes, words: 0 }
  }

  fn push(&mut self, word: u64) {
    let start = self.words * WORD_BYTES;
    self.bytes[start..start + WORD_BYTES]
      .copy_from_slice(&word.to_ne_bytes());
    self.words += 1;
  }

  #[must_use]
  pub fn words_written(&self) -> usize {
    self.words
  }
}

/// Iterator over the records of an encoded stream.
#[derive(Debug)]
pub struct RecordReader<'a> {
  bytes: &'a [u8],
  done: bool,
  offset: usize,
}

impl<'a> RecordReader<'a> {
  #[must_use]
  pub fn new(bytes: &'a [u8]) -> Self {
    Self {
      bytes,
      done: false,
      offset: 0,
    }
  }

  fn next_word(&mut self) -> Option<u64> {
    let end = self.offset + WORD_BYTES;

    if end > self.bytes.len() {
      return None;
    }

    let word = u64::from_ne_bytes(
      self.bytes[self.offset..end]
        .try_into()
        .expect("slice is exactly one word"),
    );

    self.offset = end;
    Some(word)
  }
}

impl Iterator for RecordReader<'_> {
  type Item = Result<WireRecord, WireError>;

  fn next(&mut self) -> Option<Self::Item> {
    if self.done {
      return None;
    }

    // A stream may simply stop at the mapping cursor without an END marker.
    let count = self.next_word()?;

    let Some(tag_word) = self.next_word() else {
      self.done = true;
      return Some(Err(WireError::Truncated));
    };

    let Some(tag) = WireTag::from_word(tag_word) else {
      self.done = true;
      return Some(Err(WireError::BadTag(tag_word)));
    };

    match tag {
      WireTag::End => {
        self.done = true;
        Some(Ok(WireRecord::End))
      }
      WireTag::Stack => {
        let frames =
          (count as usize).saturating_sub(STACK_HEADER_WORDS);

        // The count word is untrusted; a corrupt stream must not size an
        // allocation beyond the words actually present.
        let remaining = (self.bytes.len() - self.offset) / WORD_BYTES;

        if frames > remaining {
          self.done = true;
          return Some(Err(WireError::Truncated));
        }

        let mut stack = Vec::with_capacity(frames);

        for _ in 0..frames {
          match self.next_word() {
            Some(addr) => stack.push(addr),
            None => {
              self.done = true;
              return Some(Err(WireError::Truncated));
            }
          }
        }

        Some(Ok(WireRecord::Stack(stack)))
      }
      WireTag::Tick | WireTag::Max | WireTag::Acquire | WireTag::Release => {
        let mut payload = [0u64; 4];

        for slot in &mut payload {
          match self.next_word() {
            Some(word) => *slot = word,
            None => {
              self.done = true;
              return Some(Err(WireError::Truncated));
            }
          }
        }

        Some(Ok(WireRecord::Event {
          amount: payload[1],
          def: payload[0] as DefId,
          resource: payload[3],
          tag,
          ticks: payload[2],
        }))
      }
      WireTag::FileRef | WireTag::MemRef => {
        self.done = true;
        Some(Err(WireError::BadTag(tag_word)))
      }
    }
  }
}
