use std::{
  sync::{Arc, Mutex, TryLockError},
  thread,
  time::{Duration, Instant},
};

/// How long a reader backs off between two attempts at the lock.
const RETRY_INTERVAL: Duration = Duration::from_micros(50);

/// A single value shared by copy. Writers replace it wholesale and readers
/// get a copy, so a reader can never observe a partially updated value.
#[derive(Debug, Default)]
pub struct Published<T: Copy> {
  slot: Mutex<(T, u64)>,
}

impl<T: Copy> Published<T> {
  /// Constructs a slot holding `value`.
  pub fn new(value: T) -> Self {
    Published {
      slot: Mutex::new((value, 0)),
    }
  }

  /// Replaces the value.
  pub fn publish(&self, value: T) {
    let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
    slot.0 = value;
    slot.1 = slot.1.wrapping_add(1);
  }

  /// Copies out the value together with its publication count. Gives up
  /// once `timeout` has passed without getting hold of the lock.
  pub fn read(&self, timeout: Duration) -> Option<(T, u64)> {
    let deadline = Instant::now() + timeout;

    loop {
      match self.slot.try_lock() {
        Ok(slot) => return Some(*slot),
        Err(TryLockError::Poisoned(poisoned)) => {
          return Some(*poisoned.into_inner());
        }
        Err(TryLockError::WouldBlock) => {}
      }

      if Instant::now() >= deadline {
        return None;
      }

      thread::sleep(RETRY_INTERVAL);
    }
  }

  /// Copies out the value, waiting as long as it takes.
  pub fn latest(&self) -> T {
    self.current().0
  }

  fn current(&self) -> (T, u64) {
    *self.slot.lock().unwrap_or_else(|e| e.into_inner())
  }
}

/// The outcome of a bounded-wait read.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Snapshot<T> {
  /// The newest value, or the last good one if nothing new could be read.
  pub value: T,

  /// True if `value` is not newer than the one returned previously.
  pub stale: bool,
}

/// Follows a `Published` value, remembering the last good copy.
#[derive(Debug)]
pub struct SnapshotReader<T: Copy> {
  source: Arc<Published<T>>,
  last: T,
  seen: u64,
}

impl<T: Copy> SnapshotReader<T> {
  /// Starts following `source`. Its current value counts as already seen.
  pub fn new(source: Arc<Published<T>>) -> Self {
    let (last, seen) = source.current();

    SnapshotReader { source, last, seen }
  }

  /// Reads the newest value, waiting at most `timeout`.
  pub fn read(&mut self, timeout: Duration) -> Snapshot<T> {
    match self.source.read(timeout) {
      Some((value, count)) if count != self.seen => {
        self.last = value;
        self.seen = count;

        Snapshot {
          value,
          stale: false,
        }
      }
      _ => Snapshot {
        value: self.last,
        stale: true,
      },
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn reader_sees_each_publication_once() {
    let source = Arc::new(Published::new(1_u32));
    let mut reader = SnapshotReader::new(source.clone());

    assert_eq!(
      reader.read(Duration::ZERO),
      Snapshot {
        value: 1,
        stale: true
      }
    );

    source.publish(2);
    assert_eq!(
      reader.read(Duration::ZERO),
      Snapshot {
        value: 2,
        stale: false
      }
    );
    assert!(reader.read(Duration::ZERO).stale);
  }

  #[test]
  fn held_lock_times_out_with_last_value() {
    let source = Arc::new(Published::new(7_u32));
    let mut reader = SnapshotReader::new(source.clone());
    source.publish(8);

    let guard = source.slot.lock().unwrap();
    let started = Instant::now();
    let snapshot = reader.read(Duration::from_millis(5));
    drop(guard);

    assert!(started.elapsed() >= Duration::from_millis(5));
    assert_eq!(
      snapshot,
      Snapshot {
        value: 7,
        stale: true
      }
    );
    assert_eq!(reader.read(Duration::ZERO).value, 8);
  }
}
