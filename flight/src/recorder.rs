//! Fire-and-forget flight recording. Producers enqueue records into a bounded
//! channel without ever blocking; a background thread batches them into
//! length-prefixed postcard files on disk.

use common::comm::Record;
use jeflog::{fail, warn};
use postcard::experimental::max_size::MaxSize;
use std::{
  fmt,
  fs::{self, File},
  io::{self, BufReader, BufWriter, Read, Write},
  path::{Path, PathBuf},
  sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError},
    Arc,
  },
  thread::{self, JoinHandle},
  time::{Duration, Instant},
};

/// Configuration of the recording writer.
#[derive(Clone, Debug)]
pub struct RecorderConfig {
  /// Whether records are written to disk at all.
  pub enabled: bool,

  /// Directory where recordings are stored.
  pub log_dir: PathBuf,

  /// Maximum number of records queued between producers and the writer.
  pub channel_capacity: usize,

  /// Number of records written together.
  pub batch_size: usize,

  /// Maximum time a partial batch waits before being written.
  pub batch_timeout: Duration,

  /// Size in bytes after which a new file is started.
  pub file_size_limit: usize,
}

impl Default for RecorderConfig {
  fn default() -> Self {
    RecorderConfig {
      enabled: true,
      log_dir: default_log_dir(),
      channel_capacity: 1_024,
      batch_size: 64,
      batch_timeout: Duration::from_millis(500),
      file_size_limit: 16 * 1024 * 1024,
    }
  }
}

fn default_log_dir() -> PathBuf {
  std::env::var("HOME")
    .map(PathBuf::from)
    .unwrap_or_else(|_| PathBuf::from("."))
    .join("flight_recordings")
}

/// Errors of the recording subsystem.
#[derive(Debug)]
pub enum RecorderError {
  /// File system access failed.
  Io(io::Error),

  /// A record could not be encoded or decoded.
  Serialization(postcard::Error),

  /// The queue was full and the record was dropped.
  QueueFull,

  /// The writer thread is gone.
  Disconnected,

  /// A recording file announced a record longer than any record can be.
  Corrupt {
    /// The announced length, in bytes.
    length: u64,
  },
}

impl From<io::Error> for RecorderError {
  fn from(error: io::Error) -> Self {
    RecorderError::Io(error)
  }
}

impl From<postcard::Error> for RecorderError {
  fn from(error: postcard::Error) -> Self {
    RecorderError::Serialization(error)
  }
}

impl fmt::Display for RecorderError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Io(error) => write!(f, "IO error: {error}"),
      Self::Serialization(error) => write!(f, "serialization error: {error}"),
      Self::QueueFull => write!(f, "recording queue is full"),
      Self::Disconnected => write!(f, "recording writer has stopped"),
      Self::Corrupt { length } => {
        write!(f, "corrupt recording, record length {length} is too long")
      }
    }
  }
}

impl std::error::Error for RecorderError {}

/// A cloneable producer handle. Recording starts disabled and is switched by
/// the `Recorder` action.
#[derive(Clone, Debug)]
pub struct Recorder {
  sender: SyncSender<Record>,
  recording: Arc<AtomicBool>,
  overflowing: Arc<AtomicBool>,
  dropped: Arc<AtomicU32>,
}

impl Recorder {
  /// A recorder feeding a bare channel, without a writer thread.
  pub fn channel(capacity: usize) -> (Recorder, Receiver<Record>) {
    let (sender, receiver) = mpsc::sync_channel(capacity);

    let recorder = Recorder {
      sender,
      recording: Arc::new(AtomicBool::new(false)),
      overflowing: Arc::new(AtomicBool::new(false)),
      dropped: Arc::new(AtomicU32::new(0)),
    };

    (recorder, receiver)
  }

  /// Enqueues a record without blocking. While recording is disabled the
  /// record is discarded. A full queue drops the record and marks the
  /// recorder as overflowing until a later record gets through.
  pub fn record(&self, record: Record) -> Result<(), RecorderError> {
    if !self.is_recording() {
      return Ok(());
    }

    match self.sender.try_send(record) {
      Ok(()) => {
        self.overflowing.store(false, Ordering::Relaxed);
        Ok(())
      }
      Err(TrySendError::Full(_)) => {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        self.overflowing.store(true, Ordering::Relaxed);
        Err(RecorderError::QueueFull)
      }
      Err(TrySendError::Disconnected(_)) => Err(RecorderError::Disconnected),
    }
  }

  /// Starts or stops recording.
  pub fn set_recording(&self, enabled: bool) {
    self.recording.store(enabled, Ordering::Relaxed);
  }

  /// True while records are accepted.
  pub fn is_recording(&self) -> bool {
    self.recording.load(Ordering::Relaxed)
  }

  /// True while the last attempt to enqueue found the queue full.
  pub fn is_overflowing(&self) -> bool {
    self.overflowing.load(Ordering::Relaxed)
  }

  /// Total number of records dropped because the queue was full.
  pub fn dropped(&self) -> u32 {
    self.dropped.load(Ordering::Relaxed)
  }
}

/// The background writer. Stops once every `Recorder` clone is dropped or
/// `finish` is called.
#[derive(Debug)]
pub struct RecordWriter {
  handle: JoinHandle<()>,
  stop: Arc<AtomicBool>,
}

impl RecordWriter {
  /// Starts the writer thread and returns the producer handle feeding it.
  pub fn start(
    config: RecorderConfig,
  ) -> Result<(Recorder, RecordWriter), RecorderError> {
    let (recorder, receiver) = Recorder::channel(config.channel_capacity);
    let stop = Arc::new(AtomicBool::new(false));

    if !config.enabled {
      let stopped = stop.clone();
      let handle = thread::spawn(move || {
        while !stopped.load(Ordering::Relaxed) {
          let idle = Duration::from_millis(100);

          if let Err(RecvTimeoutError::Disconnected) =
            receiver.recv_timeout(idle)
          {
            break;
          }
        }
      });

      return Ok((recorder, RecordWriter { handle, stop }));
    }

    fs::create_dir_all(&config.log_dir)?;

    let stopped = stop.clone();
    let handle =
      thread::spawn(move || write_records(receiver, config, stopped));

    Ok((recorder, RecordWriter { handle, stop }))
  }

  /// Writes out every record already queued and stops the writer, even if
  /// producers are still alive.
  pub fn finish(self) -> Result<(), RecorderError> {
    self.stop.store(true, Ordering::Relaxed);

    self.handle.join().map_err(|_| {
      RecorderError::Io(io::Error::new(
        io::ErrorKind::Other,
        "recording writer panicked",
      ))
    })
  }
}

struct OpenFile {
  writer: BufWriter<File>,
  size: usize,
}

struct Writer {
  config: RecorderConfig,
  file: Option<OpenFile>,
  index: u32,
  buffer: [u8; Record::POSTCARD_MAX_SIZE],
}

fn write_records(
  receiver: Receiver<Record>,
  config: RecorderConfig,
  stop: Arc<AtomicBool>,
) {
  let mut batch = Vec::with_capacity(config.batch_size);
  let mut last_flush = Instant::now();

  let mut writer = Writer {
    config,
    file: None,
    index: 0,
    buffer: [0; Record::POSTCARD_MAX_SIZE],
  };

  loop {
    let timeout = writer
      .config
      .batch_timeout
      .saturating_sub(last_flush.elapsed());

    match receiver.recv_timeout(timeout) {
      Ok(record) => batch.push(record),
      Err(RecvTimeoutError::Timeout) => {}
      Err(RecvTimeoutError::Disconnected) => break,
    }

    if stop.load(Ordering::Relaxed) {
      batch.extend(receiver.try_iter());
      break;
    }

    let due = last_flush.elapsed() >= writer.config.batch_timeout;

    if batch.len() >= writer.config.batch_size || (due && !batch.is_empty()) {
      writer.write_batch(&mut batch);
      last_flush = Instant::now();
    } else if due {
      last_flush = Instant::now();
    }
  }

  writer.write_batch(&mut batch);

  if let Some(file) = writer.file.as_mut() {
    if let Err(error) = file.writer.flush() {
      fail!("Failed to flush recording: {error}");
    }
  }
}

impl Writer {
  fn write_batch(&mut self, batch: &mut Vec<Record>) {
    if batch.is_empty() {
      return;
    }

    if self.file.is_none() {
      match self.open_next() {
        Ok(file) => self.file = Some(file),
        Err(error) => {
          fail!("Failed to open recording file: {error}");
          batch.clear();
          return;
        }
      }
    }

    let Some(file) = self.file.as_mut() else {
      return;
    };

    for record in batch.drain(..) {
      let encoded = match postcard::to_slice(&record, &mut self.buffer) {
        Ok(encoded) => encoded,
        Err(error) => {
          warn!("Failed to serialize record: {error}");
          continue;
        }
      };

      let length = encoded.len() as u64;

      let written = file
        .writer
        .write_all(&length.to_le_bytes())
        .and_then(|_| file.writer.write_all(encoded));

      if let Err(error) = written {
        fail!("Failed to write record: {error}");
        continue;
      }

      file.size += 8 + encoded.len();
    }

    if let Err(error) = file.writer.flush() {
      fail!("Failed to flush recording: {error}");
    }

    if file.size >= self.config.file_size_limit {
      self.file = None;
    }
  }

  fn open_next(&mut self) -> io::Result<OpenFile> {
    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let path = self
      .config
      .log_dir
      .join(format!("flight_{stamp}_{:03}.postcard", self.index));

    self.index += 1;

    Ok(OpenFile {
      writer: BufWriter::with_capacity(64 * 1024, File::create(path)?),
      size: 0,
    })
  }
}

/// Reads back every record of a recording file.
pub fn read_recording(path: &Path) -> Result<Vec<Record>, RecorderError> {
  let mut reader = BufReader::new(File::open(path)?);
  let mut records = Vec::new();
  let mut length = [0; 8];

  loop {
    match reader.read_exact(&mut length) {
      Ok(()) => {}
      Err(error) if error.kind() == io::ErrorKind::UnexpectedEof => break,
      Err(error) => return Err(error.into()),
    }

    let length = u64::from_le_bytes(length);

    if length > Record::POSTCARD_MAX_SIZE as u64 {
      return Err(RecorderError::Corrupt { length });
    }

    let mut encoded = vec![0; length as usize];
    reader.read_exact(&mut encoded)?;
    records.push(postcard::from_bytes(&encoded)?);
  }

  Ok(records)
}

#[cfg(test)]
mod tests {
  use super::*;
  use common::comm::{Event, FlightPhase, RecordPayload};

  fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir()
      .join(format!("flight-recorder-{name}-{}", std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    dir
  }

  #[test]
  fn disabled_recorder_discards() {
    let (recorder, receiver) = Recorder::channel(4);

    recorder
      .record(Record::new(0, RecordPayload::Event(Event::Ready)))
      .unwrap();

    assert!(receiver.try_recv().is_err());
  }

  #[test]
  fn full_queue_drops_instead_of_blocking() {
    let (recorder, receiver) = Recorder::channel(2);
    recorder.set_recording(true);

    for timestamp in 0..5 {
      let record = Record::new(timestamp, RecordPayload::Voltage(8_000));
      let _ = recorder.record(record);
    }

    assert_eq!(recorder.dropped(), 3);
    assert!(recorder.is_overflowing());

    // the queue drains and the next record gets through
    assert_eq!(receiver.try_recv().unwrap().timestamp, 0);
    assert_eq!(receiver.try_recv().unwrap().timestamp, 1);
    recorder
      .record(Record::new(9, RecordPayload::Voltage(8_000)))
      .unwrap();
    assert!(!recorder.is_overflowing());
  }

  #[test]
  fn oversized_length_is_rejected() {
    let dir = scratch_dir("corrupt");
    fs::create_dir_all(&dir).unwrap();

    let path = dir.join("corrupt.rec");
    let mut bytes = u64::MAX.to_le_bytes().to_vec();
    bytes.extend([0; 16]);
    fs::write(&path, bytes).unwrap();

    assert!(matches!(
      read_recording(&path),
      Err(RecorderError::Corrupt { length: u64::MAX })
    ));
    let _ = fs::remove_dir_all(&dir);
  }

  #[test]
  fn written_file_decodes_to_recorded_records() {
    let dir = scratch_dir("roundtrip");
    let config = RecorderConfig {
      log_dir: dir.clone(),
      batch_size: 3,
      ..RecorderConfig::default()
    };

    let (recorder, writer) = RecordWriter::start(config).unwrap();
    recorder.set_recording(true);

    let records = vec![
      Record::new(
        10,
        RecordPayload::PhaseChange {
          from: FlightPhase::Ready,
          to: FlightPhase::Thrusting,
        },
      ),
      Record::new(10, RecordPayload::Event(Event::Liftoff)),
      Record::new(20, RecordPayload::Voltage(7_950)),
      Record::new(30, RecordPayload::Event(Event::Burnout)),
    ];

    for record in &records {
      recorder.record(*record).unwrap();
    }

    writer.finish().unwrap();
    drop(recorder);

    let files: Vec<_> = fs::read_dir(&dir)
      .unwrap()
      .map(|entry| entry.unwrap().path())
      .collect();
    assert_eq!(files.len(), 1);

    assert_eq!(read_recording(&files[0]).unwrap(), records);
    let _ = fs::remove_dir_all(&dir);
  }
}
