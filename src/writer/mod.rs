//! Multi-stream writer
//!
//! One writer task moves frames from the per-stream queues into the current
//! flight's files. Time is cut into fixed periods: inside a period the writer
//! blocks on all queues at once and stores one frame per wake-up; at the
//! period boundary it flushes every file, drains the log ring and reports
//! queue overflows. Pause requests are only observed at boundaries.
//!
//! ```text
//! Starting ─► Active ─(pause)─► Draining ─► Paused ─(resume)─► Reopening ─► Active
//!               └─(storage error)─► Failed ─(pause)─► Paused
//! ```

pub mod frame;
pub mod log_ring;
pub mod queue;

pub use log_ring::LogRing;
pub use queue::StreamQueue;

use crate::disk::Disk;
use crate::error::{Result, StorageError};
use crate::flight::{FileManager, Stream};
use crate::settings::StorageSettings;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Select, Sender};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Why storage is paused; several reasons may be active at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum PauseReason {
    /// Board reset pending
    Reset = 1,
    /// Operator pressed the safe/pause button
    Safe = 2,
    /// Host mass-storage session owns the disk
    MassStorage = 4,
}

impl PauseReason {
    pub fn bit(self) -> u32 {
        self as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WriterState {
    Starting,
    Active,
    Draining,
    Paused,
    Reopening,
    /// A storage error ended the flight; waits for a pause/resume cycle
    Failed,
    Stopped,
}

enum Control {
    /// Re-check the pause mask
    Wake,
    Shutdown,
}

/// Overflows per stream over one period
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OverflowReport {
    pub sensor: u32,
    pub state: u32,
    pub gps: u32,
}

impl OverflowReport {
    pub fn total(&self) -> u64 {
        self.sensor as u64 + self.state as u64 + self.gps as u64
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    fn accumulate(&mut self, other: &OverflowReport) {
        self.sensor = self.sensor.saturating_add(other.sensor);
        self.state = self.state.saturating_add(other.state);
        self.gps = self.gps.saturating_add(other.gps);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WriterStats {
    pub periods: u64,
    pub sensor_frames: u64,
    pub state_frames: u64,
    pub gps_frames: u64,
    pub bytes_written: u64,
    /// Frames rejected by the encoder
    pub dropped_frames: u64,
    pub write_errors: u64,
    /// Overflows since start
    pub overflows: OverflowReport,
    pub flights_opened: u64,
    pub log_bytes_dropped: u64,
}

/// Status lights driven by the writer
pub trait Indicator: Send {
    /// Storage work in progress
    fn busy(&mut self, _on: bool) {}

    /// Result of the last period
    fn healthy(&mut self, _ok: bool) {}
}

#[derive(Debug, Default)]
pub struct NoIndicator;

impl Indicator for NoIndicator {}

struct Shared {
    pause: AtomicU32,
    active: AtomicBool,
    period_ms: AtomicU64,
    state: Mutex<WriterState>,
    stats: Mutex<WriterStats>,
    last_overflow: Mutex<OverflowReport>,
}

/// Producer side of the writer; cheap to clone
#[derive(Clone)]
pub struct WriterHandle {
    sensor: StreamQueue,
    state: StreamQueue,
    gps: StreamQueue,
    log: LogRing,
    control: Sender<Control>,
    shared: Arc<Shared>,
}

impl WriterHandle {
    /// Queue a frame; never blocks. `Busy` means the queue was full.
    pub fn enqueue(&self, stream: Stream, frame: Vec<u8>) -> Result<()> {
        match stream {
            Stream::Sensor => self.sensor.try_send(frame),
            Stream::State => self.state.try_send(frame),
            Stream::Gps => self.gps.try_send(frame),
            Stream::Log | Stream::Perf => Err(StorageError::Parameter(format!(
                "{} is not a frame stream",
                stream
            ))),
        }
    }

    pub fn enqueue_sensor(&self, frame: Vec<u8>) -> Result<()> {
        self.sensor.try_send(frame)
    }

    pub fn enqueue_state(&self, frame: Vec<u8>) -> Result<()> {
        self.state.try_send(frame)
    }

    pub fn enqueue_gps(&self, frame: Vec<u8>) -> Result<()> {
        self.gps.try_send(frame)
    }

    /// Operator pause.
    pub fn pause(&self) {
        self.pause_for(PauseReason::Safe);
    }

    pub fn resume(&self) {
        self.resume_for(PauseReason::Safe);
    }

    pub fn pause_for(&self, reason: PauseReason) {
        let before = self.shared.pause.fetch_or(reason.bit(), Ordering::SeqCst);
        debug!("Pause requested ({:?}), mask {:#x}", reason, before | reason.bit());
        self.wake();
    }

    pub fn resume_for(&self, reason: PauseReason) {
        let before = self.shared.pause.fetch_and(!reason.bit(), Ordering::SeqCst);
        debug!("Resume requested ({:?}), mask {:#x}", reason, before & !reason.bit());
        self.wake();
    }

    pub fn pause_mask(&self) -> u32 {
        self.shared.pause.load(Ordering::SeqCst)
    }

    /// True while flight files are open.
    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> WriterState {
        *self.shared.state.lock()
    }

    /// Queue a log line for the flight log; returns the bytes accepted.
    pub fn log(&self, line: &str) -> usize {
        self.log.push(line.as_bytes())
    }

    /// Overflows reported at the most recent period boundary.
    pub fn overflow_report(&self) -> OverflowReport {
        *self.shared.last_overflow.lock()
    }

    pub fn stats(&self) -> WriterStats {
        let mut stats = self.shared.stats.lock().clone();
        stats.log_bytes_dropped = self.log.dropped();
        stats
    }

    pub fn period(&self) -> Duration {
        Duration::from_millis(self.shared.period_ms.load(Ordering::Relaxed))
    }

    /// Takes effect at the next period.
    pub fn set_period(&self, period: Duration) {
        let ms = (period.as_millis() as u64).max(1);
        self.shared.period_ms.store(ms, Ordering::Relaxed);
    }

    pub fn shutdown(&self) {
        let _ = self.control.send(Control::Shutdown);
    }

    fn wake(&self) {
        let _ = self.control.send(Control::Wake);
    }
}

enum PeriodEnd {
    Elapsed,
    Shutdown,
}

pub struct StorageWriter<D: Disk, I: Indicator = NoIndicator> {
    files: Arc<Mutex<FileManager<D>>>,
    sensor: StreamQueue,
    state_queue: StreamQueue,
    gps: StreamQueue,
    log: LogRing,
    control: Receiver<Control>,
    shared: Arc<Shared>,
    state: WriterState,
    indicator: I,
    encode_buf: Vec<u8>,
    started: Instant,
}

impl<D: Disk> StorageWriter<D, NoIndicator> {
    pub fn new(
        files: Arc<Mutex<FileManager<D>>>,
        settings: &StorageSettings,
        period: Duration,
    ) -> (Self, WriterHandle) {
        let (control_tx, control_rx) = channel::unbounded();
        let shared = Arc::new(Shared {
            pause: AtomicU32::new(0),
            active: AtomicBool::new(false),
            period_ms: AtomicU64::new((period.as_millis() as u64).max(1)),
            state: Mutex::new(WriterState::Starting),
            stats: Mutex::new(WriterStats::default()),
            last_overflow: Mutex::new(OverflowReport::default()),
        });

        let handle = WriterHandle {
            sensor: StreamQueue::new(settings.queues.sensor),
            state: StreamQueue::new(settings.queues.state),
            gps: StreamQueue::new(settings.queues.gps),
            log: LogRing::new(settings.log_ring_bytes),
            control: control_tx,
            shared: Arc::clone(&shared),
        };

        let writer = StorageWriter {
            files,
            sensor: handle.sensor.clone(),
            state_queue: handle.state.clone(),
            gps: handle.gps.clone(),
            log: handle.log.clone(),
            control: control_rx,
            shared,
            state: WriterState::Starting,
            indicator: NoIndicator,
            encode_buf: Vec::with_capacity(frame::ENCODE_BUFFER_LEN),
            started: Instant::now(),
        };
        (writer, handle)
    }
}

impl<D: Disk, I: Indicator> StorageWriter<D, I> {
    pub fn with_indicator<J: Indicator>(self, indicator: J) -> StorageWriter<D, J> {
        StorageWriter {
            files: self.files,
            sensor: self.sensor,
            state_queue: self.state_queue,
            gps: self.gps,
            log: self.log,
            control: self.control,
            shared: self.shared,
            state: self.state,
            indicator,
            encode_buf: self.encode_buf,
            started: self.started,
        }
    }

    pub fn state(&self) -> WriterState {
        self.state
    }

    fn period(&self) -> Duration {
        Duration::from_millis(self.shared.period_ms.load(Ordering::Relaxed))
    }

    fn paused(&self) -> bool {
        self.shared.pause.load(Ordering::SeqCst) != 0
    }

    fn set_state(&mut self, state: WriterState) {
        if state != self.state {
            debug!("Writer {:?} -> {:?}", self.state, state);
        }
        self.state = state;
        *self.shared.state.lock() = state;
    }

    /// Run one transition. `Active` runs a full period.
    pub fn step(&mut self) -> WriterState {
        let next = match self.state {
            WriterState::Starting | WriterState::Reopening => {
                if self.paused() {
                    WriterState::Paused
                } else {
                    self.open()
                }
            }
            WriterState::Active => {
                if self.paused() {
                    WriterState::Draining
                } else {
                    match self.run_period() {
                        Ok(PeriodEnd::Elapsed) => WriterState::Active,
                        Ok(PeriodEnd::Shutdown) => {
                            self.teardown();
                            WriterState::Stopped
                        }
                        Err(e) => {
                            error!("Storage failed: {}", e);
                            self.teardown();
                            self.indicator.healthy(false);
                            WriterState::Failed
                        }
                    }
                }
            }
            WriterState::Draining => {
                info!("Pausing storage");
                self.teardown();
                WriterState::Paused
            }
            WriterState::Paused => {
                if !self.paused() {
                    info!("Resuming storage");
                    WriterState::Reopening
                } else {
                    self.idle(WriterState::Paused)
                }
            }
            WriterState::Failed => {
                if self.paused() {
                    WriterState::Paused
                } else {
                    self.idle(WriterState::Failed)
                }
            }
            WriterState::Stopped => WriterState::Stopped,
        };
        self.set_state(next);
        next
    }

    /// Step until shutdown; returns the final statistics.
    pub fn run(mut self) -> WriterStats {
        while self.step() != WriterState::Stopped {}
        if self.files.lock().is_mounted() {
            self.teardown();
        }
        let mut stats = self.shared.stats.lock().clone();
        stats.log_bytes_dropped = self.log.dropped();
        info!("Writer stopped after {} periods", stats.periods);
        stats
    }

    /// Run on a dedicated thread.
    pub fn spawn(self) -> Result<JoinHandle<WriterStats>>
    where
        I: 'static,
    {
        let join = thread::Builder::new()
            .name("storage-writer".into())
            .spawn(move || self.run())?;
        Ok(join)
    }

    /// Wait on the control channel for up to one period.
    fn idle(&mut self, current: WriterState) -> WriterState {
        match self.control.recv_timeout(self.period()) {
            Ok(Control::Shutdown) | Err(RecvTimeoutError::Disconnected) => WriterState::Stopped,
            Ok(Control::Wake) | Err(RecvTimeoutError::Timeout) => current,
        }
    }

    fn open(&mut self) -> WriterState {
        self.indicator.busy(true);
        let opened = self.files.lock().reopen();
        self.indicator.busy(false);
        match opened {
            Ok(key) => {
                self.shared.active.store(true, Ordering::SeqCst);
                self.shared.stats.lock().flights_opened += 1;
                info!("Recording flight {}", key);
                WriterState::Active
            }
            Err(e) => {
                error!("Opening flight files failed: {}", e);
                self.teardown();
                self.indicator.healthy(false);
                WriterState::Failed
            }
        }
    }

    fn run_period(&mut self) -> Result<PeriodEnd> {
        let deadline = Instant::now() + self.period();
        let sensor = self.sensor.receiver().clone();
        let state = self.state_queue.receiver().clone();
        let gps = self.gps.receiver().clone();
        let control = self.control.clone();

        self.indicator.busy(true);
        loop {
            let mut sel = Select::new();
            let sensor_op = sel.recv(&sensor);
            let state_op = sel.recv(&state);
            let gps_op = sel.recv(&gps);
            let control_op = sel.recv(&control);

            let Ok(op) = sel.select_deadline(deadline) else {
                break;
            };
            let index = op.index();
            if index == control_op {
                match op.recv(&control) {
                    Ok(Control::Wake) => continue,
                    Ok(Control::Shutdown) | Err(_) => {
                        self.end_period()?;
                        return Ok(PeriodEnd::Shutdown);
                    }
                }
            }

            let (stream, received) = if index == sensor_op {
                (Stream::Sensor, op.recv(&sensor))
            } else if index == state_op {
                (Stream::State, op.recv(&state))
            } else {
                debug_assert_eq!(index, gps_op);
                (Stream::Gps, op.recv(&gps))
            };
            if let Ok(frame) = received {
                self.store(stream, &frame);
            }
        }

        self.end_period()?;
        Ok(PeriodEnd::Elapsed)
    }

    fn store(&mut self, stream: Stream, payload: &[u8]) {
        self.encode_buf.clear();
        if let Err(e) = frame::encode_into(payload, &mut self.encode_buf) {
            warn!("Dropping {} frame: {}", stream, e);
            self.shared.stats.lock().dropped_frames += 1;
            return;
        }

        // Write errors surface through the flush at the period boundary.
        let written = self.files.lock().write(stream, &self.encode_buf);
        let mut stats = self.shared.stats.lock();
        match written {
            Ok(()) => {
                stats.bytes_written += self.encode_buf.len() as u64;
                match stream {
                    Stream::Sensor => stats.sensor_frames += 1,
                    Stream::State => stats.state_frames += 1,
                    Stream::Gps => stats.gps_frames += 1,
                    Stream::Log | Stream::Perf => {}
                }
            }
            Err(e) => {
                debug!("{} write failed: {}", stream, e);
                stats.write_errors += 1;
            }
        }
    }

    /// Period boundary: drain the log, flush files, report overflows.
    fn end_period(&mut self) -> Result<()> {
        self.drain_log();
        let flushed = self.files.lock().flush();
        self.indicator.healthy(flushed.is_ok());
        self.indicator.busy(false);

        let report = OverflowReport {
            sensor: self.sensor.take_overflows(),
            state: self.state_queue.take_overflows(),
            gps: self.gps.take_overflows(),
        };
        for (name, count) in [
            ("sensor", report.sensor),
            ("state", report.state),
            ("gps", report.gps),
        ] {
            if count > 0 {
                warn!("{} overflows in {} queue", count, name);
                self.log
                    .push(format!("{} overflows in {} queue\n", count, name).as_bytes());
            }
        }

        *self.shared.last_overflow.lock() = report;
        let mut stats = self.shared.stats.lock();
        stats.periods += 1;
        stats.overflows.accumulate(&report);
        flushed
    }

    fn drain_log(&mut self) {
        if self.log.is_empty() {
            return;
        }
        let bytes = self.log.drain();
        if let Err(e) = self.files.lock().write(Stream::Log, &bytes) {
            debug!("Log write failed, keeping {} bytes: {}", bytes.len(), e);
            self.log.push_front(&bytes);
        }
    }

    fn perf_summary(&self) -> String {
        let stats = self.shared.stats.lock().clone();
        format!(
            "periods {} sensor {} state {} gps {} bytes {} overflows {} write_errors {}\n",
            stats.periods,
            stats.sensor_frames,
            stats.state_frames,
            stats.gps_frames,
            stats.bytes_written,
            stats.overflows.total(),
            stats.write_errors
        )
    }

    /// Close the flight, dump statistics and release the mount.
    fn teardown(&mut self) {
        self.indicator.busy(true);
        self.drain_log();
        let uptime_ms = self.started.elapsed().as_millis() as u64;
        let summary = self.perf_summary();

        let mut files = self.files.lock();
        if let Err(e) = files.flush() {
            warn!("Final flush failed: {}", e);
        }
        if let Err(e) = files.close() {
            warn!("Closing flight files failed: {}", e);
        }
        if files.is_mounted() {
            if let Err(e) = files.dump_perf_stats(uptime_ms, &summary) {
                warn!("Perf dump failed: {}", e);
            }
        }
        if let Err(e) = files.unmount() {
            warn!("Unmount failed: {}", e);
        }
        drop(files);

        self.shared.active.store(false, Ordering::SeqCst);
        self.indicator.busy(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::NandDisk;
    use crate::flight::FlightKey;
    use crate::nand::{Geometry, SimNand};
    use crate::settings::QueueSettings;

    type Files = Arc<Mutex<FileManager<NandDisk<SimNand>>>>;

    fn setup(sensor_queue: usize) -> (StorageWriter<NandDisk<SimNand>>, WriterHandle, Files) {
        let settings = StorageSettings {
            queues: QueueSettings {
                sensor: sensor_queue,
                ..QueueSettings::default()
            },
            ..StorageSettings::default()
        };
        let disk = NandDisk::new(SimNand::new(Geometry::small(64)));
        let files = Arc::new(Mutex::new(FileManager::new(disk, &settings).unwrap()));
        let (writer, handle) =
            StorageWriter::new(Arc::clone(&files), &settings, Duration::from_millis(20));
        (writer, handle, files)
    }

    #[test]
    fn test_pause_bits() {
        assert_eq!(PauseReason::Reset.bit(), 1);
        assert_eq!(PauseReason::Safe.bit(), 2);
        assert_eq!(PauseReason::MassStorage.bit(), 4);
    }

    #[test]
    fn test_overflow_reported_at_boundary() {
        let (mut writer, handle, _files) = setup(4);
        let results: Vec<_> = (0..5u8).map(|i| handle.enqueue_sensor(vec![i])).collect();
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 4);
        assert!(matches!(results[4], Err(StorageError::Busy)));

        assert_eq!(writer.step(), WriterState::Active);
        assert_eq!(writer.step(), WriterState::Active);
        assert_eq!(handle.overflow_report().sensor, 1);
        assert_eq!(handle.stats().sensor_frames, 4);

        writer.step();
        assert_eq!(handle.overflow_report(), OverflowReport::default());
    }

    #[test]
    fn test_frames_land_in_stream_files() {
        let (mut writer, handle, files) = setup(8);
        writer.step();
        handle.enqueue_gps(b"fix".to_vec()).unwrap();
        handle.enqueue_state(b"coast".to_vec()).unwrap();
        handle.log("armed\n");
        writer.step();

        let mut files = files.lock();
        let key = files.current_flight().unwrap();
        let gps_path = files.path_of(Stream::Gps, key);
        let gps = files.read_file(&gps_path).unwrap();
        assert_eq!(&gps[crate::flight::HEADER_LEN..], b"\x03fix");
        let log_path = files.path_of(Stream::Log, key);
        let log = files.read_file(&log_path).unwrap();
        assert_eq!(&log[crate::flight::HEADER_LEN..], b"armed\n");
    }

    #[test]
    fn test_pause_drains_and_resume_opens_new_flight() {
        let (mut writer, handle, files) = setup(8);
        assert_eq!(writer.step(), WriterState::Active);
        assert!(handle.is_active());
        let first = files.lock().current_flight().unwrap();

        handle.pause_for(PauseReason::MassStorage);
        assert_eq!(writer.step(), WriterState::Draining);
        assert_eq!(writer.step(), WriterState::Paused);
        assert!(!handle.is_active());
        assert!(!files.lock().is_mounted());

        handle.resume_for(PauseReason::MassStorage);
        assert_eq!(writer.step(), WriterState::Reopening);
        assert_eq!(writer.step(), WriterState::Active);
        let second = files.lock().current_flight().unwrap();
        assert!(second > first);
        assert_eq!(second, FlightKey::Suffix(1));
    }

    #[test]
    fn test_pause_reasons_are_level_triggered() {
        let (mut writer, handle, _files) = setup(8);
        handle.pause_for(PauseReason::Safe);
        handle.pause_for(PauseReason::MassStorage);
        assert_eq!(writer.step(), WriterState::Paused);

        handle.resume_for(PauseReason::Safe);
        assert_eq!(writer.step(), WriterState::Paused);
        handle.resume_for(PauseReason::MassStorage);
        assert_eq!(writer.step(), WriterState::Reopening);
    }

    #[test]
    fn test_perf_dump_written_on_pause() {
        let (mut writer, handle, files) = setup(8);
        writer.step();
        let key = files.lock().current_flight().unwrap();
        handle.pause();
        writer.step();
        writer.step();

        let mut files = files.lock();
        files.mount().unwrap();
        let perf_path = files.path_of(Stream::Perf, key);
        let perf = files.read_file(&perf_path).unwrap();
        let text = String::from_utf8_lossy(&perf[crate::flight::HEADER_LEN..]).into_owned();
        assert!(text.contains(" ms:\n"));
        assert!(text.contains("periods"));
    }

    #[test]
    fn test_spawned_writer_shuts_down() {
        let (writer, handle, _files) = setup(8);
        let join = writer.spawn().unwrap();
        handle.enqueue_sensor(vec![1, 2, 3]).unwrap();

        let start = Instant::now();
        while handle.stats().sensor_frames == 0 && start.elapsed() < Duration::from_secs(5) {
            thread::sleep(Duration::from_millis(5));
        }
        handle.shutdown();
        let stats = join.join().unwrap();
        assert_eq!(stats.sensor_frames, 1);
        assert_eq!(handle.state(), WriterState::Stopped);
    }

    #[test]
    fn test_log_and_perf_streams_rejected_for_frames() {
        let (_writer, handle, _files) = setup(8);
        assert!(matches!(
            handle.enqueue(Stream::Log, vec![1]),
            Err(StorageError::Parameter(_))
        ));
    }
}
