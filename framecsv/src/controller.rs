//! The capture controller and processing scheduler.
//!
//! A dedicated thread sleeps between passes and drains every live thread
//! context through its processor into the stream writer. Start/stop commands
//! arrive over a channel and are acknowledged through per-command completion
//! channels, so callers may either fire-and-forget or block on the result.
//! In inline mode no thread is spawned; passes run synchronously from the
//! producer's `end_frame` call instead.

use crossbeam_channel::{bounded, select, tick, Receiver, Sender};
use parking_lot::Mutex;
use spscbuf::SpscBuffer;
use std::collections::HashMap;
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::{CompressionMode, ProfilerConfig};
use crate::processor::ThreadProcessor;
use crate::profiler::ProfilerState;
use crate::sample::{CategoryId, MarkerPhase, Timeline, TimingMarker};
use crate::writer::{StreamWriter, WriterConfig, COMMANDLINE_KEY};
use crate::{now_ns, ProfilerError};

/// One capture run's parameters.
#[derive(Debug, Clone)]
pub struct CaptureRequest {
    pub directory: PathBuf,
    /// Defaults to a timestamped name when unset.
    pub filename: Option<String>,
    /// Stop automatically once this many primary-timeline frames have
    /// elapsed.
    pub frame_limit: Option<u64>,
    /// Honored only when the configured compression mode is `AsRequested`.
    pub compress: bool,
    pub metadata: Vec<(String, String)>,
}

impl CaptureRequest {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        CaptureRequest {
            directory: directory.into(),
            filename: None,
            frame_limit: None,
            compress: false,
            metadata: Vec::new(),
        }
    }
}

/// Resolves to the output path once the capture file is fully written.
pub struct CaptureCompletion(Inner);

enum Inner {
    Ready(crate::Result<PathBuf>),
    Pending(Receiver<crate::Result<PathBuf>>),
}

impl CaptureCompletion {
    pub fn wait(self) -> crate::Result<PathBuf> {
        match self.0 {
            Inner::Ready(result) => result,
            Inner::Pending(receiver) => {
                receiver.recv().map_err(|_| ProfilerError::ControllerGone)?
            }
        }
    }
}

enum Command {
    Start(Box<CaptureRequest>, Sender<crate::Result<()>>),
    Stop(Sender<crate::Result<PathBuf>>),
}

struct CaptureSession {
    path: PathBuf,
    writer: StreamWriter<BufWriter<File>>,
    lookup: crate::boundary::FrameLookup,
    processors: HashMap<u64, ThreadProcessor>,
    frame_limit: Option<u64>,
    metadata: Vec<(String, String)>,
    last_pass_samples: usize,
    last_pass_duration: Duration,
    growth_streak: u32,
}

struct ControllerCore {
    state: Arc<ProfilerState>,
    config: ProfilerConfig,
    session: Option<CaptureSession>,
}

impl ControllerCore {
    fn start(&mut self, request: CaptureRequest) -> crate::Result<()> {
        if self.session.is_some() {
            return Err(ProfilerError::AlreadyCapturing);
        }

        let compress = match self.config.compression {
            CompressionMode::Off => false,
            CompressionMode::On => true,
            CompressionMode::AsRequested => request.compress,
        };
        let filename = request.filename.clone().unwrap_or_else(|| {
            let unix = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            let ext = if compress { "csv.zst" } else { "csv" };
            format!("Profile_{unix}.{ext}")
        });
        let path = request.directory.join(filename);

        std::fs::create_dir_all(&request.directory)?;
        let file = BufWriter::new(File::create(&path)?);
        let compression = if compress {
            framecsv_format::Compression::Zstd {
                level: self.config.compression_level,
            }
        } else {
            framecsv_format::Compression::None
        };
        let writer = StreamWriter::new(
            file,
            self.config.write_buffer_size,
            compression,
            WriterConfig {
                lookahead_frames: self.config.lookahead_frames,
                continuous: self.config.continuous_streaming,
                emit_count_stats: self.config.emit_count_stats,
                fold_worker_stats: self.config.fold_worker_stats,
                ..WriterConfig::default()
            },
        );

        // Discard anything committed between sessions: boundary inboxes and
        // per-thread buffers may hold samples from before this capture.
        let mut lookup = crate::boundary::FrameLookup::new();
        lookup.sync(&self.state.boundaries);
        lookup.clear();
        let mut scratch_markers = Vec::new();
        let mut scratch_stats = Vec::new();
        let mut scratch_events = Vec::new();
        for ctx in self.state.live_contexts() {
            ctx.markers.drain_all(&mut scratch_markers, 0);
            ctx.stats.drain_all(&mut scratch_stats, 0);
            ctx.events.drain_all(&mut scratch_events, 0);
            scratch_markers.clear();
            scratch_stats.clear();
            scratch_events.clear();
        }

        self.session = Some(CaptureSession {
            path: path.clone(),
            writer,
            lookup,
            processors: HashMap::new(),
            frame_limit: request.frame_limit,
            metadata: self.seeded_metadata(request.metadata),
            last_pass_samples: 0,
            last_pass_duration: Duration::ZERO,
            growth_streak: 0,
        });
        self.state.begin_session(compress);
        info!(path = %path.display(), frame_limit = ?request.frame_limit, "capture started");
        Ok(())
    }

    /// One processing pass. Returns true when the frame limit has been
    /// reached and the capture should stop.
    fn run_pass(&mut self) -> crate::Result<bool> {
        let Some(session) = self.session.as_mut() else {
            return Ok(false);
        };
        let started = Instant::now();

        let (samples, frontier) = drain_pass(&self.state, &self.config, session);
        if frontier != i64::MAX {
            session.writer.advance_cursor(frontier)?;
        }

        let duration = started.elapsed();
        if samples > session.last_pass_samples && duration > session.last_pass_duration {
            session.growth_streak += 1;
            if session.growth_streak >= self.config.stall_growth_passes {
                warn!(
                    samples,
                    pass_ms = duration.as_millis() as u64,
                    "processing falling behind, stalling producers"
                );
                self.state.request_stall(self.config.stall_block_passes);
                session.growth_streak = 0;
            }
        } else {
            session.growth_streak = 0;
        }
        session.last_pass_samples = samples;
        session.last_pass_duration = duration;
        self.state.complete_pass();

        Ok(matches!(session.frame_limit,
            Some(limit) if session.lookup.frame_count(Timeline::Primary) as u64 > limit))
    }

    fn stop(&mut self) -> crate::Result<PathBuf> {
        let Some(session) = self.session.take() else {
            return Err(ProfilerError::NotCapturing);
        };
        // Producers stop accepting samples first; everything committed up to
        // here is still processed and flushed.
        self.state.end_session();
        self.state.set_writing_file(true);
        let result = Self::write_out(&self.state, &self.config, session);
        self.state.set_writing_file(false);
        match &result {
            Ok(path) => info!(path = %path.display(), "capture written"),
            Err(error) => warn!(%error, "capture finalization failed"),
        }
        result
    }

    fn write_out(
        state: &ProfilerState,
        config: &ProfilerConfig,
        mut session: CaptureSession,
    ) -> crate::Result<PathBuf> {
        let (samples, _) = drain_pass(state, config, &mut session);
        debug!(samples, "final drain");
        session.lookup.clear();

        let CaptureSession {
            path,
            writer,
            metadata,
            ..
        } = session;
        let out = writer.finalize(&metadata)?;
        out.into_inner().map_err(|e| e.into_error())?;
        Ok(path)
    }

    fn seeded_metadata(&self, extra: Vec<(String, String)>) -> Vec<(String, String)> {
        let mut metadata = vec![
            ("Platform".to_string(), std::env::consts::OS.to_string()),
            (
                "BuildConfiguration".to_string(),
                if cfg!(debug_assertions) { "Debug" } else { "Release" }.to_string(),
            ),
            (
                "ProfilerVersion".to_string(),
                env!("CARGO_PKG_VERSION").to_string(),
            ),
            (
                "BufferBenchNsPerAppend".to_string(),
                append_benchmark_ns().to_string(),
            ),
        ];
        if let Some(fps) = self.config.target_framerate {
            metadata.push(("TargetFramerate".to_string(), fps.to_string()));
        }
        metadata.extend(extra);
        if !metadata.iter().any(|(k, _)| k == COMMANDLINE_KEY) {
            let commandline: Vec<String> = std::env::args().collect();
            metadata.push((COMMANDLINE_KEY.to_string(), commandline.join(" ")));
        }
        metadata
    }
}

/// Appends and attributes everything every live thread committed so far.
/// Returns the total sample count and the minimum per-thread frontier.
fn drain_pass(
    state: &ProfilerState,
    config: &ProfilerConfig,
    session: &mut CaptureSession,
) -> (usize, i64) {
    session.lookup.sync(&state.boundaries);
    let mut samples = 0;
    let mut frontier = i64::MAX;
    for ctx in state.live_contexts() {
        let processor = session
            .processors
            .entry(ctx.tid)
            .or_insert_with(|| ThreadProcessor::new(&ctx, state.render_tid()));
        let stats = processor.process(
            &ctx,
            &mut session.writer,
            &mut session.lookup,
            &state.categories,
            config.drain_slack_bytes,
        );
        samples += stats.samples;
        frontier = frontier.min(stats.frontier);
    }
    (samples, frontier)
}

/// Times raw appends into a scratch buffer; recorded as capture metadata so
/// a trace's own overhead is visible in the file.
fn append_benchmark_ns() -> u64 {
    const ROUNDS: u64 = 4096;
    let buffer: SpscBuffer<TimingMarker> = SpscBuffer::new();
    let started = now_ns();
    for i in 0..ROUNDS {
        buffer.push(TimingMarker {
            name: "BufferBench",
            category: CategoryId::DEFAULT,
            phase: MarkerPhase::Begin,
            exclusive: false,
            artificial: false,
            timestamp: i,
        });
    }
    (now_ns().saturating_sub(started)) / ROUNDS
}

enum Driver {
    Thread {
        commands: Option<Sender<Command>>,
        handle: Option<std::thread::JoinHandle<()>>,
    },
    Inline {
        core: Mutex<ControllerCore>,
    },
}

pub struct Controller {
    driver: Driver,
}

impl Controller {
    pub(crate) fn spawn(state: Arc<ProfilerState>, config: ProfilerConfig) -> crate::Result<Self> {
        let interval = Duration::from_millis(config.process_interval_ms.max(1));
        let core = ControllerCore {
            state,
            config,
            session: None,
        };
        if core.config.inline_processing {
            return Ok(Controller {
                driver: Driver::Inline {
                    core: Mutex::new(core),
                },
            });
        }
        let (commands, receiver) = bounded(16);
        let handle = std::thread::Builder::new()
            .name("framecsv-proc".to_string())
            .spawn(move || run_loop(core, receiver, interval))?;
        Ok(Controller {
            driver: Driver::Thread {
                commands: Some(commands),
                handle: Some(handle),
            },
        })
    }

    pub(crate) fn start(&self, request: CaptureRequest) -> crate::Result<()> {
        match &self.driver {
            Driver::Thread { commands, .. } => {
                let sender = commands.as_ref().ok_or(ProfilerError::ControllerGone)?;
                let (ack, ack_rx) = bounded(1);
                sender
                    .send(Command::Start(Box::new(request), ack))
                    .map_err(|_| ProfilerError::ControllerGone)?;
                ack_rx.recv().map_err(|_| ProfilerError::ControllerGone)?
            }
            Driver::Inline { core } => core.lock().start(request),
        }
    }

    pub(crate) fn stop(&self) -> crate::Result<CaptureCompletion> {
        match &self.driver {
            Driver::Thread { commands, .. } => {
                let sender = commands.as_ref().ok_or(ProfilerError::ControllerGone)?;
                let (done, done_rx) = bounded(1);
                sender
                    .send(Command::Stop(done))
                    .map_err(|_| ProfilerError::ControllerGone)?;
                Ok(CaptureCompletion(Inner::Pending(done_rx)))
            }
            Driver::Inline { core } => Ok(CaptureCompletion(Inner::Ready(core.lock().stop()))),
        }
    }

    /// Runs one pass when in inline mode; no-op when a scheduler thread is
    /// running.
    pub(crate) fn pump(&self) -> crate::Result<()> {
        let Driver::Inline { core } = &self.driver else {
            return Ok(());
        };
        let mut core = core.lock();
        if core.run_pass()? {
            let path = core.stop()?;
            info!(path = %path.display(), "frame limit reached, capture stopped");
        }
        Ok(())
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        if let Driver::Thread { commands, handle } = &mut self.driver {
            commands.take();
            if let Some(handle) = handle.take() {
                let _ = handle.join();
            }
        }
    }
}

fn run_loop(mut core: ControllerCore, commands: Receiver<Command>, interval: Duration) {
    let ticker = tick(interval);
    loop {
        select! {
            recv(commands) -> command => match command {
                Ok(Command::Start(request, ack)) => {
                    let _ = ack.send(core.start(*request));
                }
                Ok(Command::Stop(done)) => {
                    let _ = done.send(core.stop());
                }
                Err(_) => break,
            },
            recv(ticker) -> _ => match core.run_pass() {
                Ok(true) => match core.stop() {
                    Ok(path) => {
                        info!(path = %path.display(), "frame limit reached, capture stopped")
                    }
                    Err(error) => warn!(%error, "auto-stop failed"),
                },
                Ok(false) => {}
                Err(error) => warn!(%error, "processing pass failed"),
            },
        }
    }
    // Flush an active session on shutdown rather than losing it.
    if core.session.is_some() {
        if let Err(error) = core.stop() {
            warn!(%error, "failed to finalize capture during shutdown");
        }
    }
}
