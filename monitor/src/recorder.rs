use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Notify;
use tokio::time;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::channel::{Channel, ChannelHandle};
use crate::frame::pcm_to_bytes;
use crate::mixer::{Mixer, Overflow};
use crate::queue::{Direction, FrameQueue};
use crate::service::MONITOR_SERVICE;
use crate::session::{SessionState, StateCell};
use crate::wav;

// Buffered audio is flushed to disk in chunks of this many bytes.
const WRITE_CHUNK: usize = 256 * 1024;

const WORKER_TICK: Duration = Duration::from_millis(1);

/// Options for a mixed-recording session. Read and write volumes are
/// independent: recording wants asymmetric control over "what they
/// hear" versus "what they say".
#[derive(Debug, Clone, Default)]
pub struct RecorderOptions {
    pub bridged_only: bool,
    pub append: bool,
    pub read_volume: i8,
    pub write_volume: i8,
    pub overflow: Overflow,
    pub post_command: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SinkFormat {
    Wav,
    Raw,
}

impl SinkFormat {
    fn from_ext(ext: &str) -> Option<SinkFormat> {
        match ext {
            "wav" => Some(SinkFormat::Wav),
            "sln" | "raw" | "pcm" => Some(SinkFormat::Raw),
            _ => None,
        }
    }
}

/// Mixed recording of a target channel's two directions, driven by an
/// owned worker task polling on a short fixed cadence.
///
/// The worker is the only component here allowed to wait; it parks on
/// its ticker and a stop notification instead of spinning.
pub struct RecorderSession {
    pub id: Uuid,
    target_name: String,
    target: ChannelHandle,
    queue: Arc<FrameQueue>,
    state: StateCell,
    stop_requested: AtomicBool,
    finished: AtomicBool,
    notify: Notify,
    path: PathBuf,
}

impl RecorderSession {
    /// Attach to `target` and start the recording worker.
    ///
    /// An empty `filename` records under the default basename in the
    /// configured spool directory; relative names land there too. The
    /// extension picks the sink format (`wav`, or `sln`/`raw`/`pcm`
    /// for headerless PCM); a missing extension means WAV.
    pub fn start(
        target: &Channel,
        filename: &str,
        opts: RecorderOptions,
    ) -> Result<Arc<RecorderSession>> {
        if target.is_hungup() {
            return Err(anyhow!("channel {} is gone", target.name()));
        }
        let (path, format) = resolve_sink(filename)?;

        let queue = Arc::new(FrameQueue::new());
        let session = Arc::new(RecorderSession {
            id: Uuid::new_v4(),
            target_name: target.name().to_string(),
            target: target.handle(),
            queue: queue.clone(),
            state: StateCell::new(),
            stop_requested: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            notify: Notify::new(),
            path,
        });

        target.attach(&queue);
        session.state.mark_running();
        info!(
            channel = target.name(),
            path = session.path.display().to_string(),
            "recorder session started"
        );

        let worker = session.clone();
        tokio::spawn(async move {
            worker.run(opts, format).await;
        });
        Ok(session)
    }

    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    pub fn target_name(&self) -> &str {
        &self.target_name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Ask the worker to stop and wake it immediately.
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// Bounded wait for the worker to exit after a stop request. Used
    /// by the administrative surface; gives up rather than blocking
    /// forever on a session another thread is tearing down.
    pub async fn wait_stopped(&self) -> bool {
        let config = &MONITOR_SERVICE.config;
        for _ in 0..config.stop_retries {
            if self.is_finished() {
                return true;
            }
            time::sleep(Duration::from_millis(config.stop_retry_ms)).await;
        }
        self.is_finished()
    }

    async fn run(self: Arc<Self>, opts: RecorderOptions, format: SinkFormat) {
        if let Err(e) = self.record(&opts, format).await {
            error!(
                channel = self.target_name.as_str(),
                "recorder error: {e}"
            );
        }
        self.teardown();
        self.finished.store(true, Ordering::SeqCst);
    }

    async fn record(&self, opts: &RecorderOptions, format: SinkFormat) -> Result<()> {
        let config = &MONITOR_SERVICE.config;
        let tick_samples = config.tick_samples();

        let mut mixer = Mixer::new(opts.overflow);
        mixer.set_volume(Direction::Read, opts.read_volume);
        mixer.set_volume(Direction::Write, opts.write_volume);

        let (mut file, mut samples) = match format {
            SinkFormat::Wav => open_wav(&self.path, opts.append, config.sample_rate).await?,
            SinkFormat::Raw => open_raw(&self.path, opts.append).await?,
        };

        let mut buf: Vec<u8> = Vec::new();
        let mut ticker = time::interval(WORKER_TICK);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.notify.notified() => {}
            }
            if self.stop_requested.load(Ordering::SeqCst) || !self.queue.is_running() {
                break;
            }
            if !self.gate_open(opts) {
                if self.target.upgrade().is_none() {
                    break;
                }
                // only active call segments are wanted; what arrived
                // while unbridged is discarded, not buffered
                self.queue.drain(Direction::Read);
                self.queue.drain(Direction::Write);
                continue;
            }

            mixer.drain_queue(&self.queue);
            while let Some(pcm) = mixer.tick(tick_samples) {
                samples += pcm.len() as u64;
                buf.extend_from_slice(&pcm_to_bytes(&pcm));
            }
            if buf.len() >= WRITE_CHUNK {
                file.write_all(&buf).await?;
                buf.clear();
            }
        }

        // frames that arrived since the last interval
        if self.gate_open(opts) {
            mixer.drain_queue(&self.queue);
            while let Some(pcm) = mixer.tick(tick_samples) {
                samples += pcm.len() as u64;
                buf.extend_from_slice(&pcm_to_bytes(&pcm));
            }
        }
        if !buf.is_empty() {
            file.write_all(&buf).await?;
        }
        if format == SinkFormat::Wav {
            let size = (samples * 2) as u32;
            file.seek(SeekFrom::Start(wav::RIFF_SIZE_OFFSET)).await?;
            file.write_u32_le(size + 36).await?;
            file.seek(SeekFrom::Start(wav::DATA_SIZE_OFFSET)).await?;
            file.write_u32_le(size).await?;
        }
        file.flush().await?;

        if let Some(command) = opts.post_command.as_ref() {
            self.run_post_command(command).await;
        }
        Ok(())
    }

    /// Whether mixing should emit right now. Without `bridged_only`
    /// the gate is always open while the target exists; with it, only
    /// while the target is bridged to a peer.
    fn gate_open(&self, opts: &RecorderOptions) -> bool {
        match self.target.upgrade() {
            Some(target) => {
                if target.is_hungup() {
                    false
                } else {
                    !opts.bridged_only || target.is_bridged()
                }
            }
            None => false,
        }
    }

    fn teardown(&self) {
        self.state.mark_done();
        if self.queue.is_running() {
            if let Some(target) = self.target.upgrade() {
                target.detach(&self.queue);
            }
        }
        self.queue.mark_done();
        info!(
            channel = self.target_name.as_str(),
            session = self.id.to_string(),
            "recorder session stopped"
        );
    }

    async fn run_post_command(&self, command: &str) {
        let filename = self.path.display().to_string();
        let mut parts = command
            .split_whitespace()
            .map(|part| part.replace("%f", &filename));
        let Some(program) = parts.next() else {
            return;
        };
        let args: Vec<String> = parts.collect();
        match tokio::process::Command::new(&program)
            .args(&args)
            .output()
            .await
        {
            Ok(output) if !output.status.success() => {
                warn!(
                    command = program.as_str(),
                    "post-process command failed: {}",
                    String::from_utf8_lossy(&output.stderr)
                );
            }
            Ok(_) => {}
            Err(e) => {
                warn!(
                    command = program.as_str(),
                    "post-process command could not run: {e}"
                );
            }
        }
    }
}

fn resolve_sink(filename: &str) -> Result<(PathBuf, SinkFormat)> {
    let config = &MONITOR_SERVICE.config;
    if filename.is_empty() {
        return Ok((config.record_path("muxmon", "wav"), SinkFormat::Wav));
    }
    let path = PathBuf::from(filename);
    let path = if path.is_absolute() {
        path
    } else {
        config.record_dir.join(path)
    };
    match path.extension().and_then(|ext| ext.to_str()) {
        None => Ok((path.with_extension("wav"), SinkFormat::Wav)),
        Some(ext) => match SinkFormat::from_ext(ext) {
            Some(format) => Ok((path, format)),
            None => Err(anyhow!("unsupported recording format {ext}")),
        },
    }
}

/// Open a WAV sink. Appending resumes the sample counter from the
/// existing data chunk so the finalize patch covers the whole file;
/// anything unreadable is started fresh.
async fn open_wav(path: &Path, append: bool, sample_rate: u32) -> Result<(fs::File, u64)> {
    let mut file = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)
        .await?;
    if append {
        let mut buf = [0u8; wav::HEADER_LEN];
        if file.read_exact(&mut buf).await.is_ok() {
            if let Ok(info) = wav::parse_header(&buf) {
                file.seek(SeekFrom::End(0)).await?;
                return Ok((file, (info.data_len / 2) as u64));
            }
        }
    }
    file.set_len(0).await?;
    file.seek(SeekFrom::Start(0)).await?;
    file.write_all(&wav::header(sample_rate, 0)?).await?;
    Ok((file, 0))
}

async fn open_raw(path: &Path, append: bool) -> Result<(fs::File, u64)> {
    let mut open = fs::OpenOptions::new();
    open.write(true).create(true);
    if append {
        open.append(true);
    } else {
        open.truncate(true);
    }
    Ok((open.open(path).await?, 0))
}
