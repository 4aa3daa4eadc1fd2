use std::io::{Seek, SeekFrom, Write};
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI8, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use byteorder::{LittleEndian, WriteBytesExt};
use chrono::Utc;
use parking_lot::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::channel::{Channel, ChannelHandle, Generator};
use crate::frame::pcm_to_bytes;
use crate::mixer::{cycle_volume, Mixer, Overflow};
use crate::queue::FrameQueue;
use crate::service::MONITOR_SERVICE;
use crate::session::{SessionState, StateCell};
use crate::tone;
use crate::wav;

/// Options for a live spy session. The volume factor is shared by both
/// observed directions.
#[derive(Debug, Clone, Default)]
pub struct SpyOptions {
    pub quiet: bool,
    pub volume: i8,
    pub group: Option<String>,
    pub record: Option<String>,
    pub overflow: Overflow,
}

/// What the dialplan layer should do after a DTMF digit was consumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpyControl {
    /// Digit consumed, keep listening.
    Continue,
    /// Volume factor cycled to the contained value.
    Volume(i8),
    /// Session stopped; the caller picks the next matching channel.
    Stop,
    /// Stop and jump to the channel whose name ends in this suffix.
    Jump(String),
}

/// Live audio spy: taps a target channel's two directions, mixes them
/// each generator tick, and plays the result into the spying channel.
///
/// Lifecycle is Init -> Running -> Done; a done session is torn down
/// and discarded, never reused.
pub struct SpySession {
    pub id: Uuid,
    target_name: String,
    target: ChannelHandle,
    spyer: ChannelHandle,
    queue: Arc<FrameQueue>,
    mixer: Mutex<Mixer>,
    state: StateCell,
    torn_down: AtomicBool,
    volume: AtomicI8,
    digits: Mutex<String>,
    record: Mutex<Option<SideRecorder>>,
}

impl SpySession {
    /// Attach to `target` and start playing its mixed audio into
    /// `spyer`.
    ///
    /// Fails when the target is gone, when the group filter does not
    /// match, or when the spying channel is already spying (a channel
    /// being used to listen may not itself be listened through).
    pub fn start(target: &Channel, spyer: &Channel, opts: SpyOptions) -> Result<Arc<SpySession>> {
        if target.is_hungup() {
            return Err(anyhow!("channel {} is gone", target.name()));
        }
        if let Some(group) = opts.group.as_ref() {
            if target.group().as_deref() != Some(group.as_str()) {
                return Err(anyhow!(
                    "channel {} is not in group {}",
                    target.name(),
                    group
                ));
            }
        }
        if !spyer.try_begin_spy() {
            return Err(anyhow!("channel {} is already spying", spyer.name()));
        }

        match Self::activate(target, spyer, opts) {
            Ok(session) => Ok(session),
            Err(e) => {
                spyer.end_spy();
                Err(e)
            }
        }
    }

    fn activate(target: &Channel, spyer: &Channel, opts: SpyOptions) -> Result<Arc<SpySession>> {
        let config = &MONITOR_SERVICE.config;

        let record = match opts.record.as_ref() {
            Some(basename) => Some(SideRecorder::create(
                side_channel_path(basename),
                config.sample_rate,
            )?),
            None => None,
        };

        // hardware gain costs nothing and cannot clip, so it always
        // wins over software scaling when the driver offers it
        let hardware = spyer.try_set_gain(opts.volume);
        let mut mixer = Mixer::new(opts.overflow);
        if !hardware {
            mixer.set_volume_all(opts.volume);
        }

        let queue = Arc::new(FrameQueue::new());
        let session = Arc::new(SpySession {
            id: Uuid::new_v4(),
            target_name: target.name().to_string(),
            target: target.handle(),
            spyer: spyer.handle(),
            queue: queue.clone(),
            mixer: Mutex::new(mixer),
            state: StateCell::new(),
            torn_down: AtomicBool::new(false),
            volume: AtomicI8::new(opts.volume),
            digits: Mutex::new(String::new()),
            record: Mutex::new(record),
        });

        target.attach(&queue);
        target.request_unbridge();

        if !opts.quiet {
            let _ = spyer.write_audio(tone::beep(config.sample_rate));
        }

        if let Err(e) = spyer.activate_generator(Box::new(SpyGenerator {
            session: session.clone(),
        })) {
            target.detach(&queue);
            return Err(e);
        }

        session.state.mark_running();
        info!(
            target = target.name(),
            spyer = spyer.name(),
            session = session.id.to_string(),
            "spy session started"
        );
        Ok(session)
    }

    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    pub fn target_name(&self) -> &str {
        &self.target_name
    }

    pub fn volume(&self) -> i8 {
        self.volume.load(Ordering::SeqCst)
    }

    /// Path of the recording side-channel, when one was opened.
    pub fn record_path(&self) -> Option<PathBuf> {
        self.record.lock().as_ref().map(|record| record.path.clone())
    }

    /// One mixing tick, invoked through the spying channel's generator.
    ///
    /// `None` means "nothing ready this tick" and never blocks; the
    /// session never waits inside the channel's I/O cycle.
    pub fn on_tick(&self, samples: usize) -> Option<Vec<i16>> {
        if self.state.get() != SessionState::Running {
            return None;
        }
        if !self.queue.is_running() {
            // target torn down elsewhere; teardown happens on release
            self.state.mark_done();
            return None;
        }

        let pcm = {
            let mut mixer = self.mixer.lock();
            mixer.drain_queue(&self.queue);
            mixer.tick(samples)?
        };

        if let Some(record) = self.record.lock().as_mut() {
            if let Err(e) = record.write(&pcm) {
                error!(
                    target = self.target_name.as_str(),
                    "spy recording write failed: {e}"
                );
                self.state.mark_done();
                return None;
            }
        }
        Some(pcm)
    }

    /// Consume one DTMF digit from the spying user's keypad.
    pub fn handle_dtmf(&self, digit: char) -> SpyControl {
        match digit {
            '*' => {
                self.stop();
                SpyControl::Stop
            }
            '#' => {
                let suffix = mem::take(&mut *self.digits.lock());
                if suffix.is_empty() {
                    SpyControl::Volume(self.adjust_volume(1))
                } else {
                    SpyControl::Jump(suffix)
                }
            }
            digit if digit.is_ascii_digit() => {
                self.digits.lock().push(digit);
                SpyControl::Continue
            }
            _ => SpyControl::Continue,
        }
    }

    /// Step the volume factor, wrapping through [-4, 4]. Hardware gain
    /// first; software scaling only when the driver declines.
    pub fn adjust_volume(&self, delta: i8) -> i8 {
        let factor = cycle_volume(self.volume.load(Ordering::SeqCst), delta);
        self.volume.store(factor, Ordering::SeqCst);

        let hardware = self
            .spyer
            .upgrade()
            .map(|spyer| spyer.try_set_gain(factor))
            .unwrap_or(false);
        let mut mixer = self.mixer.lock();
        if hardware {
            mixer.set_volume_all(0);
        } else {
            mixer.set_volume_all(factor);
        }
        factor
    }

    /// Idempotent teardown, safe from any state.
    ///
    /// The target is only touched while its queue is still running and
    /// the handle still resolves; once the queue is done the target may
    /// be gone and is left alone.
    pub fn stop(&self) {
        self.state.mark_done();
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }

        if self.queue.is_running() {
            if let Some(target) = self.target.upgrade() {
                target.detach(&self.queue);
            }
        }
        self.queue.mark_done();

        if let Some(spyer) = self.spyer.upgrade() {
            spyer.end_spy();
            spyer.deactivate_generator();
        }

        if let Some(mut record) = self.record.lock().take() {
            if let Err(e) = record.finalize() {
                warn!(
                    target = self.target_name.as_str(),
                    "spy recording finalize failed: {e}"
                );
            }
        }

        info!(
            target = self.target_name.as_str(),
            session = self.id.to_string(),
            "spy session stopped"
        );
    }
}

/// Spy-backed generator capability installed on the spying channel.
struct SpyGenerator {
    session: Arc<SpySession>,
}

impl Generator for SpyGenerator {
    fn alloc(&mut self) -> Result<()> {
        Ok(())
    }

    fn generate(&mut self, samples: usize) -> Result<Option<Vec<i16>>> {
        if self.session.state.get() == SessionState::Done {
            return Err(anyhow!("spy session ended"));
        }
        Ok(self.session.on_tick(samples))
    }

    fn release(&mut self) {
        self.session.stop();
    }
}

/// Recording side-channel: a synchronous WAV sink fed from inside the
/// mixing tick, finalized on stop.
struct SideRecorder {
    file: std::fs::File,
    path: PathBuf,
    samples: u32,
}

impl SideRecorder {
    fn create(path: PathBuf, sample_rate: u32) -> Result<SideRecorder> {
        let mut file = std::fs::File::create(&path)?;
        file.write_all(&wav::header(sample_rate, 0)?)?;
        Ok(SideRecorder {
            file,
            path,
            samples: 0,
        })
    }

    fn write(&mut self, pcm: &[i16]) -> Result<()> {
        self.file.write_all(&pcm_to_bytes(pcm))?;
        self.samples += pcm.len() as u32;
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        let size = self.samples * 2;
        self.file.seek(SeekFrom::Start(wav::RIFF_SIZE_OFFSET))?;
        self.file.write_u32::<LittleEndian>(size + 36)?;
        self.file.seek(SeekFrom::Start(wav::DATA_SIZE_OFFSET))?;
        self.file.write_u32::<LittleEndian>(size)?;
        self.file.flush()?;
        Ok(())
    }
}

fn side_channel_path(basename: &str) -> PathBuf {
    let timestamp = Utc::now().timestamp();
    let base = Path::new(basename);
    if base.is_absolute() {
        PathBuf::from(format!("{}.{}.wav", basename, timestamp))
    } else {
        MONITOR_SERVICE.config.record_path(basename, "wav")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::AudioFrame;
    use crate::queue::Direction;

    fn quiet_opts() -> SpyOptions {
        SpyOptions {
            quiet: true,
            ..SpyOptions::default()
        }
    }

    fn push_both(target: &Channel, read: i16, write: i16) {
        target.push_frame(Direction::Read, &AudioFrame::slin(&[read; 160]));
        target.push_frame(Direction::Write, &AudioFrame::slin(&[write; 160]));
    }

    #[test]
    fn test_live_spy_mixes_both_directions() {
        let target = Channel::new("SIP/alice-0001");
        let spyer = Channel::new("SIP/super-0001");
        let session = SpySession::start(&target, &spyer, quiet_opts()).unwrap();
        assert_eq!(session.state(), SessionState::Running);

        push_both(&target, 100, 50);
        spyer.generator_tick(160);
        let heard = spyer.audio_receiver().try_recv().unwrap();
        assert_eq!(heard, vec![150i16; 160]);
        session.stop();
    }

    #[test]
    fn test_announce_beep_unless_quiet() {
        let target = Channel::new("SIP/alice-0001");
        let spyer = Channel::new("SIP/super-0001");
        let session = SpySession::start(&target, &spyer, SpyOptions::default()).unwrap();

        // the beep is queued on the sink before any mixed audio
        let first = spyer.audio_receiver().try_recv().unwrap();
        assert_eq!(first.len(), 8 * 60);
        assert!(first.iter().any(|v| *v != 0));
        session.stop();
    }

    #[test]
    fn test_one_sided_tick_not_ready() {
        let target = Channel::new("SIP/alice-0001");
        let spyer = Channel::new("SIP/super-0001");
        let session = SpySession::start(&target, &spyer, quiet_opts()).unwrap();

        target.push_frame(Direction::Read, &AudioFrame::slin(&[1000i16; 160]));
        spyer.generator_tick(160);
        assert!(spyer.audio_receiver().try_recv().is_err());
        assert_eq!(session.state(), SessionState::Running);
        session.stop();
    }

    #[test]
    fn test_stop_restores_channels() {
        let target = Channel::new("SIP/alice-0001");
        let spyer = Channel::new("SIP/super-0001");
        let session = SpySession::start(&target, &spyer, quiet_opts()).unwrap();
        assert_eq!(target.attached_queues().len(), 1);

        session.stop();
        session.stop();
        assert_eq!(session.state(), SessionState::Done);
        assert!(target.attached_queues().is_empty());
        assert!(!spyer.has_generator());
        assert!(spyer.try_begin_spy());
    }

    #[test]
    fn test_torn_down_target_is_not_touched() {
        let target = Channel::new("SIP/alice-0001");
        let spyer = Channel::new("SIP/super-0001");
        let session = SpySession::start(&target, &spyer, quiet_opts()).unwrap();

        // simulate concurrent teardown right after attach
        target.attached_queues()[0].mark_done();
        spyer.generator_tick(160);
        session.stop();
        assert_eq!(session.state(), SessionState::Done);

        // and the harder case: the target object itself is gone
        let target = Channel::new("SIP/carol-0001");
        let spyer = Channel::new("SIP/super-0002");
        let session = SpySession::start(&target, &spyer, quiet_opts()).unwrap();
        drop(target);
        session.stop();
        assert_eq!(session.state(), SessionState::Done);
    }

    #[test]
    fn test_target_hangup_ends_session() {
        let target = Channel::new("SIP/alice-0001");
        let spyer = Channel::new("SIP/super-0001");
        let session = SpySession::start(&target, &spyer, quiet_opts()).unwrap();

        target.hangup();
        // first tick observes the done queue, second releases the
        // finished generator
        spyer.generator_tick(160);
        spyer.generator_tick(160);
        assert_eq!(session.state(), SessionState::Done);
        assert!(!spyer.has_generator());
    }

    #[test]
    fn test_dtmf_protocol() {
        let target = Channel::new("SIP/alice-0001");
        let spyer = Channel::new("SIP/super-0001");
        let session = SpySession::start(&target, &spyer, quiet_opts()).unwrap();

        assert_eq!(session.handle_dtmf('#'), SpyControl::Volume(1));
        assert_eq!(session.handle_dtmf('5'), SpyControl::Continue);
        assert_eq!(session.handle_dtmf('3'), SpyControl::Continue);
        assert_eq!(
            session.handle_dtmf('#'),
            SpyControl::Jump("53".to_string())
        );
        assert_eq!(session.handle_dtmf('*'), SpyControl::Stop);
        assert_eq!(session.state(), SessionState::Done);
    }

    #[test]
    fn test_volume_cycles_through_range() {
        let target = Channel::new("SIP/alice-0001");
        let spyer = Channel::new("SIP/super-0001");
        let session = SpySession::start(&target, &spyer, quiet_opts()).unwrap();

        for expected in [1, 2, 3, 4, -4, -3] {
            assert_eq!(session.adjust_volume(1), expected);
        }
        session.stop();
    }

    #[test]
    fn test_hardware_gain_preferred() {
        let target = Channel::new("SIP/alice-0001");
        let spyer = Channel::with_hardware_gain("Zap/1-1");
        let opts = SpyOptions {
            quiet: true,
            volume: 2,
            ..SpyOptions::default()
        };
        let session = SpySession::start(&target, &spyer, opts).unwrap();

        // driver took the gain; samples must pass through unscaled
        assert_eq!(spyer.gain(), 2);
        push_both(&target, 100, 50);
        spyer.generator_tick(160);
        assert_eq!(
            spyer.audio_receiver().try_recv().unwrap(),
            vec![150i16; 160]
        );
        session.stop();
    }

    #[test]
    fn test_software_volume_fallback() {
        let target = Channel::new("SIP/alice-0001");
        let spyer = Channel::new("SIP/super-0001");
        let opts = SpyOptions {
            quiet: true,
            volume: 1,
            ..SpyOptions::default()
        };
        let session = SpySession::start(&target, &spyer, opts).unwrap();

        push_both(&target, 100, 50);
        spyer.generator_tick(160);
        assert_eq!(
            spyer.audio_receiver().try_recv().unwrap(),
            vec![300i16; 160]
        );
        session.stop();
    }

    #[test]
    fn test_spyer_reentrancy_guard() {
        let target = Channel::new("SIP/alice-0001");
        let other = Channel::new("SIP/bob-0001");
        let spyer = Channel::new("SIP/super-0001");

        let session = SpySession::start(&target, &spyer, quiet_opts()).unwrap();
        assert!(SpySession::start(&other, &spyer, quiet_opts()).is_err());
        session.stop();
        assert!(other.attached_queues().is_empty());
    }

    #[test]
    fn test_group_filter() {
        let target = Channel::new("SIP/alice-0001");
        target.set_group("sales");
        let spyer = Channel::new("SIP/super-0001");

        let opts = SpyOptions {
            quiet: true,
            group: Some("support".to_string()),
            ..SpyOptions::default()
        };
        assert!(SpySession::start(&target, &spyer, opts).is_err());
        assert!(spyer.try_begin_spy());
        spyer.end_spy();

        let opts = SpyOptions {
            quiet: true,
            group: Some("sales".to_string()),
            ..SpyOptions::default()
        };
        let session = SpySession::start(&target, &spyer, opts).unwrap();
        session.stop();
    }

    #[test]
    fn test_soft_unbridge_signal() {
        let target = Channel::new("SIP/alice-0001");
        let peer = Channel::new("SIP/bob-0001");
        target.set_bridge(&peer);
        let spyer = Channel::new("SIP/super-0001");

        let session = SpySession::start(&target, &spyer, quiet_opts()).unwrap();
        assert!(peer.unbridge_requested());
        session.stop();
    }

    #[test]
    fn test_write_failure_ends_session() {
        let target = Channel::new("SIP/alice-0001");
        let spyer = Channel::new("SIP/super-0001");
        let session = SpySession::start(&target, &spyer, quiet_opts()).unwrap();

        // jam the sink so the generated frame has nowhere to go
        while spyer.write_audio(vec![0i16; 1]).is_ok() {}
        push_both(&target, 100, 50);
        spyer.generator_tick(160);
        assert_eq!(session.state(), SessionState::Done);
        assert!(!spyer.has_generator());
    }

    #[test]
    fn test_recording_side_channel() {
        let target = Channel::new("SIP/alice-0001");
        let spyer = Channel::new("SIP/super-0001");
        let base = std::env::temp_dir().join(format!("spyrec-{}", Uuid::new_v4()));
        let opts = SpyOptions {
            quiet: true,
            record: Some(base.to_string_lossy().to_string()),
            ..SpyOptions::default()
        };
        let session = SpySession::start(&target, &spyer, opts).unwrap();
        let path = session.record_path().unwrap();

        push_both(&target, 100, 50);
        spyer.generator_tick(160);
        session.stop();

        let bytes = std::fs::read(&path).unwrap();
        let info = wav::parse_header(&bytes).unwrap();
        assert_eq!(info.data_len, 320);
        assert_eq!(
            crate::frame::bytes_to_pcm(&bytes[wav::HEADER_LEN..]),
            vec![150i16; 160]
        );
        std::fs::remove_file(&path).ok();
    }
}
