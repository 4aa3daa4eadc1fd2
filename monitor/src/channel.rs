use std::mem;
use std::sync::atomic::{AtomicBool, AtomicI8, Ordering};
use std::sync::{Arc, Weak};

use anyhow::{anyhow, Result};
use async_channel::{Receiver, Sender};
use parking_lot::Mutex;
use tracing::info;

use crate::frame::AudioFrame;
use crate::queue::{Direction, FrameQueue};

const AUDIO_SINK_DEPTH: usize = 1000;

/// Audio-producing capability installed on a channel: the channel's
/// I/O cycle calls `generate` once per tick and writes whatever comes
/// back to the channel's audio sink.
///
/// `generate` answers `Ok(None)` for "nothing this tick, try again"
/// and `Err` when the source is finished, after which the channel takes
/// the generator out and calls `release` exactly once.
pub trait Generator: Send {
    fn alloc(&mut self) -> Result<()>;
    fn generate(&mut self, samples: usize) -> Result<Option<Vec<i16>>>;
    fn release(&mut self);
}

struct ChannelInner {
    name: String,
    group: Mutex<Option<String>>,
    /// Attached monitor queues in insertion order. Weakly held: the
    /// channel observes them, the sessions own them.
    spies: Mutex<Vec<Weak<FrameQueue>>>,
    bridge_peer: Mutex<Option<Weak<ChannelInner>>>,
    generator: Mutex<Option<Box<dyn Generator>>>,
    hungup: AtomicBool,
    spying: AtomicBool,
    unbridge_requested: AtomicBool,
    supports_gain: bool,
    gain: AtomicI8,
    audio_tx: Sender<Vec<i16>>,
    audio_rx: Receiver<Vec<i16>>,
}

/// Engine-owned call channel, seen by this module set as an opaque
/// handle with a small operation surface. Cloning shares the channel.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

/// Checked weak reference to a channel. Sessions borrow channels, they
/// never own them; once the engine drops a channel every handle stops
/// resolving and the holder must walk away.
#[derive(Clone)]
pub struct ChannelHandle {
    inner: Weak<ChannelInner>,
}

impl ChannelHandle {
    pub fn upgrade(&self) -> Option<Channel> {
        self.inner.upgrade().map(|inner| Channel { inner })
    }
}

impl Channel {
    pub fn new(name: &str) -> Channel {
        Self::build(name, false)
    }

    /// Channel whose driver exposes a hardware gain control.
    pub fn with_hardware_gain(name: &str) -> Channel {
        Self::build(name, true)
    }

    fn build(name: &str, supports_gain: bool) -> Channel {
        let (audio_tx, audio_rx) = async_channel::bounded(AUDIO_SINK_DEPTH);
        Channel {
            inner: Arc::new(ChannelInner {
                name: name.to_string(),
                group: Mutex::new(None),
                spies: Mutex::new(Vec::new()),
                bridge_peer: Mutex::new(None),
                generator: Mutex::new(None),
                hungup: AtomicBool::new(false),
                spying: AtomicBool::new(false),
                unbridge_requested: AtomicBool::new(false),
                supports_gain,
                gain: AtomicI8::new(0),
                audio_tx,
                audio_rx,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn handle(&self) -> ChannelHandle {
        ChannelHandle {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn set_group(&self, group: &str) {
        *self.inner.group.lock() = Some(group.to_string());
    }

    pub fn group(&self) -> Option<String> {
        self.inner.group.lock().clone()
    }

    /// Append a queue to the attachment list. The caller must only
    /// attach a running queue.
    pub fn attach(&self, queue: &Arc<FrameQueue>) {
        self.inner.spies.lock().push(Arc::downgrade(queue));
    }

    /// Unlink a queue, preserving the order of the remaining entries.
    ///
    /// No-op once the queue is done: a done queue means this channel
    /// may already be torn down elsewhere, so nobody gets to touch it.
    pub fn detach(&self, queue: &Arc<FrameQueue>) {
        if !queue.is_running() {
            return;
        }
        self.inner.spies.lock().retain(|attached| {
            attached
                .upgrade()
                .map(|attached| !Arc::ptr_eq(&attached, queue))
                .unwrap_or(false)
        });
    }

    /// Producer entry point: fan one direction's frame out to every
    /// live attached queue. Dead entries are pruned in passing.
    pub fn push_frame(&self, direction: Direction, frame: &AudioFrame) {
        self.inner.spies.lock().retain(|attached| match attached.upgrade() {
            Some(queue) => {
                queue.push(direction, frame.clone());
                true
            }
            None => false,
        });
    }

    /// Live attached queues in insertion order.
    pub fn attached_queues(&self) -> Vec<Arc<FrameQueue>> {
        self.inner
            .spies
            .lock()
            .iter()
            .filter_map(|queue| queue.upgrade())
            .collect()
    }

    pub fn is_hungup(&self) -> bool {
        self.inner.hungup.load(Ordering::SeqCst)
    }

    /// Tear the channel down. Every attached queue is flipped to done
    /// so its session stops touching this channel, and the audio sink
    /// closes.
    pub fn hangup(&self) {
        if self.inner.hungup.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(channel = self.inner.name.as_str(), "hangup");
        let spies = mem::take(&mut *self.inner.spies.lock());
        for queue in spies {
            if let Some(queue) = queue.upgrade() {
                queue.mark_done();
            }
        }
        self.unbridge();
        self.inner.audio_tx.close();
        self.deactivate_generator();
    }

    /// Connect this channel's audio directly to a peer's.
    pub fn set_bridge(&self, peer: &Channel) {
        *self.inner.bridge_peer.lock() = Some(Arc::downgrade(&peer.inner));
        *peer.inner.bridge_peer.lock() = Some(Arc::downgrade(&self.inner));
    }

    pub fn is_bridged(&self) -> bool {
        self.inner
            .bridge_peer
            .lock()
            .as_ref()
            .map(|peer| peer.upgrade().is_some())
            .unwrap_or(false)
    }

    pub fn unbridge(&self) {
        let peer = self.inner.bridge_peer.lock().take();
        if let Some(peer) = peer.and_then(|peer| peer.upgrade()) {
            let mut back = peer.bridge_peer.lock();
            if back
                .as_ref()
                .map(|back| back.as_ptr() == Arc::as_ptr(&self.inner))
                .unwrap_or(false)
            {
                *back = None;
            }
        }
    }

    /// Ask this channel's bridge peer to fall back to engine-routed
    /// audio, so frames pass through this channel where a spy point can
    /// observe them. The engine acts on the flag; the bridge itself is
    /// untouched here.
    pub fn request_unbridge(&self) {
        let peer = self.inner.bridge_peer.lock().clone();
        if let Some(peer) = peer.and_then(|peer| peer.upgrade()) {
            peer.unbridge_requested.store(true, Ordering::SeqCst);
        }
    }

    pub fn unbridge_requested(&self) -> bool {
        self.inner.unbridge_requested.load(Ordering::SeqCst)
    }

    /// Re-entrancy guard: a channel that is spying may not itself be
    /// used to start another spy.
    pub fn try_begin_spy(&self) -> bool {
        !self.inner.spying.swap(true, Ordering::SeqCst)
    }

    pub fn end_spy(&self) {
        self.inner.spying.store(false, Ordering::SeqCst);
    }

    /// Push a volume factor down to the channel driver. Returns false
    /// when the driver has no gain control and the caller must scale in
    /// software instead.
    pub fn try_set_gain(&self, factor: i8) -> bool {
        if !self.inner.supports_gain {
            return false;
        }
        self.inner.gain.store(factor, Ordering::SeqCst);
        true
    }

    pub fn gain(&self) -> i8 {
        self.inner.gain.load(Ordering::SeqCst)
    }

    /// Queue one PCM frame on the channel's audio sink.
    pub fn write_audio(&self, pcm: Vec<i16>) -> Result<()> {
        if self.is_hungup() {
            return Err(anyhow!("channel {} is gone", self.inner.name));
        }
        self.inner
            .audio_tx
            .try_send(pcm)
            .map_err(|_| anyhow!("channel {} audio sink unavailable", self.inner.name))
    }

    /// Engine-side end of the audio sink.
    pub fn audio_receiver(&self) -> Receiver<Vec<i16>> {
        self.inner.audio_rx.clone()
    }

    /// Install an audio generator, releasing any previous one.
    pub fn activate_generator(&self, mut generator: Box<dyn Generator>) -> Result<()> {
        generator.alloc()?;
        let previous = self.inner.generator.lock().replace(generator);
        if let Some(mut previous) = previous {
            previous.release();
        }
        Ok(())
    }

    /// Take the generator out and release it. Safe to call with none
    /// installed.
    pub fn deactivate_generator(&self) {
        let generator = self.inner.generator.lock().take();
        if let Some(mut generator) = generator {
            generator.release();
        }
    }

    pub fn has_generator(&self) -> bool {
        self.inner.generator.lock().is_some()
    }

    /// One generator invocation from the channel's I/O cycle. Produced
    /// audio goes to the sink; a finished or write-failed generator is
    /// taken out and released.
    pub fn generator_tick(&self, samples: usize) {
        let produced = {
            let mut slot = self.inner.generator.lock();
            match slot.as_mut() {
                Some(generator) => generator.generate(samples),
                None => return,
            }
        };
        match produced {
            Ok(Some(pcm)) => {
                if let Err(e) = self.write_audio(pcm) {
                    info!(
                        channel = self.inner.name.as_str(),
                        "generator write failed, releasing: {e}"
                    );
                    self.deactivate_generator();
                }
            }
            Ok(None) => {}
            Err(e) => {
                info!(
                    channel = self.inner.name.as_str(),
                    "generator finished: {e}"
                );
                self.deactivate_generator();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attach_detach_symmetry() {
        let channel = Channel::new("SIP/alice-0001");
        let before = Arc::new(FrameQueue::new());
        let queue = Arc::new(FrameQueue::new());
        let after = Arc::new(FrameQueue::new());

        channel.attach(&before);
        channel.attach(&queue);
        channel.attach(&after);
        channel.detach(&queue);

        let remaining = channel.attached_queues();
        assert_eq!(remaining.len(), 2);
        assert!(Arc::ptr_eq(&remaining[0], &before));
        assert!(Arc::ptr_eq(&remaining[1], &after));
    }

    #[test]
    fn test_detach_refuses_done_queue() {
        let channel = Channel::new("SIP/alice-0001");
        let queue = Arc::new(FrameQueue::new());
        channel.attach(&queue);

        queue.mark_done();
        channel.detach(&queue);
        // the done queue stays linked; only a hangup sweeps it
        assert_eq!(channel.attached_queues().len(), 1);
    }

    #[test]
    fn test_push_frame_fans_out() {
        let channel = Channel::new("SIP/alice-0001");
        let first = Arc::new(FrameQueue::new());
        let second = Arc::new(FrameQueue::new());
        channel.attach(&first);
        channel.attach(&second);

        channel.push_frame(Direction::Read, &AudioFrame::slin(&[1i16; 8]));
        assert_eq!(first.len(Direction::Read), 1);
        assert_eq!(second.len(Direction::Read), 1);
    }

    #[test]
    fn test_hangup_marks_queues_done() {
        let channel = Channel::new("SIP/alice-0001");
        let queue = Arc::new(FrameQueue::new());
        channel.attach(&queue);

        channel.hangup();
        assert!(!queue.is_running());
        assert!(channel.is_hungup());
        assert!(channel.write_audio(vec![0i16; 8]).is_err());
    }

    #[test]
    fn test_bridge_and_soft_unbridge() {
        let a = Channel::new("SIP/alice-0001");
        let b = Channel::new("SIP/bob-0001");
        a.set_bridge(&b);
        assert!(a.is_bridged());
        assert!(b.is_bridged());

        a.request_unbridge();
        assert!(b.unbridge_requested());
        assert!(!a.unbridge_requested());

        a.unbridge();
        assert!(!a.is_bridged());
        assert!(!b.is_bridged());
    }

    #[test]
    fn test_spy_guard() {
        let channel = Channel::new("SIP/alice-0001");
        assert!(channel.try_begin_spy());
        assert!(!channel.try_begin_spy());
        channel.end_spy();
        assert!(channel.try_begin_spy());
    }

    #[test]
    fn test_gain_control() {
        let plain = Channel::new("SIP/alice-0001");
        assert!(!plain.try_set_gain(2));

        let driver = Channel::with_hardware_gain("Zap/1-1");
        assert!(driver.try_set_gain(2));
        assert_eq!(driver.gain(), 2);
    }

    #[test]
    fn test_handle_stops_resolving() {
        let channel = Channel::new("SIP/alice-0001");
        let handle = channel.handle();
        assert!(handle.upgrade().is_some());
        drop(channel);
        assert!(handle.upgrade().is_none());
    }
}
