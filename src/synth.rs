//! Software oscillator channels shared between the simulation thread and the
//! audio thread.
//!
//! Each channel is split in two. [`SpeakerChannel`] holds only atomics and is
//! shared through an `Arc`; the simulation thread drives it with
//! [`SpeakerChannel::force_play`], [`SpeakerChannel::play_if_idle`],
//! [`SpeakerChannel::queue`] and [`SpeakerChannel::stop`]. [`Voice`] owns the
//! running synthesis state and lives on the audio thread, which calls
//! [`Voice::synth`] from the backend's buffer callback.
//!
//! Handoff:
//! - The current sound is published in a single slot guarded by a sequence
//!   counter. Writers never wait; the audio thread retries a torn read.
//! - `status` packs a generation counter with a playing bit. Every
//!   simulation-side change of the active sound bumps the generation, which
//!   is how the audio thread notices it must reload the slot.
//! - Pending sounds sit in a fixed ring of [`QUEUE_CAPACITY`] slots indexed by
//!   monotonic `head`/`tail` counters. Only the simulation thread pushes; the
//!   audio thread pops by compare-and-swap on `head`, and a clear is a
//!   compare-and-swap of `head` up to `tail`.
//! - `completed` is bumped by the audio thread at every natural end and
//!   drained with a swap by the simulation thread.

use std::{
    f32::consts::TAU,
    sync::atomic::{fence, AtomicU32, AtomicUsize, Ordering},
    sync::Arc,
};

use crate::{
    sound::{Sound, Waveform, MAX_FREQUENCY, MIN_FREQUENCY},
    utils::clamp_f32,
};

pub const QUEUE_CAPACITY: usize = 32;

const PLAYING: u32 = 1;

/// A [`Sound`] stored field by field in atomics.
#[derive(Debug, Default)]
struct AtomicSound {
    waveform: AtomicU32,
    volume: AtomicU32,
    duty: AtomicU32,
    attack: AtomicU32,
    duration: AtomicU32,
    decay: AtomicU32,
    frequency: AtomicU32,
    slide: AtomicU32,
    vibrato_depth: AtomicU32,
    vibrato_frequency: AtomicU32,
    looping: AtomicU32,
}

impl AtomicSound {
    fn store(&self, sound: &Sound) {
        let f = |a: &AtomicU32, v: f32| a.store(v.to_bits(), Ordering::Relaxed);
        self.waveform
            .store(sound.waveform.to_bits(), Ordering::Relaxed);
        f(&self.volume, sound.volume);
        f(&self.duty, sound.duty);
        f(&self.attack, sound.attack);
        f(&self.duration, sound.duration);
        f(&self.decay, sound.decay);
        f(&self.frequency, sound.frequency);
        f(&self.slide, sound.slide);
        f(&self.vibrato_depth, sound.vibrato_depth);
        f(&self.vibrato_frequency, sound.vibrato_frequency);
        self.looping
            .store(sound.looping as u32, Ordering::Relaxed);
    }

    fn load(&self) -> Sound {
        let f = |a: &AtomicU32| f32::from_bits(a.load(Ordering::Relaxed));
        Sound {
            waveform: Waveform::from_bits(self.waveform.load(Ordering::Relaxed)),
            volume: f(&self.volume),
            duty: f(&self.duty),
            attack: f(&self.attack),
            duration: f(&self.duration),
            decay: f(&self.decay),
            frequency: f(&self.frequency),
            slide: f(&self.slide),
            vibrato_depth: f(&self.vibrato_depth),
            vibrato_frequency: f(&self.vibrato_frequency),
            looping: self.looping.load(Ordering::Relaxed) != 0,
        }
    }
}

/// Single-producer single-consumer ring of pending sounds.
#[derive(Debug)]
struct SoundQueue {
    slots: Vec<AtomicSound>,
    head: AtomicUsize,
    tail: AtomicUsize,
}

impl SoundQueue {
    fn new() -> Self {
        Self {
            slots: (0..QUEUE_CAPACITY).map(|_| AtomicSound::default()).collect(),
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    fn len(&self) -> usize {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        tail.wrapping_sub(head)
    }

    fn push(&self, sound: &Sound) -> bool {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if tail.wrapping_sub(head) >= QUEUE_CAPACITY {
            return false;
        }
        self.slots[tail % QUEUE_CAPACITY].store(sound);
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        true
    }

    fn pop(&self) -> Option<Sound> {
        loop {
            let head = self.head.load(Ordering::Acquire);
            let tail = self.tail.load(Ordering::Acquire);
            if head == tail {
                return None;
            }
            let sound = self.slots[head % QUEUE_CAPACITY].load();
            if self
                .head
                .compare_exchange(head, head.wrapping_add(1), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(sound);
            }
        }
    }

    fn clear(&self) {
        loop {
            let head = self.head.load(Ordering::Acquire);
            let tail = self.tail.load(Ordering::Acquire);
            if self
                .head
                .compare_exchange(head, tail, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }
}

/// The shared half of one synthesizer channel.
#[derive(Debug)]
pub struct SpeakerChannel {
    slot: AtomicSound,
    slot_seq: AtomicU32,
    status: AtomicU32,
    queue: SoundQueue,
    completed: AtomicU32,
}

impl Default for SpeakerChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl SpeakerChannel {
    pub fn new() -> Self {
        Self {
            slot: AtomicSound::default(),
            slot_seq: AtomicU32::new(0),
            status: AtomicU32::new(0),
            queue: SoundQueue::new(),
            completed: AtomicU32::new(0),
        }
    }

    /// Creates a channel and the voice that renders it.
    pub fn pair() -> (Arc<SpeakerChannel>, Voice) {
        let channel = Arc::new(SpeakerChannel::new());
        let voice = Voice::new(channel.clone());
        (channel, voice)
    }

    pub fn is_playing(&self) -> bool {
        self.status.load(Ordering::Acquire) & PLAYING != 0
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    fn publish(&self, sound: &Sound) {
        let seq = self.slot_seq.load(Ordering::Relaxed);
        self.slot_seq.store(seq.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);
        self.slot.store(sound);
        self.slot_seq.store(seq.wrapping_add(2), Ordering::Release);
    }

    fn current(&self) -> Sound {
        loop {
            let before = self.slot_seq.load(Ordering::Acquire);
            if before & 1 == 0 {
                let sound = self.slot.load();
                fence(Ordering::Acquire);
                if self.slot_seq.load(Ordering::Relaxed) == before {
                    return sound;
                }
            }
            std::hint::spin_loop();
        }
    }

    fn next_generation(status: u32, playing: bool) -> u32 {
        ((status >> 1).wrapping_add(1) << 1) | playing as u32
    }

    /// Replaces whatever is playing and drops everything queued.
    pub fn force_play(&self, sound: &Sound) {
        self.queue.clear();
        self.publish(sound);
        let _ = self
            .status
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
                Some(Self::next_generation(s, true))
            });
    }

    pub fn play_if_idle(&self, sound: &Sound) -> bool {
        let status = self.status.load(Ordering::Acquire);
        if status & PLAYING != 0 {
            return false;
        }
        // The slot is only read after a generation change, so writing it
        // before the swap is harmless if the swap loses.
        self.publish(sound);
        self.status
            .compare_exchange(
                status,
                Self::next_generation(status, true),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Plays now when idle, otherwise appends to the queue. Returns false
    /// when the queue is full.
    pub fn queue(&self, sound: &Sound) -> bool {
        if self.play_if_idle(sound) {
            return true;
        }
        self.queue.push(sound)
    }

    pub fn stop(&self) {
        self.queue.clear();
        let _ = self
            .status
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
                Some(Self::next_generation(s, false))
            });
    }

    /// Number of sounds that ended naturally since the last call.
    pub fn take_completed(&self) -> u32 {
        self.completed.swap(0, Ordering::AcqRel)
    }

    /// Audio thread: idle to playing within the same generation.
    fn resume_from_queue(&self, generation: u32) -> bool {
        self.status
            .compare_exchange(
                generation << 1,
                (generation << 1) | PLAYING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Audio thread: playing to idle, unless the simulation thread changed
    /// the sound in the meantime.
    fn finish(&self, generation: u32) -> bool {
        self.status
            .compare_exchange(
                (generation << 1) | PLAYING,
                generation << 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

#[derive(Debug, Clone)]
struct SynthState {
    sound: Sound,
    samples_played: u64,
    total_samples: u64,
    current_frequency: f32,
    phase: f32,
    noise_seed: u32,
    noise_value: f32,
}

impl SynthState {
    fn new(sound: Sound, sample_rate: u32, noise_seed: u32) -> Self {
        let mut state = Self {
            sound,
            samples_played: 0,
            total_samples: sound.total_samples(sample_rate),
            current_frequency: sound.frequency,
            phase: 0.0,
            noise_seed: noise_seed.max(1),
            noise_value: 0.0,
        };
        state.noise_value = state.next_noise();
        state
    }

    fn restart(&mut self) {
        self.samples_played = 0;
        self.current_frequency = self.sound.frequency;
        self.phase = 0.0;
    }

    fn remaining(&self) -> u64 {
        self.total_samples.saturating_sub(self.samples_played)
    }

    fn next_noise(&mut self) -> f32 {
        let mut x = self.noise_seed;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.noise_seed = x;
        (x as f32 / u32::MAX as f32) * 2.0 - 1.0
    }

    fn oscillator(&self) -> f32 {
        let p = self.phase;
        match self.sound.waveform {
            Waveform::Square => {
                if p < self.sound.duty {
                    1.0
                } else {
                    -1.0
                }
            }
            Waveform::Triangle => {
                if p < 0.5 {
                    4.0 * p - 1.0
                } else {
                    3.0 - 4.0 * p
                }
            }
            Waveform::Sawtooth => 2.0 * p - 1.0,
            Waveform::Noise => self.noise_value,
        }
    }

    fn next_sample(&mut self, sample_rate: u32) -> f32 {
        let rate = sample_rate as f32;
        let t = self.samples_played as f32 / rate;
        let vibrato =
            self.sound.vibrato_depth * (TAU * self.sound.vibrato_frequency * t).sin();
        let frequency = clamp_f32(
            self.current_frequency + vibrato,
            MIN_FREQUENCY,
            MAX_FREQUENCY,
        );

        let sample = self.oscillator() * self.sound.envelope(t);

        self.phase += frequency / rate;
        if self.phase >= 1.0 {
            self.phase = self.phase.fract();
            if self.sound.waveform == Waveform::Noise {
                self.noise_value = self.next_noise();
            }
        }
        self.current_frequency = clamp_f32(
            self.current_frequency + self.sound.slide / rate,
            MIN_FREQUENCY,
            MAX_FREQUENCY,
        );
        self.samples_played += 1;
        sample
    }
}

/// The audio-thread half of a channel.
#[derive(Debug)]
pub struct Voice {
    channel: Arc<SpeakerChannel>,
    generation: u32,
    state: Option<SynthState>,
    sample_rate: u32,
    noise_seed: u32,
}

impl Voice {
    pub fn new(channel: Arc<SpeakerChannel>) -> Self {
        Self {
            channel,
            generation: 0,
            state: None,
            sample_rate: 0,
            noise_seed: 0x2545_F491,
        }
    }

    pub fn channel(&self) -> &Arc<SpeakerChannel> {
        &self.channel
    }

    pub fn is_active(&self) -> bool {
        self.state.is_some()
    }

    fn start(&mut self, sound: Sound) {
        self.noise_seed = self.noise_seed.wrapping_mul(747_796_405).wrapping_add(1);
        self.state = Some(SynthState::new(sound, self.sample_rate, self.noise_seed));
    }

    /// Picks up a sound change made by the simulation thread.
    fn sync(&mut self) {
        let status = self.channel.status.load(Ordering::Acquire);
        let generation = status >> 1;
        if generation == self.generation {
            return;
        }
        self.generation = generation;
        if status & PLAYING != 0 {
            let sound = self.channel.current();
            self.start(sound);
        } else {
            self.state = None;
        }
    }

    /// Adds `sample_count` frames of this channel into the interleaved
    /// `buffer`, starting at frame `offset`. The mono signal is written to
    /// every one of `channels`.
    pub fn synth(
        &mut self,
        buffer: &mut [f32],
        offset: usize,
        sample_count: usize,
        channels: usize,
        sample_rate: u32,
    ) {
        if channels == 0 || sample_rate == 0 {
            return;
        }
        if sample_rate != self.sample_rate {
            self.sample_rate = sample_rate;
            if let Some(state) = &mut self.state {
                state.total_samples = state.sound.total_samples(sample_rate);
            }
        }
        let frames = sample_count.min((buffer.len() / channels).saturating_sub(offset));
        let mut frame = offset;
        let end = offset + frames;

        while frame < end {
            self.sync();

            if self.state.is_none() {
                // A push can land just after this voice went idle.
                match self.channel.queue.pop() {
                    Some(next) if self.channel.resume_from_queue(self.generation) => {
                        self.start(next);
                    }
                    Some(_) => continue,
                    None => return,
                }
            }
            let Some(state) = self.state.as_mut() else {
                continue;
            };

            let run = (state.remaining().min((end - frame) as u64)) as usize;
            for f in frame..frame + run {
                let sample = state.next_sample(sample_rate);
                for c in 0..channels {
                    buffer[f * channels + c] += sample;
                }
            }
            frame += run;

            if state.remaining() == 0 {
                self.channel.completed.fetch_add(1, Ordering::AcqRel);
                if let Some(next) = self.channel.queue.pop() {
                    self.start(next);
                } else if state.sound.looping && state.total_samples > 0 {
                    state.restart();
                } else {
                    self.state = None;
                    self.channel.finish(self.generation);
                }
            }
        }
    }
}
