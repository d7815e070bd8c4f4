use std::{rc::Rc, sync::Arc, time::Duration};

use tracing::{debug, info, trace};

use crate::{
    computer::Bus,
    device::{Device, DeviceUpdateResult},
    event::names,
    guest::{arg, arg_usize, ApiResult, GuestApi, GuestError},
    sound::Sound,
    synth::{SpeakerChannel, Voice},
    value::Value,
};

/// The audio-thread half of a speaker. Move it to the thread that owns the
/// output stream and call [`SpeakerOutput::fill`] from its callback.
#[derive(Debug)]
pub struct SpeakerOutput {
    voices: Vec<Voice>,
}

impl SpeakerOutput {
    /// Renders every channel into the interleaved `buffer`. Channels are
    /// mixed additively and the sum is clipped to [-1, 1].
    pub fn fill(&mut self, buffer: &mut [f32], channels: usize, sample_rate: u32) {
        buffer.iter_mut().for_each(|s| *s = 0.0);
        if channels == 0 {
            return;
        }
        let frames = buffer.len() / channels;
        for voice in &mut self.voices {
            voice.synth(buffer, 0, frames, channels, sample_rate);
        }
        for sample in buffer.iter_mut() {
            *sample = sample.clamp(-1.0, 1.0);
        }
    }

    pub fn channel_count(&self) -> usize {
        self.voices.len()
    }
}

/// Guest functions take 1-based channel numbers.
#[derive(Debug)]
struct SpeakerApi {
    name: String,
    channels: Vec<Arc<SpeakerChannel>>,
}

impl SpeakerApi {
    const FUNCTIONS: &'static [&'static str] = &[
        "play",
        "playIfIdle",
        "queue",
        "stop",
        "isPlaying",
        "getChannelCount",
    ];

    fn channel(&self, function: &str, args: &[Value]) -> Result<&SpeakerChannel, GuestError> {
        let number = arg_usize(function, args, 0)?;
        number
            .checked_sub(1)
            .and_then(|i| self.channels.get(i))
            .map(|c| c.as_ref())
            .ok_or_else(|| GuestError::BadArgument {
                function: function.to_string(),
                index: 1,
                message: format!("channel must be between 1 and {}", self.channels.len()),
            })
    }

    fn sound(function: &str, args: &[Value]) -> Result<Sound, GuestError> {
        let value = arg(args, 1).ok_or_else(|| GuestError::BadArgument {
            function: function.to_string(),
            index: 2,
            message: "table expected, got nil".to_string(),
        })?;
        Ok(Sound::from_value(value)?)
    }
}

impl GuestApi for SpeakerApi {
    fn name(&self) -> &str {
        &self.name
    }

    fn functions(&self) -> &[&'static str] {
        Self::FUNCTIONS
    }

    fn call(&self, function: &str, args: &[Value]) -> Result<ApiResult, GuestError> {
        match function {
            "play" => {
                let channel = self.channel(function, args)?;
                channel.force_play(&Self::sound(function, args)?);
                Ok(ApiResult::none())
            }
            "playIfIdle" => {
                let channel = self.channel(function, args)?;
                let started = channel.play_if_idle(&Self::sound(function, args)?);
                Ok(ApiResult::one(started))
            }
            "queue" => {
                let channel = self.channel(function, args)?;
                let accepted = channel.queue(&Self::sound(function, args)?);
                Ok(ApiResult::one(accepted))
            }
            "stop" => {
                self.channel(function, args)?.stop();
                Ok(ApiResult::none())
            }
            "isPlaying" => Ok(ApiResult::one(self.channel(function, args)?.is_playing())),
            "getChannelCount" => Ok(ApiResult::one(self.channels.len())),
            _ => Err(GuestError::UnknownFunction(function.to_string())),
        }
    }
}

/// A bank of synthesizer channels. The simulation thread keeps the device;
/// the matching [`SpeakerOutput`] is taken once and handed to the audio
/// backend.
#[derive(Debug)]
pub struct SpeakerDevice {
    channels: Vec<Arc<SpeakerChannel>>,
    output: Option<SpeakerOutput>,
    api: Option<Rc<SpeakerApi>>,
    bus: Option<Bus>,
}

impl SpeakerDevice {
    pub fn new(channel_count: usize) -> Self {
        let (channels, voices): (Vec<_>, Vec<_>) =
            (0..channel_count).map(|_| SpeakerChannel::pair()).unzip();
        Self {
            channels,
            output: Some(SpeakerOutput { voices }),
            api: None,
            bus: None,
        }
    }

    pub fn take_output(&mut self) -> Option<SpeakerOutput> {
        self.output.take()
    }

    pub fn channel(&self, index: usize) -> Option<&Arc<SpeakerChannel>> {
        self.channels.get(index)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    fn stop_all(&self) {
        for channel in &self.channels {
            channel.stop();
        }
    }
}

impl Device for SpeakerDevice {
    fn device_type(&self) -> &str {
        "speaker"
    }

    fn description(&self) -> &str {
        "Square, triangle, sawtooth and noise synthesizer"
    }

    fn attach(&mut self, bus: &Bus, name: &str) {
        info!("[SPK] {} attached with {} channels", name, self.channels.len());
        self.api = Some(Rc::new(SpeakerApi {
            name: name.to_string(),
            channels: self.channels.clone(),
        }));
        self.bus = Some(bus.clone());
    }

    fn detach(&mut self) {
        self.stop_all();
        self.api = None;
        self.bus = None;
    }

    /// Turns completions counted on the audio thread into events.
    fn update(&mut self, _dt: Duration) -> DeviceUpdateResult {
        let Some(bus) = &self.bus else {
            return DeviceUpdateResult::Continue;
        };
        for (index, channel) in self.channels.iter().enumerate() {
            let completed = channel.take_completed();
            for _ in 0..completed {
                trace!("[SPK] channel {} completed a sound", index + 1);
                bus.queue_event(names::SOUND_COMPLETE, vec![Value::from(index + 1)]);
            }
        }
        DeviceUpdateResult::Continue
    }

    fn power_off(&mut self) {
        debug!("[SPK] silencing {} channels", self.channels.len());
        self.stop_all();
    }

    fn guest_api(&self) -> Option<Rc<dyn GuestApi>> {
        self.api.clone().map(|api| api as Rc<dyn GuestApi>)
    }
}
