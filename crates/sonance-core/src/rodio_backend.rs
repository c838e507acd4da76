//! Real playback through rodio.
//!
//! Each channel owns a [`Sink`] on the default output device. Looping is
//! done by keeping two copies of the sound queued and topping the sink up
//! whenever one finishes, which is also how loop boundaries are detected.
//! Volume is gain times distance attenuation times master gain; doppler is
//! applied as playback speed.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use parking_lot::Mutex;
use rodio::buffer::SamplesBuffer;
use rodio::{OutputStream, OutputStreamHandle, Sink, Source};
use sonance_common::{AssetKey, AudioError, AudioResult};
use tracing::{debug, info, warn};

use crate::backend::{AudioBackend, BackendBuffer, BackendChannel, DecodedSound, Emitter};
use crate::decode::{DecodeEvent, DecodeQueue, Decoder};
use crate::fs_store::{asset_file_name, DEFAULT_EXTENSION};
use crate::listener::Listener;

/// Backend on the default rodio output device.
pub struct RodioBackend {
    // Dropping the stream stops all output.
    _stream: OutputStream,
    handle: OutputStreamHandle,
    master: Arc<Mutex<f32>>,
}

impl std::fmt::Debug for RodioBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RodioBackend")
            .field("master", &*self.master.lock())
            .finish_non_exhaustive()
    }
}

impl RodioBackend {
    /// Open the default output device.
    pub fn new() -> AudioResult<Self> {
        let (stream, handle) =
            OutputStream::try_default().map_err(|e| AudioError::DeviceInitFailed(e.to_string()))?;
        info!("Opened default audio output");
        Ok(Self {
            _stream: stream,
            handle,
            master: Arc::new(Mutex::new(1.0)),
        })
    }
}

impl AudioBackend for RodioBackend {
    type Buffer = RodioBuffer;
    type Channel = RodioChannel;

    fn driver_name(&self, verbose: bool) -> String {
        if verbose {
            "rodio (cpal default output device)".to_string()
        } else {
            "rodio".to_string()
        }
    }

    fn create_buffer(&mut self) -> RodioBuffer {
        RodioBuffer::default()
    }

    fn create_channel(&mut self) -> AudioResult<RodioChannel> {
        Ok(RodioChannel {
            handle: self.handle.clone(),
            master: Arc::clone(&self.master),
            sink: None,
            sound: None,
            looping: false,
            gain: 1.0,
            attenuation: 1.0,
            pitch: 1.0,
        })
    }

    fn set_internal_gain(&mut self, gain: f32) {
        *self.master.lock() = gain;
    }
}

/// Decoded PCM held for channels to queue.
#[derive(Debug, Clone, Default)]
pub struct RodioBuffer {
    sound: Option<Arc<DecodedSound>>,
}

impl BackendBuffer for RodioBuffer {
    fn load(&mut self, key: AssetKey, sound: &Arc<DecodedSound>) -> AudioResult<()> {
        self.sound = None;
        if sound.frame_count() == 0 || sound.sample_rate == 0 {
            return Err(AudioError::BufferLoad {
                key,
                message: "no samples".to_string(),
            });
        }
        self.sound = Some(Arc::clone(sound));
        Ok(())
    }

    fn duration(&self) -> Duration {
        self.sound.as_ref().map_or(Duration::ZERO, |sound| sound.duration())
    }
}

/// A rodio sink driven as a mixer voice.
pub struct RodioChannel {
    handle: OutputStreamHandle,
    master: Arc<Mutex<f32>>,
    sink: Option<Sink>,
    sound: Option<Arc<DecodedSound>>,
    looping: bool,
    gain: f32,
    attenuation: f32,
    pitch: f32,
}

impl std::fmt::Debug for RodioChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RodioChannel")
            .field("looping", &self.looping)
            .field("gain", &self.gain)
            .field("playing", &self.is_playing())
            .finish_non_exhaustive()
    }
}

impl RodioChannel {
    fn samples(sound: &DecodedSound) -> SamplesBuffer<f32> {
        SamplesBuffer::new(sound.channels, sound.sample_rate, sound.samples.as_ref().clone())
    }

    fn volume(&self) -> f32 {
        self.gain * self.attenuation * *self.master.lock()
    }

    fn apply(&self) {
        if let Some(sink) = &self.sink {
            sink.set_volume(self.volume());
            sink.set_speed(self.pitch);
        }
    }

    fn start(&mut self, offset: Option<Duration>) {
        let Some(sound) = self.sound.clone() else {
            return;
        };
        let sink = match Sink::try_new(&self.handle) {
            Ok(sink) => sink,
            Err(e) => {
                warn!("Failed to open sink: {e}");
                return;
            },
        };
        sink.append(Self::samples(&sound));
        if self.looping {
            sink.append(Self::samples(&sound));
        }
        if let Some(offset) = offset {
            if let Err(e) = sink.try_seek(offset) {
                debug!("Seek to {offset:?} failed: {e}");
            }
        }
        self.sink = Some(sink);
        self.apply();
    }
}

impl BackendChannel for RodioChannel {
    type Buffer = RodioBuffer;

    fn attach(&mut self, buffer: &RodioBuffer, looping: bool) -> AudioResult<()> {
        let Some(sound) = &buffer.sound else {
            return Err(AudioError::ChannelAttach("buffer is empty".to_string()));
        };
        self.cleanup();
        self.sound = Some(Arc::clone(sound));
        self.looping = looping;
        Ok(())
    }

    fn cleanup(&mut self) {
        if let Some(sink) = self.sink.take() {
            sink.stop();
        }
        self.sound = None;
        self.looping = false;
    }

    fn play(&mut self) {
        if !self.is_playing() {
            self.start(None);
        }
    }

    fn play_synced(&mut self, master_position: Option<Duration>) {
        let period = self.sound.as_ref().map_or(Duration::ZERO, |sound| sound.duration());
        let offset = master_position
            .filter(|_| !period.is_zero())
            .map(|position| Duration::from_nanos((position.as_nanos() % period.as_nanos()) as u64));
        if let Some(sink) = self.sink.take() {
            sink.stop();
        }
        self.start(offset);
    }

    fn is_playing(&self) -> bool {
        self.sink
            .as_ref()
            .is_some_and(|sink| !sink.empty() && !sink.is_paused())
    }

    fn playback_position(&self) -> Option<Duration> {
        self.sink.as_ref().map(Sink::get_pos)
    }

    fn poll_looped(&mut self) -> bool {
        if !self.looping {
            return false;
        }
        let (Some(sink), Some(sound)) = (&self.sink, &self.sound) else {
            return false;
        };
        if sink.empty() || sink.len() >= 2 {
            return false;
        }
        sink.append(Self::samples(sound));
        true
    }

    fn set_gain(&mut self, gain: f32) {
        self.gain = gain;
        self.apply();
    }

    fn update_3d(&mut self, emitter: &Emitter, listener: &Listener) {
        (self.attenuation, self.pitch) = match *emitter {
            Emitter::Ambient => (1.0, 1.0),
            Emitter::Positioned { position, velocity } => (
                listener.attenuation(position),
                listener.doppler_pitch(position, velocity),
            ),
        };
        self.apply();
    }
}

/// Decode a cached file to f32 PCM.
fn decode_file(key: AssetKey, path: &Path) -> AudioResult<DecodedSound> {
    let file = File::open(path)?;
    let source = rodio::Decoder::new(BufReader::new(file)).map_err(|e| AudioError::DecodeFailed {
        key,
        message: e.to_string(),
    })?;
    let channels = source.channels();
    let sample_rate = source.sample_rate();
    let samples: Vec<f32> = source.convert_samples::<f32>().collect();
    Ok(DecodedSound::new(samples, sample_rate, channels))
}

/// Decoder reading encoded files from a cache directory.
#[derive(Debug)]
pub struct RodioDecoder {
    cache_dir: PathBuf,
    extension: String,
    queue: DecodeQueue,
    decoded: AHashMap<AssetKey, Arc<DecodedSound>>,
}

impl RodioDecoder {
    /// Decode files named `<key>.ogg` under `cache_dir`.
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            extension: DEFAULT_EXTENSION.to_string(),
            queue: DecodeQueue::new(),
            decoded: AHashMap::new(),
        }
    }

    /// Use a different file extension.
    #[must_use]
    pub fn with_extension(mut self, extension: &str) -> Self {
        self.extension = extension.trim_start_matches('.').to_string();
        self
    }

    fn path(&self, key: AssetKey) -> PathBuf {
        self.cache_dir.join(asset_file_name(key, &self.extension))
    }
}

impl Decoder for RodioDecoder {
    fn request_decode(&mut self, key: AssetKey) -> bool {
        if !self.decoded.contains_key(&key) && !self.path(key).is_file() {
            return false;
        }
        self.queue.push(key);
        true
    }

    fn process_queue(&mut self, budget: Duration) -> Vec<DecodeEvent> {
        let cache_dir = &self.cache_dir;
        let extension = &self.extension;
        let decoded = &mut self.decoded;
        self.queue.run(budget, |key| {
            if decoded.contains_key(&key) {
                return DecodeEvent::Decoded(key);
            }
            let path = cache_dir.join(asset_file_name(key, extension));
            match decode_file(key, &path) {
                Ok(sound) => {
                    debug!("Decoded {key}: {:?}", sound.duration());
                    decoded.insert(key, Arc::new(sound));
                    DecodeEvent::Decoded(key)
                },
                Err(e) => {
                    warn!("{e}");
                    DecodeEvent::Failed(key)
                },
            }
        })
    }

    fn has_decoded(&self, key: AssetKey) -> bool {
        self.decoded.contains_key(&key)
    }

    fn decoded(&self, key: AssetKey) -> Option<Arc<DecodedSound>> {
        self.decoded.get(&key).cloned()
    }
}
