//! CPAL microphone and speaker. CPAL streams are not `Send` on every host, so each
//! one lives on its own thread for its whole life.

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig};
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tokio::sync::oneshot;

use crate::audio::capture::{CapturedAudio, Microphone, RecordingStream};
use crate::audio::playback::AudioOutput;
use crate::error::{Error, Result};

fn device_error(e: impl std::fmt::Display) -> Error {
    Error::device(e.to_string())
}

fn to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16
}

/// Default (or named) input device of the default host.
pub struct CpalMicrophone {
    preferred: Option<String>,
}

impl CpalMicrophone {
    pub fn new(preferred: Option<String>) -> Self {
        Self { preferred }
    }

    pub fn list_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices = host.input_devices().map_err(device_error)?;
        Ok(devices.filter_map(|d| d.name().ok()).collect())
    }
}

impl Microphone for CpalMicrophone {
    fn open(&self) -> Result<Box<dyn RecordingStream>> {
        let (ready_tx, ready_rx) = mpsc::channel();
        let (stop_tx, stop_rx) = mpsc::channel();
        let preferred = self.preferred.clone();
        let worker = thread::Builder::new()
            .name("microphone".into())
            .spawn(move || record(preferred, ready_tx, stop_rx))
            .map_err(device_error)?;
        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Box::new(CpalRecording {
                stop: Some(stop_tx),
                worker: Some(worker),
            })),
            Ok(Err(e)) => {
                let _ = worker.join();
                Err(e)
            }
            Err(_) => Err(Error::device("microphone thread exited")),
        }
    }
}

struct CpalRecording {
    stop: Option<Sender<()>>,
    worker: Option<JoinHandle<Result<CapturedAudio>>>,
}

impl RecordingStream for CpalRecording {
    fn finish(mut self: Box<Self>) -> Result<CapturedAudio> {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        match self.worker.take() {
            Some(worker) => worker
                .join()
                .map_err(|_| Error::device("microphone thread panicked"))?,
            None => Err(Error::device("recording already finished")),
        }
    }
}

impl Drop for CpalRecording {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

fn input_device(preferred: Option<&str>) -> Result<cpal::Device> {
    let host = cpal::default_host();
    match preferred {
        Some(name) => host
            .input_devices()
            .map_err(device_error)?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| Error::device(format!("input device '{name}' not found"))),
        None => host
            .default_input_device()
            .ok_or_else(|| Error::device("no default input device available")),
    }
}

fn record(preferred: Option<String>, ready: Sender<Result<()>>, stop: Receiver<()>) -> Result<CapturedAudio> {
    let buffer = Arc::new(Mutex::new(Vec::<i16>::new()));
    let started = start_input(preferred.as_deref(), buffer.clone());
    let (stream, sample_rate, channels) = match started {
        Ok(started) => started,
        Err(e) => {
            let _ = ready.send(Err(e.clone()));
            return Err(e);
        }
    };
    let _ = ready.send(Ok(()));
    let _ = stop.recv();
    if let Err(e) = stream.pause() {
        log::debug!("failed to pause input stream: {e}");
    }
    drop(stream);

    let samples = match buffer.lock() {
        Ok(mut buf) => std::mem::take(&mut *buf),
        Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
    };
    Ok(CapturedAudio {
        samples,
        sample_rate,
        channels,
    })
}

fn start_input(preferred: Option<&str>, buffer: Arc<Mutex<Vec<i16>>>) -> Result<(cpal::Stream, u32, u16)> {
    let device = input_device(preferred)?;
    let supported = device.default_input_config().map_err(device_error)?;
    let format = supported.sample_format();
    let config: StreamConfig = supported.into();
    let sample_rate = config.sample_rate.0;
    let channels = config.channels.max(1);
    log::debug!("recording {format:?} {sample_rate}Hz x{channels}");

    let err_fn = |err| log::warn!("input stream error: {err}");
    let stream = match format {
        SampleFormat::F32 => device.build_input_stream(
            &config,
            move |data: &[f32], _| {
                if let Ok(mut buf) = buffer.lock() {
                    buf.extend(data.iter().map(|s| to_i16(*s)));
                }
            },
            err_fn,
            None,
        ),
        SampleFormat::I16 => device.build_input_stream(
            &config,
            move |data: &[i16], _| {
                if let Ok(mut buf) = buffer.lock() {
                    buf.extend_from_slice(data);
                }
            },
            err_fn,
            None,
        ),
        SampleFormat::U16 => device.build_input_stream(
            &config,
            move |data: &[u16], _| {
                if let Ok(mut buf) = buffer.lock() {
                    buf.extend(data.iter().map(|s| (i32::from(*s) - 32_768) as i16));
                }
            },
            err_fn,
            None,
        ),
        other => return Err(Error::device(format!("unsupported sample format: {other:?}"))),
    }
    .map_err(device_error)?;
    stream.play().map_err(device_error)?;
    Ok((stream, sample_rate, channels))
}

struct Pcm {
    samples: Vec<f32>,
    sample_rate: u32,
    channels: usize,
}

/// EBML header that opens a webm/matroska file.
const EBML_MAGIC: [u8; 4] = [0x1a, 0x45, 0xdf, 0xa3];

/// Decode a clip to interleaved f32. WAV, MP3 and Ogg/Vorbis are supported;
/// webm (Opus) voice notes are refused up front, symphonia has no Opus decoder.
fn decode(bytes: &[u8]) -> Result<Pcm> {
    if bytes.starts_with(&EBML_MAGIC) {
        return Err(Error::device("webm/opus clips cannot be played on this device output"));
    }
    let source = MediaSourceStream::new(Box::new(Cursor::new(bytes.to_vec())), Default::default());
    let probed = symphonia::default::get_probe()
        .format(&Hint::new(), source, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(device_error)?;
    let mut format = probed.format;
    let track = format
        .default_track()
        .ok_or_else(|| Error::device("clip has no audio track"))?;
    let track_id = track.id;
    let mut sample_rate = track.codec_params.sample_rate.unwrap_or(44_100);
    let mut channels = track.codec_params.channels.map_or(1, |c| c.count());
    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(device_error)?;

    let mut samples = Vec::new();
    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(symphonia::core::errors::Error::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break;
            }
            Err(e) => return Err(device_error(e)),
        };
        if packet.track_id() != track_id {
            continue;
        }
        let decoded = decoder.decode(&packet).map_err(device_error)?;
        let spec = *decoded.spec();
        sample_rate = spec.rate;
        channels = spec.channels.count();
        let mut buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
        buf.copy_interleaved_ref(decoded);
        samples.extend_from_slice(buf.samples());
    }
    Ok(Pcm {
        samples,
        sample_rate,
        channels: channels.max(1),
    })
}

/// Default output device of the default host.
pub struct CpalOutput;

#[async_trait]
impl AudioOutput for CpalOutput {
    async fn play(&self, clip: Arc<[u8]>, stop: oneshot::Receiver<()>) -> Result<()> {
        let stopped = Arc::new(AtomicBool::new(false));
        let flag = stopped.clone();
        let mut playing = tokio::task::spawn_blocking(move || play_blocking(&clip, &flag));
        tokio::select! {
            result = &mut playing => result.map_err(device_error)?,
            _ = stop => {
                stopped.store(true, Ordering::SeqCst);
                playing.await.map_err(device_error)?
            }
        }
    }
}

fn play_blocking(clip: &[u8], stopped: &AtomicBool) -> Result<()> {
    let pcm = Arc::new(decode(clip)?);
    let device = cpal::default_host()
        .default_output_device()
        .ok_or_else(|| Error::device("no default output device available"))?;
    let supported = device.default_output_config().map_err(device_error)?;
    if supported.sample_format() != SampleFormat::F32 {
        return Err(Error::device(format!(
            "unsupported output format: {:?}",
            supported.sample_format()
        )));
    }
    let config: StreamConfig = supported.into();
    let out_channels = usize::from(config.channels.max(1));
    let step = f64::from(pcm.sample_rate) / f64::from(config.sample_rate.0.max(1));
    let frames = pcm.samples.len() / pcm.channels;

    let position = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicBool::new(frames == 0));
    let (src, pos, finished) = (pcm.clone(), position.clone(), done.clone());
    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _| {
                for frame in data.chunks_mut(out_channels) {
                    let n = pos.fetch_add(1, Ordering::Relaxed);
                    let at = (n as f64 * step) as usize;
                    if at >= frames {
                        frame.fill(0.0);
                        finished.store(true, Ordering::SeqCst);
                        continue;
                    }
                    for (c, sample) in frame.iter_mut().enumerate() {
                        *sample = src.samples[at * src.channels + c % src.channels];
                    }
                }
            },
            |err| log::warn!("output stream error: {err}"),
            None,
        )
        .map_err(device_error)?;
    stream.play().map_err(device_error)?;
    while !done.load(Ordering::SeqCst) && !stopped.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(20));
    }
    drop(stream);
    Ok(())
}
