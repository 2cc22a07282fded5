// Copyright (C) 2026 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//
//! Decoding of WAV and MP3 sources into a [`SampleStore`] via symphonia.

use std::fs::File;
use std::io::Cursor;
use std::path::Path;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, Packet};
use symphonia::core::io::{MediaSource, MediaSourceStream};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::debug;

use super::{SampleStore, StoreError};

/// Decodes a WAV container held in memory.
pub fn decode_wav_bytes(bytes: &[u8]) -> Result<SampleStore, StoreError> {
    let mut hint = Hint::new();
    hint.with_extension("wav");
    decode(Box::new(Cursor::new(bytes.to_vec())), hint, "in-memory WAV")
}

/// Decodes an MP3 stream from disk.
pub fn decode_mp3_file(path: &Path) -> Result<SampleStore, StoreError> {
    let file = File::open(path)?;
    let mut hint = Hint::new();
    hint.with_extension("mp3");
    decode(Box::new(file), hint, &path.display().to_string())
}

/// Decodes any container symphonia can probe, using the extension as a hint.
pub fn decode_file(path: &Path) -> Result<SampleStore, StoreError> {
    let file = File::open(path)?;
    let mut hint = Hint::new();
    if let Some(extension) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(extension);
    }
    decode(Box::new(file), hint, &path.display().to_string())
}

fn decode(
    source: Box<dyn MediaSource>,
    hint: Hint,
    label: &str,
) -> Result<SampleStore, StoreError> {
    let mss = MediaSourceStream::new(source, Default::default());
    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| StoreError::DecodeFailed(format!("{}: {}", label, e)))?;
    let mut format_reader = probed.format;

    let track = format_reader
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| StoreError::DecodeFailed(format!("{}: no audio track", label)))?;
    let track_id = track.id;
    let codec_params = track.codec_params.clone();

    let sample_rate = codec_params
        .sample_rate
        .ok_or_else(|| StoreError::DecodeFailed(format!("{}: unknown sample rate", label)))?;
    let mut channels = codec_params
        .channels
        .map(|c| c.count() as u16)
        .unwrap_or(0);
    if channels > 2 {
        return Err(StoreError::UnsupportedChannels(channels));
    }

    let mut decoder = symphonia::default::get_codecs()
        .make(&codec_params, &DecoderOptions::default())
        .map_err(|e| StoreError::DecodeFailed(format!("{}: {}", label, e)))?;

    let mut samples = Vec::with_capacity(
        codec_params.n_frames.unwrap_or(0) as usize * channels.max(1) as usize,
    );
    let mut buffer: Option<SampleBuffer<f32>> = None;
    let mut buffer_shape = (0usize, 0usize);

    while let Some(packet) = read_next_packet(format_reader.as_mut(), decoder.as_mut())? {
        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::ResetRequired) => {
                decoder.reset();
                continue;
            }
            Err(SymphoniaError::DecodeError(e)) => {
                debug!(source = label, error = e, "Skipping undecodable packet");
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        if decoded.frames() == 0 {
            continue;
        }

        let spec = *decoded.spec();
        let packet_channels = spec.channels.count() as u16;
        if packet_channels > 2 {
            return Err(StoreError::UnsupportedChannels(packet_channels));
        }
        channels = packet_channels;

        // (channels, frame capacity) of the conversion buffer.
        if buffer_shape.0 != packet_channels as usize || buffer_shape.1 < decoded.capacity() {
            buffer = Some(SampleBuffer::new(decoded.capacity() as u64, spec));
            buffer_shape = (packet_channels as usize, decoded.capacity());
        }
        if let Some(buffer) = buffer.as_mut() {
            buffer.copy_interleaved_ref(decoded);
            samples.extend_from_slice(buffer.samples());
        }
    }

    if channels == 0 {
        return Err(StoreError::DecodeFailed(format!("{}: no audio decoded", label)));
    }

    debug!(
        source = label,
        channels,
        sample_rate,
        frames = samples.len() / channels as usize,
        "Decoded source"
    );
    SampleStore::new(samples, channels, sample_rate)
}

/// Reads the next packet, resetting the decoder when the stream asks for it. Returns `None` at
/// the end of the stream.
fn read_next_packet(
    format_reader: &mut dyn FormatReader,
    decoder: &mut dyn Decoder,
) -> Result<Option<Packet>, StoreError> {
    loop {
        match format_reader.next_packet() {
            Ok(packet) => return Ok(Some(packet)),
            Err(SymphoniaError::ResetRequired) => {
                decoder.reset();
                continue;
            }
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Ok(None)
            }
            // Some readers report the end of the stream as a decode error.
            Err(SymphoniaError::DecodeError(_)) => return Ok(None),
            Err(e) => return Err(StoreError::AudioError(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use crate::store::{SampleStore, StoreError};
    use crate::testutil::write_wav;

    #[test]
    fn decodes_stereo_wav_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stereo.wav");
        let left: Vec<i16> = (0..100).map(|i| i * 10).collect();
        let right: Vec<i16> = (0..100).map(|i| -i * 10).collect();
        write_wav(&path, &[left, right], 44100).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        let store = SampleStore::from_wav_bytes(&bytes).unwrap();
        assert_eq!(2, store.channel_count());
        assert_eq!(44100, store.sample_rate());
        assert_eq!(100, store.frame_count());

        // Interleaved, left first.
        let samples = store.samples();
        assert_eq!(0.0, samples[0]);
        assert!(samples[2] > 0.0);
        assert!(samples[3] < 0.0);
    }

    #[test]
    fn decodes_mono_wav_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mono.wav");
        write_wav(&path, &[vec![1000i16; 480]], 48000).unwrap();

        let store = SampleStore::from_file(&path).unwrap();
        assert_eq!(1, store.channel_count());
        assert_eq!(48000, store.sample_rate());
        assert_eq!(480, store.frame_count());
        let expected = 1000.0 / 32768.0;
        assert!(store.samples().iter().all(|s| (s - expected).abs() < 1e-4));
    }

    #[test]
    fn rejects_surround_sources() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quad.wav");
        write_wav(&path, &[vec![0i16; 10], vec![0; 10], vec![0; 10]], 44100).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert!(matches!(
            SampleStore::from_wav_bytes(&bytes),
            Err(StoreError::UnsupportedChannels(3)) | Err(StoreError::DecodeFailed(_))
        ));
    }

    #[test]
    fn garbage_bytes_fail_to_decode() {
        let result = SampleStore::from_wav_bytes(&[1, 2, 3, 4, 5, 6, 7, 8]);
        assert!(matches!(result, Err(StoreError::DecodeFailed(_))));
    }

    #[test]
    fn missing_mp3_is_an_io_error() {
        let result = SampleStore::from_mp3_file(Path::new("/nonexistent/ensemble/track.mp3"));
        assert!(matches!(result, Err(StoreError::IoError(_))));
    }
}
