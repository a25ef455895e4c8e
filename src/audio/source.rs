//! # Audio Sources
//!
//! The microphone seam of the capture pipeline. A source is acquired when recording
//! starts (the permission prompt in a browser), asked for one chunk per interval while
//! recording, and released unconditionally when recording stops.
//!
//! ## Shipped implementation:
//! `WavFileSource` replays a 16-bit PCM WAV file as if it were being spoken into a
//! microphone. It can hand out raw little-endian PCM or wrap every chunk in its own
//! WAV header so each chunk is independently decodable by the backend.

use crate::audio::format::AudioFormat;
use crate::error::{SessionError, SessionResult};
use byteorder::{LittleEndian, WriteBytesExt};
use std::fs::File;
use std::io::{BufReader, Cursor};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

/// A microphone-like producer of encoded audio chunks.
///
/// ## Contract:
/// - `acquire` is called once per recording with the negotiated format
/// - `next_chunk` returns `Ok(None)` when the source has nothing more to give
/// - `release` must be safe to call at any time, including twice
pub trait AudioSource: Send {
    /// Encodings this source can produce.
    fn supported_formats(&self) -> Vec<AudioFormat>;

    fn acquire(&mut self, format: &AudioFormat) -> SessionResult<()>;

    /// Produce the audio captured over the last `interval`.
    fn next_chunk(&mut self, interval: Duration) -> SessionResult<Option<Vec<u8>>>;

    fn release(&mut self);
}

/// PCM track decoded from a WAV file.
#[derive(Debug, Clone)]
struct Track {
    samples: Vec<i16>,
    sample_rate: u32,
    channels: u16,
    position: usize,
}

/// File-backed microphone.
#[derive(Debug)]
pub struct WavFileSource {
    path: PathBuf,
    track: Option<Track>,
    format: Option<AudioFormat>,
}

impl WavFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            track: None,
            format: None,
        }
    }

    pub fn is_acquired(&self) -> bool {
        self.track.is_some()
    }

    fn load_track(&self) -> SessionResult<Track> {
        let file = File::open(&self.path).map_err(|e| {
            SessionError::Media(format!("Microphone unavailable ({}): {}", self.path.display(), e))
        })?;
        let mut reader = BufReader::new(file);
        let (header, data) = wav::read(&mut reader)
            .map_err(|e| SessionError::Media(format!("Could not read audio input: {}", e)))?;

        let samples = match data {
            wav::BitDepth::Sixteen(samples) => samples,
            _ => {
                return Err(SessionError::Media(format!(
                    "Audio input must be 16-bit PCM, got {} bits",
                    header.bits_per_sample
                )))
            }
        };

        Ok(Track {
            samples,
            sample_rate: header.sampling_rate,
            channels: header.channel_count,
            position: 0,
        })
    }

    fn encode(track: &Track, format: &AudioFormat, samples: &[i16]) -> SessionResult<Vec<u8>> {
        if format.is_wav() {
            let header = wav::Header::new(
                wav::header::WAV_FORMAT_PCM,
                track.channels,
                track.sample_rate,
                16,
            );
            let mut out = Cursor::new(Vec::with_capacity(samples.len() * 2 + 44));
            wav::write(header, &wav::BitDepth::Sixteen(samples.to_vec()), &mut out)
                .map_err(|e| SessionError::Media(format!("Could not encode audio chunk: {}", e)))?;
            return Ok(out.into_inner());
        }

        let mut out = Vec::with_capacity(samples.len() * 2);
        for sample in samples {
            out.write_i16::<LittleEndian>(*sample)
                .map_err(|e| SessionError::Media(format!("Could not encode audio chunk: {}", e)))?;
        }
        Ok(out)
    }
}

impl AudioSource for WavFileSource {
    fn supported_formats(&self) -> Vec<AudioFormat> {
        vec![AudioFormat::new("audio/wav"), AudioFormat::new("audio/pcm")]
    }

    fn acquire(&mut self, format: &AudioFormat) -> SessionResult<()> {
        let track = self.load_track()?;
        info!(
            path = %self.path.display(),
            sample_rate = track.sample_rate,
            channels = track.channels,
            samples = track.samples.len(),
            format = %format,
            "Audio input acquired"
        );
        self.track = Some(track);
        self.format = Some(format.clone());
        Ok(())
    }

    fn next_chunk(&mut self, interval: Duration) -> SessionResult<Option<Vec<u8>>> {
        let (Some(track), Some(format)) = (self.track.as_mut(), self.format.as_ref()) else {
            return Err(SessionError::Media("Audio input is not acquired".to_string()));
        };

        if track.position >= track.samples.len() {
            return Ok(None);
        }

        let per_chunk = (track.sample_rate as u128 * track.channels as u128 * interval.as_millis() / 1000)
            .max(track.channels as u128) as usize;
        let end = (track.position + per_chunk).min(track.samples.len());
        let start = track.position;
        track.position = end;

        let track = &*track;
        let chunk = Self::encode(track, format, &track.samples[start..end])?;
        Ok(Some(chunk))
    }

    fn release(&mut self) {
        if self.track.take().is_some() {
            debug!(path = %self.path.display(), "Audio input released");
        }
        self.format = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::ReadBytesExt;

    fn write_wav(samples: &[i16], sample_rate: u32) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let header = wav::Header::new(wav::header::WAV_FORMAT_PCM, 1, sample_rate, 16);
        wav::write(header, &wav::BitDepth::Sixteen(samples.to_vec()), file.as_file_mut()).unwrap();
        file
    }

    #[test]
    fn test_chunks_cover_the_file_as_pcm() {
        let samples: Vec<i16> = (0..1000).map(|i| i as i16).collect();
        let file = write_wav(&samples, 1000);
        let mut source = WavFileSource::new(file.path());

        source.acquire(&AudioFormat::new("audio/pcm")).unwrap();
        let interval = Duration::from_millis(250);

        let mut decoded = Vec::new();
        let mut chunks = 0;
        while let Some(chunk) = source.next_chunk(interval).unwrap() {
            assert_eq!(chunk.len(), 500); // 250 samples * 2 bytes
            let mut cursor = Cursor::new(chunk);
            while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
                decoded.push(sample);
            }
            chunks += 1;
        }

        assert_eq!(chunks, 4);
        assert_eq!(decoded, samples);
    }

    #[test]
    fn test_wav_chunks_are_self_contained() {
        let file = write_wav(&[1, 2, 3, 4, 5, 6, 7, 8], 16);
        let mut source = WavFileSource::new(file.path());
        source.acquire(&AudioFormat::new("audio/wav")).unwrap();

        let chunk = source.next_chunk(Duration::from_millis(250)).unwrap().unwrap();
        let (header, data) = wav::read(&mut Cursor::new(chunk)).unwrap();
        assert_eq!(header.sampling_rate, 16);
        match data {
            wav::BitDepth::Sixteen(samples) => assert_eq!(samples, vec![1, 2, 3, 4]),
            _ => panic!("expected 16-bit samples"),
        }
    }

    #[test]
    fn test_missing_file_is_media_error() {
        let mut source = WavFileSource::new("/definitely/not/here.wav");
        let err = source.acquire(&AudioFormat::new("audio/wav")).unwrap_err();
        assert!(matches!(err, SessionError::Media(_)));
        assert!(!source.is_acquired());
    }

    #[test]
    fn test_release_is_idempotent() {
        let file = write_wav(&[0; 64], 16);
        let mut source = WavFileSource::new(file.path());
        source.acquire(&AudioFormat::new("audio/pcm")).unwrap();
        source.release();
        source.release();
        assert!(!source.is_acquired());
        assert!(source.next_chunk(Duration::from_millis(250)).is_err());
    }
}
