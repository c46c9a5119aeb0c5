/// Audio sources for the detection service
///
/// WAV files are decoded with hound; raw streams (stdin, sockets) carry
/// little-endian signed 16-bit mono PCM.

use crate::audio_buffer::AudioSample;
use async_trait::async_trait;
use byteorder::{ByteOrder, LittleEndian};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: hound::Error,
    },

    #[error("Unsupported audio format: {0}")]
    Format(String),

    #[error("WAV decode error: {0}")]
    Wav(#[from] hound::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Pull-based source of mono 16-bit audio
#[async_trait]
pub trait AudioSource: Send {
    /// Read up to `max_samples` samples; `None` at end of stream
    async fn read_chunk(
        &mut self,
        max_samples: usize,
    ) -> Result<Option<Vec<AudioSample>>, SourceError>;
}

/// 16-bit mono WAV file
pub struct WavFileSource {
    reader: hound::WavReader<BufReader<File>>,
}

impl WavFileSource {
    /// Open `path`, rejecting anything but 16-bit integer mono at `sample_rate`
    pub fn open(path: impl AsRef<Path>, sample_rate: usize) -> Result<Self, SourceError> {
        let path = path.as_ref();
        let reader = hound::WavReader::open(path).map_err(|source| SourceError::Open {
            path: path.to_path_buf(),
            source,
        })?;

        let spec = reader.spec();
        if spec.channels != 1 {
            return Err(SourceError::Format(format!(
                "expected mono audio, got {} channels",
                spec.channels
            )));
        }
        if spec.bits_per_sample != 16 || spec.sample_format != hound::SampleFormat::Int {
            return Err(SourceError::Format(format!(
                "expected 16-bit integer samples, got {}-bit {:?}",
                spec.bits_per_sample, spec.sample_format
            )));
        }
        if spec.sample_rate as usize != sample_rate {
            return Err(SourceError::Format(format!(
                "expected {} Hz, got {} Hz",
                sample_rate, spec.sample_rate
            )));
        }

        info!(
            "Opened {} ({} samples at {} Hz)",
            path.display(),
            reader.len(),
            spec.sample_rate
        );
        Ok(Self { reader })
    }

    /// Total samples in the file
    pub fn len(&self) -> u32 {
        self.reader.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reader.len() == 0
    }
}

#[async_trait]
impl AudioSource for WavFileSource {
    async fn read_chunk(
        &mut self,
        max_samples: usize,
    ) -> Result<Option<Vec<AudioSample>>, SourceError> {
        let chunk = self
            .reader
            .samples::<i16>()
            .take(max_samples)
            .collect::<Result<Vec<_>, _>>()?;

        if chunk.is_empty() && max_samples > 0 {
            return Ok(None);
        }
        Ok(Some(chunk))
    }
}

/// Raw little-endian s16 PCM from any async reader
pub struct PcmStreamSource<R> {
    reader: R,
    bytes: Vec<u8>,
    // Odd byte left over from a short read
    pending: Option<u8>,
}

impl<R> PcmStreamSource<R>
where
    R: AsyncRead + Unpin + Send,
{
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            bytes: Vec::new(),
            pending: None,
        }
    }

    pub fn into_inner(self) -> R {
        self.reader
    }
}

#[async_trait]
impl<R> AudioSource for PcmStreamSource<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn read_chunk(
        &mut self,
        max_samples: usize,
    ) -> Result<Option<Vec<AudioSample>>, SourceError> {
        if max_samples == 0 {
            return Ok(Some(Vec::new()));
        }

        let wanted = max_samples * 2;
        self.bytes.resize(wanted, 0);

        let mut filled = 0;
        if let Some(byte) = self.pending.take() {
            self.bytes[0] = byte;
            filled = 1;
        }

        while filled < wanted {
            let read = self.reader.read(&mut self.bytes[filled..wanted]).await?;
            if read == 0 {
                break;
            }
            filled += read;
        }

        let whole = filled - filled % 2;
        if whole == 0 {
            if filled == 1 {
                debug!("Dropping trailing odd byte at end of stream");
            }
            return Ok(None);
        }
        if filled % 2 == 1 {
            self.pending = Some(self.bytes[whole]);
        }

        let mut samples = vec![0; whole / 2];
        LittleEndian::read_i16_into(&self.bytes[..whole], &mut samples);
        Ok(Some(samples))
    }
}
