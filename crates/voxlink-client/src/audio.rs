//! Trait seams for the audio hardware and the speech codec.
//!
//! Capture, render, and the Opus-style codec are external collaborators; the
//! runtime only sees these traits. The null implementations here back the
//! reference binary and the integration tests.

use std::thread;
use std::time::Duration;

use bytes::Bytes;

#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    #[error("capture failure: {0}")]
    Capture(String),
    #[error("render failure: {0}")]
    Render(String),
    #[error("frame encode failure: {0}")]
    Encode(String),
    #[error("frame decode failure: {0}")]
    Decode(String),
}

/// Microphone-side frame source. One call blocks for one frame interval and
/// yields one PCM frame.
pub trait CaptureSource: Send {
    fn read_frame(&mut self) -> Result<Bytes, AudioError>;
}

/// Speaker-side sink. Expected to pace playback at the frame cadence.
pub trait RenderSink: Send {
    fn render(&mut self, frame: &[u8]) -> Result<(), AudioError>;
}

/// Compresses PCM frames before they are sealed into packets.
pub trait FrameEncoder: Send {
    fn encode(&mut self, pcm: &[u8]) -> Result<Bytes, AudioError>;
}

/// Expands received frames back to PCM before playout.
pub trait FrameDecoder: Send {
    fn decode(&mut self, frame: &[u8]) -> Result<Bytes, AudioError>;
}

/// Capture source producing zeroed frames at the real frame cadence.
pub struct SilenceSource {
    frame: Bytes,
    interval: Duration,
}

impl SilenceSource {
    pub fn new(frame_len: usize, interval: Duration) -> Self {
        SilenceSource {
            frame: Bytes::from(vec![0u8; frame_len]),
            interval,
        }
    }
}

impl CaptureSource for SilenceSource {
    fn read_frame(&mut self) -> Result<Bytes, AudioError> {
        thread::sleep(self.interval);
        Ok(self.frame.clone())
    }
}

/// Sink that discards frames, counting them.
#[derive(Default)]
pub struct NullSink {
    rendered: u64,
}

impl NullSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rendered(&self) -> u64 {
        self.rendered
    }
}

impl RenderSink for NullSink {
    fn render(&mut self, _frame: &[u8]) -> Result<(), AudioError> {
        self.rendered += 1;
        Ok(())
    }
}

/// Identity codec for uncompressed streams and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughCodec;

impl FrameEncoder for PassthroughCodec {
    fn encode(&mut self, pcm: &[u8]) -> Result<Bytes, AudioError> {
        Ok(Bytes::copy_from_slice(pcm))
    }
}

impl FrameDecoder for PassthroughCodec {
    fn decode(&mut self, frame: &[u8]) -> Result<Bytes, AudioError> {
        Ok(Bytes::copy_from_slice(frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silence_source_yields_zeroed_frames() {
        let mut src = SilenceSource::new(8, Duration::from_millis(1));
        let frame = src.read_frame().unwrap();
        assert_eq!(frame.as_ref(), &[0u8; 8]);
    }

    #[test]
    fn passthrough_is_identity() {
        let mut codec = PassthroughCodec;
        let encoded = codec.encode(b"pcm data").unwrap();
        let decoded = codec.decode(&encoded).unwrap();
        assert_eq!(decoded.as_ref(), b"pcm data");
    }

    #[test]
    fn null_sink_counts_frames() {
        let mut sink = NullSink::new();
        sink.render(b"a").unwrap();
        sink.render(b"b").unwrap();
        assert_eq!(sink.rendered(), 2);
    }
}
