//! H.264/MP4 video encoding and the optional ffmpeg audio post-processing.
//!
//! Frames stream into the encoder one at a time; the encoded Annex B frames
//! are buffered and muxed into an MP4 once the render completes. All
//! temporary files are `tempfile` guards, so cleanup happens on every exit
//! path, including failures inside the optional audio steps.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::process::Command;

use bytes::Bytes;
use image::RgbaImage;
use openh264::OpenH264API;
use openh264::encoder::{Encoder, EncoderConfig, FrameRate};
use openh264::formats::{RgbSliceU8, YUVBuffer};
use thiserror::Error;
use tracing::{debug, warn};

/// Typed errors for encoding and muxing.
#[derive(Debug, Error)]
pub enum VideoError {
    /// The canvas does not divide evenly into any supported macro block.
    #[error("canvas {0}x{1} has no common macro-block alignment")]
    BadCanvas(u32, u32),

    #[error("encoder initialization failed: {0}")]
    EncoderInit(String),

    #[error("encode failed: {0}")]
    EncodeFailed(String),

    #[error("MP4 mux failed: {0}")]
    MuxFailed(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

const MIN_MACRO_BLOCK: u32 = 16;
const MAX_MACRO_BLOCK: u32 = 200;

/// Smallest block size >= 16 that divides both canvas dimensions. The frame
/// canvas must be divisible by the encoder's macro-block granularity.
pub fn macro_block(width: u32, height: u32) -> Option<u32> {
    (MIN_MACRO_BLOCK..=MAX_MACRO_BLOCK).find(|block| width % block == 0 && height % block == 0)
}

/// Streaming video encoder: push RGBA frames, receive MP4 bytes.
pub struct VideoEncoder {
    width: u32,
    height: u32,
    fps: u32,
    quality: u8,
    encoder: Option<Encoder>,
    h264_frames: Vec<Vec<u8>>,
    rgb_scratch: Vec<u8>,
}

impl VideoEncoder {
    pub fn new(width: u32, height: u32, fps: u32, quality: u8) -> Result<Self, VideoError> {
        let Some(block) = macro_block(width, height) else {
            return Err(VideoError::BadCanvas(width, height));
        };
        debug!(width, height, block, fps, "video encoder configured");
        Ok(Self {
            width,
            height,
            fps: fps.max(1),
            quality: quality.clamp(1, 10),
            encoder: None,
            h264_frames: Vec::new(),
            rgb_scratch: vec![0u8; (width * height * 3) as usize],
        })
    }

    fn ensure_encoder(&mut self) -> Result<(), VideoError> {
        if self.encoder.is_some() {
            return Ok(());
        }
        let bitrate = 2_000_000 + self.quality as u32 * 1_800_000;
        let config = EncoderConfig::new()
            .max_frame_rate(FrameRate::from_hz(self.fps as f32))
            .usage_type(openh264::encoder::UsageType::ScreenContentRealTime)
            .rate_control_mode(openh264::encoder::RateControlMode::Bitrate)
            .bitrate(openh264::encoder::BitRate::from_bps(bitrate))
            .adaptive_quantization(false)
            .background_detection(false);
        self.encoder = Some(
            Encoder::with_api_config(OpenH264API::from_source(), config)
                .map_err(|e| VideoError::EncoderInit(format!("{e:?}")))?,
        );
        Ok(())
    }

    /// Encodes one composed frame.
    pub fn push_frame(&mut self, frame: &RgbaImage) -> Result<(), VideoError> {
        if frame.dimensions() != (self.width, self.height) {
            return Err(VideoError::EncodeFailed(format!(
                "frame is {}x{}, encoder expects {}x{}",
                frame.width(),
                frame.height(),
                self.width,
                self.height
            )));
        }
        self.ensure_encoder()?;

        for (src, dst) in frame
            .as_raw()
            .chunks_exact(4)
            .zip(self.rgb_scratch.chunks_exact_mut(3))
        {
            dst.copy_from_slice(&src[..3]);
        }
        let rgb = RgbSliceU8::new(
            &self.rgb_scratch,
            (self.width as usize, self.height as usize),
        );
        let yuv = YUVBuffer::from_rgb_source(rgb);

        let encoder = self.encoder.as_mut().expect("encoder initialized above");
        let bitstream = encoder
            .encode(&yuv)
            .map_err(|e| VideoError::EncodeFailed(format!("{e:?}")))?;
        self.h264_frames.push(bitstream.to_vec());
        Ok(())
    }

    /// Muxes the buffered frames and returns the finished MP4.
    pub fn finish(self) -> Result<Bytes, VideoError> {
        if self.h264_frames.is_empty() {
            return Err(VideoError::MuxFailed("no frames to mux".to_string()));
        }

        let first_frame = &self.h264_frames[0];
        let nals = parse_annexb_nals(first_frame);
        let sps = nals
            .iter()
            .find(|n| (n[0] & 0x1F) == 7)
            .ok_or_else(|| VideoError::MuxFailed("no SPS in first frame".to_string()))?;
        let pps = nals
            .iter()
            .find(|n| (n[0] & 0x1F) == 8)
            .ok_or_else(|| VideoError::MuxFailed("no PPS in first frame".to_string()))?;

        let mp4_config = mp4::Mp4Config {
            major_brand: str::parse("isom").unwrap(),
            minor_version: 512,
            compatible_brands: vec![
                str::parse("isom").unwrap(),
                str::parse("iso2").unwrap(),
                str::parse("avc1").unwrap(),
                str::parse("mp41").unwrap(),
            ],
            timescale: 1000,
        };

        // mux through a self-cleaning temp file; the writer must drop (and
        // flush) before the file is read back
        let output = tempfile::Builder::new().suffix(".mp4").tempfile()?;
        {
            let writer = BufWriter::new(output.reopen()?);
            let mut mp4_writer = mp4::Mp4Writer::write_start(writer, &mp4_config)
                .map_err(|e| VideoError::MuxFailed(e.to_string()))?;

            let track_config = mp4::TrackConfig {
                track_type: mp4::TrackType::Video,
                timescale: 1000,
                language: "und".to_string(),
                media_conf: mp4::MediaConfig::AvcConfig(mp4::AvcConfig {
                    width: self.width as u16,
                    height: self.height as u16,
                    seq_param_set: sps.to_vec(),
                    pic_param_set: pps.to_vec(),
                }),
            };
            mp4_writer
                .add_track(&track_config)
                .map_err(|e| VideoError::MuxFailed(e.to_string()))?;

            let sample_duration = 1000 / self.fps;

            for (frame_idx, annexb_data) in self.h264_frames.iter().enumerate() {
                if annexb_data.is_empty() {
                    continue;
                }
                let nals = parse_annexb_nals(annexb_data);
                let is_sync = nals.iter().any(|n| (n[0] & 0x1F) == 5);

                let mut avcc_data = Vec::new();
                for nal in &nals {
                    let nal_type = nal[0] & 0x1F;
                    if nal_type == 7 || nal_type == 8 {
                        continue;
                    }
                    avcc_data.extend_from_slice(&(nal.len() as u32).to_be_bytes());
                    avcc_data.extend_from_slice(nal);
                }
                if avcc_data.is_empty() {
                    continue;
                }

                let sample = mp4::Mp4Sample {
                    start_time: frame_idx as u64 * sample_duration as u64,
                    duration: sample_duration,
                    rendering_offset: 0,
                    is_sync,
                    bytes: Bytes::from(avcc_data),
                };
                mp4_writer
                    .write_sample(1, &sample)
                    .map_err(|e| VideoError::MuxFailed(e.to_string()))?;
            }

            mp4_writer
                .write_end()
                .map_err(|e| VideoError::MuxFailed(e.to_string()))?;
        }

        let data = std::fs::read(output.path())?;
        Ok(Bytes::from(data))
    }
}

/// Parses an Annex B byte stream into individual NAL units without start
/// codes.
fn parse_annexb_nals(data: &[u8]) -> Vec<&[u8]> {
    let mut nals = Vec::new();
    let mut i = 0;
    while i < data.len() {
        if i + 2 < data.len() && data[i] == 0 && data[i + 1] == 0 {
            let start = if i + 3 < data.len() && data[i + 2] == 0 && data[i + 3] == 1 {
                i + 4
            } else if data[i + 2] == 1 {
                i + 3
            } else {
                i += 1;
                continue;
            };
            let mut end = start;
            while end < data.len() {
                if end + 2 < data.len()
                    && data[end] == 0
                    && data[end + 1] == 0
                    && (data[end + 2] == 1
                        || (end + 3 < data.len() && data[end + 2] == 0 && data[end + 3] == 1))
                {
                    break;
                }
                end += 1;
            }
            if end > start {
                nals.push(&data[start..end]);
            }
            i = end;
        } else {
            i += 1;
        }
    }
    nals
}

fn write_temp(suffix: &str, data: &[u8]) -> std::io::Result<tempfile::NamedTempFile> {
    let mut tmp = tempfile::Builder::new().suffix(suffix).tempfile()?;
    tmp.write_all(data)?;
    tmp.flush()?;
    Ok(tmp)
}

fn run_ffmpeg(args: &[&str]) -> bool {
    match Command::new("ffmpeg").args(args).output() {
        Ok(output) if output.status.success() => true,
        Ok(output) => {
            warn!(
                status = %output.status,
                "ffmpeg exited with failure: {}",
                String::from_utf8_lossy(&output.stderr)
            );
            false
        }
        Err(e) => {
            warn!("ffmpeg not runnable: {e}");
            false
        }
    }
}

/// Muxes a looping audio track under the whole video (the fixed-60fps
/// novelty mode). Best-effort: `None` leaves the caller's video untouched.
pub fn mux_audio_track(video: &Bytes, audio: &Path) -> Option<Bytes> {
    let input = write_temp(".mp4", video).ok()?;
    let output = tempfile::Builder::new().suffix(".mp4").tempfile().ok()?;

    let ok = run_ffmpeg(&[
        "-i",
        input.path().to_str()?,
        "-i",
        audio.to_str()?,
        "-map",
        "0:v:0",
        "-map",
        "1:a:0",
        "-c:v",
        "copy",
        "-shortest",
        "-y",
        "-loglevel",
        "quiet",
        output.path().to_str()?,
    ]);
    if !ok {
        return None;
    }
    std::fs::read(output.path()).ok().map(Bytes::from)
}

/// Seconds of lead-in the drop track carries before its payoff beat.
const DROP_LEAD_SECS: f32 = 4.708;

/// Mixes two audio tracks time-aligned so the drop track's payoff lands on
/// the first kill. Best-effort: any failure returns `None` and the render
/// stands as-is.
pub fn mix_kill_audio(
    video: &Bytes,
    kill_video_secs: f32,
    drop_track: &Path,
    lead_track: &Path,
) -> Option<Bytes> {
    let sync_time = kill_video_secs - DROP_LEAD_SECS;
    if sync_time < 0.0 {
        debug!(kill_video_secs, "kill too early to sync the drop track");
        return None;
    }

    let input = write_temp(".mp4", video).ok()?;
    let output = tempfile::Builder::new().suffix(".mp4").tempfile().ok()?;

    let delay_ms = (sync_time * 1000.0).round() as i64;
    let filter = format!(
        "[1]adelay={delay_ms}|{delay_ms}[a];[2]afade=t=out:st={sync_time}:d={DROP_LEAD_SECS}[b];[a][b]amix[out]"
    );

    let ok = run_ffmpeg(&[
        "-i",
        input.path().to_str()?,
        "-i",
        drop_track.to_str()?,
        "-i",
        lead_track.to_str()?,
        "-filter_complex",
        &filter,
        "-map",
        "0:v:0",
        "-map",
        "[out]",
        "-c:v",
        "copy",
        "-shortest",
        "-y",
        "-loglevel",
        "quiet",
        output.path().to_str()?,
    ]);
    if !ok {
        return None;
    }
    std::fs::read(output.path()).ok().map(Bytes::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn macro_block_alignment() {
        // the two canvas layouts must align; 800x850 -> 25, 1300x850 -> 50
        assert_eq!(macro_block(800, 850), Some(25));
        assert_eq!(macro_block(1300, 850), Some(50));
        assert_eq!(macro_block(768, 800), Some(16));
        assert_eq!(macro_block(797, 850), None);
    }

    #[test]
    fn misaligned_canvas_is_rejected() {
        assert!(matches!(
            VideoEncoder::new(797, 850, 30, 5),
            Err(VideoError::BadCanvas(797, 850))
        ));
    }

    #[test]
    fn wrong_frame_size_is_rejected() {
        let mut encoder = VideoEncoder::new(800, 850, 30, 5).unwrap();
        let frame = RgbaImage::new(16, 16);
        assert!(matches!(
            encoder.push_frame(&frame),
            Err(VideoError::EncodeFailed(_))
        ));
    }

    #[test]
    fn annexb_nal_parsing() {
        let data = [
            0x00, 0x00, 0x00, 0x01, 0x67, 0xAA, 0xBB, // SPS, 4-byte start code
            0x00, 0x00, 0x01, 0x68, 0xCC, // PPS, 3-byte start code
            0x00, 0x00, 0x00, 0x01, 0x65, 0x01, 0x02, 0x03, // IDR
        ];
        let nals = parse_annexb_nals(&data);
        assert_eq!(nals.len(), 3);
        assert_eq!(nals[0][0] & 0x1F, 7);
        assert_eq!(nals[1][0] & 0x1F, 8);
        assert_eq!(nals[2][0] & 0x1F, 5);
    }

    #[test]
    fn encode_and_mux_roundtrip() {
        let mut encoder = VideoEncoder::new(800, 850, 30, 5).unwrap();
        let frame = RgbaImage::from_pixel(800, 850, image::Rgba([40, 60, 80, 255]));
        for _ in 0..3 {
            encoder.push_frame(&frame).unwrap();
        }
        let video = encoder.finish().unwrap();
        // an MP4 carries an ftyp box near the start
        assert!(!video.is_empty());
        assert_eq!(&video[4..8], b"ftyp");
    }
}
