//! FFmpeg-backed video decoder
//!
//! Decodes compressed chunks with libavcodec and hands out tightly packed
//! YUV420P pictures.

use bytes::Bytes;
use codecwarp_core::{CodecError, ResourceKind, Role, SessionConfig, Tracked};
use tracing::debug;

use crate::{Codec, CodecFactory, CodecInput, CodecOutput};

/// Creates [`FfmpegDecoder`] handles
#[derive(Debug, Clone, Default)]
pub struct FfmpegDecoderFactory {
    /// Number of decoder threads (None = FFmpeg default)
    pub thread_count: Option<usize>,
}

impl CodecFactory for FfmpegDecoderFactory {
    type Codec = FfmpegDecoder;

    fn init(&self, config: &SessionConfig) -> Result<FfmpegDecoder, CodecError> {
        if config.role != Role::Decoder {
            return Err(CodecError::InitFailed(format!(
                "ffmpeg backend only decodes, got {} session",
                config.role
            )));
        }
        FfmpegDecoder::new(&config.codec, config.description.as_ref(), self.thread_count)
    }
}

/// Video decoder handle backed by an FFmpeg codec context
pub struct FfmpegDecoder {
    decoder: ffmpeg_next::decoder::Video,
    scaler: Option<ffmpeg_next::software::scaling::Context>,
    width: u32,
    height: u32,
    format: ffmpeg_next::format::Pixel,
    _tracked: Tracked,
}

impl FfmpegDecoder {
    pub fn new(
        codec_name: &str,
        description: Option<&Bytes>,
        thread_count: Option<usize>,
    ) -> Result<Self, CodecError> {
        ffmpeg_next::init().map_err(|e| CodecError::InitFailed(e.to_string()))?;

        let codec = ffmpeg_next::decoder::find_by_name(codec_name)
            .ok_or_else(|| CodecError::CodecNotFound(codec_name.to_string()))?;

        let mut context = ffmpeg_next::codec::Context::new_with_codec(codec);

        if let Some(extradata) = description {
            set_extradata(&mut context, extradata)?;
        }

        if let Some(thread_count) = thread_count {
            unsafe {
                (*context.as_mut_ptr()).thread_count = thread_count as i32;
            }
        }

        let decoder = context
            .decoder()
            .video()
            .map_err(|e| CodecError::InitFailed(format!("failed to open decoder: {}", e)))?;

        debug!("opened ffmpeg decoder {}", codec_name);

        Ok(Self {
            decoder,
            scaler: None,
            width: 0,
            height: 0,
            format: ffmpeg_next::format::Pixel::None,
            _tracked: Tracked::new(ResourceKind::CodecHandle),
        })
    }

    fn convert_frame(&mut self, frame: &ffmpeg_next::frame::Video) -> Result<Bytes, CodecError> {
        let width = frame.width();
        let height = frame.height();

        // Rebuild the scaler when geometry or source format changes
        if self.width != width || self.height != height || self.format != frame.format() {
            self.scaler = if frame.format() == ffmpeg_next::format::Pixel::YUV420P {
                None
            } else {
                Some(
                    ffmpeg_next::software::scaling::Context::get(
                        frame.format(),
                        width,
                        height,
                        ffmpeg_next::format::Pixel::YUV420P,
                        width,
                        height,
                        ffmpeg_next::software::scaling::Flags::BILINEAR,
                    )
                    .map_err(|e| CodecError::ConversionFailed(e.to_string()))?,
                )
            };
            self.width = width;
            self.height = height;
            self.format = frame.format();
        }

        let converted;
        let yuv_frame = match self.scaler.as_mut() {
            Some(scaler) => {
                let mut output = ffmpeg_next::frame::Video::empty();
                scaler
                    .run(frame, &mut output)
                    .map_err(|e| CodecError::ConversionFailed(e.to_string()))?;
                converted = output;
                &converted
            }
            None => frame,
        };

        Ok(pack_yuv420p(yuv_frame, width as usize, height as usize))
    }
}

impl Codec for FfmpegDecoder {
    fn submit(&mut self, input: CodecInput) -> Result<(), CodecError> {
        let mut packet = ffmpeg_next::Packet::copy(&input.data);
        packet.set_pts(Some(input.pts));
        if input.key_frame {
            packet.set_flags(ffmpeg_next::packet::Flags::KEY);
        }

        match self.decoder.send_packet(&packet) {
            Ok(()) => Ok(()),
            Err(ffmpeg_next::Error::Eof) => Err(CodecError::EndOfStream),
            Err(e) => Err(CodecError::SubmitFailed(e.to_string())),
        }
    }

    fn send_eof(&mut self) -> Result<(), CodecError> {
        self.decoder
            .send_eof()
            .map_err(|e| CodecError::SubmitFailed(e.to_string()))
    }

    fn poll_output(&mut self) -> Result<Option<CodecOutput>, CodecError> {
        let mut decoded = ffmpeg_next::frame::Video::empty();
        match self.decoder.receive_frame(&mut decoded) {
            Ok(()) => {
                let data = self.convert_frame(&decoded)?;
                Ok(Some(CodecOutput {
                    pts: decoded.pts(),
                    data,
                    key_frame: decoded.is_key(),
                }))
            }
            Err(ffmpeg_next::Error::Other { errno }) if errno == ffmpeg_next::util::error::EAGAIN => {
                Ok(None)
            }
            Err(ffmpeg_next::Error::Eof) => Ok(None),
            Err(e) => Err(CodecError::ReceiveFailed(e.to_string())),
        }
    }

    fn coded_size(&self) -> Option<(u32, u32)> {
        if self.width > 0 && self.height > 0 {
            Some((self.width, self.height))
        } else {
            None
        }
    }
}

fn set_extradata(context: &mut ffmpeg_next::codec::Context, extradata: &[u8]) -> Result<(), CodecError> {
    let padding = ffmpeg_next::ffi::AV_INPUT_BUFFER_PADDING_SIZE as usize;
    unsafe {
        let buf = ffmpeg_next::ffi::av_mallocz(extradata.len() + padding) as *mut u8;
        if buf.is_null() {
            return Err(CodecError::InitFailed("failed to allocate extradata".into()));
        }
        std::ptr::copy_nonoverlapping(extradata.as_ptr(), buf, extradata.len());
        let raw = context.as_mut_ptr();
        (*raw).extradata = buf;
        (*raw).extradata_size = extradata.len() as i32;
    }
    Ok(())
}

/// Copy the three planes row by row, dropping stride padding
fn pack_yuv420p(frame: &ffmpeg_next::frame::Video, width: usize, height: usize) -> Bytes {
    let y_size = width * height;
    let uv_width = width / 2;
    let uv_height = height / 2;
    let mut yuv = Vec::with_capacity(y_size + 2 * uv_width * uv_height);

    let planes = [(0, width, height), (1, uv_width, uv_height), (2, uv_width, uv_height)];
    for (plane, plane_width, plane_height) in planes {
        let stride = frame.stride(plane);
        let data = frame.data(plane);
        for row in 0..plane_height {
            let start = row * stride;
            yuv.extend_from_slice(&data[start..start + plane_width]);
        }
    }

    Bytes::from(yuv)
}
