//! Kind-specific normalization applied before upload.
//!
//! Static images above the configured bound are downscaled. Animated WebP and GIF
//! payloads are never decoded into a single frame: they are stored byte-for-byte.

use crate::error::StabilizationError;
use crate::types::MessageKind;
use bytes::Bytes;
use image::codecs::gif::GifDecoder;
use image::{AnimationDecoder, DynamicImage, GenericImageView, ImageFormat, ImageReader};
use std::io::Cursor;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransformLimits {
    pub max_image_dimension: u32,
    pub max_sticker_dimension: u32,
}

impl Default for TransformLimits {
    fn default() -> Self {
        Self {
            max_image_dimension: 1600,
            max_sticker_dimension: 512,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransformedMedia {
    pub bytes: Bytes,
    pub content_type: String,
    pub animated: bool,
    pub reencoded: bool,
}

impl TransformedMedia {
    fn passthrough(bytes: Bytes, content_type: String, animated: bool) -> Self {
        Self {
            bytes,
            content_type,
            animated,
            reencoded: false,
        }
    }
}

pub fn sniff_content_type(data: &[u8]) -> Option<&'static str> {
    if data.len() >= 12 && &data[0..4] == b"RIFF" && &data[8..12] == b"WEBP" {
        return Some("image/webp");
    }
    if data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a") {
        return Some("image/gif");
    }
    if data.starts_with(&[0x89, b'P', b'N', b'G']) {
        return Some("image/png");
    }
    if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return Some("image/jpeg");
    }
    None
}

/// Walks the RIFF chunks looking for the VP8X animation flag or animation chunks.
pub fn is_animated_webp(data: &[u8]) -> bool {
    if sniff_content_type(data) != Some("image/webp") {
        return false;
    }
    let mut offset = 12;
    while offset + 8 <= data.len() {
        let fourcc = &data[offset..offset + 4];
        let size = u32::from_le_bytes([
            data[offset + 4],
            data[offset + 5],
            data[offset + 6],
            data[offset + 7],
        ]) as usize;
        let payload = offset + 8;
        match fourcc {
            b"VP8X" => {
                if data.get(payload).is_some_and(|flags| flags & 0x02 != 0) {
                    return true;
                }
            }
            b"ANIM" | b"ANMF" => return true,
            _ => {}
        }
        // Chunks are padded to an even length.
        offset = payload.saturating_add(size).saturating_add(size & 1);
    }
    false
}

pub fn is_animated_gif(data: &[u8]) -> bool {
    if sniff_content_type(data) != Some("image/gif") {
        return false;
    }
    match GifDecoder::new(Cursor::new(data)) {
        Ok(decoder) => decoder.into_frames().take(2).filter(|f| f.is_ok()).count() > 1,
        Err(_) => false,
    }
}

pub fn is_animated(data: &[u8]) -> bool {
    is_animated_webp(data) || is_animated_gif(data)
}

pub fn normalize_media(
    kind: MessageKind,
    bytes: Bytes,
    mime_hint: Option<&str>,
    limits: &TransformLimits,
) -> Result<TransformedMedia, StabilizationError> {
    if !kind.carries_media() {
        return Err(StabilizationError::UnsupportedMediaKind(kind.as_str().to_string()));
    }

    let content_type = sniff_content_type(&bytes)
        .map(str::to_string)
        .or_else(|| mime_hint.map(str::to_string))
        .unwrap_or_else(|| "application/octet-stream".to_string());

    let max_dimension = match kind {
        MessageKind::Image => limits.max_image_dimension,
        MessageKind::Sticker => limits.max_sticker_dimension,
        _ => return Ok(TransformedMedia::passthrough(bytes, content_type, false)),
    };

    if is_animated(&bytes) {
        debug!(kind = kind.as_str(), "keeping animated media as-is");
        return Ok(TransformedMedia::passthrough(bytes, content_type, true));
    }

    match downscale(&bytes, max_dimension) {
        Ok(Some((data, content_type))) => Ok(TransformedMedia {
            bytes: Bytes::from(data),
            content_type: content_type.to_string(),
            animated: false,
            reencoded: true,
        }),
        Ok(None) => Ok(TransformedMedia::passthrough(bytes, content_type, false)),
        Err(err) => {
            warn!(kind = kind.as_str(), "storing media unmodified: {err}");
            Ok(TransformedMedia::passthrough(bytes, content_type, false))
        }
    }
}

/// Returns `None` when the image already fits.
fn downscale(data: &[u8], max_dimension: u32) -> image::ImageResult<Option<(Vec<u8>, &'static str)>> {
    let reader = ImageReader::new(Cursor::new(data)).with_guessed_format()?;
    let format = reader.format();
    let img = reader.decode()?;

    let (width, height) = img.dimensions();
    if max_dimension == 0 || (width <= max_dimension && height <= max_dimension) {
        return Ok(None);
    }
    let resized = img.resize(max_dimension, max_dimension, image::imageops::FilterType::Lanczos3);

    // Stay in the source format so the object key's extension keeps matching the bytes.
    let (format, content_type, resized) = match format {
        Some(ImageFormat::Png) => (ImageFormat::Png, "image/png", resized),
        Some(ImageFormat::WebP) => (ImageFormat::WebP, "image/webp", to_rgb_or_rgba(resized)),
        Some(ImageFormat::Gif) => (
            ImageFormat::Gif,
            "image/gif",
            DynamicImage::ImageRgba8(resized.to_rgba8()),
        ),
        _ => (
            ImageFormat::Jpeg,
            "image/jpeg",
            DynamicImage::ImageRgb8(resized.to_rgb8()),
        ),
    };
    let mut output = Cursor::new(Vec::new());
    resized.write_to(&mut output, format)?;
    Ok(Some((output.into_inner(), content_type)))
}

fn to_rgb_or_rgba(img: DynamicImage) -> DynamicImage {
    match img {
        DynamicImage::ImageRgb8(_) | DynamicImage::ImageRgba8(_) => img,
        other => DynamicImage::ImageRgba8(other.to_rgba8()),
    }
}
