use bytes::Bytes;
use image::codecs::gif::GifEncoder;
use image::{Delay, Frame, GenericImageView, ImageFormat, Rgba, RgbaImage};
use std::io::Cursor;
use wa_inbox::media::storage::{content_type_for_extension, media_key};
use wa_inbox::media::transform::{
    is_animated, is_animated_gif, normalize_media, sniff_content_type, TransformLimits,
};
use wa_inbox::types::MessageKind;

fn limits(max: u32) -> TransformLimits {
    TransformLimits {
        max_image_dimension: max,
        max_sticker_dimension: max,
    }
}

fn encode(width: u32, height: u32, format: ImageFormat) -> Vec<u8> {
    let img = image::DynamicImage::ImageRgb8(image::RgbImage::from_pixel(
        width,
        height,
        image::Rgb([200, 30, 30]),
    ));
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, format).unwrap();
    out.into_inner()
}

fn two_frame_gif() -> Vec<u8> {
    let mut buf = Vec::new();
    {
        let mut encoder = GifEncoder::new(&mut buf);
        let frames = [Rgba([255, 0, 0, 255]), Rgba([0, 0, 255, 255])].map(|color| {
            Frame::from_parts(
                RgbaImage::from_pixel(8, 8, color),
                0,
                0,
                Delay::from_numer_denom_ms(100, 1),
            )
        });
        encoder.encode_frames(frames).unwrap();
    }
    buf
}

#[test]
fn test_sniff_content_type() {
    assert_eq!(sniff_content_type(&encode(2, 2, ImageFormat::Png)), Some("image/png"));
    assert_eq!(sniff_content_type(&encode(2, 2, ImageFormat::Jpeg)), Some("image/jpeg"));
    assert_eq!(sniff_content_type(b"plain text"), None);
}

#[test]
fn test_large_png_downscaled_keeps_format() {
    let original = encode(64, 32, ImageFormat::Png);
    let out = normalize_media(MessageKind::Image, Bytes::from(original), Some("image/png"), &limits(16))
        .unwrap();
    assert!(out.reencoded);
    assert_eq!(out.content_type, "image/png");
    let decoded = image::load_from_memory(&out.bytes).unwrap();
    assert_eq!(decoded.dimensions(), (16, 8));
}

#[test]
fn test_large_jpeg_downscaled() {
    let original = encode(40, 40, ImageFormat::Jpeg);
    let out = normalize_media(MessageKind::Image, Bytes::from(original), None, &limits(10)).unwrap();
    assert!(out.reencoded);
    assert_eq!(out.content_type, "image/jpeg");
    assert_eq!(image::load_from_memory(&out.bytes).unwrap().dimensions(), (10, 10));
}

#[test]
fn test_large_static_gif_stays_gif_and_matches_key() {
    let img = image::DynamicImage::ImageRgba8(RgbaImage::from_pixel(64, 4, Rgba([10, 200, 10, 255])));
    let mut original = Cursor::new(Vec::new());
    img.write_to(&mut original, ImageFormat::Gif).unwrap();

    let out = normalize_media(
        MessageKind::Image,
        Bytes::from(original.into_inner()),
        Some("image/gif"),
        &limits(16),
    )
    .unwrap();
    assert!(out.reencoded);
    assert!(!out.animated);
    assert_eq!(out.content_type, "image/gif");
    assert_eq!(sniff_content_type(&out.bytes), Some("image/gif"));
    assert_eq!(image::load_from_memory(&out.bytes).unwrap().dimensions(), (16, 1));

    let key = media_key("main", "GIF1", MessageKind::Image, Some("image/gif"));
    let ext = key.rsplit('.').next().unwrap();
    assert_eq!(content_type_for_extension(ext), out.content_type);
}

#[test]
fn test_small_image_untouched() {
    let original = Bytes::from(encode(8, 8, ImageFormat::Png));
    let out = normalize_media(MessageKind::Image, original.clone(), None, &limits(16)).unwrap();
    assert!(!out.reencoded);
    assert_eq!(out.bytes, original);
}

#[test]
fn test_animated_gif_passthrough() {
    let gif = two_frame_gif();
    assert!(is_animated_gif(&gif));
    assert!(is_animated(&gif));

    let original = Bytes::from(gif);
    let out = normalize_media(MessageKind::Sticker, original.clone(), Some("image/gif"), &limits(2)).unwrap();
    assert!(out.animated);
    assert!(!out.reencoded);
    assert_eq!(out.bytes, original);
    assert_eq!(out.content_type, "image/gif");
}

#[test]
fn test_single_frame_gif_not_animated() {
    let gif = encode(4, 4, ImageFormat::Gif);
    assert!(!is_animated_gif(&gif));
}

#[test]
fn test_animated_webp_sticker_passthrough() {
    let mut body = b"WEBP".to_vec();
    body.extend_from_slice(b"VP8X");
    body.extend_from_slice(&10u32.to_le_bytes());
    body.extend_from_slice(&[0x12, 0, 0, 0, 0x1f, 0x01, 0, 0x1f, 0x01, 0]);
    body.extend_from_slice(b"ANIM");
    body.extend_from_slice(&6u32.to_le_bytes());
    body.extend_from_slice(&[0; 6]);
    let mut webp = b"RIFF".to_vec();
    webp.extend_from_slice(&(body.len() as u32).to_le_bytes());
    webp.extend_from_slice(&body);

    let original = Bytes::from(webp);
    let out = normalize_media(MessageKind::Sticker, original.clone(), None, &limits(16)).unwrap();
    assert!(out.animated);
    assert_eq!(out.bytes, original);
    assert_eq!(out.content_type, "image/webp");
}

#[test]
fn test_undecodable_image_stored_as_is() {
    let original = Bytes::from_static(b"\xff\xd8\xffnot really a jpeg");
    let out = normalize_media(MessageKind::Image, original.clone(), Some("image/jpeg"), &limits(16)).unwrap();
    assert!(!out.reencoded);
    assert_eq!(out.bytes, original);
}

#[test]
fn test_audio_uses_mime_hint() {
    let out = normalize_media(
        MessageKind::Audio,
        Bytes::from_static(b"OggS\0\0"),
        Some("audio/ogg; codecs=opus"),
        &limits(16),
    )
    .unwrap();
    assert_eq!(out.content_type, "audio/ogg; codecs=opus");
}
