//! YUYV (4:2:2) to JPEG
//!
//! Layout: `[Y0 U Y1 V]` per pixel pair; both luma samples share one chroma
//! pair. Conversion uses full-range BT.601 coefficients in 16.16 fixed point.

use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;

use super::CameraError;

/// Expand packed YUYV to interleaved RGB8
pub fn yuyv_to_rgb(data: &[u8], width: u32, height: u32) -> Result<Vec<u8>, CameraError> {
    let pixels = width as usize * height as usize;
    let expected = pixels * 2;
    if data.len() < expected {
        return Err(CameraError::ShortFrame {
            got: data.len(),
            expected,
        });
    }

    let mut rgb = Vec::with_capacity(pixels * 3);
    for chunk in data[..expected].chunks_exact(4) {
        let (y0, u, y1, v) = (chunk[0], chunk[1], chunk[2], chunk[3]);
        rgb.extend_from_slice(&ycbcr_to_rgb(y0, u, v));
        rgb.extend_from_slice(&ycbcr_to_rgb(y1, u, v));
    }
    Ok(rgb)
}

/// Software-encode one YUYV frame to JPEG
pub fn encode_yuyv_jpeg(
    data: &[u8],
    width: u32,
    height: u32,
    quality: u8,
) -> Result<Vec<u8>, CameraError> {
    let rgb = yuyv_to_rgb(data, width, height)?;
    let mut out = Vec::with_capacity(rgb.len() / 8);
    JpegEncoder::new_with_quality(&mut out, quality).encode(
        &rgb,
        width,
        height,
        ExtendedColorType::Rgb8,
    )?;
    Ok(out)
}

fn ycbcr_to_rgb(y: u8, cb: u8, cr: u8) -> [u8; 3] {
    let y = i32::from(y) << 16;
    let cb = i32::from(cb) - 128;
    let cr = i32::from(cr) - 128;

    // 1.402, 0.344136, 0.714136, 1.772 scaled by 65536
    let r = (y + 91881 * cr + (1 << 15)) >> 16;
    let g = (y - 22554 * cb - 46802 * cr + (1 << 15)) >> 16;
    let b = (y + 116130 * cb + (1 << 15)) >> 16;

    [clamp(r), clamp(g), clamp(b)]
}

fn clamp(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}
