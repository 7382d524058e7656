use anyhow::{anyhow, Result};
use image::imageops::{self, FilterType};
use image::RgbImage;

use crate::frame::{PixelFormat, RawImage};

/// Convert a decoded picture to RGB24 and resize it to the output resolution.
pub(crate) fn normalize_frame(raw: RawImage, width: u32, height: u32) -> Result<RgbImage> {
    if width == 0 || height == 0 {
        return Err(anyhow!("output resolution {}x{} is empty", width, height));
    }
    let rgb = normalize_to_rgb(raw.data, raw.width, raw.height, raw.format)?;
    let image = RgbImage::from_raw(raw.width, raw.height, rgb)
        .ok_or_else(|| anyhow!("RGB buffer does not match {}x{}", raw.width, raw.height))?;
    if image.width() == width && image.height() == height {
        return Ok(image);
    }
    Ok(imageops::resize(&image, width, height, FilterType::Triangle))
}

pub(crate) fn normalize_to_rgb(
    pixels: Vec<u8>,
    width: u32,
    height: u32,
    format: PixelFormat,
) -> Result<Vec<u8>> {
    match format {
        PixelFormat::Rgb24 => {
            check_packed_len(&pixels, width, height, "RGB")?;
            Ok(pixels)
        }
        PixelFormat::Bgr24 => {
            check_packed_len(&pixels, width, height, "BGR")?;
            let mut pixels = pixels;
            for px in pixels.chunks_exact_mut(3) {
                px.swap(0, 2);
            }
            Ok(pixels)
        }
        PixelFormat::Nv12 => nv12_to_rgb(&pixels, width, height),
    }
}

fn check_packed_len(pixels: &[u8], width: u32, height: u32, label: &str) -> Result<()> {
    if width == 0 || height == 0 {
        return Err(anyhow!("{} frame has empty dimensions", label));
    }
    let expected = width
        .checked_mul(height)
        .and_then(|v| v.checked_mul(3))
        .ok_or_else(|| anyhow!("{} frame dimensions overflow", label))? as usize;
    if pixels.len() != expected {
        return Err(anyhow!(
            "{} frame length mismatch: expected {}, got {}",
            label,
            expected,
            pixels.len()
        ));
    }
    Ok(())
}

fn nv12_to_rgb(pixels: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let w = width as usize;
    let h = height as usize;
    if w == 0 || h == 0 {
        return Err(anyhow!("NV12 frame has empty dimensions"));
    }
    let y_plane = w
        .checked_mul(h)
        .ok_or_else(|| anyhow!("NV12 frame dimensions overflow"))?;
    let expected = y_plane
        .checked_add(y_plane / 2)
        .ok_or_else(|| anyhow!("NV12 frame dimensions overflow"))?;
    if pixels.len() != expected {
        return Err(anyhow!(
            "NV12 frame length mismatch: expected {}, got {}",
            expected,
            pixels.len()
        ));
    }

    let mut rgb = vec![0u8; y_plane * 3];
    for j in 0..h {
        for i in 0..w {
            let y = pixels[j * w + i] as f32;
            let uv_index = y_plane + (j / 2) * w + (i / 2) * 2;
            let u = pixels[uv_index] as f32 - 128.0;
            let v = pixels[uv_index + 1] as f32 - 128.0;

            let r = y + 1.402_f32 * v;
            let g = y - 0.344_136_f32 * u - 0.714_136_f32 * v;
            let b = y + 1.772_f32 * u;

            let offset = (j * w + i) * 3;
            rgb[offset] = clamp_to_u8(r);
            rgb[offset + 1] = clamp_to_u8(g);
            rgb[offset + 2] = clamp_to_u8(b);
        }
    }

    Ok(rgb)
}

fn clamp_to_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nv12_conversion_produces_gray() -> Result<()> {
        let y_plane = vec![128u8; 4];
        let uv_plane = vec![128u8; 2];
        let nv12 = [y_plane, uv_plane].concat();

        let rgb = normalize_to_rgb(nv12, 2, 2, PixelFormat::Nv12)?;
        assert_eq!(rgb, vec![128u8; 12]);
        Ok(())
    }

    #[test]
    fn bgr_is_swapped_to_rgb() -> Result<()> {
        let rgb = normalize_to_rgb(vec![1, 2, 3, 4, 5, 6], 2, 1, PixelFormat::Bgr24)?;
        assert_eq!(rgb, vec![3, 2, 1, 6, 5, 4]);
        Ok(())
    }

    #[test]
    fn frames_are_resized_to_output_resolution() -> Result<()> {
        let raw = RawImage::rgb(vec![200u8; 32 * 24 * 3], 32, 24);
        let image = normalize_frame(raw, 16, 12)?;
        assert_eq!(image.dimensions(), (16, 12));
        assert_eq!(image.get_pixel(5, 5).0, [200, 200, 200]);
        Ok(())
    }

    #[test]
    fn truncated_buffers_are_rejected() {
        let raw = RawImage::rgb(vec![0u8; 10], 4, 4);
        assert!(normalize_frame(raw, 4, 4).is_err());
    }
}
