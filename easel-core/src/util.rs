use anyhow::Result;
use base64::{prelude::BASE64_STANDARD, Engine};
use candle_core::{DType, Device, Tensor};
use image::{imageops::FilterType, DynamicImage};

use crate::EaselError;

/// Round down to a multiple of 8 with a floor of 256.
pub fn multiple_of_8(x: u32) -> u32 {
    (x / 8 * 8).max(256)
}

/// Decode base64 image data, with or without a `data:<mime>;base64,` prefix,
/// into an RGB image.
pub fn decode_base64_image(data: &str) -> crate::Result<DynamicImage> {
    let payload = match data.split_once(',') {
        Some((header, rest)) if header.starts_with("data:") => rest,
        _ => data,
    };
    // Line-wrapped payloads are common; whitespace is never part of base64.
    let payload: String = payload.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    let bytes = BASE64_STANDARD
        .decode(payload)
        .map_err(|e| EaselError::InvalidInput(format!("image_data is not valid base64: {e}")))?;
    let image = image::load_from_memory(&bytes)
        .map_err(|e| EaselError::InvalidInput(format!("image_data is not a readable image: {e}")))?;
    Ok(DynamicImage::ImageRgb8(image.to_rgb8()))
}

/// Resize to exactly `width`×`height`.
pub fn fit_image(image: DynamicImage, width: u32, height: u32) -> DynamicImage {
    if image.width() == width && image.height() == height {
        return image;
    }
    image.resize_exact(width, height, FilterType::Lanczos3)
}

/// Converts a tensor with shape (3, height, width) and dtype u8 into an image.
pub fn tensor_to_image(img: &Tensor) -> Result<DynamicImage> {
    let (channels, height, width) = img.dims3()?;
    if channels != 3 {
        anyhow::bail!("tensor_to_image expects an image with 3 channels, got {channels}");
    }
    let img = img.permute((1, 2, 0))?.flatten_all()?;
    let pixels = img.to_vec1::<u8>()?;
    let buffer = image::ImageBuffer::from_raw(width as u32, height as u32, pixels)
        .ok_or_else(|| candle_core::Error::msg("error converting tensor to image buffer"))?;
    Ok(DynamicImage::ImageRgb8(buffer))
}

/// Converts an RGB image into a (1, 3, height, width) tensor scaled to [-1, 1].
pub fn image_to_tensor(img: &DynamicImage, device: &Device, dtype: DType) -> Result<Tensor> {
    let rgb = img.to_rgb8();
    let (width, height) = (rgb.width() as usize, rgb.height() as usize);
    let data = rgb.into_raw();
    let tensor = Tensor::from_vec(data, (height, width, 3), &Device::Cpu)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?
        .affine(2. / 255., -1.)?
        .unsqueeze(0)?;
    Ok(tensor.to_device(device)?.to_dtype(dtype)?)
}

/// Decoded VAE output in [-1, 1] with shape (1, 3, h, w) to an image.
pub fn decoded_to_image(decoded: &Tensor) -> Result<DynamicImage> {
    let decoded = decoded.to_dtype(DType::F32)?;
    let img = ((decoded.clamp(-1f32, 1f32)? + 1.0)? * 127.5)?
        .to_device(&Device::Cpu)?
        .to_dtype(DType::U8)?;
    tensor_to_image(&img.squeeze(0)?)
}
