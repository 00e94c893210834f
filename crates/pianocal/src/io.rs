//! Conversions between `image::GrayImage` and the workspace image types.

use crate::PianocalError;
use image::ImageReader;
use pianocal_core::{GrayImage, GrayImageView};
use std::path::Path;

/// Decode a photo from disk into 8-bit grayscale.
pub fn load_luma(path: impl AsRef<Path>) -> Result<image::GrayImage, PianocalError> {
    Ok(ImageReader::open(path)?.decode()?.to_luma8())
}

/// Decode a photo from disk into a workspace [`GrayImage`].
pub fn load_gray(path: impl AsRef<Path>) -> Result<GrayImage, PianocalError> {
    Ok(from_luma(&load_luma(path)?))
}

/// Borrow an `image::GrayImage` as a lightweight view.
pub fn gray_view(img: &image::GrayImage) -> GrayImageView<'_> {
    GrayImageView {
        width: img.width() as usize,
        height: img.height() as usize,
        data: img.as_raw(),
    }
}

pub fn from_luma(img: &image::GrayImage) -> GrayImage {
    GrayImage {
        width: img.width() as usize,
        height: img.height() as usize,
        data: img.as_raw().clone(),
    }
}

pub fn to_luma(img: &GrayImage) -> Result<image::GrayImage, PianocalError> {
    let expected = img.width * img.height;
    image::GrayImage::from_raw(img.width as u32, img.height as u32, img.data.clone()).ok_or(
        PianocalError::InvalidGrayBuffer {
            expected,
            got: img.data.len(),
        },
    )
}

/// Encode `img` to disk; the format follows the file extension.
pub fn save_gray(path: impl AsRef<Path>, img: &GrayImage) -> Result<(), PianocalError> {
    to_luma(img)?.save(path)?;
    Ok(())
}
