use image::{DynamicImage, GenericImageView, RgbaImage};
use image_hasher::{Hasher, HasherConfig};
use thiserror::Error;

use crate::core::fingerprint::Fingerprint;
use crate::settings::HashConfig;

#[derive(Debug, Error)]
pub enum HashError {
    #[error("Bitmap cannot be decoded: {message}")]
    Decode { message: String },

    #[error("Hash computation failed: {message}")]
    ComputationFailed { message: String },
}

/// Builds the hasher described by `config`.
pub fn build_hasher(config: &HashConfig) -> Hasher {
    let (width, height) = config.size;
    let mut hasher_config = HasherConfig::new()
        .hash_size(width, height)
        .hash_alg(config.alg.to_hash_alg())
        .resize_filter(config.resize_filter.to_filter_type());
    if config.alg.uses_dct() {
        hasher_config = hasher_config.preproc_dct();
    }
    hasher_config.to_hasher()
}

/// Perceptual fingerprint of `bitmap`. Pure: the same bitmap and config always give the same bits.
pub fn compute_hash(bitmap: &DynamicImage, config: &HashConfig) -> Result<Fingerprint, HashError> {
    compute_hash_with(&build_hasher(config), bitmap, config)
}

/// Same as [`compute_hash`] with a prebuilt hasher, for hashing many bitmaps with one config.
pub fn compute_hash_with(
    hasher: &Hasher,
    bitmap: &DynamicImage,
    config: &HashConfig,
) -> Result<Fingerprint, HashError> {
    let (width, height) = bitmap.dimensions();
    if width == 0 || height == 0 {
        return Err(HashError::Decode {
            message: format!("zero-dimension bitmap {}x{}", width, height),
        });
    }

    let hash = hasher.hash_image(bitmap);
    Fingerprint::from_bytes(config.bits, hash.as_bytes().to_vec()).ok_or_else(|| {
        HashError::ComputationFailed {
            message: format!(
                "expected {} bits, hasher produced {} bytes",
                config.bits,
                hash.as_bytes().len()
            ),
        }
    })
}

/// Wraps a raw RGBA buffer, rejecting buffers that do not match `width * height * 4`.
pub fn bitmap_from_rgba(width: u32, height: u32, rgba: Vec<u8>) -> Result<DynamicImage, HashError> {
    let expected = width as usize * height as usize * 4;
    if width == 0 || height == 0 || rgba.len() != expected {
        return Err(HashError::Decode {
            message: format!(
                "RGBA buffer of {} bytes does not match {}x{}",
                rgba.len(),
                width,
                height
            ),
        });
    }
    RgbaImage::from_raw(width, height, rgba)
        .map(DynamicImage::ImageRgba8)
        .ok_or_else(|| HashError::Decode {
            message: "RGBA buffer rejected".to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{AdvancedSettings, HashAlgorithm, HashSize, ResizeFilter};
    use image::{ImageBuffer, Rgb};

    fn config(alg: HashAlgorithm, size: HashSize) -> HashConfig {
        let mut settings = AdvancedSettings::default();
        settings.duplicates.hash_alg = alg;
        settings.duplicates.hash_size = size;
        settings.hash_config()
    }

    fn gradient(width: u32, height: u32, invert: bool) -> DynamicImage {
        let img = ImageBuffer::from_fn(width, height, |x, _y| {
            let v = ((x * 255) / width.max(1)) as u8;
            let v = if invert { 255 - v } else { v };
            Rgb([v, v, v])
        });
        DynamicImage::ImageRgb8(img)
    }

    const ALGS: [HashAlgorithm; 3] = [
        HashAlgorithm::Blockhash,
        HashAlgorithm::Phash,
        HashAlgorithm::Dhash,
    ];
    const SIZES: [HashSize; 3] = [HashSize::S8x8, HashSize::S16x16, HashSize::S32x32];

    #[test]
    fn test_output_length_matches_hash_size() {
        let img = gradient(256, 192, false);
        for alg in ALGS {
            for size in SIZES {
                let cfg = config(alg, size);
                let fp = compute_hash(&img, &cfg).unwrap();
                assert_eq!(fp.bit_len(), size.bits(), "{:?} {:?}", alg, size);
            }
        }
    }

    #[test]
    fn test_hash_is_deterministic() {
        let img = gradient(300, 200, false);
        for alg in ALGS {
            let cfg = config(alg, HashSize::S16x16);
            let first = compute_hash(&img, &cfg).unwrap();
            let second = compute_hash(&img, &cfg).unwrap();
            assert_eq!(first, second);
            assert_eq!(first.distance(&second), Some(0));
        }
    }

    #[test]
    fn test_identical_pixels_in_different_buffers_match() {
        let cfg = config(HashAlgorithm::Blockhash, HashSize::S16x16);
        let a = compute_hash(&gradient(320, 240, false), &cfg).unwrap();
        let b = compute_hash(&gradient(320, 240, false), &cfg).unwrap();
        assert_eq!(a.distance(&b), Some(0));
    }

    #[test]
    fn test_inverted_image_is_far_away() {
        let cfg = config(HashAlgorithm::Blockhash, HashSize::S16x16);
        let a = compute_hash(&gradient(320, 240, false), &cfg).unwrap();
        let b = compute_hash(&gradient(320, 240, true), &cfg).unwrap();
        assert!(a.distance(&b).unwrap() > cfg.effective_threshold);
    }

    #[test]
    fn test_resize_filter_is_applied() {
        let img = gradient(333, 111, false);
        let mut settings = AdvancedSettings::default();
        settings.duplicates.hash_alg = HashAlgorithm::Dhash;
        settings.duplicates.resize_filter = ResizeFilter::Lanczos3;
        let fp = compute_hash(&img, &settings.hash_config()).unwrap();
        assert_eq!(fp.bit_len(), 256);
    }

    #[test]
    fn test_zero_dimension_is_decode_error() {
        let cfg = config(HashAlgorithm::Blockhash, HashSize::S8x8);
        let empty = DynamicImage::new_rgba8(0, 0);
        assert!(matches!(
            compute_hash(&empty, &cfg),
            Err(HashError::Decode { .. })
        ));
    }

    #[test]
    fn test_bitmap_from_rgba_validates_buffer() {
        assert!(bitmap_from_rgba(2, 2, vec![0u8; 16]).is_ok());
        assert!(matches!(
            bitmap_from_rgba(2, 2, vec![0u8; 15]),
            Err(HashError::Decode { .. })
        ));
        assert!(bitmap_from_rgba(0, 4, Vec::new()).is_err());
    }
}
