use std::io::Cursor;

use image::codecs::png::{CompressionType, FilterType as PngFilter, PngEncoder};
use image::imageops::FilterType;
use image::{
    DynamicImage, GenericImageView, ImageBuffer, ImageDecoder, ImageEncoder, ImageReader, Pixel,
    Primitive,
};

use crate::error::{Error, Result};

pub const MAX_DIMENSION: u32 = 1024;
pub const THUMBNAIL_DIMENSION: u32 = 512;
/// Grid spacing, in pixels, of the transparency probe.
pub const ALPHA_SAMPLE_STRIDE: usize = 10;

#[derive(Debug, Clone, Copy)]
pub struct TransformConfig {
    pub max_dim: u32,
    pub thumb_dim: u32,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            max_dim: MAX_DIMENSION,
            thumb_dim: THUMBNAIL_DIMENSION,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Png,
}

impl OutputFormat {
    /// Opaque and transparent images alike are stored as PNG: lossless, and
    /// it carries an alpha channel when the pixel data has one.
    pub fn for_alpha(_has_alpha: bool) -> Self {
        OutputFormat::Png
    }

    pub fn mime(self) -> &'static str {
        match self {
            OutputFormat::Png => "image/png",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Png => "png",
        }
    }
}

#[derive(Debug, Clone)]
pub struct EncodedImage {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone)]
pub struct TransformedImage {
    pub full: EncodedImage,
    pub thumbnail: EncodedImage,
    pub format: OutputFormat,
    pub has_alpha: bool,
}

impl TransformedImage {
    pub fn mime(&self) -> &'static str {
        self.format.mime()
    }
}

pub struct ImageTransform {
    config: TransformConfig,
}

impl ImageTransform {
    pub fn new(config: TransformConfig) -> Self {
        Self { config }
    }

    pub fn transform(&self, bytes: &[u8]) -> Result<TransformedImage> {
        let image = decode_oriented(bytes)?;
        if image.width() == 0 || image.height() == 0 {
            return Err(Error::Decode("image has no pixels".into()));
        }

        let has_alpha = has_transparency(&image);
        // Normalise before resampling so the filter never drops the alpha channel.
        let canonical = if has_alpha {
            DynamicImage::ImageRgba8(image.to_rgba8())
        } else {
            DynamicImage::ImageRgb8(image.to_rgb8())
        };
        let full = fit_within(canonical, self.config.max_dim);
        let thumbnail = fit_within(full.clone(), self.config.thumb_dim);

        let format = OutputFormat::for_alpha(has_alpha);
        Ok(TransformedImage {
            full: encode(&full, format)?,
            thumbnail: encode(&thumbnail, format)?,
            format,
            has_alpha,
        })
    }
}

impl Default for ImageTransform {
    fn default() -> Self {
        Self::new(TransformConfig::default())
    }
}

fn decode_oriented(bytes: &[u8]) -> Result<DynamicImage> {
    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|err| Error::Decode(err.to_string()))?;
    let mut decoder = reader
        .into_decoder()
        .map_err(|err| Error::Decode(err.to_string()))?;
    let orientation = decoder
        .orientation()
        .map_err(|err| Error::Decode(err.to_string()))?;
    let mut image =
        DynamicImage::from_decoder(decoder).map_err(|err| Error::Decode(err.to_string()))?;
    image.apply_orientation(orientation);
    Ok(image)
}

/// Probes alpha on a sparse grid plus the whole last row and column.
pub fn has_transparency(image: &DynamicImage) -> bool {
    match image {
        DynamicImage::ImageLumaA8(buffer) => sample_alpha(buffer),
        DynamicImage::ImageRgba8(buffer) => sample_alpha(buffer),
        DynamicImage::ImageLumaA16(buffer) => sample_alpha(buffer),
        DynamicImage::ImageRgba16(buffer) => sample_alpha(buffer),
        DynamicImage::ImageRgba32F(buffer) => sample_alpha(buffer),
        _ => false,
    }
}

fn sample_alpha<P: Pixel>(buffer: &ImageBuffer<P, Vec<P::Subpixel>>) -> bool {
    let (width, height) = buffer.dimensions();
    if width == 0 || height == 0 {
        return false;
    }
    let opaque = P::Subpixel::DEFAULT_MAX_VALUE;
    let translucent = |x: u32, y: u32| {
        buffer
            .get_pixel(x, y)
            .channels()
            .last()
            .is_some_and(|alpha| *alpha < opaque)
    };

    let grid = (0..height)
        .step_by(ALPHA_SAMPLE_STRIDE)
        .any(|y| (0..width).step_by(ALPHA_SAMPLE_STRIDE).any(|x| translucent(x, y)));
    grid || (0..width).any(|x| translucent(x, height - 1))
        || (0..height).any(|y| translucent(width - 1, y))
}

/// Shrinks `image` so its longest side is at most `max_dim`. Never enlarges.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn fit_within(image: DynamicImage, max_dim: u32) -> DynamicImage {
    let (width, height) = image.dimensions();
    let longest = width.max(height);
    if max_dim == 0 || longest <= max_dim {
        return image;
    }
    let scale = f64::from(max_dim) / f64::from(longest);
    let next_width = ((f64::from(width) * scale).round() as u32).clamp(1, max_dim);
    let next_height = ((f64::from(height) * scale).round() as u32).clamp(1, max_dim);
    image.resize_exact(next_width, next_height, FilterType::Lanczos3)
}

fn encode(image: &DynamicImage, format: OutputFormat) -> Result<EncodedImage> {
    let mut bytes = Vec::new();
    match format {
        OutputFormat::Png => {
            let encoder =
                PngEncoder::new_with_quality(&mut bytes, CompressionType::Best, PngFilter::Adaptive);
            encoder
                .write_image(
                    image.as_bytes(),
                    image.width(),
                    image.height(),
                    image.color().into(),
                )
                .map_err(|err| Error::Storage(format!("png encode failed: {err}")))?;
        }
    }
    Ok(EncodedImage {
        bytes,
        width: image.width(),
        height: image.height(),
    })
}
