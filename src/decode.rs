//! Decoders turn the raw bytes of a cache entry into an image.  The
//! cache treats decoded images as immutable: every caller gets the
//! same `Arc`.
use image::DynamicImage;

use crate::error::Error;
use crate::error::Result;

/// Turns raw bytes into decoded images.
pub trait Decoder: Send + Sync {
    /// The decoded image type.
    type Image: Send + Sync + 'static;

    /// Decodes `bytes`, or fails with [`Error::Decode`].
    fn decode(&self, bytes: &[u8]) -> Result<Self::Image>;

    /// Returns what `image` counts against the memory budget, if the
    /// cache has one.
    fn cost(&self, _image: &Self::Image) -> usize {
        1
    }
}

/// Decodes any format the `image` crate recognises; costs are pixel
/// buffer sizes in bytes.
#[derive(Clone, Copy, Debug, Default)]
pub struct ImageDecoder;

impl Decoder for ImageDecoder {
    type Image = DynamicImage;

    fn decode(&self, bytes: &[u8]) -> Result<DynamicImage> {
        image::load_from_memory(bytes).map_err(|e| Error::Decode(e.to_string()))
    }

    fn cost(&self, image: &DynamicImage) -> usize {
        image.as_bytes().len()
    }
}
