//! Images: decoded pixel buffers shared through a [`Catalog`].
//!
//! An [`ImageKey`] names either a file on disk or another image key plus a
//! transform (rotation and target size). Loading a derived key checks its
//! source out of the same catalog, transforms the pixels and checks the
//! source back in straight away: derived entries never hold their source.
//! Pixels are reference counted, so a derived image that needs no
//! transform shares the source buffer, which stays valid after the source
//! entry is evicted.

use crate::catalog::{Catalog, CheckoutError};
use crate::handle::Handle;
use crate::key::{encode_json, CatalogKey, KeyError};
use core::fmt;
use image::imageops::{self, FilterType};
use image::{Rgba, RgbaImage};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Shared decoded pixels.
pub type Pixels = Arc<RgbaImage>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ImageLabel {
    /// Path of an image file.
    File(String),
    /// Encoding of the source [`ImageKey`].
    Derived(String),
}

/// Identity of an image: where its pixels come from, its rotation in
/// degrees (counter-clockwise) and its target size. `None` for a dimension
/// keeps the natural size of the source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageKey {
    label: ImageLabel,
    angle: f64,
    width: Option<u32>,
    height: Option<u32>,
}

fn checked_angle(angle: f64) -> Result<f64, KeyError> {
    if !angle.is_finite() {
        return Err(KeyError::NonFiniteAngle);
    }
    // -0.0 and 0.0 are the same rotation and must encode alike.
    Ok(if angle == 0.0 { 0.0 } else { angle })
}

impl ImageKey {
    /// The image file at `path`, untransformed.
    pub fn file(path: impl Into<String>) -> Self {
        Self::file_sized(path, None, None)
    }

    /// The image file at `path`, scaled to the given dimensions.
    pub fn file_sized(path: impl Into<String>, width: Option<u32>, height: Option<u32>) -> Self {
        Self {
            label: ImageLabel::File(path.into()),
            angle: 0.0,
            width,
            height,
        }
    }

    /// `source` rotated by `angle` degrees and scaled to the given size.
    pub fn derived(
        source: &ImageKey,
        angle: f64,
        width: Option<u32>,
        height: Option<u32>,
    ) -> Result<Self, KeyError> {
        Ok(Self {
            label: ImageLabel::Derived(source.encode()),
            angle: checked_angle(angle)?,
            width,
            height,
        })
    }

    pub fn with_angle(mut self, angle: f64) -> Result<Self, KeyError> {
        self.angle = checked_angle(angle)?;
        Ok(self)
    }

    /// Parse a key back from its encoding.
    pub fn decode(encoded: &str) -> Result<Self, KeyError> {
        let mut key: ImageKey =
            serde_json::from_str(encoded).map_err(|e| KeyError::Malformed(e.to_string()))?;
        key.angle = checked_angle(key.angle)?;
        Ok(key)
    }

    pub fn label(&self) -> &ImageLabel {
        &self.label
    }

    pub fn angle(&self) -> f64 {
        self.angle
    }

    pub fn width(&self) -> Option<u32> {
        self.width
    }

    pub fn height(&self) -> Option<u32> {
        self.height
    }

    /// File path for file keys.
    pub fn path(&self) -> Option<&str> {
        match &self.label {
            ImageLabel::File(path) => Some(path),
            ImageLabel::Derived(_) => None,
        }
    }

    /// Key of the source image for derived keys.
    pub fn source(&self) -> Result<Option<ImageKey>, KeyError> {
        match &self.label {
            ImageLabel::File(_) => Ok(None),
            ImageLabel::Derived(inner) => ImageKey::decode(inner).map(Some),
        }
    }
}

impl CatalogKey for ImageKey {
    fn encode(&self) -> String {
        encode_json(self).expect("image keys hold only strings, finite floats and integers")
    }
}

#[derive(Debug, Error)]
pub enum ImageError {
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error(transparent)]
    Checkout(#[from] CheckoutError),
}

/// Image loader backed by its own catalog.
#[derive(Clone)]
pub struct Images {
    catalog: Catalog<ImageKey, Pixels>,
}

impl Default for Images {
    fn default() -> Self {
        Self::new()
    }
}

impl Images {
    pub fn new() -> Self {
        Self {
            catalog: Catalog::new(load_image, evict_image),
        }
    }

    pub fn catalog(&self) -> &Catalog<ImageKey, Pixels> {
        &self.catalog
    }

    /// Load the image file at `path`.
    pub fn load(&self, path: impl Into<String>) -> Result<Image, CheckoutError> {
        self.open(ImageKey::file(path))
    }

    /// Load the image file at `path` scaled to the given size.
    pub fn load_sized(
        &self,
        path: impl Into<String>,
        width: Option<u32>,
        height: Option<u32>,
    ) -> Result<Image, CheckoutError> {
        self.open(ImageKey::file_sized(path, width, height))
    }

    /// A rotated and/or scaled copy of `source`.
    pub fn transformed(
        &self,
        source: &Image,
        angle: f64,
        width: Option<u32>,
        height: Option<u32>,
    ) -> Result<Image, ImageError> {
        let key = ImageKey::derived(source.key(), angle, width, height)?;
        Ok(self.open(key)?)
    }

    pub fn open(&self, key: ImageKey) -> Result<Image, CheckoutError> {
        let handle = self.catalog.acquire(key)?;
        Ok(Image::new(handle))
    }
}

fn load_image(catalog: &Catalog<ImageKey, Pixels>, key: &ImageKey) -> Option<Pixels> {
    match &key.label {
        ImageLabel::File(path) => {
            let decoded = match image::open(path) {
                Ok(img) => Arc::new(img.into_rgba8()),
                Err(e) => {
                    warn!("could not load image {path}: {e}");
                    return None;
                }
            };
            transform(&decoded, key)
        }
        ImageLabel::Derived(inner) => {
            let source = match ImageKey::decode(inner) {
                Ok(source) => source,
                Err(e) => {
                    warn!("derived image has a bad source key: {e}");
                    return None;
                }
            };
            let pixels = match catalog.checkout(&source) {
                Ok(pixels) => pixels,
                Err(e) => {
                    debug!("source of derived image unavailable: {e}");
                    return None;
                }
            };
            let derived = transform(&pixels, key);
            catalog.checkin(&source);
            derived
        }
    }
}

fn evict_image(key: &ImageKey, pixels: Pixels) {
    debug!(
        "freeing {}x{} image {}",
        pixels.width(),
        pixels.height(),
        key.encode()
    );
}

/// Apply the size and rotation requested by `key` to `src`.
///
/// Returns `src` itself when nothing changes and `None` when the source or
/// the target has no pixels.
fn transform(src: &Pixels, key: &ImageKey) -> Option<Pixels> {
    let (w, h) = src.dimensions();
    if w == 0 || h == 0 {
        return None;
    }
    let (tw, th) = (key.width.unwrap_or(w), key.height.unwrap_or(h));
    if tw == 0 || th == 0 {
        return None;
    }
    let resized = ((tw, th) != (w, h))
        .then(|| imageops::resize(&**src, tw, th, FilterType::Triangle));
    if key.angle == 0.0 {
        return Some(resized.map(Arc::new).unwrap_or_else(|| Arc::clone(src)));
    }
    let base = resized.as_ref().unwrap_or(&**src);
    Some(Arc::new(rotate(base, key.angle)))
}

/// Rotate counter-clockwise by `degrees` into the rotated bounding box.
fn rotate(img: &RgbaImage, degrees: f64) -> RgbaImage {
    let turn = degrees.rem_euclid(360.0);
    if turn == 0.0 {
        return img.clone();
    } else if turn == 90.0 {
        return imageops::rotate270(img);
    } else if turn == 180.0 {
        return imageops::rotate180(img);
    } else if turn == 270.0 {
        return imageops::rotate90(img);
    }

    let (w, h) = (img.width() as f64, img.height() as f64);
    let (sin, cos) = degrees.to_radians().sin_cos();
    // Shave rounding noise so near-integral extents do not grow a pixel.
    let ow = (w * cos.abs() + h * sin.abs() - 1e-6).ceil().max(1.0);
    let oh = (w * sin.abs() + h * cos.abs() - 1e-6).ceil().max(1.0);
    let mut out = RgbaImage::from_pixel(ow as u32, oh as u32, Rgba([0, 0, 0, 0]));
    for (x, y, px) in out.enumerate_pixels_mut() {
        let dx = x as f64 + 0.5 - ow / 2.0;
        let dy = y as f64 + 0.5 - oh / 2.0;
        let sx = cos * dx - sin * dy + w / 2.0;
        let sy = sin * dx + cos * dy + h / 2.0;
        if sx >= 0.0 && sy >= 0.0 && sx < w && sy < h {
            *px = *img.get_pixel(sx as u32, sy as u32);
        }
    }
    out
}

/// A checked-out image.
pub struct Image {
    handle: Handle<ImageKey, Pixels>,
    size: Size,
}

impl Image {
    fn new(handle: Handle<ImageKey, Pixels>) -> Self {
        let size = handle
            .with(|p| Size {
                width: p.width(),
                height: p.height(),
            })
            .unwrap_or_default();
        Self { handle, size }
    }

    /// Width in pixels; 0 once freed.
    pub fn width(&self) -> u32 {
        self.size().width
    }

    /// Height in pixels; 0 once freed.
    pub fn height(&self) -> u32 {
        self.size().height
    }

    /// Size in pixels; zero once freed.
    pub fn size(&self) -> Size {
        if self.is_live() {
            self.size
        } else {
            Size::default()
        }
    }

    pub fn key(&self) -> &ImageKey {
        self.handle.key()
    }

    /// Path of the file this image was loaded from, for file images.
    pub fn path(&self) -> Option<&str> {
        self.key().path()
    }

    /// The pixels, or `None` once freed.
    pub fn pixels(&self) -> Option<Pixels> {
        self.handle.get()
    }

    pub fn is_live(&self) -> bool {
        self.handle.is_live()
    }

    /// Let the catalog know this image no longer uses its pixels.
    pub fn free(&self) -> bool {
        self.handle.free()
    }
}

impl fmt::Display for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key().encode())
    }
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Image")
            .field("key", &self.key().encode())
            .field("size", &self.size())
            .field("live", &self.is_live())
            .finish()
    }
}
