//! Synthetic page images for tests.

use image::{DynamicImage, ImageOutputFormat, Rgb, RgbImage};
use std::io::Cursor;

pub const PAGE_WIDTH: u32 = 800;
pub const PAGE_HEIGHT: u32 = 1200;

/// Layout of bright and dark regions on a synthetic page. Any two
/// different patterns are 32 bits apart in average-hash space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagePattern {
    Checkerboard,
    LeftHalf,
    TopHalf,
}

impl PagePattern {
    fn is_bright(&self, x: u32, y: u32, width: u32, height: u32) -> bool {
        // Regions follow an 8x8 grid shifted by 3px
        let cx = (x + 3) * 8 / width.max(1);
        let cy = (y + 3) * 8 / height.max(1);
        match self {
            PagePattern::Checkerboard => (cx + cy) % 2 == 0,
            PagePattern::LeftHalf => cx < 4,
            PagePattern::TopHalf => cy < 4,
        }
    }
}

/// Vertical 5px stripes over the pattern's regions, so every page has
/// strong edges and contrast.
pub fn page_image(width: u32, height: u32, pattern: PagePattern) -> DynamicImage {
    let img = RgbImage::from_fn(width, height, |x, y| {
        let stripe = (x / 5) % 2 == 0;
        let value = match (pattern.is_bright(x, y, width, height), stripe) {
            (true, true) => 255,
            (true, false) => 160,
            (false, true) => 95,
            (false, false) => 0,
        };
        Rgb([value, value, value])
    });
    DynamicImage::ImageRgb8(img)
}

pub fn flat_image(width: u32, height: u32, value: u8) -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([value, value, value])))
}

pub fn encode_png(image: &DynamicImage) -> Vec<u8> {
    let mut buf = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut buf), ImageOutputFormat::Png)
        .expect("png encoding");
    buf
}

pub fn encode_jpeg(image: &DynamicImage) -> Vec<u8> {
    let mut buf = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut buf), ImageOutputFormat::Jpeg(90))
        .expect("jpeg encoding");
    buf
}

/// A full-size page that passes every check and scores as acceptable.
pub fn page_png(pattern: PagePattern) -> Vec<u8> {
    encode_png(&page_image(PAGE_WIDTH, PAGE_HEIGHT, pattern))
}
