//! Test fixtures: image payloads and model outputs

use image::{DynamicImage, ImageFormat, RgbImage};
use meal_zone_guard::models::analysis::MealAnalysis;
use meal_zone_guard::models::ingredient::ExtractedIngredient;
use meal_zone_guard::services::image_validation::{to_data_uri, ImageMime};
use std::io::Cursor;

pub const MIB: usize = 1024 * 1024;

/// Bytes that pass the JPEG signature check, padded to `len`. Not decodable;
/// use only where the compressor takes the identity path.
pub fn jpeg_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, b'J', b'F', b'I', b'F', 0x00];
    bytes.resize(len.max(bytes.len()), 0x5A);
    bytes
}

pub fn jpeg_data_uri(len: usize) -> String {
    to_data_uri(ImageMime::Jpeg, &jpeg_bytes(len))
}

/// A real, decodable PNG filled with deterministic noise so it compresses poorly.
pub fn noisy_png(width: u32, height: u32) -> Vec<u8> {
    let mut state: u32 = 0x9E37_79B9;
    let img = RgbImage::from_fn(width, height, |_, _| {
        state ^= state << 13;
        state ^= state >> 17;
        state ^= state << 5;
        let [r, g, b, _] = state.to_le_bytes();
        image::Rgb([r, g, b])
    });
    let mut buf = Vec::new();
    DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .expect("encode test PNG");
    buf
}

pub fn noisy_png_data_uri(width: u32, height: u32) -> String {
    to_data_uri(ImageMime::Png, &noisy_png(width, height))
}

/// PNG bytes declared as JPEG; fails the signature check.
pub fn mislabeled_png_data_uri() -> String {
    to_data_uri(ImageMime::Jpeg, &noisy_png(4, 4))
}

pub fn ingredient(name: &str, organic: bool, category: &str) -> ExtractedIngredient {
    ExtractedIngredient {
        name: name.to_string(),
        organic,
        category: Some(category.to_string()),
    }
}

/// Vision output for a chicken curry, with a duplicate in different case.
pub fn curry_analysis() -> MealAnalysis {
    MealAnalysis {
        meal_summary: Some("Chicken curry with rice".to_string()),
        ingredients: vec![
            ingredient("Chicken", true, "protein"),
            ingredient("rice", false, "grain"),
            ingredient("Chili Pepper", false, "spice"),
            ingredient(" RICE ", true, ""),
        ],
    }
}

/// Canonical ingredient names produced by normalising [`curry_analysis`].
pub const CURRY_INGREDIENTS: &[&str] = &["chicken", "rice", "chili pepper"];
