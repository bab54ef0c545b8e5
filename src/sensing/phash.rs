use std::f64::consts::PI;

use anyhow::{bail, Result};
use image::{imageops, imageops::FilterType, RgbaImage};

const DCT_SIZE: u32 = 32;
const HASH_SIZE: usize = 8;

/// DCT-based perceptual hash: 64 bits rendered as 16 uppercase hex digits.
pub fn compute_phash(image: &RgbaImage) -> Result<String> {
    if image.width() == 0 || image.height() == 0 {
        bail!("cannot hash an empty image");
    }

    let resized = imageops::resize(image, DCT_SIZE, DCT_SIZE, FilterType::Triangle);
    let gray = imageops::grayscale(&resized);

    let size = DCT_SIZE as usize;
    let mut values: Vec<f64> = gray.pixels().map(|p| f64::from(p.0[0])).collect();

    for row in values.chunks_mut(size) {
        let transformed = dct_1d(row);
        row.copy_from_slice(&transformed);
    }

    let mut column = vec![0.0; size];
    for x in 0..size {
        for y in 0..size {
            column[y] = values[y * size + x];
        }
        let transformed = dct_1d(&column);
        for y in 0..size {
            values[y * size + x] = transformed[y];
        }
    }

    let mut coefficients = Vec::with_capacity(HASH_SIZE * HASH_SIZE);
    for y in 0..HASH_SIZE {
        coefficients.extend_from_slice(&values[y * size..y * size + HASH_SIZE]);
    }

    let mean = coefficients.iter().sum::<f64>() / coefficients.len() as f64;
    let bits: Vec<bool> = coefficients.iter().map(|&c| c > mean).collect();
    Ok(bits_to_hex(&bits))
}

/// Percentage of matching bits between two hashes, or `None` when the hashes
/// differ in length or are not valid hex.
pub fn similarity_percent(lhs: &str, rhs: &str) -> Option<f64> {
    let distance = compute_hamming_distance(lhs, rhs)?;
    let bit_length = lhs.len() * 4;
    Some(100.0 * (1.0 - distance as f64 / bit_length as f64))
}

pub fn compute_hamming_distance(lhs: &str, rhs: &str) -> Option<u32> {
    if lhs.is_empty() || lhs.len() != rhs.len() {
        return None;
    }

    lhs.chars().zip(rhs.chars()).try_fold(0u32, |acc, (a, b)| {
        let a = a.to_digit(16)?;
        let b = b.to_digit(16)?;
        Some(acc + (a ^ b).count_ones())
    })
}

/// `X_k = sum_n x_n * cos(pi / N * k * (n + 0.5))`
fn dct_1d(input: &[f64]) -> Vec<f64> {
    let n_len = input.len();
    let factor = PI / n_len as f64;
    (0..n_len)
        .map(|k| {
            input
                .iter()
                .enumerate()
                .map(|(n, x)| x * (factor * k as f64 * (n as f64 + 0.5)).cos())
                .sum()
        })
        .collect()
}

fn bits_to_hex(bits: &[bool]) -> String {
    bits.chunks(4)
        .map(|nibble| {
            let value = nibble
                .iter()
                .fold(0u32, |acc, &bit| (acc << 1) | u32::from(bit));
            std::char::from_digit(value, 16)
                .unwrap_or('0')
                .to_ascii_uppercase()
        })
        .collect()
}
