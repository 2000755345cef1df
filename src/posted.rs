//! Run-length column image encoding for the engine's patch drawers.
//!
//! A posted image is a per-column offset table followed by each column's
//! posts. A post covers up to [`POST_MAX_HEIGHT`] consecutive pixels:
//!
//! ```text
//! top_delta: u8   0 for the first post, POST_MAX_HEIGHT after
//! length:    u8
//! unused:    u8
//! pixels:    u8[length]
//! unused:    u8
//! ```
//!
//! A `0xFF` byte terminates each column. The stored offsets skip the first
//! post's three header bytes and point straight at its pixel run, which is
//! what the engine's column drawers expect.

use crate::frame::RgbaImage;
use crate::palette::ColorLut;

/// Maximum pixels a single post can carry.
pub const POST_MAX_HEIGHT: usize = 254;

/// Bytes of post overhead besides the pixels (three header bytes, one
/// trailing pad).
pub const POST_BASE_BYTES: usize = 4;

const COLUMN_TERMINATOR: u8 = 0xFF;

/// Encoded size of one column, headers and terminator included.
pub fn bytes_per_column(height: usize) -> usize {
    let posts = height.div_ceil(POST_MAX_HEIGHT);
    height + posts * POST_BASE_BYTES + 1
}

/// Total size of a posted image, offset table included.
pub fn posted_size(width: usize, height: usize) -> usize {
    width * (size_of::<u32>() + bytes_per_column(height))
}

/// Encode an RGBA image into `dst` as a posted paletted image.
///
/// Pixels are mapped through `lut`; alpha is discarded. Output is
/// deterministic: identical input bytes and palette produce identical
/// output. `dst` must be exactly [`posted_size`] bytes.
pub fn convert_rgba(src: &RgbaImage, lut: &ColorLut, dst: &mut [u8]) {
    let width = src.width as usize;
    let height = src.height as usize;
    let stride = src.stride;
    let bpc = bytes_per_column(height);

    debug_assert_eq!(dst.len(), posted_size(width, height));

    let mut cursor = 0usize;
    let mut put = |dst: &mut [u8], byte: u8| {
        dst[cursor] = byte;
        cursor += 1;
    };

    // Column offset table.
    for x in 0..width {
        let offset = (width * size_of::<u32>() + x * bpc + (POST_BASE_BYTES - 1)) as u32;
        for byte in offset.to_le_bytes() {
            put(dst, byte);
        }
    }

    for x in 0..width {
        let mut y = 0usize;

        while y < height {
            let post_end = (y + POST_MAX_HEIGHT).min(height);

            put(dst, if y == 0 { 0 } else { POST_MAX_HEIGHT as u8 });
            put(dst, (post_end - y) as u8);
            put(dst, 0);

            while y < post_end {
                let p = y * stride + x * 4;
                let index = lut.nearest(src.data[p], src.data[p + 1], src.data[p + 2]);
                put(dst, index as u8);
                y += 1;
            }

            put(dst, 0);
        }

        put(dst, COLUMN_TERMINATOR);
    }
}

/// Decode a posted image back into palette indices, row-major.
///
/// This mirrors the engine's column walker and exists so encoder output can
/// be validated without a running engine. Malformed input panics; posted
/// images only ever come from [`convert_rgba`].
pub fn decode(posted: &[u8], width: usize, height: usize) -> Vec<u8> {
    let mut pixels = vec![0u8; width * height];

    for x in 0..width {
        let table_at = x * size_of::<u32>();
        let offset =
            u32::from_le_bytes(posted[table_at..table_at + 4].try_into().unwrap()) as usize;
        // Offsets point at the first post's pixels; back up to its header.
        let mut p = offset - (POST_BASE_BYTES - 1);

        let mut y = 0usize;
        while posted[p] != COLUMN_TERMINATOR {
            let top_delta = posted[p] as usize;
            let length = posted[p + 1] as usize;
            if y > 0 {
                assert_eq!(top_delta, POST_MAX_HEIGHT, "continuation post delta");
            } else {
                assert_eq!(top_delta, 0, "first post delta");
            }
            p += 3;
            for _ in 0..length {
                pixels[y * width + x] = posted[p];
                p += 1;
                y += 1;
            }
            p += 1; // trailing pad
        }
        assert_eq!(y, height, "column {x} truncated");
    }

    pixels
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::palette::Palette;

    fn gray_image(width: u32, height: u32, level: impl Fn(usize, usize) -> u8) -> RgbaImage {
        let mut image = RgbaImage::new(width, height);
        for y in 0..height as usize {
            for x in 0..width as usize {
                let v = level(x, y);
                let p = y * image.stride + x * 4;
                image.data[p..p + 4].copy_from_slice(&[v, v, v, 255]);
            }
        }
        image
    }

    #[test]
    fn short_column_is_one_post() {
        assert_eq!(bytes_per_column(200), 200 + 4 + 1);
        assert_eq!(bytes_per_column(254), 254 + 4 + 1);
    }

    #[test]
    fn tall_column_splits_at_post_max_height() {
        assert_eq!(bytes_per_column(255), 255 + 2 * 4 + 1);
        assert_eq!(bytes_per_column(508), 508 + 2 * 4 + 1);
        assert_eq!(bytes_per_column(509), 509 + 3 * 4 + 1);
    }

    #[test]
    fn offsets_point_at_first_post_pixels() {
        let lut = ColorLut::new(&Palette::grayscale());
        let image = gray_image(3, 2, |_, _| 8);
        let mut out = vec![0u8; posted_size(3, 2)];
        convert_rgba(&image, &lut, &mut out);

        let bpc = bytes_per_column(2);
        for x in 0..3usize {
            let offset = u32::from_le_bytes(out[x * 4..x * 4 + 4].try_into().unwrap()) as usize;
            assert_eq!(offset, 3 * 4 + x * bpc + 3);
            // Three bytes back sits the first post header: delta 0.
            assert_eq!(out[offset - 3], 0);
            assert_eq!(out[offset - 2], 2); // length
        }
    }

    #[test]
    fn two_post_column_deltas() {
        let lut = ColorLut::new(&Palette::grayscale());
        let image = gray_image(1, 300, |_, y| (y % 256) as u8);
        let mut out = vec![0u8; posted_size(1, 300)];
        convert_rgba(&image, &lut, &mut out);

        let column = &out[4..];
        assert_eq!(column[0], 0); // first post delta
        assert_eq!(column[1], 254); // first post length
        let second = 3 + 254 + 1;
        assert_eq!(column[second], 254); // continuation delta
        assert_eq!(column[second + 1], (300 - 254) as u8);
        assert_eq!(column[second + 3 + 46 + 1], COLUMN_TERMINATOR);
    }

    #[test]
    fn round_trip_matches_direct_lut_indexing() {
        let lut = ColorLut::new(&Palette::grayscale());
        let image = gray_image(7, 300, |x, y| ((x * 31 + y) % 256) as u8);
        let mut out = vec![0u8; posted_size(7, 300)];
        convert_rgba(&image, &lut, &mut out);

        let decoded = decode(&out, 7, 300);
        for y in 0..300usize {
            for x in 0..7usize {
                let p = y * image.stride + x * 4;
                let direct = lut.nearest(image.data[p], image.data[p + 1], image.data[p + 2]);
                assert_eq!(decoded[y * 7 + x], direct as u8, "pixel ({x},{y})");
            }
        }
    }

    #[test]
    fn encoding_is_deterministic() {
        let lut = ColorLut::new(&Palette::grayscale());
        let image = gray_image(5, 40, |x, y| ((x + y * 3) % 256) as u8);
        let mut a = vec![0u8; posted_size(5, 40)];
        let mut b = vec![0u8; posted_size(5, 40)];
        convert_rgba(&image, &lut, &mut a);
        convert_rgba(&image, &lut, &mut b);
        assert_eq!(a, b);
    }
}
