//! YUV → RGBA kernels in 16.16 fixed point

use super::{ColorMatrix, ColorRange, Transform};

const SHIFT: u32 = 16;
const ONE: f64 = (1 << SHIFT) as f64;
const HALF: i32 = 1 << (SHIFT - 1);

/// Precomputed conversion factors for one matrix/range pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct YuvCoefficients {
    y_offset: i32,
    y: i32,
    rv: i32,
    gu: i32,
    gv: i32,
    bu: i32,
}

impl YuvCoefficients {
    pub fn new(matrix: ColorMatrix, range: ColorRange) -> Self {
        let (kr, kb) = match matrix {
            ColorMatrix::Bt601 => (0.299, 0.114),
            ColorMatrix::Bt709 => (0.2126, 0.0722),
        };
        let kg = 1.0 - kr - kb;
        let (y_scale, c_scale, y_offset) = match range {
            ColorRange::Full => (1.0, 1.0, 0),
            ColorRange::Limited => (255.0 / 219.0, 255.0 / 224.0, 16),
        };
        let fixed = |v: f64| (v * ONE).round() as i32;
        Self {
            y_offset,
            y: fixed(y_scale),
            rv: fixed(2.0 * (1.0 - kr) * c_scale),
            gu: fixed(2.0 * (1.0 - kb) * kb / kg * c_scale),
            gv: fixed(2.0 * (1.0 - kr) * kr / kg * c_scale),
            bu: fixed(2.0 * (1.0 - kb) * c_scale),
        }
    }

    #[inline]
    pub fn rgba(&self, y: u8, u: u8, v: u8) -> [u8; 4] {
        let y = (y as i32 - self.y_offset) * self.y + HALF;
        let u = u as i32 - 128;
        let v = v as i32 - 128;
        let clamp = |x: i32| (x >> SHIFT).clamp(0, 255) as u8;
        [
            clamp(y + self.rv * v),
            clamp(y - self.gu * u - self.gv * v),
            clamp(y + self.bu * u),
            255,
        ]
    }
}

/// NV12 (`uv_order`) or NV21: full-res Y plane plus one interleaved chroma plane.
#[allow(clippy::too_many_arguments)]
pub(super) fn semi_planar(
    y_plane: &[u8],
    y_stride: usize,
    uv_plane: &[u8],
    uv_stride: usize,
    uv_order: bool,
    width: usize,
    height: usize,
    coefficients: &YuvCoefficients,
    transform: &Transform,
    out: &mut [u8],
) {
    let (u_at, v_at) = if uv_order { (0, 1) } else { (1, 0) };
    for y in 0..height {
        let luma = &y_plane[y * y_stride..y * y_stride + width];
        let chroma = &uv_plane[(y / 2) * uv_stride..];
        for (x, &l) in luma.iter().enumerate() {
            let c = (x / 2) * 2;
            let rgba = coefficients.rgba(l, chroma[c + u_at], chroma[c + v_at]);
            transform.put(out, x, y, rgba);
        }
    }
}

/// I420: Y, U and V planes, chroma subsampled 2x2.
pub(super) fn planar(
    planes: [(&[u8], usize); 3],
    width: usize,
    height: usize,
    coefficients: &YuvCoefficients,
    transform: &Transform,
    out: &mut [u8],
) {
    let [(y_plane, y_stride), (u_plane, u_stride), (v_plane, v_stride)] = planes;
    for y in 0..height {
        let luma = &y_plane[y * y_stride..y * y_stride + width];
        let u_row = &u_plane[(y / 2) * u_stride..];
        let v_row = &v_plane[(y / 2) * v_stride..];
        for (x, &l) in luma.iter().enumerate() {
            let rgba = coefficients.rgba(l, u_row[x / 2], v_row[x / 2]);
            transform.put(out, x, y, rgba);
        }
    }
}

/// YUYV 4:2:2: `Y0 U Y1 V` per pixel pair.
pub(super) fn packed_422(
    bytes: &[u8],
    stride: usize,
    width: usize,
    height: usize,
    coefficients: &YuvCoefficients,
    transform: &Transform,
    out: &mut [u8],
) {
    for y in 0..height {
        let row = &bytes[y * stride..y * stride + width.div_ceil(2) * 4];
        for (pair, px) in row.chunks_exact(4).enumerate() {
            let x = pair * 2;
            let (u, v) = (px[1], px[3]);
            transform.put(out, x, y, coefficients.rgba(px[0], u, v));
            if x + 1 < width {
                transform.put(out, x + 1, y, coefficients.rgba(px[2], u, v));
            }
        }
    }
}
