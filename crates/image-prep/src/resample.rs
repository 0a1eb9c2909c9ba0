//! Bilinear resampling that reproduces Pillow's `Image.resize(size, BILINEAR)`.
//!
//! Teachable Machine models are trained on images resized by Pillow, so the
//! kernel, the fixed point quantization and the pass order all follow Pillow's
//! convolution resampler. `image::imageops::resize` keeps an `f32` intermediate
//! and rounds differently, which shifts pixels by one level here and there.

use crate::error::PrepError;
use image::RgbImage;

/// 32 bits minus 8 bits of pixel range minus 2 bits of headroom.
const PRECISION_BITS: u32 = 32 - 8 - 2;

const BILINEAR_SUPPORT: f64 = 1.0;

fn bilinear(x: f64) -> f64 {
	let x = x.abs();
	if x < 1.0 { 1.0 - x } else { 0.0 }
}

/// Per output pixel: first contributing input pixel, number of contributors,
/// and `ksize` fixed point weights (zero padded).
struct Coefficients {
	bounds: Vec<(usize, usize)>,
	ksize: usize,
	weights: Vec<i32>,
}

impl Coefficients {
	fn new(in_size: usize, out_size: usize) -> Self {
		let scale = in_size as f64 / out_size as f64;
		let filterscale = scale.max(1.0);
		let support = BILINEAR_SUPPORT * filterscale;
		let ksize = support.ceil() as usize * 2 + 1;

		let mut bounds = Vec::with_capacity(out_size);
		let mut weights = vec![0i32; out_size * ksize];
		let mut kernel = vec![0f64; ksize];

		for xx in 0..out_size {
			let center = (xx as f64 + 0.5) * scale;
			let ss = 1.0 / filterscale;

			// C style truncation, then clamp into the input
			let xmin = ((center - support + 0.5) as i64).max(0) as usize;
			let xmax = ((center + support + 0.5) as i64).min(in_size as i64) as usize - xmin;

			let mut total = 0.0;
			for x in 0..xmax {
				let w = bilinear(((x + xmin) as f64 - center + 0.5) * ss);
				kernel[x] = w;
				total += w;
			}

			let row = &mut weights[xx * ksize..(xx + 1) * ksize];
			for x in 0..xmax {
				let w = if total != 0.0 { kernel[x] / total } else { kernel[x] };
				row[x] = to_fixed(w);
			}

			bounds.push((xmin, xmax));
		}

		Self { bounds, ksize, weights }
	}

	fn row(&self, xx: usize) -> (usize, &[i32]) {
		let (xmin, xmax) = self.bounds[xx];
		(xmin, &self.weights[xx * self.ksize..xx * self.ksize + xmax])
	}
}

fn to_fixed(w: f64) -> i32 {
	let one = (1i32 << PRECISION_BITS) as f64;
	if w < 0.0 {
		(-0.5 + w * one) as i32
	} else {
		(0.5 + w * one) as i32
	}
}

fn clip8(acc: i32) -> u8 {
	(acc >> PRECISION_BITS).clamp(0, 255) as u8
}

fn horizontal(src: &RgbImage, width: u32) -> RgbImage {
	let coeffs = Coefficients::new(src.width() as usize, width as usize);
	let mut out = RgbImage::new(width, src.height());

	for y in 0..src.height() {
		for xx in 0..width {
			let (xmin, weights) = coeffs.row(xx as usize);
			let mut acc = [1i32 << (PRECISION_BITS - 1); 3];
			for (x, w) in weights.iter().enumerate() {
				let pixel = src.get_pixel((xmin + x) as u32, y);
				for c in 0..3 {
					acc[c] += pixel[c] as i32 * w;
				}
			}
			out.put_pixel(xx, y, image::Rgb(acc.map(clip8)));
		}
	}

	out
}

fn vertical(src: &RgbImage, height: u32) -> RgbImage {
	let coeffs = Coefficients::new(src.height() as usize, height as usize);
	let mut out = RgbImage::new(src.width(), height);

	for yy in 0..height {
		let (ymin, weights) = coeffs.row(yy as usize);
		for x in 0..src.width() {
			let mut acc = [1i32 << (PRECISION_BITS - 1); 3];
			for (y, w) in weights.iter().enumerate() {
				let pixel = src.get_pixel(x, (ymin + y) as u32);
				for c in 0..3 {
					acc[c] += pixel[c] as i32 * w;
				}
			}
			out.put_pixel(x, yy, image::Rgb(acc.map(clip8)));
		}
	}

	out
}

/// Resizes `src` to exactly `width` x `height`. Horizontal pass first, then
/// vertical, with an 8 bit image in between.
pub fn resize_bilinear(src: &RgbImage, width: u32, height: u32) -> Result<RgbImage, PrepError> {
	if width == 0 || height == 0 {
		return Err(PrepError::InvalidSize { width, height });
	}

	let mut img = if src.width() != width {
		horizontal(src, width)
	} else {
		src.clone()
	};

	if img.height() != height {
		img = vertical(&img, height);
	}

	Ok(img)
}
