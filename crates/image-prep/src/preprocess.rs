use crate::discover::find_images;
use crate::error::PrepError;
use crate::resample::resize_bilinear;
use exif::{In, Reader, Tag};
use image::{DynamicImage, ImageReader, RgbImage};
use log::{info, warn};
use ndarray::{Array3, Array4, Axis};
use rayon::prelude::*;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

/// Spatial input size of the exported Teachable Machine image models.
pub const SIDE: u32 = 224;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetSize {
	pub width: u32,
	pub height: u32,
}

impl TargetSize {
	pub fn new(width: u32, height: u32) -> Self {
		Self { width, height }
	}

	/// Both sides must be at least one pixel.
	pub fn check(self) -> Result<Self, PrepError> {
		if self.width == 0 || self.height == 0 {
			return Err(PrepError::InvalidSize {
				width: self.width,
				height: self.height,
			});
		}
		Ok(self)
	}
}

impl Default for TargetSize {
	fn default() -> Self {
		Self::new(SIDE, SIDE)
	}
}

/// Preprocessed images that survived decoding, with the paths they came from.
#[derive(Debug, Clone)]
pub struct PreparedBatch {
	pub paths: Vec<PathBuf>,
	/// [N, H, W, 3]
	pub tensors: Array4<f32>,
}

impl PreparedBatch {
	pub fn len(&self) -> usize {
		self.paths.len()
	}

	pub fn is_empty(&self) -> bool {
		self.paths.is_empty()
	}
}

#[derive(Debug, Clone)]
pub struct PreparedImage {
	pub path: PathBuf,
	/// [1, H, W, 3]
	pub tensor: Array4<f32>,
}

/// Decodes an image, applies its EXIF orientation and collapses it to RGB.
pub fn load_rgb<P: AsRef<Path>>(path: P) -> Result<RgbImage, PrepError> {
	let path = path.as_ref();
	let decode_err = |source| PrepError::Decode { path: path.to_path_buf(), source };

	let img = ImageReader::open(path)?
		.with_guessed_format()?
		.decode()
		.map_err(decode_err)?;

	let img = match exif_orientation(path) {
		Some(orientation) => orient(img, orientation),
		None => img,
	};

	Ok(img.into_rgb8())
}

/// Orientation tag of the primary image, if the file carries readable EXIF data.
fn exif_orientation(path: &Path) -> Option<u32> {
	let file = File::open(path).ok()?;
	let exif = Reader::new().read_from_container(&mut BufReader::new(file)).ok()?;
	exif.get_field(Tag::Orientation, In::PRIMARY)?.value.get_uint(0)
}

/// Undoes the EXIF orientation so the pixels are stored upright.
pub fn orient(img: DynamicImage, orientation: u32) -> DynamicImage {
	match orientation {
		2 => img.fliph(),
		3 => img.rotate180(),
		4 => img.flipv(),
		// transpose
		5 => img.rotate90().fliph(),
		6 => img.rotate90(),
		// transverse
		7 => img.rotate270().fliph(),
		8 => img.rotate270(),
		_ => img,
	}
}

/// Maps [0, 255] onto [-1, 1]. Output is [H, W, 3].
pub fn normalize(img: &RgbImage) -> Array3<f32> {
	Array3::from_shape_fn(
		(img.height() as usize, img.width() as usize, 3),
		|(y, x, c)| img.get_pixel(x as u32, y as u32)[c] as f32 / 127.5 - 1.0,
	)
}

fn prepare(path: &Path, size: TargetSize) -> Result<Array3<f32>, PrepError> {
	let rgb = load_rgb(path)?;
	let resized = resize_bilinear(&rgb, size.width, size.height)?;
	Ok(normalize(&resized))
}

/// Full pipeline for one image. Output is [1, H, W, 3] with values in [-1, 1].
pub fn preprocess_image<P: AsRef<Path>>(path: P, size: TargetSize) -> Result<Array4<f32>, PrepError> {
	Ok(prepare(path.as_ref(), size.check()?)?.insert_axis(Axis(0)))
}

/// Preprocesses every path, skipping the ones that fail, and stacks the
/// survivors into [N, H, W, 3] in input order. Decoding runs on the rayon pool.
pub fn preprocess_batch<P: AsRef<Path> + Sync>(paths: &[P], size: TargetSize) -> Result<PreparedBatch, PrepError> {
	let size = size.check()?;
	let prepared: Vec<_> = paths
		.par_iter()
		.map(|path| (path.as_ref(), prepare(path.as_ref(), size)))
		.collect();

	let mut kept = Vec::with_capacity(paths.len());
	let mut tensors = Vec::with_capacity(paths.len());
	for (path, result) in prepared {
		match result {
			Ok(tensor) => {
				kept.push(path.to_path_buf());
				tensors.push(tensor);
			}
			Err(err) => warn!("Error processing {}: {err}", path.display()),
		}
	}

	if tensors.is_empty() {
		return Err(PrepError::Empty);
	}

	let views: Vec<_> = tensors.iter().map(|t| t.view()).collect();
	let tensors = ndarray::stack(Axis(0), &views)?;

	Ok(PreparedBatch { paths: kept, tensors })
}

/// File the preprocessed tensor of `source` is written to inside `output_dir`.
pub fn npy_path(output_dir: &Path, source: &Path) -> PathBuf {
	let stem = source.file_stem().unwrap_or_default().to_string_lossy();
	output_dir.join(format!("{stem}_preprocessed.npy"))
}

/// Writes a tensor as a little endian float32 `.npy` file.
pub fn save_npy(path: &Path, tensor: &Array4<f32>) -> Result<(), PrepError> {
	ndarray_npy::write_npy(path, tensor)?;
	Ok(())
}

/// Preprocesses every image of `input_dir`, optionally saving each tensor to
/// `output_dir` as `<stem>_preprocessed.npy`.
pub fn process_directory(
	input_dir: &Path,
	output_dir: Option<&Path>,
	size: TargetSize,
) -> Result<Vec<PreparedImage>, PrepError> {
	let size = size.check()?;
	let paths = find_images(input_dir)?;

	if paths.is_empty() {
		println!("No image files found in {}", input_dir.display());
		return Ok(Vec::new());
	}

	println!("Found {} images to process...", paths.len());

	let mut processed = Vec::with_capacity(paths.len());
	for (i, path) in paths.iter().enumerate() {
		match preprocess_image(path, size) {
			Ok(tensor) => processed.push(PreparedImage { path: path.clone(), tensor }),
			Err(err) => {
				warn!("Error processing {}: {err}", path.display());
				continue;
			}
		}

		if (i + 1) % 100 == 0 {
			info!("Processed {}/{} images...", i + 1, paths.len());
		}
	}

	println!("Successfully processed {} images", processed.len());

	if let Some(output_dir) = output_dir {
		std::fs::create_dir_all(output_dir)?;
		for item in &processed {
			save_npy(&npy_path(output_dir, &item.path), &item.tensor)?;
		}
		println!("Saved preprocessed images to {}", output_dir.display());
	}

	Ok(processed)
}

#[cfg(test)]
mod tests {
	use super::*;
	use image::{GrayImage, Luma, Rgb, Rgba, RgbaImage};
	use rand::Rng;
	use tempfile::tempdir;

	fn solid(dir: &Path, name: &str, value: u8, width: u32, height: u32) -> PathBuf {
		let path = dir.join(name);
		RgbImage::from_pixel(width, height, Rgb([value, value, value]))
			.save(&path)
			.unwrap();
		path
	}

	#[test]
	fn output_has_batch_axis_and_target_shape() {
		let dir = tempdir().unwrap();
		let path = solid(dir.path(), "a.png", 10, 300, 200);

		let tensor = preprocess_image(&path, TargetSize::default()).unwrap();
		assert_eq!(tensor.shape(), &[1, 224, 224, 3]);
	}

	#[test]
	fn random_images_stay_in_range() {
		let dir = tempdir().unwrap();
		let mut rng = rand::thread_rng();

		for i in 0..4 {
			let (w, h) = (rng.gen_range(1..400), rng.gen_range(1..400));
			let img = RgbImage::from_fn(w, h, |_, _| Rgb([rng.gen(), rng.gen(), rng.gen()]));
			let path = dir.path().join(format!("{i}.png"));
			img.save(&path).unwrap();

			let tensor = preprocess_image(&path, TargetSize::default()).unwrap();
			assert_eq!(tensor.shape(), &[1, 224, 224, 3]);
			assert!(tensor.iter().all(|v| (-1.0..=1.0).contains(v)));
		}
	}

	#[test]
	fn white_maps_to_one_and_black_to_minus_one() {
		let dir = tempdir().unwrap();
		let white = preprocess_image(solid(dir.path(), "w.png", 255, 50, 80), TargetSize::default()).unwrap();
		let black = preprocess_image(solid(dir.path(), "b.png", 0, 50, 80), TargetSize::default()).unwrap();

		assert!(white.iter().all(|v| (v - 1.0).abs() < 1e-6));
		assert!(black.iter().all(|v| (v + 1.0).abs() < 1e-6));
	}

	#[test]
	fn custom_size_is_height_by_width() {
		let dir = tempdir().unwrap();
		let path = solid(dir.path(), "a.png", 99, 64, 64);

		let tensor = preprocess_image(&path, TargetSize::new(32, 16)).unwrap();
		assert_eq!(tensor.shape(), &[1, 16, 32, 3]);
	}

	#[test]
	fn alpha_and_grayscale_collapse_to_rgb() {
		let dir = tempdir().unwrap();

		let rgba = dir.path().join("rgba.png");
		RgbaImage::from_pixel(8, 8, Rgba([255, 0, 0, 0])).save(&rgba).unwrap();
		let gray = dir.path().join("gray.png");
		GrayImage::from_pixel(8, 8, Luma([255])).save(&gray).unwrap();

		// alpha is dropped, not composited
		assert_eq!(load_rgb(&rgba).unwrap().get_pixel(0, 0), &Rgb([255, 0, 0]));
		assert_eq!(load_rgb(&gray).unwrap().get_pixel(0, 0), &Rgb([255, 255, 255]));
	}

	#[test]
	fn orientation_matches_exif_transpose() {
		// 2x1: red on the left, blue on the right
		let mut img = RgbImage::new(2, 1);
		img.put_pixel(0, 0, Rgb([255, 0, 0]));
		img.put_pixel(1, 0, Rgb([0, 0, 255]));
		let img = DynamicImage::ImageRgb8(img);

		let red = Rgb([255, 0, 0]);

		let mirrored = orient(img.clone(), 2).into_rgb8();
		assert_eq!(mirrored.get_pixel(1, 0), &red);

		// 6: stored rotated 90 CCW, displayed after a CW rotation
		let rotated = orient(img.clone(), 6).into_rgb8();
		assert_eq!(rotated.dimensions(), (1, 2));
		assert_eq!(rotated.get_pixel(0, 0), &red);

		let rotated = orient(img.clone(), 8).into_rgb8();
		assert_eq!(rotated.get_pixel(0, 1), &red);

		let transposed = orient(img.clone(), 5).into_rgb8();
		assert_eq!(transposed.get_pixel(0, 0), &red);

		let transversed = orient(img.clone(), 7).into_rgb8();
		assert_eq!(transversed.get_pixel(0, 1), &red);

		assert_eq!(orient(img.clone(), 1).into_rgb8(), img.into_rgb8());
	}

	#[test]
	fn batch_skips_undecodable_files() {
		let dir = tempdir().unwrap();
		let good_a = solid(dir.path(), "a.png", 0, 10, 10);
		let broken = dir.path().join("broken.jpg");
		std::fs::write(&broken, b"definitely not a jpeg").unwrap();
		let good_b = solid(dir.path(), "b.png", 255, 10, 10);

		let batch = preprocess_batch(&[&good_a, &broken, &good_b], TargetSize::default()).unwrap();
		assert_eq!(batch.paths, vec![good_a, good_b]);
		assert_eq!(batch.tensors.shape(), &[2, 224, 224, 3]);
		assert!((batch.tensors[[1, 0, 0, 0]] - 1.0).abs() < 1e-6);
	}

	#[test]
	fn batch_with_no_survivors_is_empty() {
		let dir = tempdir().unwrap();
		let broken = dir.path().join("broken.png");
		std::fs::write(&broken, b"nope").unwrap();
		let missing = dir.path().join("missing.png");

		let err = preprocess_batch(&[broken, missing], TargetSize::default()).unwrap_err();
		assert!(matches!(err, PrepError::Empty));
	}

	#[test]
	fn batch_keeps_input_order() {
		let dir = tempdir().unwrap();
		let values: Vec<u8> = (0..24).map(|i| i * 10).collect();
		let paths: Vec<_> = values
			.iter()
			.map(|v| solid(dir.path(), &format!("{v}.png"), *v, 12, 9))
			.collect();

		let batch = preprocess_batch(&paths, TargetSize::new(4, 4)).unwrap();
		assert_eq!(batch.paths, paths);
		for (i, v) in values.iter().enumerate() {
			assert!((batch.tensors[[i, 0, 0, 0]] - (*v as f32 / 127.5 - 1.0)).abs() < 1e-6);
		}
	}

	#[test]
	fn zero_size_is_rejected_before_decoding() {
		let dir = tempdir().unwrap();
		let path = solid(dir.path(), "a.png", 10, 10, 10);

		let err = preprocess_image(&path, TargetSize::new(0, 224)).unwrap_err();
		assert!(matches!(err, PrepError::InvalidSize { width: 0, height: 224 }));

		let err = preprocess_batch(&[&path], TargetSize::new(224, 0)).unwrap_err();
		assert!(matches!(err, PrepError::InvalidSize { .. }));

		let err = process_directory(dir.path(), None, TargetSize::new(0, 0)).unwrap_err();
		assert!(matches!(err, PrepError::InvalidSize { .. }));
		assert!(TargetSize::default().check().is_ok());
	}

	#[test]
	fn directory_run_writes_npy_per_image() {
		let input = tempdir().unwrap();
		let output = tempdir().unwrap();
		let out_dir = output.path().join("nested");
		solid(input.path(), "cat.png", 255, 30, 30);
		solid(input.path(), "dog.bmp", 0, 30, 30);
		std::fs::write(input.path().join("notes.txt"), b"skip me").unwrap();

		let processed = process_directory(input.path(), Some(&out_dir), TargetSize::new(8, 8)).unwrap();
		assert_eq!(processed.len(), 2);

		let saved: Array4<f32> = ndarray_npy::read_npy(out_dir.join("cat_preprocessed.npy")).unwrap();
		assert_eq!(saved.shape(), &[1, 8, 8, 3]);
		assert!(saved.iter().all(|v| (v - 1.0).abs() < 1e-6));
		assert!(out_dir.join("dog_preprocessed.npy").exists());
	}

	#[test]
	fn empty_directory_yields_nothing() {
		let input = tempdir().unwrap();
		let processed = process_directory(input.path(), None, TargetSize::default()).unwrap();
		assert!(processed.is_empty());
	}
}
