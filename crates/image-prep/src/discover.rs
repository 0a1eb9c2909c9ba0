use std::io;
use std::path::{Path, PathBuf};

/// Extensions picked up when scanning a directory, compared lowercase.
pub const IMAGE_EXTENSIONS: [&str; 7] = ["jpg", "jpeg", "png", "bmp", "gif", "tiff", "webp"];

pub fn is_image(path: &Path) -> bool {
	path.extension()
		.and_then(|ext| ext.to_str())
		.map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
		.unwrap_or(false)
}

/// Image files directly inside `dir` (no recursion), sorted by path.
pub fn find_images<A: AsRef<Path>>(dir: A) -> io::Result<Vec<PathBuf>> {
	let mut paths = Vec::new();

	for entry in dir.as_ref().read_dir()? {
		let path = entry?.path();
		if path.is_file() && is_image(&path) {
			paths.push(path);
		}
	}

	paths.sort();
	Ok(paths)
}
