use burn::config::Config;
use image_prep::TargetSize;

#[derive(Config, Debug)]
pub struct PredictConfig {
	/// Images per forward pass. Only bounds memory, never changes results.
	#[config(default = 32)]
	pub batch_size: usize,
	#[config(default = 224)]
	pub image_width: u32,
	#[config(default = 224)]
	pub image_height: u32,
}

impl PredictConfig {
	pub fn target_size(&self) -> TargetSize {
		TargetSize::new(self.image_width, self.image_height)
	}
}
