use clap::Parser;
use image_prep::preprocess::{npy_path, save_npy};
use image_prep::{preprocess_image, process_directory, PrepError, TargetSize};
use log::LevelFilter;
use simple_logger::SimpleLogger;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

/// Preprocess images for Teachable Machine models
#[derive(Debug, Parser)]
struct Args {
    /// Input image file or directory containing images
    input: PathBuf,

    /// Output directory for preprocessed images (optional)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Target image size
    #[arg(
        short,
        long,
        num_args = 2,
        value_names = ["WIDTH", "HEIGHT"],
        default_values_t = vec![224u32, 224],
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    size: Vec<u32>,
}

fn main() -> ExitCode {
    if let Err(err) = SimpleLogger::new().with_level(LevelFilter::Info).env().init() {
        eprintln!("Could not initialize logging: {err}");
    }

    let args = Args::parse();
    let size = TargetSize::new(args.size[0], args.size[1]);

    let result = if args.input.is_file() {
        single(&args.input, args.output.as_deref(), size)
    } else if args.input.is_dir() {
        println!("Processing directory: {}", args.input.display());
        process_directory(&args.input, args.output.as_deref(), size)
            .map(|processed| println!("Total images processed: {}", processed.len()))
    } else {
        println!("Error: {} is not a valid file or directory", args.input.display());
        return ExitCode::FAILURE;
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            println!("Error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn single(input: &Path, output: Option<&Path>, size: TargetSize) -> Result<(), PrepError> {
    println!("Processing single image: {}", input.display());
    let tensor = preprocess_image(input, size)?;

    let (min, max) = tensor
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), v| (lo.min(*v), hi.max(*v)));
    println!("Preprocessed image shape: {:?}", tensor.shape());
    println!("Pixel value range: [{min:.2}, {max:.2}]");

    if let Some(output) = output {
        std::fs::create_dir_all(output)?;
        let file = npy_path(output, input);
        save_npy(&file, &tensor)?;
        println!("Saved to: {}", file.display());
    }

    Ok(())
}
