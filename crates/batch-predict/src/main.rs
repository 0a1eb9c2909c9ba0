use batch_predict::cli::{run, Args};
use batch_predict::{default_device, DefaultBackend};
use clap::Parser;
use log::{info, LevelFilter};
use simple_logger::SimpleLogger;
use std::process::ExitCode;

fn main() -> ExitCode {
    if let Err(err) = SimpleLogger::new().with_level(LevelFilter::Info).env().init() {
        eprintln!("Could not initialize logging: {err}");
    }

    let args = Args::parse();
    let device = default_device();
    info!("Running on {:?}", device);

    match run::<DefaultBackend>(&args, &device) {
        Ok(summary) => {
            print!("\n{summary}");
            ExitCode::SUCCESS
        }
        Err(err) => {
            println!("{err}");
            ExitCode::FAILURE
        }
    }
}
