use clap::Parser;
use nametag_trainer::{init_logging, run_training, TrainArgs};
use tracing::info;

fn main() {
    init_logging();
    let args = TrainArgs::parse();

    match run_training(&args) {
        Ok(best) => {
            info!("Best dev: {}", best.dev);
            info!("Best test: {}", best.test);
        }
        Err(e) => {
            eprintln!("Training failed: {e:#}");
            std::process::exit(1);
        }
    }
}
