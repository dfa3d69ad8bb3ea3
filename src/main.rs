use std::{env, io};

use anyhow::{bail, Result};
use clap::Parser;
#[allow(unused_imports)]
use log::*;

use nvbatch::{confirm, Args, Encoder};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    match args.get_verbosity() {
        2.. => {
            env_logger::builder()
                .filter_level(LevelFilter::Trace)
                .init();
        }
        1 => {
            env_logger::builder()
                .filter_level(LevelFilter::Debug)
                .init();
        }
        0 => {
            if env::var_os("RUST_LOG").is_some() {
                env_logger::init();
            } else {
                env_logger::builder().filter_level(LevelFilter::Info).init();
            }
        }
        -1 => {
            env_logger::builder().filter_level(LevelFilter::Warn).init();
        }
        ..=-2 => {
            env_logger::builder()
                .filter_level(LevelFilter::Error)
                .init();
        }
    }

    if !args.input_dir.is_dir() {
        bail!("Input directory does not exist: {:?}", args.input_dir);
    }

    let assume_yes = args.assume_yes;
    let encoder = Encoder::new(args)?;
    encoder.check_transcoder().await?;

    let inputs = encoder.get_video_paths().await?;
    if inputs.is_empty() {
        info!("No videos to encode in {:?}", encoder.args().input_dir);
        return Ok(());
    }

    encoder.describe_batch(&inputs, io::stdout().lock())?;
    if !assume_yes && !confirm(io::stdin().lock(), io::stdout().lock())? {
        println!("Encoding cancelled.");
        return Ok(());
    }
    encoder.create_output_dir()?;

    let cancel = encoder.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted: no more encodes will start, running ones will be stopped");
            cancel.cancel();
        }
    });

    let summary = encoder.encode_videos(&inputs).await?;
    info!("Finished: {summary}");
    if summary.failed() > 0 || summary.cancelled() > 0 {
        bail!("Not every video was encoded: {summary}");
    }
    Ok(())
}
