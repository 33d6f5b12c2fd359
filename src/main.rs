use clap::Parser;
use log::{error, info};
use std::error::Error;
use std::process::ExitCode;

use orthoseg_traindata::config::{CreateMasksArgs, PrepareArgs};
use orthoseg_traindata::mask::MasksForImagesParams;
use orthoseg_traindata::{
    create_masks_for_images, prepare_traindatasets, Cli, Command, MaskOptions, PrepareResult,
    ProgressBarObserver, WmsImageFetcher,
};

fn main() -> ExitCode {
    // Initialize the logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let result = match &cli.command {
        Command::Prepare(args) => run_prepare(args),
        Command::CreateMasks(args) => run_create_masks(args),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let mut message = e.to_string();
            let mut source = e.source();
            while let Some(cause) = source {
                message.push_str(&format!("\n  caused by: {}", cause));
                source = cause.source();
            }
            error!("{}", message);
            ExitCode::FAILURE
        }
    }
}

fn run_prepare(args: &PrepareArgs) -> PrepareResult<()> {
    let config = args.to_config()?;
    let mut fetcher = WmsImageFetcher::new()?;
    let observer = ProgressBarObserver::new();

    info!("Starting the dataset preparation...");
    let (output_dir, version) = prepare_traindatasets(&config, &mut fetcher, &observer)?;
    info!(
        "Dataset version {} available in {}",
        version,
        output_dir.display()
    );
    Ok(())
}

fn run_create_masks(args: &CreateMasksArgs) -> PrepareResult<()> {
    let params = MasksForImagesParams {
        label_path: &args.label_path,
        image_dir: &args.image_dir,
        output_base: &args.output_base,
        image_subdir: "image",
        mask_subdir: "mask",
        image_extension: &args.image_extension,
        options: MaskOptions {
            burn_value: args.burn_value,
            force: args.force,
            ..MaskOptions::default()
        },
    };

    info!("Starting the mask creation...");
    let (output_dir, version) = create_masks_for_images(&params)?;
    info!(
        "Mask version {} available in {}",
        version,
        output_dir.display()
    );
    Ok(())
}
