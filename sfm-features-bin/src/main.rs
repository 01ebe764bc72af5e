use log::*;
use rayon::prelude::*;
use sfm_features_bin::{process_image, Dataset, ExtractOptions, Outcome};
use std::path::PathBuf;
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "extract-features",
    about = "Detect and describe features in every image of a dataset"
)]
struct Opt {
    /// Configuration file to use instead of the dataset `config.yaml`.
    #[structopt(short, long, parse(from_os_str))]
    config: Option<PathBuf>,
    /// Name of an image to process as an equirectangular panorama.
    ///
    /// Can be given several times.
    #[structopt(long = "panorama")]
    panoramas: Vec<String>,
    /// Process every image with a 2:1 aspect ratio as a panorama.
    #[structopt(long)]
    detect_panoramas: bool,
    /// Also write keypoint overlays to `rendered/`.
    #[structopt(long)]
    render: bool,
    /// Extract again even when a features file exists.
    #[structopt(long)]
    overwrite: bool,
    /// The dataset directory, containing an `images/` folder.
    #[structopt(parse(from_os_str))]
    dataset: PathBuf,
}

fn main() {
    pretty_env_logger::init_timed();
    let opt = Opt::from_args();
    let dataset = Dataset::new(&opt.dataset);

    let config = match dataset.load_config(opt.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("invalid configuration: {}", e);
            std::process::exit(2);
        }
    };
    let images = match dataset.images() {
        Ok(images) => images,
        Err(e) => {
            error!("cannot list images of {}: {}", opt.dataset.display(), e);
            std::process::exit(2);
        }
    };
    let options = ExtractOptions {
        panoramas: opt.panoramas.into_iter().collect(),
        detect_panoramas: opt.detect_panoramas,
        render: opt.render,
        overwrite: opt.overwrite,
    };

    info!("extracting {} features from {} images", config.feature_type, images.len());
    let failures = images
        .par_iter()
        .filter(|name| match process_image(&dataset, name, &config, &options) {
            Ok(Outcome::Extracted { features, panorama }) => {
                let kind = if panorama { " (panorama)" } else { "" };
                info!("{}: {} features{}", name, features, kind);
                false
            }
            Ok(Outcome::Skipped) => false,
            Err(e) => {
                error!("{}: {}", name, e);
                true
            }
        })
        .count();

    if failures > 0 {
        error!("{} of {} images failed", failures, images.len());
        std::process::exit(1);
    }
}
