mod app;
mod core;
mod utils;
mod workers;

use crate::app::App;
use crate::utils::logging;
use crate::utils::paths::DataPaths;
use workers::args::Args;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::load()?;

    let paths = DataPaths::resolve(args.data_dir.as_deref())?;
    paths.ensure()?;
    logging::init(args.verbose, &paths.log_file());

    let app = App::bootstrap(&args, &paths).await?;
    app.run().await
}
