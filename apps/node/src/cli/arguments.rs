use std::path::PathBuf;

use clap::Args;

#[derive(Args)]
pub struct Run {
    /// Path to the node configuration file.
    #[clap(long, short, default_value = "tesserad.toml")]
    pub config: PathBuf,
}
