//! Command-line entry point.
//!
//! This broker has one mode of operation, so there is a single top-level
//! command rather than a `#[argh(subcommand)]` enum.

use argh::FromArgs;

/// run the credential broker
#[derive(Debug, FromArgs)]
pub struct Args {
    /// comma-separated list of configuration source file paths, composed
    /// left-to-right (later sources override earlier ones)
    #[argh(option, short = 'c')]
    pub config: String,
}

impl Args {
    pub fn run(self) -> anyhow::Result<()> {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .expect("failed to build tokio runtime");
        rt.block_on(crate::server::run(self.config))
    }
}
