mod cli;
mod logging;
mod server;

use cli::Args;

fn main() -> anyhow::Result<()> {
    let args = argh::from_env::<Args>();
    args.run()
}
