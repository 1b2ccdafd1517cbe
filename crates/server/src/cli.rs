use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "looking-glass",
    version,
    about = "Network diagnostics looking glass service"
)]
pub(crate) struct Args {
    /// Created from the bundled default when missing.
    #[arg(long, default_value = "config/looking-glass.toml")]
    pub(crate) config: PathBuf,
    /// Overrides `server.bind` from the config file.
    #[arg(long)]
    pub(crate) listen_addr: Option<String>,
    #[arg(long)]
    pub(crate) log_dir: Option<PathBuf>,
    #[arg(long, default_value_t = false)]
    pub(crate) log_to_stderr: bool,
}
