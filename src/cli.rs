use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Clone, Parser)]
#[command(
    name = "strato",
    version,
    about = "A terminal browser for cloud virtual machines."
)]
pub struct CliArgs {
    /// Path to a config file (otherwise discovered by convention)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Management endpoint base URL, overrides the config file
    #[arg(long)]
    pub endpoint: Option<String>,

    /// Child page size for tree listings, overrides the config file
    #[arg(long)]
    pub page_size: Option<usize>,

    /// tracing filter (for example: info,debug,trace)
    #[arg(long, default_value = "info")]
    pub log_filter: String,
}
