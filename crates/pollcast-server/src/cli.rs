use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "pollcast-server", version, about = "Real-time poll voting server")]
pub struct Args {
    /// Path to the TOML config file. A missing file means built-in defaults.
    #[arg(short, long, default_value = "pollcast.toml")]
    pub config: String,

    /// Override the bind address from the config file.
    #[arg(long)]
    pub bind: Option<String>,

    /// Emit logs as JSON instead of text.
    #[arg(long)]
    pub json_logs: bool,
}
