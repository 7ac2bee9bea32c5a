use camino::Utf8PathBuf;

#[derive(clap::Parser)]
#[command(version, about)]
pub struct Cli {
    /// Configuration file
    pub config: Option<Utf8PathBuf>,

    /// Rebuild the song database from scratch
    #[arg(long)]
    pub create_db: bool,

    /// Signal the running instance (via the pid file) to shut down
    #[arg(long)]
    pub kill: bool,

    /// More verbose logging
    #[arg(long, short)]
    pub verbose: bool,

    /// Log to stdout
    #[arg(long)]
    pub stdout: bool,

    /// Stay in the foreground
    #[arg(long)]
    pub no_daemon: bool,
}
