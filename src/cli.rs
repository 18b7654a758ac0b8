use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Simulation session manager
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Increase logging verbosity (default: warn, -v: info, -vv: debug, -vvv+: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    pub verbosity: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start a fresh cache generation and bake frames into it
    Bake {
        /// Cache directory (created if missing; existing frames are discarded)
        #[arg(value_name = "DIR")]
        cache_dir: PathBuf,

        /// Session name written into the setup descriptor
        #[arg(short = 'n', long = "name", default_value = "session")]
        name: String,

        /// Number of frames to compute
        #[arg(short = 'f', long = "frames", value_name = "N", default_value_t = 24)]
        frames: usize,

        /// Simulated elements per point attribute
        #[arg(long = "elements", value_name = "N", default_value_t = 1024)]
        elements: usize,

        /// Frame duration in seconds of simulated time
        #[arg(long = "time-step", value_name = "SEC", default_value_t = 1.0 / 24.0)]
        time_step: f64,

        /// Disk quota in megabytes
        #[arg(short = 'q', long = "quota-mb", value_name = "MB", default_value_t = 10240)]
        quota_mb: u64,

        /// Subdivide frames into adaptive substeps
        #[arg(long = "adaptive")]
        adaptive: bool,

        /// Give up if the bake has not finished after this many seconds
        #[arg(long = "timeout", value_name = "SEC", default_value_t = 3600)]
        timeout_sec: u64,
    },

    /// Load an existing cache and continue (or branch) the bake
    Resume {
        /// Cache directory holding a setup descriptor
        #[arg(value_name = "DIR")]
        cache_dir: PathBuf,

        /// Total frame count to reach
        #[arg(short = 'f', long = "frames", value_name = "N")]
        frames: usize,

        /// Branch point: discard cached frames at or after this index and
        /// recompute from there (default: continue after the last frame)
        #[arg(long = "from", value_name = "N")]
        from: Option<usize>,

        /// Frame duration in seconds of simulated time
        #[arg(long = "time-step", value_name = "SEC", default_value_t = 1.0 / 24.0)]
        time_step: f64,

        /// Disk quota in megabytes
        #[arg(short = 'q', long = "quota-mb", value_name = "MB", default_value_t = 10240)]
        quota_mb: u64,

        /// Subdivide frames into adaptive substeps
        #[arg(long = "adaptive")]
        adaptive: bool,

        /// Give up if the bake has not finished after this many seconds
        #[arg(long = "timeout", value_name = "SEC", default_value_t = 3600)]
        timeout_sec: u64,
    },

    /// Print cache state: setup, frame count, disk usage, lock status
    Info {
        /// Cache directory
        #[arg(value_name = "DIR")]
        cache_dir: PathBuf,
    },

    /// Remove a stale lock marker left behind by a crashed process
    Unlock {
        /// Cache directory
        #[arg(value_name = "DIR")]
        cache_dir: PathBuf,

        /// Confirm removal: the lock is never removed without this flag
        #[arg(long = "yes")]
        yes: bool,
    },
}
