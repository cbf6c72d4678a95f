//! Command-line interface for Voiceclone
//!
//! Handles argument parsing and logging configuration.

use clap::Parser;
use log::LevelFilter;

/// Voiceclone - clone a voice from a short sample and speak any text with it
#[derive(Parser, Debug)]
#[command(name = "voiceclone")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Increase logging verbosity
    /// -v = info, -vv = debug, -vvv = trace (includes model worker), -vvvv = all deps
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long)]
    pub quiet: bool,
}

impl Args {
    /// Get the log level filter based on verbosity flags
    pub fn log_level(&self) -> LevelFilter {
        if self.quiet {
            LevelFilter::Error
        } else {
            match self.verbose {
                0 => LevelFilter::Warn,
                1 => LevelFilter::Info,
                2 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }

    /// Worker stderr (python warnings, progress bars) only at -vvv
    pub fn worker_verbose(&self) -> bool {
        self.verbose >= 3
    }
}

/// Initialize the logging system based on CLI arguments
pub fn init_logging(args: &Args) {
    let mut builder = env_logger::Builder::new();

    // Base level for all modules - keep at warn to suppress noisy deps
    builder.filter_level(LevelFilter::Warn);

    builder.filter_module("voiceclone", args.log_level());

    // Forwarded worker output uses its own target
    if args.worker_verbose() {
        builder.filter_module("worker", args.log_level());
    } else {
        builder.filter_module("worker", LevelFilter::Off);
    }

    // GUI framework modules only at -vvvv (very verbose)
    if args.verbose >= 4 {
        builder.filter_module("naga", args.log_level());
        builder.filter_module("blade_graphics", args.log_level());
        builder.filter_module("gpui", args.log_level());
        builder.filter_module("fontdb", args.log_level());
    }

    builder.format_timestamp_millis().init();
}
