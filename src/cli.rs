//! # Command-Line Interface Module
//!
//! Argument parsing for the `deployr` demo binary, built on the `clap`
//! derive API. The binary loads a JSON job description, constructs a
//! fabric group, and deploys the described runners with generic demo
//! entries registered under the function names the description references.
//!
//! ## Usage Examples
//!
//! ```bash
//! # Deploy a two-runner job over an in-process fabric of two instances
//! deployr job.json
//!
//! # Larger group, explicit coordinator, verbose diagnostics
//! deployr job.json --instances 4 --coordinator 2 -vv
//!
//! # Quiet run with diagnostics written to a file
//! deployr job.json --quiet --log-file deployr.log
//! ```

use crate::fabric::FabricKind;
use clap::{
    builder::styling::{AnsiColor, Styles},
    Parser,
};
use std::path::PathBuf;

/// Defines the styles for the help message.
fn styles() -> Styles {
    Styles::styled()
        .header(AnsiColor::Yellow.on_default())
        .usage(AnsiColor::Yellow.on_default())
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

/// Topology-aware distributed job deployment runtime.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None, styles = styles())]
pub struct Args {
    /// Path to the JSON job description
    ///
    /// The description lists the runners to deploy, each naming an entry
    /// function plus either a required topology or a direct instance id,
    /// and optionally the channels to establish between them.
    #[arg(help_heading = "Core Options")]
    pub job: PathBuf,

    /// Fabric backend to deploy over
    ///
    /// The local backend runs the whole group as cooperative tasks inside
    /// this process, which is the right choice for development and tests.
    #[arg(long, value_enum, default_value_t = FabricKind::Local, help_heading = "Core Options")]
    pub fabric: FabricKind,

    /// Number of instances in the fabric group
    ///
    /// When omitted, the group is sized from the description: large
    /// enough for every directly referenced instance id and for one
    /// instance per runner.
    #[arg(short = 'n', long, help_heading = "Core Options")]
    pub instances: Option<usize>,

    /// Instance id of the deployment coordinator
    #[arg(short = 'c', long, default_value_t = 0, help_heading = "Core Options")]
    pub coordinator: u64,

    /// Memory size in bytes of each demo instance's topology
    ///
    /// Every instance of the demo group reports one cpu device with a
    /// single ram space of this size; descriptions that place runners by
    /// topology match against it.
    #[arg(long, default_value_t = crate::defaults::DEMO_MEMORY_BYTES, help_heading = "Core Options")]
    pub memory_bytes: u64,

    /// Compute resources of each demo instance's topology
    #[arg(long, default_value_t = crate::defaults::DEMO_COMPUTE_RESOURCES, help_heading = "Core Options")]
    pub compute: usize,

    /// Silence all user-facing informational output on stdout
    ///
    /// When this flag is present, only the detailed diagnostic log is
    /// written. Useful for scripting.
    #[arg(short = 'q', long, help_heading = "Output and Logging")]
    pub quiet: bool,

    /// Increase diagnostic log verbosity
    ///
    /// Can be used multiple times: -v for debug, -vv for trace.
    #[arg(short, long, action = clap::ArgAction::Count, help_heading = "Output and Logging")]
    pub verbose: u8,

    /// File for the detailed diagnostic log, or "stderr"
    ///
    /// Defaults to a rolling file next to the working directory.
    #[arg(long, help_heading = "Output and Logging")]
    pub log_file: Option<String>,
}
