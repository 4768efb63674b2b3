use clap::Parser;

/// File-inspection tool: detects the container flavour of scientific
/// array files and reports which configured backends can open them.
#[derive(Parser, Debug)]
#[command(name = "pario-finfo", about = "Inspect scientific array container files")]
pub struct CliArgs {
    /// Inspect a single file
    #[arg(long = "ifile", conflicts_with = "idir")]
    pub ifile: Option<String>,

    /// Inspect every regular file in a directory
    #[arg(long = "idir")]
    pub idir: Option<String>,

    /// Number of io tasks for the probe iosystem
    #[arg(long = "num-iotasks", default_value_t = 1)]
    pub num_iotasks: i32,

    /// Stride between io tasks
    #[arg(long = "iostride", default_value_t = 1)]
    pub iostride: i32,

    /// Base rank of the first io task
    #[arg(long = "ioroot", default_value_t = 0)]
    pub ioroot: i32,

    /// Print per-backend probe details
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,

    /// Emit the scan report as JSON instead of text
    #[arg(long = "json")]
    pub json: bool,
}
