// Command-line surface. Usage problems are reported by clap and mapped to
// exit code 64 in main.

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "drivepipe",
    version,
    about = "Stream files to and from a Drive-style cloud storage account",
    after_help = "Use '-' as <FILE> for standard input or output."
)]
pub struct Cli {
    /// Operate inside this folder instead of the account root.
    #[arg(short = 'p', long = "parent", value_name = "NAME", global = true)]
    pub parent: Option<String>,

    /// Transfer chunk size, in MiB.
    #[arg(
        short = 'C',
        long = "chunk-size",
        value_name = "MIB",
        default_value_t = 10.0,
        global = true
    )]
    pub chunk_size: f64,

    /// Enable automatic retry with exponential backoff in case of error.
    #[arg(short = 'r', long = "auto-retry", global = true)]
    pub auto_retry: bool,

    /// Display progress status.
    #[arg(short = 'v', long = "verbose", global = true)]
    pub verbose: bool,

    /// Provide OAuth authorization out-of-band instead of via a local
    /// callback listener.
    #[arg(long = "oob", global = true)]
    pub oob: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Download a file.
    Get {
        /// Remote file name.
        file: String,
        /// Override the local destination name.
        #[arg(short = 'o', long = "output", value_name = "NAME")]
        output: Option<String>,
    },
    /// Upload a file.
    Put {
        /// Local file name.
        file: String,
        /// Override the remote name (default: the local base name).
        #[arg(short = 'o', long = "output", value_name = "NAME")]
        output: Option<String>,
        /// Override the guessed MIME type.
        #[arg(short = 'm', long = "mime", value_name = "TYPE")]
        mime: Option<String>,
    },
    /// List files in scope, one per line.
    List,
    /// Print an md5 checksum manifest of the files in scope.
    Md5,
    /// Move a file to the trash.
    Trash {
        /// Remote file name.
        file: String,
    },
}
