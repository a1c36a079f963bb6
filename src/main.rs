// Entrypoint for the CLI application.
// - Keeps `main` small: parse arguments, authorize, build an API client,
//   dispatch one command, and map its outcome to an exit code.
// - Exit codes follow sysexits: 64 for usage errors, 74 for I/O errors.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use drivepipe::api::ApiClient;
use drivepipe::cli::{Cli, Command};
use drivepipe::commands::{self, Context};
use drivepipe::transfer::resolve_chunk_size;
use drivepipe::{auth, backoff::RetryPolicy};

const EX_USAGE: i32 = 64;
const EX_IOERR: i32 = 74;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // --help and --version are not usage errors.
            use clap::error::ErrorKind;
            match e.kind() {
                ErrorKind::DisplayHelp => {
                    let _ = e.print();
                    std::process::exit(0);
                }
                // Version goes to stderr so stdout stays a clean data
                // channel.
                ErrorKind::DisplayVersion => {
                    eprint!("{e}");
                    std::process::exit(0);
                }
                _ => {
                    let _ = e.print();
                    std::process::exit(EX_USAGE);
                }
            }
        }
    };

    if let Err(err) = run(cli) {
        eprintln!("I/O error: {err}.");
        std::process::exit(EX_IOERR);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let token = auth::authorize(cli.oob)?;
    let retry = cli.auto_retry.then(RetryPolicy::default);
    let client = ApiClient::from_env(&token, retry)?;

    let parent = match &cli.parent {
        Some(name) => Some(client.find_folder(name)?),
        None => None,
    };

    let ctx = Context {
        client,
        parent,
        chunk_size: resolve_chunk_size(cli.chunk_size),
        verbose: cli.verbose,
    };

    match cli.command {
        Command::Get { file, output } => commands::get(&ctx, &file, output.as_deref())?,
        Command::Put { file, output, mime } => {
            commands::put(&ctx, &file, output.as_deref(), mime.as_deref())?
        }
        Command::List => commands::list(&ctx, false)?,
        Command::Md5 => commands::list(&ctx, true)?,
        Command::Trash { file } => commands::trash(&ctx, &file)?,
    }
    Ok(())
}
