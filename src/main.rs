use std::fs::File;
use std::io::{self, Read, Seek};
use std::process::ExitCode;

use amar::{AmarReader, Unseekable};
use clap::Parser;
use log::{error, warn};

mod cli;
use crate::cli::Cli;
use crate::cli::CliError;
use crate::cli::Commands;
use crate::cli::Config;

mod create;
mod extract;

fn main() -> ExitCode {
    let cli = Cli::parse();
    cli::init_logging(cli.verbose);

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<(), CliError> {
    let config = Config::load(cli.config.as_deref())?;

    match &cli.command {
        Commands::Create { paths } => match cli.archive() {
            Some(path) => {
                let out = File::create(path).map_err(|source| CliError::Open {
                    path: path.to_path_buf(),
                    source,
                })?;
                create::create(out, paths, &config, cli.verbose, &mut io::stdout())?;
            }
            None => {
                // Archive goes to stdout, keep the report off it
                let out = io::stdout().lock();
                create::create(out, paths, &config, cli.verbose, &mut io::stderr())?;
            }
        },
        Commands::List => extract::list(&mut open_archive(cli)?, io::stdout().lock())?,
        Commands::Extract { directory, names } => {
            let mut reader = open_archive(cli)?;
            let truncated = extract::extract(&mut reader, directory, names, config.fragment_size)?;
            if truncated > 0 {
                warn!("{} attribute(s) were truncated", truncated);
            }
        }
    }
    Ok(())
}

trait Source: Read + Seek {}
impl<T: Read + Seek> Source for T {}

/// The archive file, or stdin through the non-seekable adapter.
fn open_archive(cli: &Cli) -> Result<AmarReader<Box<dyn Source>>, CliError> {
    let input: Box<dyn Source> = match cli.archive() {
        Some(path) => Box::new(File::open(path).map_err(|source| CliError::Open {
            path: path.to_path_buf(),
            source,
        })?),
        None => Box::new(Unseekable(io::stdin().lock())),
    };
    Ok(AmarReader::new(input))
}
