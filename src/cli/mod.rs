use clap::Parser;

use demo::DemoArgs;

pub mod demo;

/// Command invocation, streaming exchanges and message chunking over MQTT v5.
#[derive(clap::Parser, Debug)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(clap::Subcommand, Clone, Debug)]
pub enum Command {
    /// Run an executor and an invoker against an in-memory broker.
    ///
    /// The broker's maximum packet size is small enough that the large request
    /// has to be chunked on the way to the executor.
    Demo(DemoArgs),
}

#[derive(clap::ValueEnum, Debug, Copy, Clone)]
pub enum LogFormat {
    Full,
    Compact,
    Pretty,
    Json,
}

impl Args {
    pub fn log_format(&self) -> LogFormat {
        match &self.command {
            Command::Demo(args) => args.log,
        }
    }
}

pub fn main() -> crate::Result<()> {
    let args = Args::parse();

    crate::bootstrap(args.log_format())?;

    tracing::debug!("Parsed arguments: {args:?}");

    match args.command {
        Command::Demo(args) => demo::main(args),
    }
}
