mod cli;
mod config;
mod display;
mod driver;
mod geometry;
mod output;
mod scene;

use clap::Parser;
use cli::{Cli, Command};
use display::x11::X11Connector;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run(args) => {
            if let Err(e) = driver::run(args.into_config()).await {
                tracing::error!(error = %e, "run failed");
                eprintln!("backdropd run: {e}");
                std::process::exit(1);
            }
        }
        Command::Outputs { display } => {
            match output::list_outputs(&X11Connector::new(display)) {
                Ok(outputs) => {
                    for output in outputs {
                        println!("{}\t{}", output.name, output.rect);
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "outputs failed");
                    eprintln!("backdropd outputs: {e}");
                    std::process::exit(1);
                }
            }
        }
    }
}
