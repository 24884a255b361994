mod args;

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{error, warn, Level};

use crate::args::Args;
use faktory_rs::config::Config;
use faktory_rs::server::Server;
use faktory_rs::storage::memory::MemoryStore;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();
    let debug = args.debug;
    let config: Config = args.into();

    if debug {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .init();
    } else {
        tracing_subscriber::fmt().json().init();
    }

    let store = Arc::new(MemoryStore::new());
    let server = Server::new(config, store);

    {
        let server = server.clone();
        tokio::spawn(async move {
            if let Err(error) = signal::ctrl_c().await {
                warn!(%error, "something strange with ctrl-c handling!");
            }
            server.stop().await;
        });
    }

    match server.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!(%error, "encountered runtime error");
            ExitCode::FAILURE
        },
    }
}
