//! Panion CLI entry point

use clap::Parser;
use panion::cli::{
    handle_cancel, handle_status, handle_submit, Cli, Commands, FacadeClient, EXIT_INTERNAL,
    EXIT_OK,
};
use panion::infrastructure::config::ConfigLoader;
use panion::infrastructure::logging;
use panion::infrastructure::storage::DataDir;
use panion::runtime::Runtime;
use std::process::ExitCode;

fn main() -> ExitCode {
    let cli = Cli::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build();
    let tokio_runtime = match runtime {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to start async runtime: {e}");
            return ExitCode::from(EXIT_INTERNAL as u8);
        }
    };

    let code = tokio_runtime.block_on(async move {
        match run(cli).await {
            Ok(code) => code,
            Err(e) => {
                eprintln!("Error: {e:#}");
                EXIT_INTERNAL
            }
        }
    });
    ExitCode::from(code as u8)
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    match cli.command {
        Commands::Run { config } => {
            let config = match config {
                Some(path) => ConfigLoader::load_with_file(path)?,
                None => ConfigLoader::load()?,
            };
            let data_dir = DataDir::open(config.data_dir.clone())?;
            let _log_guard = logging::init(&config.logging, Some(&data_dir))?;

            let runtime = Runtime::new(config.clone()).await?;
            let handles = runtime.start();

            let port = config.port;
            let facade = std::sync::Arc::clone(&runtime);
            let server = tokio::spawn(async move { panion::api::serve(facade, port).await });

            tokio::signal::ctrl_c().await?;
            tracing::info!("Shutting down");
            server.abort();
            handles.stop().await;
            Ok(EXIT_OK)
        }
        Commands::Submit {
            goal,
            priority,
            capabilities,
            wait,
        } => {
            let client = FacadeClient::new(cli.server);
            handle_submit(&client, goal, priority, capabilities, wait, cli.json).await
        }
        Commands::Status { goal_id } => {
            let client = FacadeClient::new(cli.server);
            handle_status(&client, goal_id, cli.json).await
        }
        Commands::Cancel { goal_id } => {
            let client = FacadeClient::new(cli.server);
            handle_cancel(&client, goal_id, cli.json).await
        }
    }
}
