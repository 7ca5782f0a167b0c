mod cli;
mod commands;

use clap::Parser;
use cli::{Cli, Commands, CrdAction, WebhookAction};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Controller(args) => {
            commands::controller::run(args).await?;
        }
        Commands::AuditScanner(args) => {
            commands::scan::run(args).await?;
        }
        Commands::Crd { action } => match action {
            CrdAction::Generate => commands::crd::generate()?,
            CrdAction::Install => commands::crd::install().await?,
        },
        Commands::Webhook { action } => match action {
            WebhookAction::Serve {
                addr,
                cert_dir,
                loglevel,
            } => {
                commands::webhook::serve(&addr, &cert_dir, &loglevel).await?;
            }
            WebhookAction::CertGenerate {
                service_name,
                namespace,
                output_dir,
            } => {
                commands::webhook::cert_generate(&service_name, &namespace, &output_dir)?;
            }
        },
    }

    Ok(())
}
