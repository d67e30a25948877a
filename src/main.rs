mod cli;
mod commands;

use clap::Parser;
use cli::{CertAction, Cli, Commands, CrdAction};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Version => commands::version::run(),
        Commands::Check => commands::check::run().await?,
        Commands::Crd { action } => match action {
            CrdAction::Generate => commands::crd::generate()?,
            CrdAction::Install => commands::crd::install().await?,
        },
        Commands::Cert { action } => match action {
            CertAction::Generate {
                service_name,
                namespace,
                output_dir,
                ip_sans,
            } => commands::cert::generate(&service_name, &namespace, &output_dir, &ip_sans)?,
        },
        Commands::Run {
            addr,
            tls_cert,
            tls_key,
            client_ca,
            refresh_interval,
            enforce_interval,
        } => {
            commands::run::run(commands::run::RunArgs {
                addr,
                tls_cert,
                tls_key,
                client_ca,
                refresh_interval_secs: refresh_interval,
                enforce_interval_secs: enforce_interval,
            })
            .await?
        }
    }

    Ok(())
}
