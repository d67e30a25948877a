use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "taspctl")]
#[command(about = "Telemetry Aware Scheduling controller and CLI")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Display application version
    Version,

    /// Check cluster connectivity and RBAC permissions
    Check,

    /// Manage the TasPolicy CRD
    Crd {
        #[command(subcommand)]
        action: CrdAction,
    },

    /// Generate self-signed TLS certificates for development
    Cert {
        #[command(subcommand)]
        action: CertAction,
    },

    /// Run the cache refresh loop, policy controller, enforcement loop and
    /// scheduler extender
    Run {
        /// Address the scheduler extender listens on
        #[arg(long, default_value = "0.0.0.0:8443")]
        addr: String,
        /// Server certificate (PEM)
        #[arg(long, default_value = "tls.crt")]
        tls_cert: String,
        /// Server private key (PEM)
        #[arg(long, default_value = "tls.key")]
        tls_key: String,
        /// CA bundle used to verify client certificates (mutual TLS)
        #[arg(long, default_value = "ca.crt")]
        client_ca: String,
        /// Seconds between metric cache refresh cycles
        #[arg(long, default_value_t = 5)]
        refresh_interval: u64,
        /// Seconds between enforcement ticks
        #[arg(long, default_value_t = 5)]
        enforce_interval: u64,
    },
}

#[derive(Subcommand)]
pub enum CrdAction {
    /// Print the CRD YAML to stdout
    Generate,

    /// Install the CRD into the connected cluster
    Install,
}

#[derive(Subcommand)]
pub enum CertAction {
    /// Generate a self-signed CA, server certificate and client certificate
    Generate {
        #[arg(long, default_value = "tas-scheduler")]
        service_name: String,
        #[arg(long, default_value = "default")]
        namespace: String,
        #[arg(long, default_value = ".")]
        output_dir: String,
        /// Additional IP SANs (e.g. --ip-san 192.168.1.26)
        #[arg(long = "ip-san")]
        ip_sans: Vec<String>,
    },
}
