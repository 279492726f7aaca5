//! reactor-tls command line.
//!
//! ```text
//! reactor-tls connect --host example.com --port 443 [--insecure] [--ca ROOT.pem] [--send TEXT]
//!     resolve → connect → TLS 1.2 handshake → optional send → print reply
//! reactor-tls serve --config reactor.toml [--port N]
//!     listener → server handshake per connection → echo
//! ```

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use reactor_tls::config::{load_config, NetConfig, ReactorConfig};
use reactor_tls::net::{ConnectTask, Listener, Socket};
use reactor_tls::observability::{logging::init_logging, metrics};
use reactor_tls::sched::worker::lock;
use reactor_tls::sched::Scheduler;
use reactor_tls::tls::{AcceptAnyCertchain, CertStore, TrustStore};

#[derive(Parser)]
#[command(name = "reactor-tls")]
#[command(about = "TLS 1.2 client probe and echo server on a cooperative reactor", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open a TLS connection and print what the server sends back
    Connect {
        #[arg(long)]
        host: String,

        #[arg(short, long, default_value_t = 443)]
        port: u16,

        /// Skip certificate validation
        #[arg(long)]
        insecure: bool,

        /// Trusted root certificate (PEM); may be repeated
        #[arg(long = "ca")]
        trust_roots: Vec<PathBuf>,

        /// Data to send once the handshake is done
        #[arg(long)]
        send: Option<String>,
    },
    /// Serve a TLS echo endpoint
    Serve {
        #[arg(short, long)]
        config: PathBuf,

        /// Override `server.port`
        #[arg(short, long)]
        port: Option<u16>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Connect {
            host,
            port,
            insecure,
            trust_roots,
            send,
        } => run_connect(&host, port, insecure, &trust_roots, send),
        Commands::Serve { config, port } => run_serve(&config, port),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "reactor-tls failed");
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run_connect(
    host: &str,
    port: u16,
    insecure: bool,
    trust_roots: &[PathBuf],
    send: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let defaults = ReactorConfig::default();
    init_logging(&defaults.logging.filter);
    metrics::describe_metrics();

    let mut config = NetConfig::default();
    if insecure {
        config = config.with_verifier(Arc::new(AcceptAnyCertchain));
    } else {
        let mut store = TrustStore::new();
        for path in trust_roots {
            store.load_pem_file(path)?;
        }
        if store.is_empty() {
            return Err("no trust roots given; pass --ca or --insecure".into());
        }
        config = config.with_verifier(Arc::new(store));
    }

    let mut socket = ConnectTask::new(host, port)
        .connect(&config)
        .map_err(|status| format!("connect to {host}:{port} failed: {}", status.as_str()))?;
    tracing::info!(peer = %socket.describe(), "Connected");

    let payload = send.map(String::into_bytes).unwrap_or_default();
    socket.set_callback_recv_on_close(true);
    socket.enable_crypto_client_with_data(
        &config,
        host,
        payload,
        Box::new(|s: &mut Socket| {
            tracing::info!(peer = %s.describe(), "TLS handshake complete");
            print_replies(s);
        }),
    );

    let mut scheduler = Scheduler::with_config(config);
    let socket = scheduler.add_socket(socket);
    scheduler.run();

    let socket = lock(&socket);
    let failure = match socket.close_reason() {
        Some(reason) if socket.last_alert_received() != Some(0) => Some(reason.to_string()),
        _ => None,
    };
    match failure {
        Some(reason) => Err(reason.into()),
        None => Ok(()),
    }
}

fn print_replies(socket: &mut Socket) {
    socket.recv(Box::new(|s: &mut Socket, data: Vec<u8>| {
        if data.is_empty() {
            return;
        }
        println!("{}", String::from_utf8_lossy(&data));
        print_replies(s);
    }));
}

fn run_serve(path: &Path, port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(path)?;
    init_logging(&config.logging.filter);
    metrics::describe_metrics();

    let net = NetConfig::from_config(&config)?;
    let store = Arc::new(CertStore::from_identities(&config.server.identities)?);
    if store.is_empty() {
        return Err("server.identities is empty".into());
    }
    let port = port.unwrap_or(config.server.port);

    let accept_config = net.clone();
    let listener = Listener::bind(port, move |socket: &mut Socket| {
        socket.enable_crypto_server(&accept_config, store.clone(), Box::new(echo));
    })?;
    tracing::info!(port, identities = config.server.identities.len(), "Serving TLS echo");

    let mut scheduler = Scheduler::with_config(net);
    scheduler.add_socket(listener);
    scheduler.serve();
    Ok(())
}

fn echo(socket: &mut Socket) {
    socket.recv(Box::new(|s: &mut Socket, data: Vec<u8>| {
        if data.is_empty() {
            return;
        }
        if s.send(&data).is_ok() {
            echo(s);
        }
    }));
}
