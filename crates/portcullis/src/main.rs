//! Portcullis gateway.
//!
//! Terminates client connections, checks the session cookie on upgrade
//! requests and tunnels authorized ones to the upstream.

use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;

use portcullis_lib::{Config, Gateway};
use portcullis_oidc::bootstrap;
use portcullis_session::{decode_text, encode_text, SessionCodec, SessionState};
use portcullis_telemetry::{log_listening, LogFormat, Telemetry, TelemetryConfig};
use portcullis_trust::{cache_key, load_certificate, TrustedCertificate};
use portcullis_tunnel::{UpstreamConnector, UpstreamTlsOptions};

/// Fraction of the remaining certificate lifetime after which a renewal is due.
const CERT_REFRESH_FRACTION: f64 = 0.5;

#[derive(Parser, Debug)]
#[command(name = "portcullis", about = "Portcullis OIDC upgrade gateway", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the gateway.
    Serve {
        /// Configuration file (YAML, or JSON with a .json extension).
        #[arg(short, long, env = "PORTCULLIS_CONFIG")]
        config: PathBuf,

        /// Override the configured log level.
        #[arg(long)]
        log_level: Option<String>,

        /// Override the configured log format (json or pretty).
        #[arg(long)]
        log_format: Option<String>,
    },

    /// Validate a configuration file and reach the identity provider.
    Check {
        #[arg(short, long, env = "PORTCULLIS_CONFIG")]
        config: PathBuf,
    },

    /// Encrypt text into a cookie value.
    Encrypt {
        /// Encryption key (16, 24 or 32 bytes).
        #[arg(long, env = "PORTCULLIS_ENCRYPTION_KEY", hide_env_values = true)]
        key: String,

        /// Treat the text as a refresh token and seal a session valid for
        /// this many seconds.
        #[arg(long)]
        session_ttl: Option<i64>,

        text: String,
    },

    /// Decrypt a cookie value.
    Decrypt {
        #[arg(long, env = "PORTCULLIS_ENCRYPTION_KEY", hide_env_values = true)]
        key: String,

        text: String,
    },

    /// Print the cache key of an encoded token.
    CacheKey { token: String },
}

fn fail(message: impl Display) -> ExitCode {
    eprintln!("error: {}", message);
    ExitCode::from(1)
}

fn load_config(path: &Path) -> Result<Config, ExitCode> {
    Config::load(path).map_err(fail)
}

fn load_tls(config: &Config) -> Result<Option<TrustedCertificate>, ExitCode> {
    match (&config.tls_cert, &config.tls_private_key) {
        (Some(cert), Some(key)) => load_certificate(cert, key).map(Some).map_err(fail),
        _ => Ok(None),
    }
}

fn build_connector(config: &Config) -> Result<UpstreamConnector, ExitCode> {
    let ca_pem = match &config.upstream_ca {
        Some(path) => Some(std::fs::read(path).map_err(|e| {
            fail(format!("failed to read {}: {}", path.display(), e))
        })?),
        None => None,
    };

    let options = UpstreamTlsOptions {
        ca_pem,
        insecure_skip_verify: config.upstream_insecure_skip_verify,
    };

    UpstreamConnector::new(&config.upstream_url, &options).map_err(fail)
}

/// Run the serve command.
async fn run_serve(
    config_path: &Path,
    log_level: Option<String>,
    log_format: Option<String>,
) -> ExitCode {
    let config = match load_config(config_path) {
        Ok(c) => c,
        Err(code) => return code,
    };

    let format = match log_format {
        Some(value) => match LogFormat::parse(&value) {
            Some(f) => f,
            None => return fail(format!("invalid log format: {}", value)),
        },
        None => match config.log_format() {
            Ok(f) => f,
            Err(e) => return fail(e),
        },
    };

    let telemetry_config = TelemetryConfig::new()
        .with_log_level(log_level.unwrap_or_else(|| config.log_level.clone()))
        .with_log_format(format);

    let telemetry = match Telemetry::init(telemetry_config) {
        Ok(t) => t,
        Err(e) => return fail(e),
    };

    let codec = match SessionCodec::new(config.encryption_key.as_bytes()) {
        Ok(c) => c,
        Err(e) => return fail(e),
    };

    let tls: Option<TlsAcceptor> = match load_tls(&config) {
        Ok(Some(certificate)) => {
            let leaf = certificate.leaf();
            tracing::info!(
                subject = %leaf.subject,
                not_after = %leaf.not_after,
                refresh_in_secs = certificate.refresh_within(CERT_REFRESH_FRACTION).as_secs(),
                "Serving TLS certificate"
            );
            match certificate.tls_acceptor() {
                Ok(acceptor) => Some(acceptor),
                Err(e) => return fail(e),
            }
        }
        Ok(None) => None,
        Err(code) => return code,
    };

    let connector = match build_connector(&config) {
        Ok(c) => c,
        Err(code) => return code,
    };

    let (identity, _provider) = match bootstrap(config.bootstrap_config()).await {
        Ok(discovered) => discovered,
        Err(e) => return fail(e),
    };

    let addr = match config.listen_addr() {
        Ok(a) => a,
        Err(e) => return fail(e),
    };

    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => return fail(format!("failed to bind to {}: {}", addr, e)),
    };

    log_listening!(
        address = %addr,
        tls = tls.is_some(),
        upstream = %connector.address(),
        "Portcullis listening"
    );

    let gateway = Arc::new(
        Gateway::new(codec, connector)
            .with_cookie_name(config.cookie_name.clone())
            .with_max_header_size(config.max_header_size)
            .with_identity(identity.clone()),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(true);
        }
    });

    gateway.serve(listener, tls, shutdown_rx).await;

    identity.stop_sync();
    telemetry.shutdown();
    ExitCode::SUCCESS
}

/// Run the check command.
async fn run_check(config_path: &Path) -> ExitCode {
    let config = match load_config(config_path) {
        Ok(c) => c,
        Err(code) => return code,
    };
    println!("✓ configuration {}", config_path.display());

    if let Err(e) = SessionCodec::new(config.encryption_key.as_bytes()) {
        return fail(e);
    }
    println!("✓ encryption key ({} bytes)", config.encryption_key.len());

    match load_tls(&config) {
        Ok(Some(certificate)) => {
            let leaf = certificate.leaf();
            if leaf.not_after <= Utc::now() {
                return fail(format!("certificate {} expired at {}", leaf.subject, leaf.not_after));
            }
            println!(
                "✓ certificate {} (expires {}, refresh in {}s)",
                leaf.subject,
                leaf.not_after,
                certificate.refresh_within(CERT_REFRESH_FRACTION).as_secs()
            );
        }
        Ok(None) => println!("✓ plain listener (no TLS)"),
        Err(code) => return code,
    }

    let connector = match build_connector(&config) {
        Ok(c) => c,
        Err(code) => return code,
    };
    println!(
        "✓ upstream {} ({})",
        connector.address(),
        if connector.is_tls() { "tls" } else { "plain" }
    );

    match bootstrap(config.bootstrap_config()).await {
        Ok((identity, provider)) => {
            println!(
                "✓ identity provider {} ({} signing key(s))",
                provider.issuer(),
                provider.keys.len()
            );
            identity.stop_sync();
            ExitCode::SUCCESS
        }
        Err(e) => fail(e),
    }
}

fn run_encrypt(key: &str, session_ttl: Option<i64>, text: &str) -> ExitCode {
    let sealed = match session_ttl {
        Some(ttl) => {
            let Some(expires_at) = chrono::Duration::try_seconds(ttl)
                .and_then(|ttl| Utc::now().checked_add_signed(ttl))
            else {
                return fail(format!("session ttl out of range: {}", ttl));
            };
            SessionCodec::new(key.as_bytes())
                .and_then(|codec| codec.seal_state(&SessionState::new(text, expires_at)))
        }
        None => encode_text(text, key),
    };

    match sealed {
        Ok(value) => {
            println!("{}", value);
            ExitCode::SUCCESS
        }
        Err(e) => fail(e),
    }
}

fn run_decrypt(key: &str, text: &str) -> ExitCode {
    match decode_text(text, key) {
        Ok(plain) => {
            println!("{}", plain);
            ExitCode::SUCCESS
        }
        Err(e) => fail(e),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            log_level,
            log_format,
        } => run_serve(&config, log_level, log_format).await,
        Commands::Check { config } => run_check(&config).await,
        Commands::Encrypt {
            key,
            session_ttl,
            text,
        } => run_encrypt(&key, session_ttl, &text),
        Commands::Decrypt { key, text } => run_decrypt(&key, &text),
        Commands::CacheKey { token } => {
            println!("{}", cache_key(&token));
            ExitCode::SUCCESS
        }
    }
}
