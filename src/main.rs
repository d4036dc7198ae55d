//! Portico - An Embeddable HTTP/1.x Server Core
//!
//! This is the demo binary. It starts a server with a few example routes
//! and shuts it down gracefully on Ctrl+C.

use portico::config::{ServerConfig, TlsConfig};
use portico::dispatch::{FnModule, HttpError, RedirectRule};
use portico::http::{Request, Response};
use portico::server::Server;
use portico::session::Session;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Command-line options
struct Args {
    host: String,
    port: u16,
    backlog: Option<u32>,
    buffer_size: Option<usize>,
    max_requests: Option<usize>,
    max_queue: Option<usize>,
    idle_timeout: Option<u64>,
    cert: Option<String>,
    key: Option<String>,
    show_errors: bool,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            host: portico::DEFAULT_HOST.to_string(),
            port: portico::DEFAULT_PORT,
            backlog: None,
            buffer_size: None,
            max_requests: None,
            max_queue: None,
            idle_timeout: None,
            cert: None,
            key: None,
            show_errors: false,
        }
    }
}

impl Args {
    /// Parse options from the command line
    fn from_args() -> Self {
        let mut parsed = Args::default();
        let args: Vec<String> = std::env::args().collect();

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--host" | "-h" => parsed.host = value(&args, &mut i),
                "--port" | "-p" => parsed.port = number(&args, &mut i),
                "--backlog" => parsed.backlog = Some(number(&args, &mut i)),
                "--buffer-size" => parsed.buffer_size = Some(number(&args, &mut i)),
                "--max-requests" => parsed.max_requests = Some(number(&args, &mut i)),
                "--max-queue" => parsed.max_queue = Some(number(&args, &mut i)),
                "--idle-timeout" => parsed.idle_timeout = Some(number(&args, &mut i)),
                "--cert" => parsed.cert = Some(value(&args, &mut i)),
                "--key" => parsed.key = Some(value(&args, &mut i)),
                "--show-errors" => {
                    parsed.show_errors = true;
                    i += 1;
                }
                "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "--version" | "-v" => {
                    println!("Portico version {}", portico::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {}", args[i]);
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        parsed
    }

    fn into_config(self) -> anyhow::Result<ServerConfig> {
        let mut config = ServerConfig::default().with_address(&self.host, self.port)?;

        if let Some(backlog) = self.backlog {
            config.backlog = backlog;
        }
        if let Some(size) = self.buffer_size {
            config.buffer_size = size;
        }
        if let Some(max) = self.max_requests {
            config.max_concurrent_requests = max;
        }
        if let Some(max) = self.max_queue {
            config.max_queue_size = max;
        }
        if let Some(secs) = self.idle_timeout {
            config.idle_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        config.show_error_details = self.show_errors;

        match (self.cert, self.key) {
            (Some(cert), Some(key)) => config.tls = Some(TlsConfig::new(cert, key)),
            (None, None) => {}
            _ => anyhow::bail!("--cert and --key must be given together"),
        }

        Ok(config)
    }
}

/// Takes the value following the flag at `i`.
fn value(args: &[String], i: &mut usize) -> String {
    let Some(value) = args.get(*i + 1) else {
        eprintln!("Error: {} requires a value", args[*i]);
        std::process::exit(1);
    };
    *i += 2;
    value.clone()
}

fn number<T: FromStr>(args: &[String], i: &mut usize) -> T {
    let flag = args[*i].clone();
    value(args, i).parse().unwrap_or_else(|_| {
        eprintln!("Error: invalid number for {}", flag);
        std::process::exit(1);
    })
}

fn print_help() {
    println!(
        r#"
Portico - An Embeddable HTTP/1.x Server Core

USAGE:
    portico [OPTIONS]

OPTIONS:
    -h, --host <HOST>             Host to bind to (default: 127.0.0.1)
    -p, --port <PORT>             Port to listen on (default: 8080)
        --backlog <N>             Pending connection queue depth (default: 1024)
        --buffer-size <BYTES>     Per-connection read buffer (default: 16384)
        --max-requests <N>        Requests processed at once (default: 64)
        --max-queue <N>           Requests waiting beyond that (default: 1024)
        --idle-timeout <SECS>     Close silent connections, 0 disables (default: 30)
        --cert <PATH>             PEM certificate chain; enables TLS
        --key <PATH>              PEM private key
        --show-errors             Include error details in responses
    -v, --version                 Print version information
        --help                    Print this help message

LOGGING:
    Set RUST_LOG to adjust verbosity, e.g. RUST_LOG=portico=debug

EXAMPLES:
    portico                                   # Start on 127.0.0.1:8080
    portico --port 9000 --max-requests 4      # Small worker budget
    portico --cert cert.pem --key key.pem     # Serve HTTPS

TRY IT:
    $ curl -i http://127.0.0.1:8080/
    $ curl -i -c jar -b jar http://127.0.0.1:8080/visits
    $ curl -i -d 'name=ada' http://127.0.0.1:8080/echo
"#
    );
}

fn print_banner(config: &ServerConfig) {
    let scheme = if config.is_secure() { "https" } else { "http" };
    println!(
        r#"
Portico v{} - Embeddable HTTP/1.x Server Core
──────────────────────────────────────────────────────────────
Server starting on {}://{}
Workers: {}   Queue: {}

Use Ctrl+C to shutdown gracefully.
"#,
        portico::VERSION,
        scheme,
        config.bind_address,
        config.max_concurrent_requests,
        config.max_queue_size,
    );
}

/// The demo routes.
fn demo(request: &Request, response: &mut Response, session: &mut Session) -> anyhow::Result<bool> {
    match request.path() {
        "/" => {
            response.set_content_type("text/plain; charset=utf-8");
            response.write(format!("Hello from Portico v{}\n", portico::VERSION));
        }
        "/visits" => {
            let visits = session
                .get("visits")
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(0)
                + 1;
            session.set("visits", visits.to_string());
            response.set_content_type("text/plain; charset=utf-8");
            response.write(format!("Visit {} in session {}\n", visits, session.id()));
        }
        "/echo" => {
            let form = request
                .form()
                .ok_or_else(|| HttpError::bad_request("Expected a form body"))?;
            response.set_content_type("text/plain; charset=utf-8");
            for (name, value) in form.iter() {
                response.write(format!("{} = {}\n", name, value));
            }
        }
        "/panic" => panic!("demo panic"),
        _ => return Ok(false),
    }
    Ok(true)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Args::from_args().into_config()?;

    // Set up logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    print_banner(&config);

    let server = Server::builder(config)
        .rule(RedirectRule::new("/home", "/"))
        .module(FnModule::new(demo))
        .build()?
        .start()
        .await?;
    info!(address = %server.local_addr(), "Ready to accept connections");

    signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping server...");

    let stats = Arc::clone(server.stats());
    server.stop().await;

    let stats = stats.snapshot();
    info!(
        connections = stats.connections_accepted,
        requests = stats.requests_received,
        rejected = stats.requests_rejected,
        "Server shutdown complete"
    );
    Ok(())
}
