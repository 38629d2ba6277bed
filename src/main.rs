//! Rota Fetch - Entry Point
//!
//! Fetches a page through leased proxies, or inspects and maintains the
//! lease store.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use http::Method;
use tokio::io::AsyncWriteExt;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rota_fetch::client::{HttpSession, ReqwestTransportFactory, TransportFactory};
use rota_fetch::config::{Config, LogConfig};
use rota_fetch::error::FetchError;
use rota_fetch::models::{FileAttachment, Headers, Params};
use rota_fetch::proxy::{
    BanDetector, FetchOutcome, RemoteAllocator, RetryCoordinator, UserAgentPool,
};
use rota_fetch::repository::{FileLeaseStore, LeaseStore};

/// Exit code for an explicit not-found answer
const EXIT_NOT_FOUND: u8 = 2;

#[derive(Parser)]
#[command(name = "rota-fetch")]
#[command(about = "Fetch pages through rotating leased proxies", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch a URL through a leased proxy and print the body
    Fetch {
        url: String,

        /// HTTP method
        #[arg(short = 'X', long, default_value = "GET")]
        method: String,

        /// Request parameter
        #[arg(short = 'd', long = "data", value_name = "NAME=VALUE")]
        data: Vec<String>,

        /// Raw request payload, sent as is
        #[arg(long, conflicts_with = "data")]
        raw: Option<String>,

        /// File to upload
        #[arg(short = 'F', long = "file", value_name = "NAME=PATH")]
        files: Vec<String>,

        /// Request header
        #[arg(short = 'H', long = "header", value_name = "NAME: VALUE")]
        headers: Vec<String>,

        /// Service name the lease is recorded under
        #[arg(long)]
        service: Option<String>,

        /// Write the body to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Drop the lease on a proxy address
    Release { address: String },
    /// Release a proxy address and exclude it from future leases
    Blacklist { address: String },
    /// Show the valid lease of a service
    Lookup { service: Option<String> },
    /// Remove expired leases and lapsed blacklist entries
    Sweep,
}

enum Completion {
    Done,
    NotFound,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("rota-fetch: {}", e);
            return exit_code(e.exit_code());
        }
    };

    init_tracing(&config.log);

    match run(cli.command, config).await {
        Ok(Completion::Done) => ExitCode::SUCCESS,
        Ok(Completion::NotFound) => ExitCode::from(EXIT_NOT_FOUND),
        Err(e) => {
            error!("{:#}", e);
            eprintln!("rota-fetch: {:#}", e);
            let code = e
                .downcast_ref::<FetchError>()
                .map(FetchError::exit_code)
                .unwrap_or(1);
            exit_code(code)
        }
    }
}

fn init_tracing(log: &LogConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("rota_fetch={}", log.level).into());
    let registry = tracing_subscriber::registry().with(filter);

    // stdout carries fetched bodies
    if log.format.eq_ignore_ascii_case("json") {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

async fn run(command: Commands, config: Config) -> anyhow::Result<Completion> {
    let store = FileLeaseStore::open(&config.store.data_dir, config.lease_policy()).await?;

    match command {
        Commands::Fetch {
            url,
            method,
            data,
            raw,
            files,
            headers,
            service,
            output,
        } => {
            let method = Method::from_bytes(method.to_uppercase().as_bytes())
                .map_err(|_| FetchError::InvalidRequest(format!("unknown method {}", method)))?;
            let params = match raw {
                Some(body) => Params::raw(body),
                None => parse_params(&data)?,
            };
            let headers = parse_headers(&headers)?;
            let files = parse_files(&files)?;

            let mut coordinator_config = config.coordinator_config();
            if let Some(service) = service {
                coordinator_config.service_name = service;
            }

            let factory: Arc<dyn TransportFactory> = Arc::new(ReqwestTransportFactory);
            let settings = config.transport_settings();
            let agents = match &config.allocator.user_agents_file {
                Some(path) => UserAgentPool::load(path).await?,
                None => UserAgentPool::builtin(),
            };
            let allocator = RemoteAllocator::new(
                config.remote_allocator()?,
                agents,
                settings.clone(),
                factory.clone(),
            );
            let coordinator = RetryCoordinator::new(
                Arc::new(store),
                Arc::new(allocator),
                BanDetector::new(&config.fetch.ban_patterns)?,
                coordinator_config,
            );

            let mut session =
                HttpSession::new("", Params::new(), Headers::new(), settings, factory)?;
            session.set_request(&url, params, headers, files);
            info!(session = %session.id(), url = %session.request().url, "Fetching");

            match coordinator.fetch(&mut session, method).await? {
                FetchOutcome::Content(page) => {
                    match output {
                        Some(path) => tokio::fs::write(&path, &page.body)
                            .await
                            .with_context(|| format!("writing {}", path.display()))?,
                        None => {
                            let mut stdout = tokio::io::stdout();
                            stdout.write_all(&page.body).await?;
                            stdout.flush().await?;
                        }
                    }
                    info!(proxy = %page.proxy.address, attempts = page.attempts, "Done");
                    Ok(Completion::Done)
                }
                FetchOutcome::NotFound => {
                    eprintln!("not found: {}", session.request().url);
                    Ok(Completion::NotFound)
                }
            }
        }
        Commands::Release { address } => {
            match store.release(&address).await? {
                Some(service) => println!("released {} from {}", address, service),
                None => println!("no lease on {}", address),
            }
            Ok(Completion::Done)
        }
        Commands::Blacklist { address } => {
            store.blacklist(&address).await?;
            println!("blacklisted {}", address);
            Ok(Completion::Done)
        }
        Commands::Lookup { service } => {
            let service = service.unwrap_or(config.fetch.service_name);
            match store.lookup(&service).await? {
                Some(lease) => {
                    println!("{}", serde_json::to_string_pretty(&lease)?);
                    Ok(Completion::Done)
                }
                None => {
                    eprintln!("no valid lease for {}", service);
                    Ok(Completion::NotFound)
                }
            }
        }
        Commands::Sweep => {
            let report = store.sweep(Utc::now()).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(Completion::Done)
        }
    }
}

fn split_pair<'a>(
    value: &'a str,
    separator: char,
    what: &str,
) -> Result<(&'a str, &'a str), FetchError> {
    value
        .split_once(separator)
        .map(|(name, rest)| (name.trim(), rest))
        .filter(|(name, _)| !name.is_empty())
        .ok_or_else(|| {
            FetchError::InvalidRequest(format!(
                "{} {:?} must look like NAME{}VALUE",
                what, value, separator
            ))
        })
}

fn parse_params(data: &[String]) -> Result<Params, FetchError> {
    data.iter()
        .map(|pair| split_pair(pair, '=', "parameter"))
        .collect()
}

fn parse_headers(lines: &[String]) -> Result<Headers, FetchError> {
    let mut headers = Headers::new();
    for line in lines {
        let (name, value) = split_pair(line, ':', "header")?;
        headers.append(name, value.trim());
    }
    Ok(headers)
}

fn parse_files(specs: &[String]) -> Result<Vec<(String, FileAttachment)>, FetchError> {
    specs
        .iter()
        .map(|spec| {
            let (name, path) = split_pair(spec, '=', "file")?;
            Ok((name.to_string(), FileAttachment::new(path)))
        })
        .collect()
}
