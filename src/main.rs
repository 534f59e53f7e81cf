use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

mod cli;
mod config;
mod lock;
mod semantic;
#[cfg(test)]
mod tests;
mod web;
use config::Config;
use semantic::{
    Document, FailureResponse, IngestResponse, RetrievalError, RetrievalService, SearchResponse,
};

fn init_logging() {
    // logs go to stderr, stdout carries the JSON results
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
}

/// Print a result as JSON; failures are printed as `{ok: false, ...}` too.
fn report<T: Serialize>(result: Result<T, RetrievalError>) -> anyhow::Result<()> {
    match result {
        Ok(response) => {
            println!("{}", serde_json::to_string_pretty(&response)?);
            Ok(())
        }
        Err(err) => {
            println!("{}", serde_json::to_string_pretty(&FailureResponse::from(&err))?);
            Err(err.into())
        }
    }
}

fn main() -> anyhow::Result<()> {
    init_logging();
    let args = cli::Args::parse();

    let config = Config::load().context("invalid configuration")?;
    log::debug!("config: {config:?}");

    match args.command {
        cli::Command::Ingest { files } => {
            let documents = files
                .iter()
                .map(|path| {
                    std::fs::read(path)
                        .map(|bytes| Document::new(path.to_string_lossy(), bytes))
                        .with_context(|| format!("failed to read {}", path.display()))
                })
                .collect::<anyhow::Result<Vec<_>>>()?;

            let service = RetrievalService::new(config)?;
            report(service.ingest(&documents).map(|added_chunks| IngestResponse {
                ok: true,
                added_chunks,
            }))
        }

        cli::Command::Search { query, topk } => {
            let service = RetrievalService::new(config)?;
            report(
                service
                    .search(&query, topk)
                    .map(|hits| SearchResponse { ok: true, hits }),
            )
        }

        cli::Command::Status {} => {
            let service = RetrievalService::new(config)?;
            report(service.status())
        }

        cli::Command::Daemon { listen } => {
            let listen = listen.unwrap_or_else(|| config.listen.clone());
            let service = RetrievalService::new(config)?;
            web::start_daemon(service, &listen)
        }
    }
}
