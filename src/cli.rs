use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Add documents to the knowledge base
    Ingest {
        /// Files to ingest (.txt, .md, .pdf, ...)
        #[clap(required = true)]
        files: Vec<PathBuf>,
    },
    /// Search the knowledge base
    Search {
        /// Query text
        query: String,

        /// Number of hits to return
        #[clap(short = 'k', long, default_value = "5")]
        topk: usize,
    },
    /// Show the active embedding space and corpus
    Status {},
    /// Start kb as a service.
    Daemon {
        /// Address to listen on (overrides KB_LISTEN)
        #[clap(long)]
        listen: Option<String>,
    },
}
