use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "ragweave",
    about = "Local retrieval and context-budget engine for your documents"
)]
pub struct Cli {
    /// Override the XDG data directory
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Increase log verbosity (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Chunk, embed and store documents (.md, .markdown, .txt)
    Ingest(IngestArgs),
    /// Retrieve the chunks most relevant to a query
    Search(SearchArgs),
    /// Print the prompt that would be sent to the model for a query
    Prompt(PromptArgs),
    /// Manage ingested collections
    Collection {
        #[command(subcommand)]
        action: CollectionAction,
    },
    /// Manage remembered facts
    Memory {
        #[command(subcommand)]
        action: MemoryAction,
    },
    /// Recompute embeddings made by a different model
    Reembed,
    /// Show system status and statistics
    Status(StatusArgs),
}

// -- Ingest --

#[derive(Debug, Parser)]
pub struct IngestArgs {
    /// Files to ingest
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,

    /// Collection name (only with a single path; defaults to the file stem)
    #[arg(long)]
    pub name: Option<String>,
}

// -- Search --

#[derive(Debug, Parser)]
pub struct SearchArgs {
    /// The search query
    pub query: String,

    /// Number of results to return
    #[arg(short = 'n', long, default_value = "5")]
    pub count: usize,

    /// Search only within these collections (repeatable)
    #[arg(short = 'c', long)]
    pub collection: Vec<String>,

    /// Output results as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Prompt --

#[derive(Debug, Parser)]
pub struct PromptArgs {
    /// The user's question
    pub query: String,

    /// Search only within these collections (repeatable)
    #[arg(short = 'c', long)]
    pub collection: Vec<String>,
}

// -- Collection subcommands --

#[derive(Debug, Subcommand)]
pub enum CollectionAction {
    /// List all collections
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Remove a collection and all its chunks
    Remove {
        /// Name of the collection to remove
        name: String,
    },
}

// -- Memory subcommands --

#[derive(Debug, Subcommand)]
pub enum MemoryAction {
    /// Remember a fact
    Add {
        /// The fact to remember
        content: String,

        /// Where the fact came from
        #[arg(long, default_value = "manual")]
        source: String,
    },
    /// List remembered facts, most recent first
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Forget a fact by id (as printed by `memory list`)
    Remove {
        /// Memory id or unique prefix, with or without the leading '#'
        id: String,
    },
    /// Find the facts most relevant to a query
    Search {
        /// The search query
        query: String,

        /// Number of results to return
        #[arg(short = 'n', long, default_value = "5")]
        count: usize,
    },
}

// -- Status --

#[derive(Debug, Parser)]
pub struct StatusArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}
