//! CLI module for cai-mcp

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::config::CONFIG_ENV_VAR;

#[derive(Parser)]
#[command(name = "cai-mcp")]
#[command(about = "cai-mcp - Character.AI tools for MCP clients", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Config file (default: ~/.cai-mcp/config.json)
    #[arg(long, global = true, env = CONFIG_ENV_VAR)]
    pub config: Option<PathBuf>,

    /// Log output format (logs always go to stderr)
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Serve MCP over stdio (the default), or over HTTP with --http
    Serve {
        /// Serve the Streamable HTTP and WebSocket transports instead of stdio
        #[arg(long)]
        http: bool,

        /// Address to bind the HTTP transport to
        #[arg(long)]
        host: Option<String>,

        /// Port for the HTTP transport
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Show, save or replace the stored Character.AI token
    Token {
        /// Print the saved token in full instead of masked
        #[arg(long)]
        reveal: bool,
    },

    /// List the tools this server offers
    Tools,

    /// Check that the token works and show the account it belongs to
    Check,
}
