use axum::http::{HeaderMap, HeaderName, HeaderValue};
use clap::{Parser, Subcommand};

/// idemgate — idempotency gateway for POST/PATCH APIs
#[derive(Parser)]
#[command(name = "idemgate", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the gateway server
    Serve {
        /// Port to bind (defaults to IDEMPOTENCY_PORT)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Print the fingerprint the gateway computes for a JSON body
    Fingerprint {
        /// Idempotency key sent by the client
        #[arg(long)]
        key: String,
        /// Request header as `name:value`; repeatable
        #[arg(long = "header", value_parser = parse_header)]
        headers: Vec<(HeaderName, HeaderValue)>,
        /// Top-level body field to leave out; repeatable or comma-separated
        #[arg(long = "exclude", value_delimiter = ',')]
        excludes: Vec<String>,
        /// Request body as JSON
        body: String,
    },
}

fn parse_header(raw: &str) -> Result<(HeaderName, HeaderValue), String> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| format!("expected name:value, got '{}'", raw))?;
    let name = HeaderName::try_from(name.trim()).map_err(|e| e.to_string())?;
    let value = HeaderValue::from_str(value.trim()).map_err(|e| e.to_string())?;
    Ok((name, value))
}

pub fn header_map(headers: Vec<(HeaderName, HeaderValue)>) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        map.append(name, value);
    }
    map
}
