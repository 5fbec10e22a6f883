//! CLI parsing and environment resolution for the backend URL (C9).
//!
//! A `clap`-derived struct for the demo binary, plus a free function
//! resolving the one environment variable the engine cares about.

use clap::Parser;

use crate::types::Role;

/// Default backend origin when `BANDROOM_BACKEND_URL` is unset (§6).
pub const DEFAULT_BACKEND_URL: &str = "http://localhost:3001";

/// Name of the environment variable carrying the backend origin.
pub const BACKEND_URL_ENV: &str = "BANDROOM_BACKEND_URL";

/// Resolve the backend origin: `BANDROOM_BACKEND_URL` if set, else the default.
pub fn backend_url() -> String {
    std::env::var(BACKEND_URL_ENV).unwrap_or_else(|_| DEFAULT_BACKEND_URL.to_owned())
}

/// Fallback display name when `--username` is omitted: the local OS account.
fn default_username() -> String {
    whoami::username()
}

/// Convert an `http(s)://` origin into the `ws(s)://` form namespace sockets connect to.
pub fn to_ws_origin(http_origin: &str) -> String {
    if let Some(rest) = http_origin.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = http_origin.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        http_origin.to_owned()
    }
}

/// Command-line arguments for `bandroom-session-cli`, the terminal
/// demonstration binary that exercises the facade against a real backend.
#[derive(Parser, Debug)]
#[command(version, about = "Terminal harness for the bandroom session engine")]
pub struct Cli {
    /// Backend origin; overrides `BANDROOM_BACKEND_URL` if given.
    #[arg(long)]
    pub backend_url: Option<String>,

    /// Room to join on startup.
    #[arg(long)]
    pub room: Option<String>,

    /// Display name to join with; defaults to the local OS account name.
    #[arg(long, default_value_t = default_username())]
    pub username: String,

    /// Role to request when joining.
    #[arg(long, value_enum, default_value_t = CliRole::BandMember)]
    pub role: CliRole,

    /// Disable ANSI colors. Overrides `NO_COLOR` if explicitly passed.
    #[arg(long = "no-color", default_value_t = false)]
    pub disable_colors: bool,
}

impl Cli {
    /// Resolve the effective backend URL: `--backend-url`, then the env var, then the default.
    pub fn resolved_backend_url(&self) -> String {
        self.backend_url.clone().unwrap_or_else(backend_url)
    }
}

/// `clap`-friendly mirror of [`Role`] (the domain type has no `ValueEnum` impl
/// since it's shared with the wire protocol, where it serializes differently).
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum CliRole {
    /// Full participant.
    BandMember,
    /// Observer.
    Audience,
}

impl From<CliRole> for Role {
    fn from(value: CliRole) -> Self {
        match value {
            CliRole::BandMember => Role::BandMember,
            CliRole::Audience => Role::Audience,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_origin_becomes_ws() {
        assert_eq!(to_ws_origin("http://localhost:3001"), "ws://localhost:3001");
        assert_eq!(to_ws_origin("https://bandroom.example"), "wss://bandroom.example");
    }
}
