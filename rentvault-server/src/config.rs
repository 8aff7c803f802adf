//! Server configuration.
//!
//! Loads configuration from a TOML file with support for environment variable
//! expansion in string values. Variables use `$VAR` or `${VAR}` syntax.
//!
//! # Example Configuration
//!
//! ```toml
//! host = "0.0.0.0"
//! port = 4402
//!
//! [gate]
//! currency = "sat"
//! amount = 10000
//! reference_ttl_secs = 600
//! token_ttl_secs = 3600
//! fiat_rate = "0.0005"
//! fiat_symbol = "USD"
//!
//! [escrow]
//! grace_secs = 86400
//! expiry_policy = "refund_renter"
//!
//! [chain]
//! mode = "sandbox"
//! ```
//!
//! # Environment Variables
//!
//! - `CONFIG` — Path to configuration file (default: `config.toml`)
//! - `HOST` — Override server bind address
//! - `PORT` — Override server port

use std::net::IpAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};

use rentvault::escrow::ExpiryPolicy;

/// Top-level server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server bind address (default: `0.0.0.0`).
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Server port (default: `4402`).
    #[serde(default = "default_port")]
    pub port: u16,

    /// Payment gate settings for gated asset routes.
    #[serde(default)]
    pub gate: GateSection,

    /// Escrow state machine settings.
    #[serde(default)]
    pub escrow: EscrowSection,

    /// Chain backend selection.
    #[serde(default)]
    pub chain: ChainSection,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            gate: GateSection::default(),
            escrow: EscrowSection::default(),
            chain: ChainSection::default(),
        }
    }
}

/// `[gate]` — payment gate pricing and lifetimes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateSection {
    /// Currency label shown in 402 challenges.
    #[serde(default = "default_currency")]
    pub currency: String,

    /// Price per unlock, in the smallest currency unit.
    #[serde(default = "default_amount")]
    pub amount: u64,

    /// How long a payment reference stays payable, in seconds.
    #[serde(default = "default_reference_ttl")]
    pub reference_ttl_secs: u64,

    /// How long a minted access token stays valid, in seconds.
    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: u64,

    /// Optional fixed fiat rate per chain unit, as a decimal string.
    /// When unset, challenges omit the fiat estimate.
    #[serde(default)]
    pub fiat_rate: Option<String>,

    /// Currency symbol for the fiat estimate.
    #[serde(default = "default_fiat_symbol")]
    pub fiat_symbol: String,
}

impl Default for GateSection {
    fn default() -> Self {
        Self {
            currency: default_currency(),
            amount: default_amount(),
            reference_ttl_secs: default_reference_ttl(),
            token_ttl_secs: default_token_ttl(),
            fiat_rate: None,
            fiat_symbol: default_fiat_symbol(),
        }
    }
}

/// `[escrow]` — state machine timing and expiry payout.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EscrowSection {
    /// Seconds past the rental period end before a funded contract expires.
    #[serde(default = "default_grace")]
    pub grace_secs: u64,

    /// Payout policy applied on expiry.
    #[serde(default)]
    pub expiry_policy: ExpiryPolicy,
}

impl Default for EscrowSection {
    fn default() -> Self {
        Self {
            grace_secs: default_grace(),
            expiry_policy: ExpiryPolicy::default(),
        }
    }
}

/// `[chain]` — which chain client backs the engine.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ChainSection {
    /// Backend selection.
    #[serde(default)]
    pub mode: ChainMode,
}

/// Chain backend selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainMode {
    /// In-process sandbox chain; transactions exist only in memory.
    #[default]
    Sandbox,
}

fn default_host() -> IpAddr {
    IpAddr::V4(std::net::Ipv4Addr::new(0, 0, 0, 0))
}

fn default_port() -> u16 {
    4402
}

fn default_currency() -> String {
    "sat".to_owned()
}

const fn default_amount() -> u64 {
    10_000
}

const fn default_reference_ttl() -> u64 {
    600
}

const fn default_token_ttl() -> u64 {
    3_600
}

fn default_fiat_symbol() -> String {
    "USD".to_owned()
}

const fn default_grace() -> u64 {
    86_400
}

impl ServerConfig {
    /// Loads configuration from the path given by the `CONFIG` environment
    /// variable, falling back to `config.toml` in the current directory.
    ///
    /// After loading, `$VAR` / `${VAR}` references in string values are
    /// expanded from the process environment, and `HOST` / `PORT` env vars
    /// override the file values.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        let path = std::env::var("CONFIG").unwrap_or_else(|_| "config.toml".to_owned());
        Self::load_from(&path)
    }

    /// Loads configuration from a specific file path. A missing file yields
    /// the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_from(path: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let content = if Path::new(path).exists() {
            std::fs::read_to_string(path)?
        } else {
            String::new()
        };

        let expanded = expand_env_vars(&content);
        let mut config: Self = toml::from_str(&expanded)?;

        if let Ok(host) = std::env::var("HOST") {
            if let Ok(addr) = host.parse() {
                config.host = addr;
            }
        }
        if let Ok(port) = std::env::var("PORT") {
            if let Ok(p) = port.parse() {
                config.port = p;
            }
        }

        Ok(config)
    }
}

/// Expands `$VAR` and `${VAR}` patterns from environment variables.
/// Unresolved variables are left as-is.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != '$' {
            result.push(ch);
            continue;
        }

        let braced = chars.peek() == Some(&'{');
        if braced {
            chars.next();
        }

        let mut name = String::new();
        while let Some(&c) = chars.peek() {
            if braced {
                if c == '}' {
                    chars.next();
                    break;
                }
            } else if !c.is_ascii_alphanumeric() && c != '_' {
                break;
            }
            name.push(c);
            chars.next();
        }

        match std::env::var(&name) {
            Ok(value) if !name.is_empty() => result.push_str(&value),
            _ => {
                result.push('$');
                if braced {
                    result.push('{');
                }
                result.push_str(&name);
                if braced && !name.is_empty() {
                    result.push('}');
                }
            }
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let config: ServerConfig = toml::from_str("").unwrap();
        assert_eq!(config.port, 4402);
        assert_eq!(config.gate.amount, 10_000);
        assert_eq!(config.escrow.grace_secs, 86_400);
        assert_eq!(config.escrow.expiry_policy, ExpiryPolicy::RefundRenter);
        assert_eq!(config.chain.mode, ChainMode::Sandbox);
    }

    #[test]
    fn sections_parse() {
        let config: ServerConfig = toml::from_str(
            r#"
            port = 8080

            [gate]
            currency = "msat"
            amount = 250
            fiat_rate = "0.001"

            [escrow]
            grace_secs = 3600
            expiry_policy = "standard_split"
            "#,
        )
        .unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.gate.currency, "msat");
        assert_eq!(config.gate.fiat_rate.as_deref(), Some("0.001"));
        assert_eq!(config.escrow.expiry_policy, ExpiryPolicy::StandardSplit);
    }

    #[test]
    fn unresolved_variables_stay_verbatim() {
        let expanded = expand_env_vars("key = \"${RENTVAULT_UNSET_VAR}\"");
        assert_eq!(expanded, "key = \"${RENTVAULT_UNSET_VAR}\"");
    }

    #[test]
    fn set_variables_are_expanded() {
        // SAFETY: test-local variable name, no concurrent reader depends on it.
        unsafe { std::env::set_var("RENTVAULT_TEST_RATE", "0.0005") };
        let expanded = expand_env_vars("rate = \"$RENTVAULT_TEST_RATE\"");
        assert_eq!(expanded, "rate = \"0.0005\"");
    }
}
