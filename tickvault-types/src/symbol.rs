use std::fmt;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::VaultError;

/// Canonical symbol key: uppercase, surrounding whitespace trimmed.
///
/// Every map in the engine (desired specs, active subscriptions, validator
/// state) is keyed by this form, so construction always canonicalizes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Symbol(String);

impl Symbol {
    /// Canonicalize a raw symbol string.
    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(raw.as_ref().trim().to_uppercase())
    }

    /// Borrow the canonical form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Symbol {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl<'de> Deserialize<'de> for Symbol {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::new(raw))
    }
}

/// Security classification of a desired symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[non_exhaustive]
pub enum SecurityType {
    /// Common stock.
    #[default]
    Equity,
    /// Exchange-traded fund.
    Etf,
    /// Index (no depth, no trades on some venues).
    Index,
    /// Listed option contract.
    Option,
    /// Futures contract.
    Future,
}

/// Option side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OptionRight {
    /// Call option.
    Call,
    /// Put option.
    Put,
}

/// The contract terms that make a spec an option spec.
///
/// All three fields are required together: a spec with security type
/// [`SecurityType::Option`] but missing terms fails validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionTerms {
    /// Strike price.
    pub strike: Decimal,
    /// Call or put.
    pub right: OptionRight,
    /// Contract expiry date.
    pub expiry: NaiveDate,
}

/// Desired-state entry for one symbol, as loaded from configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolSpec {
    /// Canonical symbol key.
    pub symbol: Symbol,
    /// Whether tick-level trades should be collected.
    #[serde(default = "default_true")]
    pub subscribe_trades: bool,
    /// Whether level-2 depth should be collected (equities only).
    #[serde(default)]
    pub subscribe_depth: bool,
    /// Number of book levels requested when depth is on.
    #[serde(default)]
    pub depth_levels: u32,
    /// Security classification.
    #[serde(default)]
    pub security_type: SecurityType,
    /// Venue routing hint.
    #[serde(default)]
    pub exchange: Option<String>,
    /// Primary listing exchange, when it differs from the routing venue.
    #[serde(default)]
    pub primary_exchange: Option<String>,
    /// Provider-local symbol, when it differs from the canonical key.
    #[serde(default)]
    pub local_symbol: Option<String>,
    /// Option contract terms; present iff this spec describes an option.
    #[serde(default)]
    pub option: Option<OptionTerms>,
}

fn default_true() -> bool {
    true
}

impl SymbolSpec {
    /// Convenience constructor for an equity spec collecting trades only.
    pub fn equity(symbol: impl AsRef<str>) -> Self {
        Self {
            symbol: Symbol::new(symbol),
            subscribe_trades: true,
            subscribe_depth: false,
            depth_levels: 0,
            security_type: SecurityType::Equity,
            exchange: None,
            primary_exchange: None,
            local_symbol: None,
            option: None,
        }
    }

    /// Convenience constructor for an option spec.
    pub fn option(symbol: impl AsRef<str>, terms: OptionTerms) -> Self {
        Self {
            symbol: Symbol::new(symbol),
            subscribe_trades: true,
            subscribe_depth: false,
            depth_levels: 0,
            security_type: SecurityType::Option,
            exchange: None,
            primary_exchange: None,
            local_symbol: None,
            option: Some(terms),
        }
    }

    /// Enable depth collection with the given number of levels.
    #[must_use]
    pub fn with_depth(mut self, levels: u32) -> Self {
        self.subscribe_depth = true;
        self.depth_levels = levels;
        self
    }

    /// Whether this spec routes through the option-trades channel.
    #[must_use]
    pub const fn is_option(&self) -> bool {
        matches!(self.security_type, SecurityType::Option)
    }

    /// Validate the spec: option specs must carry full terms, depth requires levels.
    pub fn validate(&self) -> Result<(), VaultError> {
        if self.symbol.as_str().is_empty() {
            return Err(VaultError::invalid_arg("symbol key must be non-empty"));
        }
        if self.is_option() && self.option.is_none() {
            return Err(VaultError::invalid_arg(format!(
                "option spec {} is missing strike/right/expiry",
                self.symbol
            )));
        }
        if !self.is_option() && self.option.is_some() {
            return Err(VaultError::invalid_arg(format!(
                "{} carries option terms but is not an option",
                self.symbol
            )));
        }
        if self.subscribe_depth && self.depth_levels == 0 {
            return Err(VaultError::invalid_arg(format!(
                "{} requests depth with zero levels",
                self.symbol
            )));
        }
        Ok(())
    }
}
