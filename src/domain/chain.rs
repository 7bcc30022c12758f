use std::sync::LazyLock;

use bigdecimal::num_bigint::BigInt;
use bigdecimal::BigDecimal;
use num_traits::Zero;
use regex::Regex;

use super::amount::{self, AmountError};

/// How a chain writes its addresses. Addresses are only compared after being normalized with
/// [`ChainSpec::normalize_address`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AddressFormat {
    /// `0x` + 40 hex digits, compared lower-cased (EVM).
    Hex,
    /// Case sensitive base58 (Solana, Bitcoin legacy).
    Base58,
    /// Bech32 with a human readable prefix, canonical form is lower case.
    Bech32,
    /// `0x` + up to 64 hex digits, left padded with zeros (Aptos).
    Aptos,
    /// Filecoin `f`/`t` addresses, canonical form is lower case.
    Filecoin,
    /// Compared verbatim.
    Plain,
}

static HEX_ADDRESS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^0x[0-9a-f]{40}$").expect("static regex"));
static APTOS_ADDRESS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^0x[0-9a-f]{64}$").expect("static regex"));
static BASE58_ADDRESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[1-9A-HJ-NP-Za-km-z]{25,44}$").expect("static regex")
});
static FILECOIN_ADDRESS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[ft][0-4][0-9a-z]+$").expect("static regex"));

/// Static description of a chain: its native asset and addressing rules.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainSpec {
    pub id: String,
    pub symbol: String,
    pub precision: u32,
    pub address_format: AddressFormat,
    pub bech32_hrp: Option<String>,
    /// Wire identifier of the native asset where providers report several (Cosmos denoms).
    pub denom: Option<String>,
    /// Transfers strictly below this display amount are treated as dust and dropped.
    pub min_valid_amount: BigDecimal,
    /// Number of newest blocks the scanner leaves alone.
    pub block_height_offset: u64,
}

impl ChainSpec {
    pub fn new(id: &str, symbol: &str, precision: u32, address_format: AddressFormat) -> Self {
        Self {
            id: id.to_string(),
            symbol: symbol.to_string(),
            precision,
            address_format,
            bech32_hrp: None,
            denom: None,
            min_valid_amount: BigDecimal::from(0),
            block_height_offset: 0,
        }
    }

    pub fn with_bech32_hrp(mut self, hrp: &str) -> Self {
        self.bech32_hrp = Some(hrp.to_lowercase());
        self
    }

    pub fn with_denom(mut self, denom: &str) -> Self {
        self.denom = Some(denom.to_string());
        self
    }

    pub fn with_min_valid_amount(mut self, amount: BigDecimal) -> Self {
        self.min_valid_amount = amount;
        self
    }

    pub fn with_block_height_offset(mut self, offset: u64) -> Self {
        self.block_height_offset = offset;
        self
    }

    /// Native denom, falling back to the Cosmos convention of `u` + lower-cased symbol.
    pub fn native_denom(&self) -> String {
        self.denom
            .clone()
            .unwrap_or_else(|| format!("u{}", self.symbol.to_lowercase()))
    }

    pub fn normalize_address(&self, address: &str) -> String {
        let address = address.trim();
        match self.address_format {
            AddressFormat::Hex | AddressFormat::Bech32 | AddressFormat::Filecoin => {
                address.to_lowercase()
            }
            AddressFormat::Aptos => {
                let lowered = address.to_lowercase();
                let hex = lowered.strip_prefix("0x").unwrap_or(&lowered);
                if hex.is_empty() || hex.len() > 64 {
                    return lowered;
                }
                format!("0x{hex:0>64}")
            }
            AddressFormat::Base58 | AddressFormat::Plain => address.to_string(),
        }
    }

    pub fn is_valid_address(&self, address: &str) -> bool {
        let normalized = self.normalize_address(address);
        match self.address_format {
            AddressFormat::Hex => HEX_ADDRESS.is_match(&normalized),
            AddressFormat::Aptos => APTOS_ADDRESS.is_match(&normalized),
            AddressFormat::Base58 => BASE58_ADDRESS.is_match(&normalized),
            AddressFormat::Filecoin => FILECOIN_ADDRESS.is_match(&normalized),
            AddressFormat::Bech32 => match &self.bech32_hrp {
                Some(hrp) => normalized
                    .strip_prefix(hrp.as_str())
                    .and_then(|rest| rest.strip_prefix('1'))
                    .is_some_and(|data| {
                        data.len() >= 6
                            && data
                                .chars()
                                .all(|c| "qpzry9x8gf2tvdw0s3jn54khce6mua7l".contains(c))
                    }),
                None => normalized.contains('1'),
            },
            AddressFormat::Plain => !normalized.is_empty(),
        }
    }

    pub fn same_address(&self, left: &str, right: &str) -> bool {
        self.normalize_address(left) == self.normalize_address(right)
    }

    pub fn from_unit(&self, atomic: &BigInt) -> BigDecimal {
        amount::from_unit(atomic, self.precision)
    }

    /// Parses a provider's atomic amount string straight into display units.
    pub fn parse_amount(&self, raw: &str) -> Result<BigDecimal, AmountError> {
        amount::parse_atomic(raw).map(|atomic| self.from_unit(&atomic))
    }

    pub fn is_dust(&self, value: &BigDecimal) -> bool {
        value < &self.min_valid_amount
    }

    /// Zero-value movements and dust are not reported as transfers.
    pub fn accepts_amount(&self, value: &BigDecimal) -> bool {
        !value.is_zero() && !self.is_dust(value)
    }
}
