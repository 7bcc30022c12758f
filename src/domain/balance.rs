use bigdecimal::BigDecimal;
use num_traits::Zero;

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct BalanceRecord {
    pub address: String,
    pub balance: BigDecimal,
    pub received: BigDecimal,
    pub sent: BigDecimal,
    pub rewarded: BigDecimal,
}

impl BalanceRecord {
    /// Record for providers that only report the current balance. Everything held counts as
    /// received.
    pub fn from_balance(address: &str, balance: BigDecimal) -> Self {
        Self {
            address: address.to_string(),
            received: balance.clone(),
            balance,
            sent: BigDecimal::zero(),
            rewarded: BigDecimal::zero(),
        }
    }

    pub fn with_rewarded(mut self, rewarded: BigDecimal) -> Self {
        self.rewarded = rewarded;
        self
    }
}
