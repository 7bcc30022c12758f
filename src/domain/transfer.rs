use std::collections::{BTreeMap, HashMap, HashSet};

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};

/// A single native-currency movement, normalized across chains.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct TransferTx {
    pub hash: String,
    pub block_height: u64,
    pub block_hash: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub from_address: String,
    pub to_address: String,
    pub value: BigDecimal,
    pub symbol: String,
    pub token: Option<String>,
    pub fee: Option<BigDecimal>,
    pub success: bool,
    pub confirmations: Option<u64>,
    pub memo: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<serde_json::Value>,
}

/// Result of a single transaction lookup.
pub type Transaction = TransferTx;

/// Blocks between `block_height` and `head_height`. A provider reporting a block above the head
/// we captured yields zero rather than a negative count.
pub fn confirmations(head_height: u64, block_height: u64) -> u64 {
    head_height.saturating_sub(block_height)
}

impl TransferTx {
    pub fn dedup_key(&self) -> TransferKey {
        TransferKey {
            hash: self.hash.clone(),
            from_address: self.from_address.clone(),
            to_address: self.to_address.clone(),
            value: self.value.normalized().to_string(),
        }
    }

    /// Sets `confirmations` against `head_height`, or clears it when no head was supplied.
    pub fn with_head(mut self, head_height: Option<u64>) -> Self {
        self.confirmations = head_height.map(|head| confirmations(head, self.block_height));
        self
    }

    pub fn is_self_transfer(&self) -> bool {
        !self.from_address.is_empty() && self.from_address == self.to_address
    }
}

/// Identity of a transfer for deduplication. Values are compared by their normalized decimal form
/// so that `1.6` and `1.600000000000000000` collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferKey {
    pub hash: String,
    pub from_address: String,
    pub to_address: String,
    pub value: String,
}

/// Outcome of parsing one transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum TxDetails {
    Transfer(Transaction),
    /// The transaction failed on chain, or is not a native transfer.
    Unsuccessful,
    /// Several transfers that cannot be collapsed into one (from, to, value) triple.
    Ambiguous {
        hash: String,
        transfers: Vec<TransferTx>,
    },
}

/// Sums transfers that share sender, receiver, memo and symbol, keeping first-seen order.
/// Payments to one receiver under different memos stay apart.
pub fn aggregate_transfers(transfers: impl IntoIterator<Item = TransferTx>) -> Vec<TransferTx> {
    let mut positions: HashMap<(String, String, Option<String>, String), usize> = HashMap::new();
    let mut aggregated: Vec<TransferTx> = Vec::new();
    for transfer in transfers {
        let key = (
            transfer.from_address.clone(),
            transfer.to_address.clone(),
            transfer.memo.clone(),
            transfer.symbol.clone(),
        );
        match positions.get(&key) {
            Some(&index) => aggregated[index].value += transfer.value,
            None => {
                positions.insert(key, aggregated.len());
                aggregated.push(transfer);
            }
        }
    }
    aggregated
}

impl TxDetails {
    /// Collapses the successful transfers extracted from one transaction with
    /// [`aggregate_transfers`]. More than one aggregate is reported as ambiguous.
    pub fn from_transfers(hash: &str, transfers: Vec<TransferTx>) -> Self {
        let mut aggregated = aggregate_transfers(transfers.into_iter().filter(|t| t.success));
        match aggregated.len() {
            0 => TxDetails::Unsuccessful,
            1 => TxDetails::Transfer(aggregated.remove(0)),
            _ => TxDetails::Ambiguous {
                hash: hash.to_string(),
                transfers: aggregated,
            },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TxDetails::Transfer(tx) if tx.success)
    }

    pub fn transaction(&self) -> Option<&Transaction> {
        match self {
            TxDetails::Transfer(tx) => Some(tx),
            _ => None,
        }
    }
}

/// Address → transfers, in insertion order per address, with idempotent inserts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransferMap {
    entries: BTreeMap<String, Vec<TransferTx>>,
    seen: HashSet<TransferKey>,
}

impl TransferMap {
    /// Returns `false` when the transfer was already present.
    pub fn insert(&mut self, address: &str, transfer: TransferTx) -> bool {
        if !self.seen.insert(transfer.dedup_key()) {
            return false;
        }
        self.entries
            .entry(address.to_string())
            .or_default()
            .push(transfer);
        true
    }

    pub fn get(&self, address: &str) -> &[TransferTx] {
        self.entries.get(address).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn addresses(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<TransferTx>)> {
        self.entries.iter()
    }

    /// Number of distinct transfers stored.
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn into_inner(self) -> BTreeMap<String, Vec<TransferTx>> {
        self.entries
    }
}

/// Incoming and outgoing views over the same set of transfers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransferMaps {
    pub incoming: TransferMap,
    pub outgoing: TransferMap,
}

impl TransferMaps {
    /// Files the transfer under its sender and its receiver. A side with an empty address (UTXO
    /// inputs or outputs reported on their own) is skipped.
    pub fn insert(&mut self, transfer: TransferTx) {
        if !transfer.from_address.is_empty() {
            let from = transfer.from_address.clone();
            self.outgoing.insert(&from, transfer.clone());
        }
        if !transfer.to_address.is_empty() {
            let to = transfer.to_address.clone();
            self.incoming.insert(&to, transfer);
        }
    }

    pub fn extend(&mut self, transfers: impl IntoIterator<Item = TransferTx>) {
        for transfer in transfers {
            self.insert(transfer);
        }
    }

    /// Every distinct transfer touching `address`, sorted by dedup key.
    pub fn transfers_of(&self, address: &str) -> Vec<&TransferTx> {
        let mut seen = HashSet::new();
        let mut transfers: Vec<&TransferTx> = self
            .outgoing
            .get(address)
            .iter()
            .chain(self.incoming.get(address).iter())
            .filter(|t| seen.insert(t.dedup_key()))
            .collect();
        transfers.sort_by_key(|t| t.dedup_key());
        transfers
    }
}
