use std::collections::HashSet;

use super::transaction::Transaction;

/// Admitted transactions waiting to be mined.
///
/// Unique by id; iteration follows insertion order.
#[derive(Debug, Clone, Default)]
pub struct Mempool {
    transactions: Vec<Transaction>,
    ids: HashSet<String>,
}

impl Mempool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a pool from a stored snapshot, dropping repeated ids
    pub fn from_transactions(transactions: Vec<Transaction>) -> Self {
        let mut pool = Self::new();
        for tx in transactions {
            pool.insert(tx);
        }
        pool
    }

    /// Inserts a transaction, returning false if its id is already pending
    pub fn insert(&mut self, transaction: Transaction) -> bool {
        if !self.ids.insert(transaction.id.clone()) {
            return false;
        }
        self.transactions.push(transaction);
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    /// Removes every transaction whose id is in `confirmed`
    pub fn remove_confirmed<'a, I>(&mut self, confirmed: I) -> usize
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut removed = 0;
        for id in confirmed {
            if self.ids.remove(id) {
                removed += 1;
            }
        }
        if removed > 0 {
            let ids = &self.ids;
            self.transactions.retain(|tx| ids.contains(&tx.id));
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Transaction> {
        self.transactions.iter()
    }

    pub fn to_vec(&self) -> Vec<Transaction> {
        self.transactions.clone()
    }
}
