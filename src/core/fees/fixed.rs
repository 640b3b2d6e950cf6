use crate::core::{Asset, AssetSymbol, Transaction};
use crate::error::{BlockchainError, Result};
use log::debug;

/// Decimal places fee amounts are quoted in
pub const FEE_PRECISION: u8 = 8;

/// 0.00001000 of either symbol
const MIN_FEE_UNITS: i64 = 1_000;

/// Multipliers are `(amount, decimals)`, i.e. 1.00
const NETWORK_FEE_MULT: (i64, u8) = (100, 2);
const ADDRESS_FEE_MULT: (i64, u8) = (100, 2);

/// Constant fee schedule shared by pool admission and block application
#[derive(Debug, Clone)]
pub struct FixedFeeCalculator {
    min_gold: Asset,
    min_silver: Asset,
    network_mult: (i64, u8),
    address_mult: (i64, u8),
}

impl Default for FixedFeeCalculator {
    fn default() -> Self {
        Self {
            min_gold: Asset::new(MIN_FEE_UNITS, FEE_PRECISION, AssetSymbol::Gold),
            min_silver: Asset::new(MIN_FEE_UNITS, FEE_PRECISION, AssetSymbol::Silver),
            network_mult: NETWORK_FEE_MULT,
            address_mult: ADDRESS_FEE_MULT,
        }
    }
}

impl FixedFeeCalculator {
    pub fn min_fee(&self, symbol: AssetSymbol) -> &Asset {
        match symbol {
            AssetSymbol::Gold => &self.min_gold,
            AssetSymbol::Silver => &self.min_silver,
        }
    }

    /// Minimum fee an account pays for one transaction in `symbol`
    pub fn total_fee(&self, symbol: AssetSymbol) -> Result<Asset> {
        let network = Asset::new(self.network_mult.0, self.network_mult.1, symbol);
        let address = Asset::new(self.address_mult.0, self.address_mult.1, symbol);
        self.min_fee(symbol)
            .mul(&network, Some(FEE_PRECISION))?
            .mul(&address, Some(FEE_PRECISION))
    }

    pub fn validate_fee(&self, tx: &Transaction) -> Result<()> {
        if let Transaction::Reward(_) = tx {
            return Ok(());
        }
        let fee = tx.fee();
        let required = self.total_fee(fee.symbol())?;
        if fee.lt(&required)? {
            debug!("Rejecting fee {fee}, minimum is {required}");
            return Err(BlockchainError::validation(format!(
                "fee {fee} is below the minimum {required}"
            )));
        }
        Ok(())
    }

    /// Per-symbol fee totals of a transaction batch; these fund the block reward.
    /// Bond fees are burned and not part of the total.
    pub fn collected_fees(&self, transactions: &[Transaction]) -> Result<(Asset, Asset)> {
        let mut gold = Asset::zero(AssetSymbol::Gold);
        let mut silver = Asset::zero(AssetSymbol::Silver);
        for tx in transactions {
            let fee = tx.fee();
            match fee.symbol() {
                AssetSymbol::Gold => gold = gold.add(fee)?,
                AssetSymbol::Silver => silver = silver.add(fee)?,
            }
        }
        Ok((gold, silver))
    }
}
