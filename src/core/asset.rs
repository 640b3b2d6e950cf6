//! Fixed-point token amounts
//!
//! An [`Asset`] is an arbitrary-precision integer amount scaled by `10^decimals` and tagged
//! with one of the two chain symbols. Arithmetic between different symbols is refused;
//! operands with different precision are rescaled to the wider precision first.

use crate::error::{BlockchainError, Result};
use num_bigint::{BigInt, Sign};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Longest accepted amount part of an asset string (sign and point included)
pub const MAX_ASSET_AMOUNT_LEN: usize = 25;

/// Most decimal places a transaction may carry in any of its amounts
pub const MAX_PRECISION: u8 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AssetSymbol {
    Gold,
    Silver,
}

impl AssetSymbol {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetSymbol::Gold => "GOLD",
            AssetSymbol::Silver => "SILVER",
        }
    }
}

impl fmt::Display for AssetSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssetSymbol {
    type Err = BlockchainError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "GOLD" => Ok(AssetSymbol::Gold),
            "SILVER" => Ok(AssetSymbol::Silver),
            _ => Err(BlockchainError::InvalidEncoding(format!(
                "Unknown asset symbol: {s}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Asset {
    amount: BigInt,
    decimals: u8,
    symbol: AssetSymbol,
}

fn pow10(exp: u32) -> BigInt {
    BigInt::from(10u8).pow(exp)
}

fn precision_overflow() -> BlockchainError {
    BlockchainError::validation("asset precision overflow")
}

impl Asset {
    pub fn new(amount: impl Into<BigInt>, decimals: u8, symbol: AssetSymbol) -> Asset {
        Asset {
            amount: amount.into(),
            decimals,
            symbol,
        }
    }

    pub fn zero(symbol: AssetSymbol) -> Asset {
        Asset::new(0, 0, symbol)
    }

    pub fn amount(&self) -> &BigInt {
        &self.amount
    }

    pub fn decimals(&self) -> u8 {
        self.decimals
    }

    pub fn symbol(&self) -> AssetSymbol {
        self.symbol
    }

    pub fn is_zero(&self) -> bool {
        self.amount.sign() == Sign::NoSign
    }

    pub fn is_negative(&self) -> bool {
        self.amount.sign() == Sign::Minus
    }

    pub fn is_positive(&self) -> bool {
        self.amount.sign() == Sign::Plus
    }

    pub fn neg(&self) -> Asset {
        Asset::new(-&self.amount, self.decimals, self.symbol)
    }

    /// Amount expressed at `decimals` precision; narrowing truncates toward zero
    fn scaled_amount(&self, decimals: u8) -> BigInt {
        match decimals.cmp(&self.decimals) {
            Ordering::Equal => self.amount.clone(),
            Ordering::Greater => &self.amount * pow10((decimals - self.decimals) as u32),
            Ordering::Less => &self.amount / pow10((self.decimals - decimals) as u32),
        }
    }

    pub fn set_decimals(&self, decimals: u8) -> Asset {
        Asset::new(self.scaled_amount(decimals), decimals, self.symbol)
    }

    fn check_symbol(&self, other: &Asset) -> Result<()> {
        if self.symbol != other.symbol {
            return Err(BlockchainError::AssetTypeMismatch);
        }
        Ok(())
    }

    pub fn add(&self, other: &Asset) -> Result<Asset> {
        self.check_symbol(other)?;
        let decimals = self.decimals.max(other.decimals);
        let amount = self.scaled_amount(decimals) + other.scaled_amount(decimals);
        Ok(Asset::new(amount, decimals, self.symbol))
    }

    pub fn sub(&self, other: &Asset) -> Result<Asset> {
        self.check_symbol(other)?;
        let decimals = self.decimals.max(other.decimals);
        let amount = self.scaled_amount(decimals) - other.scaled_amount(decimals);
        Ok(Asset::new(amount, decimals, self.symbol))
    }

    /// Product at `decimals_a + decimals_b` unless `precision` is given
    pub fn mul(&self, other: &Asset, precision: Option<u8>) -> Result<Asset> {
        self.check_symbol(other)?;
        let decimals = self
            .decimals
            .checked_add(other.decimals)
            .ok_or_else(precision_overflow)?;
        let product = Asset::new(&self.amount * &other.amount, decimals, self.symbol);
        Ok(match precision {
            Some(p) => product.set_decimals(p),
            None => product,
        })
    }

    /// Quotient truncated toward zero at `precision` decimals (0 by default)
    pub fn div(&self, other: &Asset, precision: Option<u8>) -> Result<Asset> {
        self.check_symbol(other)?;
        if other.is_zero() {
            return Err(BlockchainError::DivideByZero);
        }
        let precision = precision.unwrap_or(0);
        let numerator = &self.amount * pow10(precision as u32 + other.decimals as u32);
        let denominator = &other.amount * pow10(self.decimals as u32);
        Ok(Asset::new(numerator / denominator, precision, self.symbol))
    }

    /// Raises to a non-negative integral exponent carried as an asset of the same symbol
    pub fn pow(&self, exponent: &Asset, precision: Option<u8>) -> Result<Asset> {
        self.check_symbol(exponent)?;
        let divisor = pow10(exponent.decimals as u32);
        if exponent.is_negative() || &exponent.amount % &divisor != BigInt::from(0u8) {
            return Err(BlockchainError::validation(
                "asset exponent must be a non-negative integer",
            ));
        }
        let exp = u32::try_from(&exponent.amount / &divisor)
            .map_err(|_| BlockchainError::validation("asset exponent too large"))?;
        let decimals = u8::try_from(self.decimals as u32 * exp).map_err(|_| precision_overflow())?;
        let result = Asset::new(self.amount.pow(exp), decimals, self.symbol);
        Ok(match precision {
            Some(p) => result.set_decimals(p),
            None => result,
        })
    }

    /// Value comparison after rescaling to the wider precision
    pub fn compare(&self, other: &Asset) -> Result<Ordering> {
        self.check_symbol(other)?;
        let decimals = self.decimals.max(other.decimals);
        Ok(self
            .scaled_amount(decimals)
            .cmp(&other.scaled_amount(decimals)))
    }

    pub fn gt(&self, other: &Asset) -> Result<bool> {
        Ok(self.compare(other)? == Ordering::Greater)
    }

    pub fn geq(&self, other: &Asset) -> Result<bool> {
        Ok(self.compare(other)? != Ordering::Less)
    }

    pub fn lt(&self, other: &Asset) -> Result<bool> {
        Ok(self.compare(other)? == Ordering::Less)
    }

    pub fn leq(&self, other: &Asset) -> Result<bool> {
        Ok(self.compare(other)? != Ordering::Greater)
    }

    pub fn value_eq(&self, other: &Asset) -> Result<bool> {
        Ok(self.compare(other)? == Ordering::Equal)
    }
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.is_negative() { "-" } else { "" };
        let digits = self.amount.magnitude().to_str_radix(10);
        if self.decimals == 0 {
            return write!(f, "{sign}{digits} {}", self.symbol);
        }
        let decimals = self.decimals as usize;
        let padded = format!("{digits:0>width$}", width = decimals + 1);
        let (int_part, frac_part) = padded.split_at(padded.len() - decimals);
        write!(f, "{sign}{int_part}.{frac_part} {}", self.symbol)
    }
}

impl FromStr for Asset {
    type Err = BlockchainError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |reason: &str| BlockchainError::InvalidEncoding(format!("{reason}: {s}"));

        let (amount_str, symbol_str) = s
            .split_once(' ')
            .ok_or_else(|| invalid("asset must be '<amount> <SYMBOL>'"))?;
        if amount_str.len() > MAX_ASSET_AMOUNT_LEN {
            return Err(invalid("asset amount too long"));
        }
        let symbol = symbol_str.parse::<AssetSymbol>()?;

        let (negative, unsigned) = match amount_str.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, amount_str),
        };
        let (int_part, frac_part) = unsigned.split_once('.').unwrap_or((unsigned, ""));
        let all_digits = |part: &str| part.bytes().all(|b| b.is_ascii_digit());
        if int_part.is_empty() || !all_digits(int_part) || !all_digits(frac_part) {
            return Err(invalid("invalid asset amount"));
        }

        let decimals = u8::try_from(frac_part.len()).map_err(|_| invalid("too many decimals"))?;
        let joined = format!("{int_part}{frac_part}");
        let magnitude = BigInt::parse_bytes(joined.as_bytes(), 10)
            .ok_or_else(|| invalid("invalid asset amount"))?;
        let amount = if negative { -magnitude } else { magnitude };
        Ok(Asset::new(amount, decimals, symbol))
    }
}

/// One amount per chain symbol, used for balances, fee quotes and token supply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Balance {
    pub gold: Asset,
    pub silver: Asset,
}

impl Default for Balance {
    fn default() -> Self {
        Balance {
            gold: Asset::zero(AssetSymbol::Gold),
            silver: Asset::zero(AssetSymbol::Silver),
        }
    }
}

impl Balance {
    pub fn new(gold: Asset, silver: Asset) -> Result<Balance> {
        if gold.symbol() != AssetSymbol::Gold || silver.symbol() != AssetSymbol::Silver {
            return Err(BlockchainError::AssetTypeMismatch);
        }
        Ok(Balance { gold, silver })
    }

    pub fn get(&self, symbol: AssetSymbol) -> &Asset {
        match symbol {
            AssetSymbol::Gold => &self.gold,
            AssetSymbol::Silver => &self.silver,
        }
    }

    pub fn add(&mut self, asset: &Asset) -> Result<()> {
        match asset.symbol() {
            AssetSymbol::Gold => self.gold = self.gold.add(asset)?,
            AssetSymbol::Silver => self.silver = self.silver.add(asset)?,
        }
        Ok(())
    }

    pub fn sub(&mut self, asset: &Asset) -> Result<()> {
        match asset.symbol() {
            AssetSymbol::Gold => self.gold = self.gold.sub(asset)?,
            AssetSymbol::Silver => self.silver = self.silver.sub(asset)?,
        }
        Ok(())
    }

    pub fn is_negative(&self) -> bool {
        self.gold.is_negative() || self.silver.is_negative()
    }

    /// Value equality per symbol, ignoring precision differences
    pub fn value_eq(&self, other: &Balance) -> Result<bool> {
        Ok(self.gold.value_eq(&other.gold)? && self.silver.value_eq(&other.silver)?)
    }
}

impl fmt::Display for Balance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.gold, self.silver)
    }
}
