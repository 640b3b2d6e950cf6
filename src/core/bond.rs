use crate::core::Asset;
use crate::error::Result;
use crate::utils::{Decode, Decoder, Encode, Encoder};
use crate::wallet::PublicKey;

/// Minting authority: `minter` signs blocks, `staker` collects the rewards
#[derive(Debug, Clone, PartialEq)]
pub struct Bond {
    pub minter: PublicKey,
    pub staker: PublicKey,
    pub stake_amt: Asset,
}

impl Bond {
    pub fn new(minter: PublicKey, staker: PublicKey, stake_amt: Asset) -> Bond {
        Bond {
            minter,
            staker,
            stake_amt,
        }
    }
}

impl Encode for Bond {
    fn encode(&self, enc: &mut Encoder) {
        enc.write_public_key(&self.minter);
        enc.write_public_key(&self.staker);
        enc.write_asset(&self.stake_amt);
    }
}

impl Decode for Bond {
    fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        Ok(Bond {
            minter: dec.read_public_key()?,
            staker: dec.read_public_key()?,
            stake_amt: dec.read_asset()?,
        })
    }
}
