//! Transactions in legacy and segregated-witness serialization.

use crate::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use crate::hash::sha256d;
use crate::outpoint::OutPoint;
use crate::Hash256;

const SEGWIT_FLAG: u8 = 0x01;
const MIN_TXIN_SIZE: usize = 41;
const MIN_TXOUT_SIZE: usize = 9;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxIn {
    pub prevout: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
    pub witness: Vec<Vec<u8>>,
}

impl Encodable for TxIn {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        self.prevout.consensus_encode(encoder);
        encoder.write_var_bytes(&self.script_sig);
        encoder.write_u32_le(self.sequence);
    }
}

impl Decodable for TxIn {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let prevout = OutPoint::consensus_decode(decoder)?;
        let script_sig = decoder.read_var_bytes()?;
        let sequence = decoder.read_u32_le()?;
        Ok(Self {
            prevout,
            script_sig,
            sequence,
            witness: Vec::new(),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxOut {
    pub value: i64,
    pub script_pubkey: Vec<u8>,
}

impl Encodable for TxOut {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_i64_le(self.value);
        encoder.write_var_bytes(&self.script_pubkey);
    }
}

impl Decodable for TxOut {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let value = decoder.read_i64_le()?;
        if value < 0 {
            return Err(DecodeError::InvalidData("negative output value"));
        }
        let script_pubkey = decoder.read_var_bytes()?;
        Ok(Self {
            value,
            script_pubkey,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    pub version: i32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].prevout.is_null()
    }

    pub fn has_witness(&self) -> bool {
        self.inputs.iter().any(|input| !input.witness.is_empty())
    }

    /// Identifier over the serialization without witness data.
    pub fn txid(&self) -> Hash256 {
        sha256d(&self.encode_without_witness())
    }

    pub fn output_total(&self) -> Option<i64> {
        self.outputs
            .iter()
            .try_fold(0i64, |total, output| total.checked_add(output.value))
    }

    pub fn encode_without_witness(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        self.encode_into(&mut encoder, false);
        encoder.into_inner()
    }

    pub fn consensus_encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        self.encode_into(&mut encoder, self.has_witness());
        encoder.into_inner()
    }

    fn encode_into(&self, encoder: &mut Encoder, with_witness: bool) {
        encoder.write_i32_le(self.version);
        if with_witness {
            encoder.write_u8(0x00);
            encoder.write_u8(SEGWIT_FLAG);
        }
        encoder.write_varint(self.inputs.len() as u64);
        for input in &self.inputs {
            input.consensus_encode(encoder);
        }
        encoder.write_varint(self.outputs.len() as u64);
        for output in &self.outputs {
            output.consensus_encode(encoder);
        }
        if with_witness {
            for input in &self.inputs {
                encoder.write_varint(input.witness.len() as u64);
                for item in &input.witness {
                    encoder.write_var_bytes(item);
                }
            }
        }
        encoder.write_u32_le(self.lock_time);
    }

    pub fn consensus_decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let tx = Self::consensus_decode_from(&mut decoder)?;
        decoder.finish()?;
        Ok(tx)
    }

    pub fn consensus_decode_from(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let version = decoder.read_i32_le()?;
        let mut segwit = false;
        if decoder.peek_u8()? == 0x00 {
            decoder.read_u8()?;
            if decoder.read_u8()? != SEGWIT_FLAG {
                return Err(DecodeError::InvalidData("unknown transaction flag"));
            }
            segwit = true;
        }

        let input_count = decoder.read_count(MIN_TXIN_SIZE)?;
        if input_count == 0 {
            return Err(DecodeError::InvalidData("transaction has no inputs"));
        }
        let mut inputs = Vec::with_capacity(input_count);
        for _ in 0..input_count {
            inputs.push(TxIn::consensus_decode(decoder)?);
        }

        let output_count = decoder.read_count(MIN_TXOUT_SIZE)?;
        let mut outputs = Vec::with_capacity(output_count);
        for _ in 0..output_count {
            outputs.push(TxOut::consensus_decode(decoder)?);
        }

        if segwit {
            let mut any_witness = false;
            for input in &mut inputs {
                let items = decoder.read_count(1)?;
                let mut witness = Vec::with_capacity(items);
                for _ in 0..items {
                    witness.push(decoder.read_var_bytes()?);
                }
                any_witness |= !witness.is_empty();
                input.witness = witness;
            }
            if !any_witness {
                return Err(DecodeError::InvalidData("segwit flag without witness data"));
            }
        }

        let lock_time = decoder.read_u32_le()?;
        Ok(Self {
            version,
            inputs,
            outputs,
            lock_time,
        })
    }
}
