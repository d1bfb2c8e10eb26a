//! Event log codec
//!
//! Escrow events travel as EVM-style logs: topic 0 is the keccak256 of the
//! event signature, indexed parameters fill the following topics, and the
//! non-indexed amount is a big-endian 32-byte word in `data`.

use crate::error::EscrowError;
use crate::events::{
    CancelledEvent, CreatedEvent, EscrowEvent, EventKind, LogPosition, ReleasedEvent,
};
use crate::ledger_client::RawLog;
use crate::models::{Address, Amount, BlockNumber, EscrowId};
use crate::EscrowResult;
use sha3::{Digest, Keccak256};

/// 32-byte ABI word
pub type Word = [u8; 32];

pub fn keccak256(bytes: &[u8]) -> Word {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Keccak256::digest(bytes));
    out
}

/// `0x`-prefixed topic 0 of an event stream
pub fn event_topic(kind: EventKind) -> String {
    to_hex(&keccak256(kind.signature().as_bytes()))
}

/// First four bytes of keccak256 of a function signature
pub fn function_selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

pub fn to_hex(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

pub fn from_hex(raw: &str) -> EscrowResult<Vec<u8>> {
    let stripped = raw.strip_prefix("0x").unwrap_or(raw);
    hex::decode(stripped).map_err(|e| EscrowError::malformed(format!("bad hex {raw}: {e}")))
}

/// Format a JSON-RPC quantity (`0x`-prefixed, no leading zeros)
pub fn format_quantity(value: u64) -> String {
    format!("0x{value:x}")
}

/// Parse a JSON-RPC quantity
pub fn parse_quantity(raw: &str) -> EscrowResult<u64> {
    let stripped = raw
        .strip_prefix("0x")
        .ok_or_else(|| EscrowError::malformed(format!("quantity {raw} lacks 0x prefix")))?;
    if stripped.is_empty() {
        return Err(EscrowError::malformed("empty quantity"));
    }
    u64::from_str_radix(stripped, 16)
        .map_err(|e| EscrowError::malformed(format!("bad quantity {raw}: {e}")))
}

pub fn u128_word(value: Amount) -> Word {
    let mut word = [0u8; 32];
    word[16..].copy_from_slice(&value.to_be_bytes());
    word
}

pub fn address_word(address: &Address) -> Word {
    let mut word = [0u8; 32];
    word[12..].copy_from_slice(&address.to_bytes());
    word
}

/// Read a uint256 word that must fit in 128 bits
pub fn word_to_u128(word: &Word) -> EscrowResult<Amount> {
    if word[..16].iter().any(|b| *b != 0) {
        return Err(EscrowError::malformed("uint256 value exceeds 128 bits"));
    }
    let mut low = [0u8; 16];
    low.copy_from_slice(&word[16..]);
    Ok(u128::from_be_bytes(low))
}

pub fn word_to_u64(word: &Word) -> EscrowResult<u64> {
    let value = word_to_u128(word)?;
    u64::try_from(value).map_err(|_| EscrowError::malformed("escrow id exceeds 64 bits"))
}

pub fn word_to_address(word: &Word) -> EscrowResult<Address> {
    if word[..12].iter().any(|b| *b != 0) {
        return Err(EscrowError::malformed("address word has dirty upper bytes"));
    }
    let mut bytes = [0u8; Address::LEN];
    bytes.copy_from_slice(&word[12..]);
    Ok(Address::from_bytes(bytes))
}

fn parse_word(raw: &str) -> EscrowResult<Word> {
    let bytes = from_hex(raw)?;
    if bytes.len() != 32 {
        return Err(EscrowError::malformed(format!(
            "expected 32-byte word, got {} bytes",
            bytes.len()
        )));
    }
    let mut word = [0u8; 32];
    word.copy_from_slice(&bytes);
    Ok(word)
}

/// Encode an event as the log the settlement machine emits
pub fn encode_event(event: &EscrowEvent, contract: &Address, transaction_hash: &str) -> RawLog {
    let id_word = u128_word(event.escrow_id() as Amount);
    let mut topics = vec![event_topic(event.kind()), to_hex(&id_word)];
    let mut data = Vec::new();

    match event {
        EscrowEvent::Created(e) => {
            topics.push(to_hex(&address_word(&e.requester)));
            topics.push(to_hex(&address_word(&e.provider)));
            data.extend_from_slice(&u128_word(e.amount));
        }
        EscrowEvent::Released(e) => {
            topics.push(to_hex(&address_word(&e.provider)));
            data.extend_from_slice(&u128_word(e.amount));
        }
        EscrowEvent::Cancelled(_) => {}
    }

    let position = event.position();
    RawLog {
        address: contract.to_string(),
        topics,
        data: to_hex(&data),
        block_number: Some(format_quantity(position.block_number)),
        transaction_hash: Some(transaction_hash.to_string()),
        log_index: Some(format_quantity(position.log_index)),
        unreadable: None,
    }
}

/// Decode one log of the given stream
pub fn decode_event(kind: EventKind, log: &RawLog) -> EscrowResult<EscrowEvent> {
    if let Some(reason) = &log.unreadable {
        return Err(EscrowError::malformed(format!("{kind}: {reason}")));
    }
    if log.topics.len() != kind.topic_count() {
        return Err(EscrowError::malformed(format!(
            "{kind}: expected {} topics, got {}",
            kind.topic_count(),
            log.topics.len()
        )));
    }
    if !log.topics[0].eq_ignore_ascii_case(&event_topic(kind)) {
        return Err(EscrowError::malformed(format!(
            "{kind}: unexpected topic0 {}",
            log.topics[0]
        )));
    }

    let block_number: BlockNumber = match &log.block_number {
        Some(raw) => parse_quantity(raw)?,
        None => return Err(EscrowError::malformed(format!("{kind}: log has no block number"))),
    };
    let log_index = match &log.log_index {
        Some(raw) => parse_quantity(raw)?,
        None => 0,
    };
    let position = LogPosition {
        block_number,
        log_index,
    };

    let data = from_hex(&log.data)?;
    if data.len() != kind.data_words() * 32 {
        return Err(EscrowError::malformed(format!(
            "{kind}: expected {} data bytes, got {}",
            kind.data_words() * 32,
            data.len()
        )));
    }

    let escrow_id: EscrowId = word_to_u64(&parse_word(&log.topics[1])?)?;

    let event = match kind {
        EventKind::Created => {
            let mut amount = [0u8; 32];
            amount.copy_from_slice(&data);
            EscrowEvent::Created(CreatedEvent {
                escrow_id,
                requester: word_to_address(&parse_word(&log.topics[2])?)?,
                provider: word_to_address(&parse_word(&log.topics[3])?)?,
                amount: word_to_u128(&amount)?,
                position,
            })
        }
        EventKind::Released => {
            let mut amount = [0u8; 32];
            amount.copy_from_slice(&data);
            EscrowEvent::Released(ReleasedEvent {
                escrow_id,
                provider: word_to_address(&parse_word(&log.topics[2])?)?,
                amount: word_to_u128(&amount)?,
                position,
            })
        }
        EventKind::Cancelled => EscrowEvent::Cancelled(CancelledEvent {
            escrow_id,
            position,
        }),
    };

    Ok(event)
}
