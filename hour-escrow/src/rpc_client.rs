//! JSON-RPC ledger client for Ethereum-compatible nodes

use crate::{
    codec::{address_word, format_quantity, from_hex, function_selector, parse_quantity, to_hex, word_to_u128, Word},
    error::EscrowError,
    ledger_client::{LedgerClient, LogQuery, RawLog},
    models::{Address, Amount, BlockNumber},
    EscrowResult,
};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    method: &'a str,
    params: Value,
    id: u64,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse<T> {
    result: Option<T>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

/// Reads the escrow and token contracts through a node's JSON-RPC endpoint
pub struct JsonRpcLedgerClient {
    http_client: reqwest::Client,
    rpc_url: String,
    token_contract: Address,
    request_id: AtomicU64,
}

impl JsonRpcLedgerClient {
    pub fn new(rpc_url: impl Into<String>, token_contract: Address, timeout: Duration) -> EscrowResult<Self> {
        let http_client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http_client,
            rpc_url: rpc_url.into(),
            token_contract,
            request_id: AtomicU64::new(1),
        })
    }

    async fn call<R: DeserializeOwned>(&self, method: &str, params: Value) -> EscrowResult<R> {
        let id = self.request_id.fetch_add(1, Ordering::SeqCst);
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            method,
            params,
            id,
        };
        debug!(method, id, "Sending JSON-RPC request");

        let response: JsonRpcResponse<R> = self
            .http_client
            .post(&self.rpc_url)
            .json(&request)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        unwrap_response(method, response)
    }

    async fn call_view(&self, calldata: Vec<u8>) -> EscrowResult<Amount> {
        let result: String = self
            .call("eth_call", call_params(&self.token_contract, &calldata))
            .await?;
        decode_amount(&result)
    }
}

fn unwrap_response<R>(method: &str, response: JsonRpcResponse<R>) -> EscrowResult<R> {
    if let Some(error) = response.error {
        return Err(EscrowError::integration(format!(
            "{method} failed with RPC error {}: {}",
            error.code, error.message
        )));
    }
    response
        .result
        .ok_or_else(|| EscrowError::integration(format!("{method} response missing result")))
}

fn get_logs_params(query: &LogQuery) -> Value {
    let to_block = query
        .to_block
        .map(format_quantity)
        .unwrap_or_else(|| "latest".to_string());
    json!([{
        "address": query.address.as_str(),
        "topics": [query.topic0],
        "fromBlock": format_quantity(query.from_block),
        "toBlock": to_block,
    }])
}

/// Read each entry on its own so one bad entry cannot sink the batch
fn read_logs(entries: Vec<Value>) -> Vec<RawLog> {
    entries
        .into_iter()
        .map(|entry| match RawLog::deserialize(&entry) {
            Ok(log) => log,
            Err(e) => RawLog::unreadable(&entry, format!("unreadable log entry: {e}")),
        })
        .collect()
}

fn call_params(to: &Address, calldata: &[u8]) -> Value {
    json!([{ "to": to.as_str(), "data": to_hex(calldata) }, "latest"])
}

fn balance_of_calldata(account: &Address) -> Vec<u8> {
    let mut data = function_selector("balanceOf(address)").to_vec();
    data.extend_from_slice(&address_word(account));
    data
}

fn allowance_calldata(owner: &Address, spender: &Address) -> Vec<u8> {
    let mut data = function_selector("allowance(address,address)").to_vec();
    data.extend_from_slice(&address_word(owner));
    data.extend_from_slice(&address_word(spender));
    data
}

fn decode_amount(result: &str) -> EscrowResult<Amount> {
    let bytes = from_hex(result)?;
    let word: Word = bytes
        .as_slice()
        .try_into()
        .map_err(|_| EscrowError::malformed(format!("expected one word, got {} bytes", bytes.len())))?;
    word_to_u128(&word)
}

#[async_trait]
impl LedgerClient for JsonRpcLedgerClient {
    async fn block_number(&self) -> EscrowResult<BlockNumber> {
        let result: String = self.call("eth_blockNumber", json!([])).await?;
        parse_quantity(&result)
    }

    async fn balance_of(&self, account: &Address) -> EscrowResult<Amount> {
        self.call_view(balance_of_calldata(account)).await
    }

    async fn allowance_of(&self, owner: &Address, spender: &Address) -> EscrowResult<Amount> {
        self.call_view(allowance_calldata(owner, spender)).await
    }

    async fn get_logs(&self, query: &LogQuery) -> EscrowResult<Vec<RawLog>> {
        let entries: Vec<Value> = self.call("eth_getLogs", get_logs_params(query)).await?;
        Ok(read_logs(entries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode_event, event_topic, u128_word};
    use crate::events::{CreatedEvent, EscrowEvent, EventKind, EventStreams, LogPosition};
    use crate::models::hours;
    use crate::reconciler::{decode_stream, reconcile};

    fn addr(byte: u8) -> Address {
        Address::from_bytes([byte; 20])
    }

    #[test]
    fn test_get_logs_params() {
        let query = LogQuery {
            address: addr(0xee),
            topic0: event_topic(EventKind::Released),
            from_block: 16,
            to_block: Some(255),
        };
        let params = get_logs_params(&query);
        let filter = &params[0];
        assert_eq!(filter["address"], addr(0xee).as_str());
        assert_eq!(filter["topics"][0], event_topic(EventKind::Released));
        assert_eq!(filter["fromBlock"], "0x10");
        assert_eq!(filter["toBlock"], "0xff");

        let open = LogQuery {
            to_block: None,
            ..query
        };
        assert_eq!(get_logs_params(&open)[0]["toBlock"], "latest");
    }

    #[test]
    fn test_calldata_layout() {
        let data = balance_of_calldata(&addr(0x11));
        assert_eq!(data.len(), 36);
        assert_eq!(&data[..4], &[0x70, 0xa0, 0x82, 0x31]);
        assert_eq!(&data[16..], &[0x11; 20]);

        let data = allowance_calldata(&addr(0x11), &addr(0x22));
        assert_eq!(data.len(), 68);
        assert_eq!(&data[..4], &[0xdd, 0x62, 0xed, 0x3e]);
        assert_eq!(&data[48..], &[0x22; 20]);
    }

    #[test]
    fn test_decode_amount() {
        let encoded = to_hex(&u128_word(5_000));
        assert_eq!(decode_amount(&encoded).unwrap(), 5_000);
        assert!(decode_amount("0x").is_err());
        assert!(decode_amount("0x01").is_err());
    }

    #[test]
    fn test_response_errors_are_integration() {
        let response: JsonRpcResponse<String> = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32000,"message":"header not found"}}"#,
        )
        .unwrap();
        let err = unwrap_response("eth_getLogs", response).unwrap_err();
        assert!(matches!(err, EscrowError::Integration(_)));
        assert!(err.is_transient());

        let response: JsonRpcResponse<String> =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":2,"result":"0x1b4"}"#).unwrap();
        assert_eq!(unwrap_response("eth_blockNumber", response).unwrap(), "0x1b4");
    }

    #[test]
    fn test_logs_deserialize() {
        let response: JsonRpcResponse<Vec<RawLog>> = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":3,"result":[{
                "address":"0xeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeee",
                "topics":["0x01"],
                "data":"0x",
                "blockNumber":"0x64",
                "transactionHash":"0xabc",
                "logIndex":"0x0",
                "removed":false
            }]}"#,
        )
        .unwrap();
        let logs = unwrap_response("eth_getLogs", response).unwrap();
        assert_eq!(logs[0].block_number.as_deref(), Some("0x64"));
    }

    #[test]
    fn test_bad_entry_skipped_next_to_good_one() {
        let event = EscrowEvent::Created(CreatedEvent {
            escrow_id: 4,
            requester: addr(0xaa),
            provider: addr(0xbb),
            amount: hours(3),
            position: LogPosition {
                block_number: 100,
                log_index: 0,
            },
        });
        let good = serde_json::to_value(encode_event(&event, &addr(0xee), "0x01")).unwrap();
        let missing_address = json!({
            "topics": [event_topic(EventKind::Created)],
            "data": "0x",
            "blockNumber": "0x65",
            "transactionHash": "0x02",
            "logIndex": "0x0"
        });
        let null_topics = json!({
            "address": addr(0xee).as_str(),
            "topics": null,
            "blockNumber": "0x66",
            "transactionHash": "0x03"
        });

        let logs = read_logs(vec![good, missing_address, null_topics, json!("0xdead")]);
        assert_eq!(logs.len(), 4);

        let mut streams = EventStreams::default();
        let skipped = decode_stream(EventKind::Created, &logs, &mut streams);
        assert_eq!(streams.created.len(), 1);
        assert_eq!(skipped.len(), 3);
        assert_eq!(skipped[0].transaction_hash.as_deref(), Some("0x02"));
        assert_eq!(skipped[1].transaction_hash.as_deref(), Some("0x03"));

        let state = reconcile(&streams);
        assert_eq!(state.escrows[&4].amount, hours(3));
        assert_eq!(state.escrows[&4].requester(), Some(&addr(0xaa)));
    }
}
