//! Order authenticator: EIP-712 signature recovery for order submission,
//! plain signed-text recovery for cancels and closes. Nonce ordering is
//! enforced against the account ledger by the caller once the signature
//! binds the payload to the trader.

use engine::{EngineError, OrderInput, OrderType, Side, Tif};
use ethers::core::types::{Address, Signature, H256};
use ethers::types::transaction::eip712::{Eip712, TypedData};
use ethers::utils::hash_message;
use serde::Deserialize;

/// Order payload as submitted over REST. All uint256 fields are decimal
/// strings; `price`, `tp` and `sl` are 1e6-scaled integers, `size` is a
/// base-asset quantity, `leverage` is 1e4-scaled.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireOrder {
    pub trader: String,
    pub token: String,
    pub is_long: bool,
    pub size: String,
    pub leverage: String,
    pub price: String,
    pub deadline: String,
    pub nonce: String,
    pub order_type: u8,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub tif: Option<String>,
    #[serde(default)]
    pub reduce_only: bool,
    #[serde(default)]
    pub tp: Option<String>,
    #[serde(default)]
    pub sl: Option<String>,
}

pub struct Authenticator {
    chain_id: u64,
    verifying_contract: String,
}

impl Authenticator {
    pub fn new(chain_id: u64, settlement_address: &str) -> Self {
        Authenticator { chain_id, verifying_contract: settlement_address.to_string() }
    }

    /// EIP-712 typed data for an order, mirrored by `sign_order`.
    pub fn order_typed_data(&self, wire: &WireOrder) -> serde_json::Value {
        serde_json::json!({
            "types": {
                "EIP712Domain": [
                    {"name": "name", "type": "string"},
                    {"name": "version", "type": "string"},
                    {"name": "chainId", "type": "uint256"},
                    {"name": "verifyingContract", "type": "address"}
                ],
                "Order": [
                    {"name": "trader", "type": "address"},
                    {"name": "token", "type": "address"},
                    {"name": "isLong", "type": "bool"},
                    {"name": "size", "type": "uint256"},
                    {"name": "leverage", "type": "uint256"},
                    {"name": "price", "type": "uint256"},
                    {"name": "deadline", "type": "uint256"},
                    {"name": "nonce", "type": "uint256"},
                    {"name": "orderType", "type": "uint8"}
                ]
            },
            "primaryType": "Order",
            "domain": {
                "name": "MemePerp",
                "version": "1",
                "chainId": self.chain_id,
                "verifyingContract": self.verifying_contract
            },
            "message": {
                "trader": wire.trader,
                "token": wire.token,
                "isLong": wire.is_long,
                "size": wire.size,
                "leverage": wire.leverage,
                "price": wire.price,
                "deadline": wire.deadline,
                "nonce": wire.nonce,
                "orderType": wire.order_type
            }
        })
    }

    /// Verify the signature binds the payload to `wire.trader`, then convert
    /// to the engine's input form. Field bounds beyond basic shape are the
    /// market engine's call.
    pub fn verify_order(
        &self,
        wire: &WireOrder,
        signature: &str,
        now: u64,
    ) -> Result<OrderInput, EngineError> {
        let trader: Address =
            wire.trader.parse().map_err(|_| EngineError::UnknownTrader(wire.trader.clone()))?;

        let typed: TypedData = serde_json::from_value(self.order_typed_data(wire))
            .map_err(|_| EngineError::BadSignature)?;
        let digest = typed.encode_eip712().map_err(|_| EngineError::BadSignature)?;
        let recovered = parse_signature(signature)?
            .recover(H256::from(digest))
            .map_err(|_| EngineError::BadSignature)?;
        if recovered != trader {
            return Err(EngineError::BadSignature);
        }

        let deadline: u64 = wire.deadline.parse().map_err(|_| EngineError::BadSignature)?;
        if deadline < now {
            return Err(EngineError::Expired { deadline, now });
        }
        let nonce: u64 = wire.nonce.parse().map_err(|_| EngineError::BadSignature)?;
        let order_type = match wire.order_type {
            0 => OrderType::Market,
            1 => OrderType::Limit,
            other => return Err(EngineError::UnknownOrderType(other)),
        };
        let size: i128 = wire.size.parse().map_err(|_| EngineError::BadSize(0))?;
        let leverage: u32 =
            wire.leverage.parse().map_err(|_| EngineError::BadLeverage { got: 0, max: 0 })?;
        let price: i128 = wire.price.parse().map_err(|_| EngineError::BadPrice(0))?;
        let tif = match wire.tif.as_deref() {
            None => match order_type {
                OrderType::Market => Tif::Ioc,
                OrderType::Limit => Tif::Gtc,
            },
            Some(s) if s.eq_ignore_ascii_case("gtc") => Tif::Gtc,
            Some(s) if s.eq_ignore_ascii_case("ioc") => Tif::Ioc,
            Some(s) if s.eq_ignore_ascii_case("fok") => Tif::Fok,
            Some(_) => return Err(EngineError::BadSignature),
        };
        let parse_trigger = |field: &Option<String>| -> Result<Option<i128>, EngineError> {
            match field {
                None => Ok(None),
                Some(s) => s.parse().map(Some).map_err(|_| EngineError::BadPrice(0)),
            }
        };

        Ok(OrderInput {
            client_id: wire.client_id.clone(),
            trader: format!("{trader:?}"),
            market: wire.token.to_lowercase(),
            side: if wire.is_long { Side::Long } else { Side::Short },
            order_type,
            size,
            leverage,
            price,
            tif,
            reduce_only: wire.reduce_only,
            tp: parse_trigger(&wire.tp)?,
            sl: parse_trigger(&wire.sl)?,
            deadline,
            nonce,
        })
    }

    /// Cancels and closes sign a human-readable message with the standard
    /// `personal_sign` prefix, e.g. `"Cancel order 7"`.
    pub fn verify_text(&self, trader: &str, message: &str, signature: &str) -> Result<(), EngineError> {
        let trader: Address =
            trader.parse().map_err(|_| EngineError::UnknownTrader(trader.to_string()))?;
        let recovered = parse_signature(signature)?
            .recover(hash_message(message))
            .map_err(|_| EngineError::BadSignature)?;
        if recovered != trader {
            return Err(EngineError::BadSignature);
        }
        Ok(())
    }
}

fn parse_signature(signature: &str) -> Result<Signature, EngineError> {
    let bytes =
        hex::decode(signature.trim_start_matches("0x")).map_err(|_| EngineError::BadSignature)?;
    if bytes.len() != 65 {
        return Err(EngineError::BadSignature);
    }
    Signature::try_from(bytes.as_slice()).map_err(|_| EngineError::BadSignature)
}
