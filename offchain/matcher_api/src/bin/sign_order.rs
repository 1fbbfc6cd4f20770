//! Dev helper: produce the signed JSON payload for `/api/order/submit`.
//! Mirrors the authenticator's EIP-712 layout exactly.

use anyhow::{anyhow, Result};
use clap::Parser;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip712::{Eip712, TypedData};
use ethers::types::H256;
use serde_json::json;

#[derive(Parser, Debug)]
#[command(name = "sign-order", about = "Generate an EIP-712 signed order for the matcher API")]
struct Args {
    #[arg(long)]
    privkey: String,
    #[arg(long)]
    token: String,
    /// long or short
    #[arg(long)]
    side: String,
    /// Base-asset quantity.
    #[arg(long)]
    size: u128,
    /// 1e4-scaled, e.g. 50000 for 5x.
    #[arg(long, default_value_t = 50_000)]
    leverage: u64,
    /// 1e6-scaled limit price; 0 for market orders.
    #[arg(long, default_value_t = 0)]
    price: u128,
    /// 0 = market, 1 = limit; derived from --price when omitted.
    #[arg(long)]
    order_type: Option<u8>,
    #[arg(long, default_value_t = 86_400)]
    ttl_secs: u64,
    #[arg(long)]
    nonce: Option<u64>,
    #[arg(long, default_value_t = 421_614)]
    chain_id: u64,
    #[arg(long, default_value = "0x0000000000000000000000000000000000000000")]
    settlement: String,
    #[arg(long, default_value = "http://127.0.0.1:8787")]
    api: String,
    #[arg(long)]
    tif: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let is_long = match args.side.to_lowercase().as_str() {
        "long" => true,
        "short" => false,
        other => return Err(anyhow!("side must be long or short, got {other}")),
    };
    let order_type = args.order_type.unwrap_or(u8::from(args.price > 0));

    let pk_bytes = hex::decode(args.privkey.trim_start_matches("0x"))?;
    if pk_bytes.len() != 32 {
        return Err(anyhow!("private key must be 32 bytes"));
    }
    let wallet = LocalWallet::from_bytes(&pk_bytes)?;
    let trader = format!("{:?}", wallet.address());

    let nonce = match args.nonce {
        Some(n) => n,
        None => fetch_nonce(&args.api, &trader).await.unwrap_or(0),
    };
    let deadline = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)?
        .as_secs()
        + args.ttl_secs;

    let order = json!({
        "trader": trader,
        "token": args.token.to_lowercase(),
        "isLong": is_long,
        "size": args.size.to_string(),
        "leverage": args.leverage.to_string(),
        "price": args.price.to_string(),
        "deadline": deadline.to_string(),
        "nonce": nonce.to_string(),
        "orderType": order_type,
        "tif": args.tif,
    });

    let td_json = json!({
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
            "chainId": args.chain_id,
            "verifyingContract": args.settlement
        },
        "message": {
            "trader": trader,
            "token": args.token.to_lowercase(),
            "isLong": is_long,
            "size": args.size.to_string(),
            "leverage": args.leverage.to_string(),
            "price": args.price.to_string(),
            "deadline": deadline.to_string(),
            "nonce": nonce.to_string(),
            "orderType": order_type
        }
    });
    let typed: TypedData = serde_json::from_value(td_json)?;
    let digest = typed.encode_eip712()?;
    let signature = wallet.sign_hash(H256::from(digest))?;

    let payload = json!({
        "order": order,
        "signature": format!("0x{}", hex::encode(signature.to_vec())),
    });
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}

async fn fetch_nonce(api: &str, trader: &str) -> Result<u64> {
    let url = format!("{}/api/user/{}/nonce", api.trim_end_matches('/'), trader);
    let resp: serde_json::Value = reqwest::get(url).await?.json().await?;
    resp.get("nonce")
        .and_then(|n| n.as_u64())
        .ok_or_else(|| anyhow!("no nonce in response"))
}
