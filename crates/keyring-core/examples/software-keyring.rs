//! Software Keyring CLI Example
//!
//! Drives a [`HardwareKeyring`] against the deterministic software signer,
//! so the whole flow (discovery, paging, identity checks, signing) can be
//! tried without a device.
//!
//! # Quick Start
//!
//! ```bash
//! cargo run --example software-keyring -- accounts 3
//! cargo run --example software-keyring -- page 2
//! cargo run --example software-keyring -- sign-tx
//! cargo run --example software-keyring -- sign-message "hello"
//! cargo run --example software-keyring -- swap
//! RUST_LOG=hw_keyring_core=debug cargo run --example software-keyring -- sign-tx
//! ```
//!
//! # Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `accounts [n]` | Add `n` accounts and list them |
//! | `page [n]` | Show discovery page `n` |
//! | `sign-tx` | Sign a sample EIP-1559 transaction |
//! | `sign-message <text>` | Sign a personal message |
//! | `swap` | Show the guard refusing a swapped wallet |
//!
//! The wallet id defaults to `demo` and can be set with `WALLET`.

#![expect(unused_crate_dependencies, reason = "needed for CLI example")]

use std::env;
use std::sync::Arc;

use hw_keyring_core::transport::direct::DirectTransport;
use hw_keyring_core::transport::software::SoftwareDevice;
use hw_keyring_core::{
    Address, Eip1559Transaction, HardwareKeyring, KeyringConfig, OwnerId, Result, Transaction, U256,
    UnsignedTransaction,
};
use tracing_subscriber::EnvFilter;

fn main() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_help();
        return;
    }

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Failed to start runtime: {e}");
            return;
        }
    };

    let wallet = OwnerId::new(env::var("WALLET").unwrap_or_else(|_| "demo".to_string()));
    let device = Arc::new(SoftwareDevice::new(wallet));
    let keyring = match HardwareKeyring::new(
        KeyringConfig::default(),
        Arc::new(DirectTransport::new(Arc::clone(&device))),
    ) {
        Ok(keyring) => keyring,
        Err(e) => {
            eprintln!("Invalid configuration: {e}");
            return;
        }
    };

    let outcome = runtime.block_on(async {
        match args[1].as_str() {
            "accounts" => cmd_accounts(&keyring, args.get(2)).await,
            "page" => cmd_page(&keyring, args.get(2)).await,
            "sign-tx" => cmd_sign_tx(&keyring).await,
            "sign-message" => cmd_sign_message(&keyring, &args[2..]).await,
            "swap" => cmd_swap(&keyring, &device).await,
            "--help" | "-h" | "help" => {
                print_help();
                Ok(())
            }
            _ => {
                eprintln!("Unknown command: {}", args[1]);
                print_help();
                Ok(())
            }
        }
    });

    if let Err(e) = outcome {
        eprintln!("Error: {e}");
    }
}

fn print_help() {
    println!(
        r#"Software Keyring CLI

USAGE:
    software-keyring <COMMAND>

COMMANDS:
    accounts [n]         Add n accounts (default 1) and list them
    page [n]             Show discovery page n (default 0)
    sign-tx              Sign a sample EIP-1559 transaction
    sign-message <text>  Sign a personal message
    swap                 Switch wallets mid-flow and watch the guard refuse
    help                 Show this help message

ENVIRONMENT:
    WALLET               Active wallet id of the software signer (default: demo)
    RUST_LOG             Log filter, e.g. hw_keyring_core=debug
"#
    );
}

fn parse_number(arg: Option<&String>, default: u32) -> u32 {
    arg.and_then(|raw| raw.parse().ok()).unwrap_or(default)
}

async fn cmd_accounts(keyring: &HardwareKeyring, count: Option<&String>) -> Result<()> {
    let count = parse_number(count, 1);
    keyring.add_accounts(count).await?;

    println!("Accounts ({}):\n", keyring.get_accounts().len());
    for address in keyring.get_accounts() {
        if let Some(account) = keyring.account_details(&address) {
            println!(
                "  [{}] {}  {}",
                account.derivation_index,
                address,
                account.hd_path.resolve(account.derivation_index).map_or_else(
                    |_| "?".to_string(),
                    |indices| hw_keyring_core::hd_path::format_indices(&indices)
                )
            );
        }
    }
    Ok(())
}

async fn cmd_page(keyring: &HardwareKeyring, page: Option<&String>) -> Result<()> {
    let target = parse_number(page, 0);
    let mut entries = keyring.get_first_page().await?;
    while keyring.current_page() < target {
        entries = keyring.get_next_page().await?;
    }

    println!("Page {} ({}):\n", keyring.current_page(), keyring.hd_path());
    for entry in entries {
        println!("  [{}] {}", entry.index, entry.address);
    }
    Ok(())
}

async fn first_account(keyring: &HardwareKeyring) -> Result<Address> {
    keyring.add_accounts(1).await?;
    Ok(keyring.get_accounts()[0])
}

async fn cmd_sign_tx(keyring: &HardwareKeyring) -> Result<()> {
    let account = first_account(keyring).await?;

    let tx = UnsignedTransaction::new(Transaction::Eip1559(Eip1559Transaction {
        chain_id: 1,
        nonce: 0,
        max_priority_fee_per_gas: U256::from(1_000_000_000u64),
        max_fee_per_gas: U256::from(50_000_000_000u64),
        gas_limit: 21000,
        to: Some(Address::new([0x11; 20])),
        value: U256::from(1_000_000_000_000_000u64),
        data: vec![],
        access_list: vec![],
    }));

    println!("Signing sample EIP-1559 transaction from {account}...\n");
    println!("Signing hash: {}", tx.transaction.signing_hash());

    let signed = keyring.sign_transaction(&account, &tx).await?;
    println!();
    println!("Signature:");
    println!("  r: 0x{}", hex::encode(signed.signature().r()));
    println!("  s: 0x{}", hex::encode(signed.signature().s()));
    println!("  v: {}", signed.signature().v());
    println!();
    println!("Raw transaction: {}", signed.raw_hex());
    println!("Transaction hash: {}", signed.hash());
    Ok(())
}

async fn cmd_sign_message(keyring: &HardwareKeyring, args: &[String]) -> Result<()> {
    let Some(message) = args.first() else {
        eprintln!("Usage: software-keyring sign-message <text>");
        return Ok(());
    };
    let account = first_account(keyring).await?;

    let signature = keyring.sign_personal_message(&account, message).await?;
    println!("Account:   {account}");
    println!("Signature: {signature}");
    Ok(())
}

async fn cmd_swap(keyring: &HardwareKeyring, device: &SoftwareDevice) -> Result<()> {
    let account = first_account(keyring).await?;
    if let Some(owner) = device.active() {
        println!("Account {account} belongs to wallet {owner}");
    }

    device.set_active(Some(OwnerId::new("someone-else")));
    keyring.session().mark_stale();
    println!("Signer switched to wallet someone-else\n");

    match keyring.sign_personal_message(&account, "swap test").await {
        Ok(signature) => println!("Unexpectedly signed: {signature}"),
        Err(e) => println!("Refused as expected: {e}"),
    }
    println!("Signing requests sent to the signer: {}", device.signing_requests());
    Ok(())
}
