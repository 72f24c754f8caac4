//! keyring-engine 运维命令行
//!
//! derive <mnemonic-file> [index]   按 BIP44 派生地址
//! keystore-decrypt <file>          校验 V3 keystore 密码并输出地址
//! hash-typed-data <file>           输出 EIP-712 domain / struct / 签名摘要

use std::path::Path;

use anyhow::{bail, Context, Result};
use keyring_engine::{
    config::Config,
    domain::{derivation, Address, DerivationPath, PathCompliance, TypedDataPayload},
    infrastructure::{keystore_v3, logging::init_logging},
};
use k256::ecdsa::SigningKey;

const USAGE: &str = "usage:
  keyring-engine derive <mnemonic-file> [index]
  keyring-engine keystore-decrypt <keystore-file>
  keyring-engine hash-typed-data <typed-data-file>";

fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let config = Config::from_env_and_file(std::env::var("CONFIG_PATH").ok().as_deref())
        .context("failed to load configuration")?;
    if let Err(e) = init_logging(&config.logging) {
        eprintln!("Failed to initialize logging: {}", e);
    }

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("derive") => {
            let file = args.get(1).context(USAGE)?;
            let index = match args.get(2) {
                Some(raw) => raw.parse::<u32>().context("index must be a u32")?,
                None => 0,
            };
            derive(Path::new(file), index)
        }
        Some("keystore-decrypt") => keystore_decrypt(Path::new(args.get(1).context(USAGE)?)),
        Some("hash-typed-data") => hash_typed_data(Path::new(args.get(1).context(USAGE)?)),
        _ => bail!(USAGE),
    }
}

fn derive(file: &Path, index: u32) -> Result<()> {
    let words = zeroize::Zeroizing::new(
        std::fs::read_to_string(file).with_context(|| format!("cannot read {}", file.display()))?,
    );
    let passphrase = zeroize::Zeroizing::new(std::env::var("MNEMONIC_PASSPHRASE").unwrap_or_default());

    let path = match std::env::var("DERIVATION_PATH") {
        Ok(raw) => raw.parse::<DerivationPath>()?,
        Err(_) => DerivationPath::bip44_ethereum(index)?,
    };
    if let PathCompliance::NonStandard(reason) = path.compliance() {
        tracing::warn!(path = %path, reason = %reason, "non-standard derivation path");
    }

    let seed = derivation::seed_from_mnemonic(words.trim(), &passphrase)?;
    let key = derivation::derive_full_path(&seed[..], &path)?;
    let address = key.address()?;

    tracing::info!(path = %path, address = %address, "address derived");
    println!("{}  {}", path, address);
    Ok(())
}

fn keystore_decrypt(file: &Path) -> Result<()> {
    let json = std::fs::read_to_string(file).with_context(|| format!("cannot read {}", file.display()))?;
    let keystore = keystore_v3::KeystoreV3::from_json(&json)?;
    let password = zeroize::Zeroizing::new(
        std::env::var("KEYSTORE_PASSWORD").context("KEYSTORE_PASSWORD must be set")?,
    );

    let private_key = keystore_v3::decrypt_key(&keystore, &password)?;
    let key = SigningKey::from_slice(&private_key[..]).context("keystore holds an invalid key")?;
    let address = Address::from_public_key(key.verifying_key());

    // 私钥不输出，只给出地址用于核对
    println!("{}", address);
    Ok(())
}

fn hash_typed_data(file: &Path) -> Result<()> {
    let json = std::fs::read_to_string(file).with_context(|| format!("cannot read {}", file.display()))?;
    let payload = TypedDataPayload::from_json(&json)?;

    println!("domainSeparator: 0x{}", hex::encode(payload.domain_separator()?));
    println!("messageHash:     0x{}", hex::encode(payload.message_hash()?));
    println!("digest:          0x{}", hex::encode(payload.signing_digest()?));
    Ok(())
}
