//! Keyring 存储
//!
//! - keyring 是封闭的和类型：HD / Simple / WatchOnly / Hardware
//! - 私钥材料只存在于解锁会话中；锁定时整个会话被丢弃并清零，只保留加密 blob
//! - 会话由 `tokio::sync::RwLock` 保护：签名只拿读锁，导入 / 删除 / 锁定拿写锁

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use k256::ecdsa::SigningKey;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::config::KeystoreConfig;
use crate::domain::account::{Account, Address, KeyringId};
use crate::domain::derivation::{self, SEED_LEN};
use crate::domain::derivation_path::{DerivationPath, PathCompliance};
use crate::domain::signature::RecoverableSignature;
use crate::error::{EngineError, EngineResult};
use crate::infrastructure::encryption::{SealedBlob, SessionKey};
use crate::infrastructure::event_bus::{EngineEvent, EventBus};
use crate::infrastructure::keystore_v3::{self, KdfChoice, KeystoreV3};
use crate::infrastructure::persistence::KeyringPersistence;

/// 签名请求的类别，硬件设备按此声明能力
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureScheme {
    Transaction,
    PersonalMessage,
    TypedData,
    /// 任意 32 字节摘要
    RawDigest,
}

/// 外部签名设备（硬件钱包 / 远程签名器）
#[async_trait]
pub trait HardwareTransport: Send + Sync {
    fn device_name(&self) -> String;

    fn supports(&self, scheme: SignatureScheme) -> bool;

    /// 返回路径对应的地址与压缩公钥
    async fn get_account(&self, path: &DerivationPath) -> EngineResult<(Address, Vec<u8>)>;

    async fn sign_digest(
        &self,
        path: &DerivationPath,
        digest: &[u8; 32],
        scheme: SignatureScheme,
    ) -> EngineResult<RecoverableSignature>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyringKind {
    Hd,
    Simple,
    WatchOnly,
    Hardware,
}

/// keyring 概要（不含任何密钥材料）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyringSummary {
    pub id: KeyringId,
    pub kind: KeyringKind,
    pub accounts: Vec<Account>,
}

/// 签名时从会话中取出的句柄
pub enum SigningHandle {
    Local(SigningKey),
    Hardware {
        transport: Arc<dyn HardwareTransport>,
        path: DerivationPath,
    },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// 会话内的 keyring
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct LocalAccount {
    account: Account,
    key: SigningKey,
}

enum Keyring {
    Hd {
        mnemonic: Zeroizing<String>,
        passphrase: Zeroizing<String>,
        seed: Zeroizing<[u8; SEED_LEN]>,
        next_index: u32,
        accounts: Vec<LocalAccount>,
    },
    Simple {
        private_key: Zeroizing<[u8; 32]>,
        account: LocalAccount,
    },
    WatchOnly {
        account: Account,
    },
    Hardware {
        device: String,
        /// 解锁后需要重新连接设备
        transport: Option<Arc<dyn HardwareTransport>>,
        next_index: u32,
        accounts: Vec<Account>,
    },
}

impl Keyring {
    fn kind(&self) -> KeyringKind {
        match self {
            Self::Hd { .. } => KeyringKind::Hd,
            Self::Simple { .. } => KeyringKind::Simple,
            Self::WatchOnly { .. } => KeyringKind::WatchOnly,
            Self::Hardware { .. } => KeyringKind::Hardware,
        }
    }

    fn accounts(&self) -> Vec<Account> {
        match self {
            Self::Hd { accounts, .. } => accounts.iter().map(|a| a.account.clone()).collect(),
            Self::Simple { account, .. } => vec![account.account.clone()],
            Self::WatchOnly { account } => vec![account.clone()],
            Self::Hardware { accounts, .. } => accounts.clone(),
        }
    }

    fn owns(&self, address: &Address) -> bool {
        self.accounts().iter().any(|a| &a.address == address)
    }

    fn to_record(&self, id: KeyringId) -> KeyringRecord {
        match self {
            Self::Hd {
                mnemonic,
                passphrase,
                next_index,
                accounts,
                ..
            } => KeyringRecord::Hd {
                id,
                mnemonic: mnemonic.to_string(),
                passphrase: passphrase.to_string(),
                paths: accounts
                    .iter()
                    .filter_map(|a| a.account.derivation_path.clone())
                    .collect(),
                next_index: *next_index,
            },
            Self::Simple { private_key, .. } => KeyringRecord::Simple {
                id,
                private_key: hex::encode(&private_key[..]),
            },
            Self::WatchOnly { account } => KeyringRecord::WatchOnly {
                id,
                address: account.address,
            },
            Self::Hardware {
                device,
                next_index,
                accounts,
                ..
            } => KeyringRecord::Hardware {
                id,
                device: device.clone(),
                next_index: *next_index,
                accounts: accounts.clone(),
            },
        }
    }
}

/// 加密 blob 中的 keyring 记录
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(tag = "type", rename_all = "snake_case")]
enum KeyringRecord {
    Hd {
        #[zeroize(skip)]
        id: KeyringId,
        mnemonic: String,
        passphrase: String,
        #[zeroize(skip)]
        paths: Vec<DerivationPath>,
        next_index: u32,
    },
    Simple {
        #[zeroize(skip)]
        id: KeyringId,
        private_key: String,
    },
    WatchOnly {
        #[zeroize(skip)]
        id: KeyringId,
        #[zeroize(skip)]
        address: Address,
    },
    Hardware {
        #[zeroize(skip)]
        id: KeyringId,
        device: String,
        next_index: u32,
        #[zeroize(skip)]
        accounts: Vec<Account>,
    },
}

#[derive(Serialize, Deserialize, Default)]
struct VaultSnapshot {
    version: u32,
    keyrings: Vec<KeyringRecord>,
}

struct Session {
    key: SessionKey,
    /// 保持插入顺序
    keyrings: BTreeMap<u64, (KeyringId, Keyring)>,
    next_slot: u64,
}

impl Session {
    fn new(key: SessionKey) -> Self {
        Self {
            key,
            keyrings: BTreeMap::new(),
            next_slot: 0,
        }
    }

    fn insert(&mut self, id: KeyringId, keyring: Keyring) {
        self.keyrings.insert(self.next_slot, (id, keyring));
        self.next_slot += 1;
    }

    fn get(&self, id: &KeyringId) -> Option<&Keyring> {
        self.keyrings
            .values()
            .find(|(kid, _)| kid == id)
            .map(|(_, k)| k)
    }

    fn get_mut(&mut self, id: &KeyringId) -> Option<&mut Keyring> {
        self.keyrings
            .values_mut()
            .find(|(kid, _)| kid == id)
            .map(|(_, k)| k)
    }

    fn remove(&mut self, id: &KeyringId) -> Option<Keyring> {
        let slot = self
            .keyrings
            .iter()
            .find(|(_, (kid, _))| kid == id)
            .map(|(slot, _)| *slot)?;
        self.keyrings.remove(&slot).map(|(_, k)| k)
    }

    fn find_owner(&self, address: &Address) -> Option<KeyringId> {
        self.keyrings
            .values()
            .find(|(_, k)| k.owns(address))
            .map(|(id, _)| *id)
    }

    fn snapshot(&self) -> VaultSnapshot {
        VaultSnapshot {
            version: 1,
            keyrings: self
                .keyrings
                .values()
                .map(|(id, k)| k.to_record(*id))
                .collect(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// KeyringStore
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct KeyringStore {
    session: RwLock<Option<Session>>,
    persistence: Arc<dyn KeyringPersistence>,
    events: EventBus,
    config: KeystoreConfig,
}

impl KeyringStore {
    pub fn new(
        persistence: Arc<dyn KeyringPersistence>,
        events: EventBus,
        config: KeystoreConfig,
    ) -> Self {
        Self {
            session: RwLock::new(None),
            persistence,
            events,
            config,
        }
    }

    pub async fn is_unlocked(&self) -> bool {
        self.session.read().await.is_some()
    }

    /// 用密码解锁；首次使用（尚无 blob）时以该密码创建空 vault
    pub async fn unlock(&self, password: &str) -> EngineResult<()> {
        let mut guard = self.session.write().await;
        if guard.is_some() {
            return Ok(());
        }

        let session = match self.persistence.load_encrypted_blob().await? {
            Some(bytes) => {
                let blob = SealedBlob::from_bytes(&bytes)?;
                let key = blob.session_key(password)?;
                let plaintext = blob.open_with(&key)?;
                let snapshot: VaultSnapshot = serde_json::from_slice(&plaintext)
                    .map_err(|e| EngineError::Decryption(format!("corrupt vault: {}", e)))?;
                restore_session(key, snapshot)?
            }
            None => {
                let session = Session::new(SessionKey::derive(
                    password,
                    self.config.session_pbkdf2_rounds,
                )?);
                self.save(&session).await?;
                tracing::info!("created new keyring vault");
                session
            }
        };

        tracing::info!(keyrings = session.keyrings.len(), "wallet unlocked");
        *guard = Some(session);
        drop(guard);

        self.events.publish(EngineEvent::WalletUnlocked).await;
        Ok(())
    }

    /// 丢弃解锁会话（密钥材料随 drop 清零），加密 blob 保留
    pub async fn lock(&self) {
        let previous = self.session.write().await.take();
        if previous.is_some() {
            drop(previous);
            tracing::info!("wallet locked");
            self.events.publish(EngineEvent::WalletLocked).await;
        }
    }

    /// 把当前会话重新加密写入持久化存储
    pub async fn persist(&self) -> EngineResult<()> {
        let guard = self.session.read().await;
        let session = guard.as_ref().ok_or(EngineError::KeyringLocked)?;
        self.save(session).await
    }

    /// 修改密码：校验旧密码后用新盐值重新加密
    pub async fn change_password(&self, old_password: &str, new_password: &str) -> EngineResult<()> {
        let mut guard = self.session.write().await;
        let session = guard.as_mut().ok_or(EngineError::KeyringLocked)?;

        if let Some(bytes) = self.persistence.load_encrypted_blob().await? {
            SealedBlob::from_bytes(&bytes)?.open(old_password)?;
        }

        session.key = SessionKey::derive(new_password, self.config.session_pbkdf2_rounds)?;
        self.save(session).await?;
        tracing::info!("vault password changed");
        Ok(())
    }

    async fn save(&self, session: &Session) -> EngineResult<()> {
        let plaintext = Zeroizing::new(serde_json::to_vec(&session.snapshot())?);
        let blob = SealedBlob::seal_with(&plaintext, &session.key)?;
        self.persistence.save_encrypted_blob(&blob.to_bytes()?).await
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // 导入
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// 导入助记词，创建 HD keyring 并派生第一个账户
    pub async fn import_mnemonic(&self, words: &str, passphrase: &str) -> EngineResult<KeyringId> {
        let mnemonic = derivation::parse_mnemonic(words)?;
        let phrase = Zeroizing::new(mnemonic.to_string());
        let seed = derivation::seed_from_mnemonic(&phrase, passphrase)?;

        let first = derive_local_account(&seed[..], &DerivationPath::bip44_ethereum(0)?, KeyringId::new())?;
        let id = first.account.keyring_id;
        let address = first.account.address;

        let mut guard = self.session.write().await;
        let session = guard.as_mut().ok_or(EngineError::KeyringLocked)?;
        ensure_not_duplicate(session, &address)?;

        session.insert(
            id,
            Keyring::Hd {
                mnemonic: phrase,
                passphrase: Zeroizing::new(passphrase.to_string()),
                seed,
                next_index: 1,
                accounts: vec![first],
            },
        );
        self.save(session).await?;
        drop(guard);

        tracing::info!(keyring_id = %id, address = %address, "HD keyring imported");
        self.events
            .publish(EngineEvent::AccountAdded {
                keyring_id: id,
                address,
            })
            .await;
        Ok(id)
    }

    /// 导入单个私钥
    pub async fn import_private_key(&self, private_key: &[u8]) -> EngineResult<KeyringId> {
        let bytes: [u8; 32] = private_key.try_into().map_err(|_| {
            EngineError::InvalidPrivateKey(format!("expected 32 bytes, got {}", private_key.len()))
        })?;
        let private_key = Zeroizing::new(bytes);
        let key = SigningKey::from_slice(&private_key[..])
            .map_err(|e| EngineError::InvalidPrivateKey(e.to_string()))?;

        let id = KeyringId::new();
        let account = Account {
            address: Address::from_public_key(key.verifying_key()),
            keyring_id: id,
            derivation_path: None,
            public_key: Some(key.verifying_key().to_encoded_point(true).as_bytes().to_vec()),
        };
        let address = account.address;

        let mut guard = self.session.write().await;
        let session = guard.as_mut().ok_or(EngineError::KeyringLocked)?;
        ensure_not_duplicate(session, &address)?;

        session.insert(
            id,
            Keyring::Simple {
                private_key,
                account: LocalAccount { account, key },
            },
        );
        self.save(session).await?;
        drop(guard);

        tracing::info!(keyring_id = %id, address = %address, "private key imported");
        self.events
            .publish(EngineEvent::AccountAdded {
                keyring_id: id,
                address,
            })
            .await;
        Ok(id)
    }

    /// 导入只读地址
    pub async fn import_watch_only(&self, address: Address) -> EngineResult<KeyringId> {
        let id = KeyringId::new();

        let mut guard = self.session.write().await;
        let session = guard.as_mut().ok_or(EngineError::KeyringLocked)?;
        ensure_not_duplicate(session, &address)?;

        session.insert(
            id,
            Keyring::WatchOnly {
                account: Account {
                    address,
                    keyring_id: id,
                    derivation_path: None,
                    public_key: None,
                },
            },
        );
        self.save(session).await?;
        drop(guard);

        tracing::info!(keyring_id = %id, address = %address, "watch-only address imported");
        self.events
            .publish(EngineEvent::AccountAdded {
                keyring_id: id,
                address,
            })
            .await;
        Ok(id)
    }

    /// 导入硬件设备，读取其第一个账户
    pub async fn import_hardware(&self, transport: Arc<dyn HardwareTransport>) -> EngineResult<KeyringId> {
        let id = KeyringId::new();
        let path = DerivationPath::bip44_ethereum(0)?;
        let (address, public_key) = transport.get_account(&path).await?;

        let mut guard = self.session.write().await;
        let session = guard.as_mut().ok_or(EngineError::KeyringLocked)?;
        ensure_not_duplicate(session, &address)?;

        let device = transport.device_name();
        session.insert(
            id,
            Keyring::Hardware {
                device: device.clone(),
                transport: Some(transport),
                next_index: 1,
                accounts: vec![Account {
                    address,
                    keyring_id: id,
                    derivation_path: Some(path),
                    public_key: Some(public_key),
                }],
            },
        );
        self.save(session).await?;
        drop(guard);

        tracing::info!(keyring_id = %id, device = %device, address = %address, "hardware keyring imported");
        self.events
            .publish(EngineEvent::AccountAdded {
                keyring_id: id,
                address,
            })
            .await;
        Ok(id)
    }

    /// 解锁后重新绑定硬件设备
    pub async fn attach_hardware_transport(
        &self,
        keyring_id: KeyringId,
        transport: Arc<dyn HardwareTransport>,
    ) -> EngineResult<()> {
        let mut guard = self.session.write().await;
        let session = guard.as_mut().ok_or(EngineError::KeyringLocked)?;
        match session.get_mut(&keyring_id) {
            Some(Keyring::Hardware {
                transport: slot, ..
            }) => {
                *slot = Some(transport);
                Ok(())
            }
            Some(_) => Err(EngineError::UnsupportedOperation(
                "keyring is not a hardware keyring".into(),
            )),
            None => Err(EngineError::KeyringNotFound(keyring_id.to_string())),
        }
    }

    /// 解密 V3 keystore 并作为 Simple keyring 导入
    pub async fn import_keystore_json(&self, json: &str, password: &str) -> EngineResult<KeyringId> {
        let keystore = KeystoreV3::from_json(json)?;
        let private_key = keystore_v3::decrypt_key(&keystore, password)?;
        self.import_private_key(&private_key[..]).await
    }

    /// 把本地账户的私钥导出为 V3 keystore（scrypt 参数取自配置）
    pub async fn export_keystore_json(&self, address: &Address, password: &str) -> EngineResult<String> {
        let kdf = KdfChoice::Scrypt {
            log_n: self.config.scrypt_log_n,
        };
        self.export_keystore_json_with(address, password, kdf).await
    }

    pub async fn export_keystore_json_with(
        &self,
        address: &Address,
        password: &str,
        kdf: KdfChoice,
    ) -> EngineResult<String> {
        let keyring_id = self
            .find_keyring(address)
            .await?
            .ok_or_else(|| EngineError::UnknownAddress(address.to_string()))?;

        let key = match self.signing_handle(keyring_id, address).await? {
            SigningHandle::Local(key) => key,
            SigningHandle::Hardware { .. } => {
                return Err(EngineError::UnsupportedOperation(
                    "hardware keys cannot be exported".into(),
                ))
            }
        };
        let mut secret = Zeroizing::new([0u8; 32]);
        secret.copy_from_slice(&key.to_bytes());

        // scrypt 是 CPU 密集型，放到阻塞线程池
        let password = Zeroizing::new(password.to_string());
        let keystore = tokio::task::spawn_blocking(move || {
            keystore_v3::encrypt_key(&secret, &password, kdf)
        })
        .await
        .map_err(|e| EngineError::Other(format!("keystore task failed: {}", e)))??;
        keystore.to_json()
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // 账户
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// 派生账户
    ///
    /// - HD：未给路径时派生下一个未使用的 m/44'/60'/0'/0/i；给定路径已存在则直接返回
    /// - Simple / WatchOnly：返回唯一账户
    /// - Hardware：向设备请求地址，等待设备期间不持有会话锁
    pub async fn derive_account(
        &self,
        keyring_id: KeyringId,
        path: Option<DerivationPath>,
    ) -> EngineResult<Account> {
        let mut guard = self.session.write().await;
        let session = guard.as_mut().ok_or(EngineError::KeyringLocked)?;

        let plan = match session.get(&keyring_id) {
            None => return Err(EngineError::KeyringNotFound(keyring_id.to_string())),
            Some(Keyring::Simple { account, .. }) => DerivePlan::Existing(account.account.clone()),
            Some(Keyring::WatchOnly { account }) => DerivePlan::Existing(account.clone()),
            Some(Keyring::Hd {
                seed,
                next_index,
                accounts,
                ..
            }) => {
                let target = match &path {
                    Some(p) => p.clone(),
                    None => DerivationPath::bip44_ethereum(next_unused_index(
                        *next_index,
                        accounts.iter().filter_map(|a| a.account.derivation_path.as_ref()),
                    ))?,
                };
                match accounts
                    .iter()
                    .find(|a| a.account.derivation_path.as_ref() == Some(&target))
                {
                    Some(found) => DerivePlan::Existing(found.account.clone()),
                    None => {
                        if let PathCompliance::NonStandard(reason) = target.compliance() {
                            tracing::warn!(path = %target, reason = %reason, "deriving non-standard path");
                        }
                        let local = derive_local_account(&seed[..], &target, keyring_id)?;
                        ensure_owned_by(session, &local.account.address, keyring_id)?;
                        let account = local.account.clone();
                        if let Some(Keyring::Hd {
                            next_index,
                            accounts,
                            ..
                        }) = session.get_mut(&keyring_id)
                        {
                            advance_next_index(next_index, &target);
                            accounts.push(local);
                        }
                        DerivePlan::Derived(account)
                    }
                }
            }
            Some(Keyring::Hardware {
                transport,
                next_index,
                accounts,
                ..
            }) => {
                let target = match &path {
                    Some(p) => p.clone(),
                    None => DerivationPath::bip44_ethereum(next_unused_index(
                        *next_index,
                        accounts.iter().filter_map(|a| a.derivation_path.as_ref()),
                    ))?,
                };
                match accounts
                    .iter()
                    .find(|a| a.derivation_path.as_ref() == Some(&target))
                {
                    Some(found) => DerivePlan::Existing(found.clone()),
                    None => DerivePlan::Device {
                        transport: transport.clone().ok_or_else(|| {
                            EngineError::HardwareDeviceError("device not connected".into())
                        })?,
                        target,
                    },
                }
            }
        };

        let account = match plan {
            DerivePlan::Existing(account) => return Ok(account),
            DerivePlan::Derived(account) => {
                self.save(session).await?;
                drop(guard);
                account
            }
            DerivePlan::Device { transport, target } => {
                drop(guard);
                let (address, public_key) = transport.get_account(&target).await?;
                match self.insert_hardware_account(keyring_id, target, address, public_key).await? {
                    (account, false) => return Ok(account),
                    (account, true) => account,
                }
            }
        };

        tracing::info!(keyring_id = %keyring_id, address = %account.address, "account derived");
        self.events
            .publish(EngineEvent::AccountAdded {
                keyring_id,
                address: account.address,
            })
            .await;
        Ok(account)
    }

    /// 设备返回后重新拿写锁登记账户；等待期间同一路径可能已被并发调用登记
    async fn insert_hardware_account(
        &self,
        keyring_id: KeyringId,
        target: DerivationPath,
        address: Address,
        public_key: Vec<u8>,
    ) -> EngineResult<(Account, bool)> {
        let mut guard = self.session.write().await;
        let session = guard.as_mut().ok_or(EngineError::KeyringLocked)?;
        ensure_owned_by(session, &address, keyring_id)?;

        let Some(Keyring::Hardware {
            next_index,
            accounts,
            ..
        }) = session.get_mut(&keyring_id)
        else {
            return Err(EngineError::KeyringNotFound(keyring_id.to_string()));
        };
        if let Some(found) = accounts
            .iter()
            .find(|a| a.derivation_path.as_ref() == Some(&target))
        {
            return Ok((found.clone(), false));
        }

        advance_next_index(next_index, &target);
        let account = Account {
            address,
            keyring_id,
            derivation_path: Some(target),
            public_key: Some(public_key),
        };
        accounts.push(account.clone());
        self.save(session).await?;
        Ok((account, true))
    }

    pub async fn list_accounts(&self) -> EngineResult<Vec<Account>> {
        let guard = self.session.read().await;
        let session = guard.as_ref().ok_or(EngineError::KeyringLocked)?;
        Ok(session
            .keyrings
            .values()
            .flat_map(|(_, k)| k.accounts())
            .collect())
    }

    pub async fn list_keyrings(&self) -> EngineResult<Vec<KeyringSummary>> {
        let guard = self.session.read().await;
        let session = guard.as_ref().ok_or(EngineError::KeyringLocked)?;
        Ok(session
            .keyrings
            .values()
            .map(|(id, k)| KeyringSummary {
                id: *id,
                kind: k.kind(),
                accounts: k.accounts(),
            })
            .collect())
    }

    pub async fn find_keyring(&self, address: &Address) -> EngineResult<Option<KeyringId>> {
        let guard = self.session.read().await;
        let session = guard.as_ref().ok_or(EngineError::KeyringLocked)?;
        Ok(session.find_owner(address))
    }

    /// 删除 keyring；其密钥材料在 drop 时清零
    pub async fn remove_keyring(&self, keyring_id: KeyringId) -> EngineResult<()> {
        let mut guard = self.session.write().await;
        let session = guard.as_mut().ok_or(EngineError::KeyringLocked)?;
        let removed = session
            .remove(&keyring_id)
            .ok_or_else(|| EngineError::KeyringNotFound(keyring_id.to_string()))?;
        drop(removed);
        self.save(session).await?;
        drop(guard);

        tracing::info!(keyring_id = %keyring_id, "keyring removed");
        self.events
            .publish(EngineEvent::KeyringRemoved { keyring_id })
            .await;
        Ok(())
    }

    /// 取出签名句柄；只读锁，不阻塞并发签名
    pub async fn signing_handle(
        &self,
        keyring_id: KeyringId,
        address: &Address,
    ) -> EngineResult<SigningHandle> {
        let guard = self.session.read().await;
        let session = guard.as_ref().ok_or(EngineError::KeyringLocked)?;
        let keyring = session
            .get(&keyring_id)
            .ok_or_else(|| EngineError::KeyringNotFound(keyring_id.to_string()))?;

        match keyring {
            Keyring::Hd { accounts, .. } => accounts
                .iter()
                .find(|a| &a.account.address == address)
                .map(|a| SigningHandle::Local(a.key.clone()))
                .ok_or_else(|| EngineError::UnknownAddress(address.to_string())),
            Keyring::Simple { account, .. } => {
                if &account.account.address == address {
                    Ok(SigningHandle::Local(account.key.clone()))
                } else {
                    Err(EngineError::UnknownAddress(address.to_string()))
                }
            }
            Keyring::WatchOnly { account } => {
                if &account.address == address {
                    Err(EngineError::UnsupportedOperation(
                        "watch-only account cannot sign".into(),
                    ))
                } else {
                    Err(EngineError::UnknownAddress(address.to_string()))
                }
            }
            Keyring::Hardware {
                transport,
                accounts,
                ..
            } => {
                let account = accounts
                    .iter()
                    .find(|a| &a.address == address)
                    .ok_or_else(|| EngineError::UnknownAddress(address.to_string()))?;
                let transport = transport
                    .clone()
                    .ok_or_else(|| EngineError::HardwareDeviceError("device not connected".into()))?;
                let path = account
                    .derivation_path
                    .clone()
                    .ok_or_else(|| EngineError::InvalidPath("hardware account without path".into()))?;
                Ok(SigningHandle::Hardware { transport, path })
            }
        }
    }
}

/// derive_account 第一阶段（持锁）的结论
enum DerivePlan {
    Existing(Account),
    Derived(Account),
    /// 需要向设备请求，释放锁后进行
    Device {
        transport: Arc<dyn HardwareTransport>,
        target: DerivationPath,
    },
}

/// m/44'/60'/0'/0/i 形式的路径返回 i
fn default_layout_index(path: &DerivationPath) -> Option<u32> {
    let index = path.last_index()?;
    let expected = DerivationPath::bip44_ethereum(index).ok()?;
    (expected == *path).then_some(index)
}

/// 从 `start` 起第一个未被占用的默认路径索引
fn next_unused_index<'a>(start: u32, used: impl Iterator<Item = &'a DerivationPath>) -> u32 {
    let taken: BTreeSet<u32> = used.filter_map(default_layout_index).collect();
    let mut index = start;
    while taken.contains(&index) {
        index += 1;
    }
    index
}

fn advance_next_index(next_index: &mut u32, derived: &DerivationPath) {
    if let Some(index) = default_layout_index(derived) {
        if index >= *next_index {
            *next_index = index + 1;
        }
    }
}

/// 同一地址不能同时属于两个 keyring
fn ensure_owned_by(session: &Session, address: &Address, keyring_id: KeyringId) -> EngineResult<()> {
    match session.find_owner(address) {
        Some(owner) if owner != keyring_id => Err(EngineError::UnsupportedOperation(format!(
            "account {} already belongs to keyring {}",
            address, owner
        ))),
        _ => Ok(()),
    }
}

fn derive_local_account(
    seed: &[u8],
    path: &DerivationPath,
    keyring_id: KeyringId,
) -> EngineResult<LocalAccount> {
    let extended = derivation::derive_full_path(seed, path)?;
    let key = extended.signing_key()?;
    Ok(LocalAccount {
        account: Account {
            address: Address::from_public_key(key.verifying_key()),
            keyring_id,
            derivation_path: Some(path.clone()),
            public_key: Some(extended.public_key()?),
        },
        key,
    })
}

fn ensure_not_duplicate(session: &Session, address: &Address) -> EngineResult<()> {
    match session.find_owner(address) {
        Some(owner) => Err(EngineError::UnsupportedOperation(format!(
            "account {} already belongs to keyring {}",
            address, owner
        ))),
        None => Ok(()),
    }
}

fn restore_session(key: SessionKey, snapshot: VaultSnapshot) -> EngineResult<Session> {
    let mut session = Session::new(key);
    for record in &snapshot.keyrings {
        match record {
            KeyringRecord::Hd {
                id,
                mnemonic,
                passphrase,
                paths,
                next_index,
            } => {
                let seed = derivation::seed_from_mnemonic(mnemonic, passphrase)?;
                let accounts = paths
                    .iter()
                    .map(|p| derive_local_account(&seed[..], p, *id))
                    .collect::<EngineResult<Vec<_>>>()?;
                session.insert(
                    *id,
                    Keyring::Hd {
                        mnemonic: Zeroizing::new(mnemonic.clone()),
                        passphrase: Zeroizing::new(passphrase.clone()),
                        seed,
                        next_index: *next_index,
                        accounts,
                    },
                );
            }
            KeyringRecord::Simple { id, private_key } => {
                let bytes = Zeroizing::new(
                    hex::decode(private_key)
                        .map_err(|e| EngineError::Decryption(format!("corrupt private key: {}", e)))?,
                );
                let mut raw = Zeroizing::new([0u8; 32]);
                if bytes.len() != 32 {
                    return Err(EngineError::Decryption("corrupt private key length".into()));
                }
                raw.copy_from_slice(&bytes);
                let key = SigningKey::from_slice(&raw[..])
                    .map_err(|e| EngineError::InvalidPrivateKey(e.to_string()))?;
                let account = Account {
                    address: Address::from_public_key(key.verifying_key()),
                    keyring_id: *id,
                    derivation_path: None,
                    public_key: Some(key.verifying_key().to_encoded_point(true).as_bytes().to_vec()),
                };
                session.insert(
                    *id,
                    Keyring::Simple {
                        private_key: raw,
                        account: LocalAccount { account, key },
                    },
                );
            }
            KeyringRecord::WatchOnly { id, address } => {
                session.insert(
                    *id,
                    Keyring::WatchOnly {
                        account: Account {
                            address: *address,
                            keyring_id: *id,
                            derivation_path: None,
                            public_key: None,
                        },
                    },
                );
            }
            KeyringRecord::Hardware {
                id,
                device,
                next_index,
                accounts,
            } => {
                session.insert(
                    *id,
                    Keyring::Hardware {
                        device: device.clone(),
                        transport: None,
                        next_index: *next_index,
                        accounts: accounts.clone(),
                    },
                );
            }
        }
    }
    Ok(session)
}
