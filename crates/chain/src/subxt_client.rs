//! Substrate-backed chain client.
//!
//! Uses dynamic storage queries and transactions against the `JobsManager`
//! and `BondingManager` pallets, so no generated metadata is required.

use crate::client::ChainClient;
use crate::error::{ChainError, ChainResult};
use crate::types::{JobInfo, JobLog, Transaction, TxHash};
use async_trait::async_trait;
use parity_scale_codec::Decode;
use sp_core::crypto::AccountId32;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use subxt::dynamic::{storage, tx, Value};
use subxt::events::Phase;
use subxt::ext::sp_core::{sr25519, Pair as _};
use subxt::tx::{DynamicPayload, PairSigner};
use subxt::utils::H256;
use subxt::{OnlineClient, PolkadotConfig};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use vtn_types::{Claim, JobId};

const JOBS_PALLET: &str = "JobsManager";
const BONDING_PALLET: &str = "BondingManager";
const NEW_JOB_EVENT: &str = "NewJob";
const EVENT_BUFFER: usize = 256;
const TX_INDEX_CAPACITY: usize = 4096;

#[derive(Debug, Decode)]
struct NewJobFields {
    job_id: [u8; 32],
    broadcaster: [u8; 32],
    transcoder: [u8; 32],
    #[allow(dead_code)]
    max_price_per_segment: u128,
}

#[derive(Debug, Decode)]
struct JobRecord {
    broadcaster: [u8; 32],
    transcoder: [u8; 32],
    max_price_per_segment: u128,
    end_block: u32,
}

/// Where a recently seen extrinsic lives.
#[derive(Default)]
struct TxIndex {
    order: VecDeque<TxHash>,
    entries: HashMap<TxHash, (H256, u32)>,
}

impl TxIndex {
    fn insert(&mut self, hash: TxHash, block: H256, index: u32) {
        if self.entries.insert(hash, (block, index)).is_none() {
            self.order.push_back(hash);
        }
        while self.order.len() > TX_INDEX_CAPACITY {
            if let Some(old) = self.order.pop_front() {
                self.entries.remove(&old);
            }
        }
    }

    fn get(&self, hash: &TxHash) -> Option<(H256, u32)> {
        self.entries.get(hash).copied()
    }
}

impl From<subxt::Error> for ChainError {
    fn from(err: subxt::Error) -> Self {
        match err {
            subxt::Error::Rpc(e) => ChainError::Rpc(e.to_string()),
            subxt::Error::Io(e) => ChainError::Connection(e.to_string()),
            subxt::Error::Codec(e) => ChainError::Decode(e.to_string()),
            subxt::Error::Runtime(e) => {
                let msg = e.to_string();
                if msg.contains("AlreadyRewarded") {
                    ChainError::AlreadyRewarded
                } else {
                    ChainError::Rejected(msg)
                }
            }
            other => ChainError::Rpc(other.to_string()),
        }
    }
}

/// Chain client over a Substrate node RPC endpoint.
pub struct SubxtChainClient {
    client: OnlineClient<PolkadotConfig>,
    signer: PairSigner<PolkadotConfig, sr25519::Pair>,
    account_bytes: [u8; 32],
    account: String,
    tx_index: Arc<Mutex<TxIndex>>,
}

/// Derive the sr25519 pair behind `suri` and its raw account id.
fn signer_pair(suri: &str) -> ChainResult<(sr25519::Pair, [u8; 32])> {
    let pair = sr25519::Pair::from_string(suri, None)
        .map_err(|e| ChainError::Signer(format!("{e:?}")))?;
    let account_bytes: [u8; 32] = pair.public().0;
    Ok((pair, account_bytes))
}

impl SubxtChainClient {
    /// Connect to `rpc_url` and sign with the sr25519 key behind `suri`
    /// (e.g. `//Alice` or a mnemonic).
    pub async fn connect(rpc_url: &str, suri: &str) -> ChainResult<Self> {
        let (pair, account_bytes) = signer_pair(suri)?;
        let client = OnlineClient::<PolkadotConfig>::from_url(rpc_url)
            .await
            .map_err(|e| ChainError::Connection(e.to_string()))?;

        let signer = PairSigner::new(pair);
        let account = AccountId32::from(account_bytes).to_string();
        info!(rpc_url = %rpc_url, account = %account, "Connected to chain");

        Ok(Self {
            client,
            signer,
            account_bytes,
            account,
            tx_index: Arc::new(Mutex::new(TxIndex::default())),
        })
    }

    async fn fetch_storage(
        &self,
        pallet: &str,
        entry: &str,
        key: Vec<u8>,
    ) -> ChainResult<Option<Vec<u8>>> {
        let query = storage(pallet, entry, vec![Value::from_bytes(key)]);
        let value = self
            .client
            .storage()
            .at_latest()
            .await?
            .fetch(&query)
            .await?;
        Ok(value.map(|v| v.encoded().to_vec()))
    }

    async fn submit(&self, call: DynamicPayload) -> ChainResult<TxHash> {
        let events = self
            .client
            .tx()
            .sign_and_submit_then_watch_default(&call, &self.signer)
            .await?
            .wait_for_finalized_success()
            .await?;
        Ok(TxHash(events.extrinsic_hash().0))
    }
}

fn account_string(bytes: [u8; 32]) -> String {
    AccountId32::from(bytes).to_string()
}

fn decode<T: Decode>(bytes: &[u8]) -> ChainResult<T> {
    T::decode(&mut &bytes[..]).map_err(|e| ChainError::Decode(e.to_string()))
}

/// Signer of an extrinsic from its `MultiAddress::Id` encoding.
fn signer_from_address(address: &[u8]) -> String {
    match address {
        [0, rest @ ..] if rest.len() == 32 => {
            let mut bytes = [0u8; 32];
            bytes.copy_from_slice(rest);
            account_string(bytes)
        }
        other => format!("0x{}", hex::encode(other)),
    }
}

async fn forward_job_events(
    client: OnlineClient<PolkadotConfig>,
    account: [u8; 32],
    tx_index: Arc<Mutex<TxIndex>>,
    sink: mpsc::Sender<JobLog>,
) -> ChainResult<()> {
    let mut blocks = client.blocks().subscribe_finalized().await?;

    while let Some(block) = blocks.next().await {
        let block = block?;
        let block_hash = block.hash();
        let block_number: u64 = block.number().into();

        let extrinsics = block.extrinsics().await?;
        let mut hashes = HashMap::new();
        for ext in extrinsics.iter() {
            let ext = ext?;
            hashes.insert(ext.index(), TxHash::of(ext.bytes()));
        }

        let events = block.events().await?;
        for event in events.iter() {
            let event = event?;
            if event.pallet_name() != JOBS_PALLET || event.variant_name() != NEW_JOB_EVENT {
                continue;
            }
            let Phase::ApplyExtrinsic(index) = event.phase() else {
                continue;
            };
            let fields: NewJobFields = match decode(event.field_bytes()) {
                Ok(fields) => fields,
                Err(e) => {
                    warn!(block = block_number, error = %e, "Undecodable NewJob event");
                    continue;
                }
            };
            if fields.transcoder != account {
                continue;
            }
            let Some(tx_hash) = hashes.get(&index).copied() else {
                continue;
            };

            tx_index
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .insert(tx_hash, block_hash, index);

            let log = JobLog {
                tx_hash,
                block_number,
                job_id: JobId::from_le_bytes(&fields.job_id),
                broadcaster: account_string(fields.broadcaster),
                transcoder: account_string(fields.transcoder),
            };
            debug!(job_id = %log.job_id, block = block_number, "NewJob event");
            if sink.send(log).await.is_err() {
                return Ok(());
            }
        }
    }

    Err(ChainError::SubscriptionClosed)
}

#[async_trait]
impl ChainClient for SubxtChainClient {
    fn account(&self) -> &str {
        &self.account
    }

    async fn is_active_transcoder(&self) -> ChainResult<bool> {
        let entry = self
            .fetch_storage(BONDING_PALLET, "ActiveTranscoders", self.account_bytes.to_vec())
            .await?;
        Ok(entry.is_some())
    }

    async fn transcoder_stake(&self) -> ChainResult<u128> {
        match self
            .fetch_storage(BONDING_PALLET, "Transcoders", self.account_bytes.to_vec())
            .await?
        {
            // Bonded stake leads the transcoder record.
            Some(bytes) => decode::<u128>(&bytes),
            None => Ok(0),
        }
    }

    async fn subscribe_job_events(&self) -> ChainResult<mpsc::Receiver<JobLog>> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let client = self.client.clone();
        let account = self.account_bytes;
        let tx_index = Arc::clone(&self.tx_index);

        tokio::spawn(async move {
            if let Err(e) = forward_job_events(client, account, tx_index, tx).await {
                warn!(error = %e, "Job event subscription ended");
            }
        });
        Ok(rx)
    }

    async fn transaction_by_hash(&self, hash: &TxHash) -> ChainResult<Transaction> {
        let location = self
            .tx_index
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(hash);
        let Some((block_hash, index)) = location else {
            return Err(ChainError::TransactionNotFound(hash.to_string()));
        };

        let extrinsics = self.client.blocks().at(block_hash).await?.extrinsics().await?;
        for ext in extrinsics.iter() {
            let ext = ext?;
            if ext.index() == index {
                return Ok(Transaction {
                    hash: *hash,
                    from: ext.address_bytes().map(signer_from_address),
                    input: ext.field_bytes().to_vec(),
                });
            }
        }
        Err(ChainError::TransactionNotFound(hash.to_string()))
    }

    async fn job_info(&self, log: &JobLog) -> ChainResult<JobInfo> {
        let key = log
            .job_id
            .to_le_word()
            .ok_or_else(|| ChainError::Decode(format!("job id {} exceeds 256 bits", log.job_id)))?;
        let bytes = self
            .fetch_storage(JOBS_PALLET, "Jobs", key.to_vec())
            .await?
            .ok_or_else(|| ChainError::JobNotFound(log.job_id.to_string()))?;
        let record: JobRecord = decode(&bytes)?;

        Ok(JobInfo {
            job_id: log.job_id.clone(),
            broadcaster: account_string(record.broadcaster),
            transcoder: account_string(record.transcoder),
            max_price_per_segment: record.max_price_per_segment,
            end_block: u64::from(record.end_block),
        })
    }

    async fn submit_claim(&self, claim: &Claim) -> ChainResult<TxHash> {
        let job = claim
            .job_id
            .to_le_word()
            .ok_or_else(|| ChainError::Decode(format!("job id {} exceeds 256 bits", claim.job_id)))?;
        let call = tx(
            JOBS_PALLET,
            "claim_work",
            vec![
                Value::from_bytes(job),
                Value::u128(u128::from(claim.start)),
                Value::u128(u128::from(claim.end)),
                Value::from_bytes(claim.digest.as_bytes()),
            ],
        );
        self.submit(call).await
    }

    async fn reward(&self) -> ChainResult<TxHash> {
        let call = tx(BONDING_PALLET, "reward", Vec::<Value>::new());
        self.submit(call).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tx_index_is_bounded() {
        let mut index = TxIndex::default();
        for i in 0..(TX_INDEX_CAPACITY as u32 + 10) {
            index.insert(TxHash::of(&i.to_le_bytes()), H256::zero(), i);
        }
        assert_eq!(index.entries.len(), TX_INDEX_CAPACITY);
        assert!(index.get(&TxHash::of(&0u32.to_le_bytes())).is_none());
        assert!(index
            .get(&TxHash::of(&(TX_INDEX_CAPACITY as u32).to_le_bytes()))
            .is_some());
    }

    #[test]
    fn test_signer_pair_account_id() {
        let (_, account_bytes) = signer_pair("//Alice").unwrap();
        assert_eq!(
            AccountId32::from(account_bytes).to_string(),
            "5GrwvaEF5zXb26Fz9rcQpDWS57CtERHpNehXCPcNoHGKutQY"
        );
        assert!(matches!(signer_pair("not a suri"), Err(ChainError::Signer(_))));
    }

    #[test]
    fn test_signer_from_address() {
        let mut address = vec![0u8];
        address.extend_from_slice(&[7u8; 32]);
        assert_eq!(signer_from_address(&address), account_string([7u8; 32]));
        assert_eq!(signer_from_address(&[1, 2]), "0x0102");
    }

    #[test]
    fn test_job_record_decode() {
        use parity_scale_codec::Encode;
        let bytes = ([1u8; 32], [2u8; 32], 500u128, 99u32).encode();
        let record: JobRecord = decode(&bytes).unwrap();
        assert_eq!(record.max_price_per_segment, 500);
        assert_eq!(record.end_block, 99);
        assert_eq!(record.transcoder, [2u8; 32]);
    }
}
