//! In-memory ledgers, wallet and counterparty channel for running whole
//! swaps inside one test process.

#![allow(dead_code)]

use anyhow::Context;
use bitcoin::{OutPoint, Script, Transaction, TxIn, TxOut, Txid};
use chrono::Utc;
use hashlock::{
    asset::{Amount, Currency},
    chain::{
        entrypoint::{
            AddParameters, InitiateParameters, InitiateSettings, Operation, OperationIndexer,
            OperationStatus, RedeemParameters, RefundParameters, ADD, INITIATE, REDEEM, REFUND,
        },
        event_log::{Added, Address, EventLogChain, Hash, Initiated, Log, Redeemed, Refunded},
        utxo::{
            pubkey_hash, redeem_script_sig, refund_script_sig, HtlcScript, UtxoChain,
            UtxoTransaction,
        },
        Broadcast, ChainFamily, KeyPath, LedgerTime, LockAction, RateLimiter, SignedTx, TxId,
        UnsignedTx, WalletSigner,
    },
    channel::{CounterpartyChannel, Message, MessageKind},
    engine::{EngineSettings, LedgerHandle, Ledgers, SwapEngine, SwapEvent},
    observation::{LockLocation, Outpoint},
    observer::{ChainObserver, EntrypointObserver, EventLogObserver, UtxoObserver},
    record::{KeyPaths, SwapRecord},
    repository::MemoryRepository,
    terms::{LockTimes, PartyTerms, Position, Rewards, SwapTerms, Symbol},
    RelativeTime, Role, Secret, SecretHash, SwapId, Timestamp,
};
use rust_decimal::Decimal;
use std::{
    collections::{HashMap, VecDeque},
    convert::TryFrom,
    str::FromStr,
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::sync::mpsc;

pub const EVENT_LOG_CONTRACT: Address = Address([0x11; 20]);
pub const ENTRYPOINT_CONTRACT: &str = "KT1VG2WtYdSWz5E7chTeAdDPZNy2MpP8pTfL";

pub const INITIATOR_ETH: &str = "0x00000000000000000000000000000000000000a1";
pub const ACCEPTOR_ETH: &str = "0x00000000000000000000000000000000000000b2";
pub const INITIATOR_XTZ: &str = "tz1aKTCbAUuea2RV9kxqRVRg3HT7f1RKnp6a";
pub const ACCEPTOR_XTZ: &str = "tz1Mj7RzPmMAqDUNFBn5t5VbXmWW4cSUAdtT";
pub const INITIATOR_BTC: &str = "bcrt1qryj6ya9vqpph8w65992nhk64cs890vfy0khsfg";
pub const ACCEPTOR_BTC: &str = "bcrt1qcqslz7lfn34dl096t5uwurff9spen5h4v2pmap";

/// A ledger clock that can be moved by the test.
#[derive(Debug)]
pub struct Clock(AtomicU32);

impl Clock {
    fn new() -> Self {
        Clock(AtomicU32::new(u32::from(Timestamp::now())))
    }

    pub fn set(&self, time: Timestamp) {
        self.0.store(u32::from(time), Ordering::SeqCst);
    }

    fn now(&self) -> Timestamp {
        Timestamp::from(self.0.load(Ordering::SeqCst))
    }
}

fn decode(transaction: &SignedTx) -> anyhow::Result<UnsignedTx> {
    Ok(serde_json::from_slice(&transaction.bytes)?)
}

/// An account chain whose swap contract emits event logs.
#[derive(Debug)]
pub struct EventLogLedger {
    logs: Mutex<Vec<Log>>,
    pub clock: Clock,
    transactions: AtomicU64,
    refunds: AtomicU32,
    failing_requests: AtomicU32,
    redeem_before_refund: Mutex<Option<Secret>>,
}

impl EventLogLedger {
    pub fn new() -> Self {
        EventLogLedger {
            logs: Mutex::new(Vec::new()),
            clock: Clock::new(),
            transactions: AtomicU64::new(0),
            refunds: AtomicU32::new(0),
            failing_requests: AtomicU32::new(0),
            redeem_before_refund: Mutex::new(None),
        }
    }

    pub fn refunds(&self) -> u32 {
        self.refunds.load(Ordering::SeqCst)
    }

    /// Lets the next `count` log requests fail.
    pub fn fail_requests(&self, count: u32) {
        self.failing_requests.store(count, Ordering::SeqCst);
    }

    /// The next refund races a redeem revealing `secret`: the redeem lands
    /// while the refund is in flight and the refund is rejected.
    pub fn redeem_before_refund(&self, secret: Secret) {
        *self.redeem_before_refund.lock().unwrap() = Some(secret);
    }

    /// Tops up the lock under `hashed_secret`.
    pub fn add(&self, sender: Address, hashed_secret: SecretHash, amount: Amount) -> TxId {
        let added = Added {
            hashed_secret,
            sender,
            value: amount,
        };

        self.push(added.topics(), added.data())
    }

    fn push(&self, topics: Vec<Hash>, data: Vec<u8>) -> TxId {
        let number = self.transactions.fetch_add(1, Ordering::SeqCst) + 1;
        let mut transaction_hash = [0u8; 32];
        transaction_hash[24..].copy_from_slice(&number.to_be_bytes());
        let transaction_hash = Hash(transaction_hash);

        self.logs.lock().unwrap().push(Log {
            address: EVENT_LOG_CONTRACT,
            topics,
            data,
            block_number: number,
            transaction_hash,
        });

        TxId::new(transaction_hash.to_string())
    }
}

#[async_trait::async_trait]
impl EventLogChain for EventLogLedger {
    async fn contract_events(
        &self,
        contract: Address,
        _: u64,
        topics: Vec<Option<Hash>>,
    ) -> anyhow::Result<Vec<Log>> {
        let failing = self
            .failing_requests
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1));
        if failing.is_ok() {
            anyhow::bail!("connection reset by node");
        }

        Ok(self
            .logs
            .lock()
            .unwrap()
            .iter()
            .filter(|log| log.address == contract && log.matches(&topics))
            .cloned()
            .collect())
    }
}

#[async_trait::async_trait]
impl Broadcast for EventLogLedger {
    async fn broadcast(&self, transaction: SignedTx) -> anyhow::Result<TxId> {
        let tx_id = match decode(&transaction)?.action {
            LockAction::Lock { params } => {
                let initiated = Initiated {
                    hashed_secret: params.secret_hash,
                    participant: Address::from_str(&params.redeem_address)?,
                    initiator: Address::from_str(&params.refund_address)?,
                    refund_timestamp: u64::from(u32::from(params.refund_time)),
                    value: params.amount,
                    redeem_fee: params.reward_for_redeem,
                };
                self.push(initiated.topics(), initiated.data())
            }
            LockAction::Redeem { params, secret, .. } => {
                let redeemed = Redeemed {
                    hashed_secret: params.secret_hash,
                    secret,
                };
                self.push(redeemed.topics(), redeemed.data())
            }
            LockAction::Refund { params, .. } => {
                if self.clock.now() < params.refund_time {
                    anyhow::bail!("lock is not refundable yet");
                }

                let racing_redeem = self.redeem_before_refund.lock().unwrap().take();
                if let Some(secret) = racing_redeem {
                    let redeemed = Redeemed {
                        hashed_secret: params.secret_hash,
                        secret,
                    };
                    self.push(redeemed.topics(), redeemed.data());

                    tokio::time::sleep(Duration::from_millis(200)).await;
                    anyhow::bail!("lock was already redeemed");
                }
                self.refunds.fetch_add(1, Ordering::SeqCst);

                let refunded = Refunded {
                    hashed_secret: params.secret_hash,
                };
                self.push(refunded.topics(), Vec::new())
            }
        };

        Ok(tx_id)
    }
}

#[async_trait::async_trait]
impl LedgerTime for EventLogLedger {
    async fn ledger_time(&self) -> anyhow::Result<Timestamp> {
        Ok(self.clock.now())
    }
}

/// A chain whose swap contract is called through entrypoints, reported by
/// an indexer.
#[derive(Debug)]
pub struct EntrypointLedger {
    operations: Mutex<Vec<Operation>>,
    pub clock: Clock,
    transactions: AtomicU64,
    refunds: AtomicU32,
}

impl EntrypointLedger {
    pub fn new() -> Self {
        EntrypointLedger {
            operations: Mutex::new(Vec::new()),
            clock: Clock::new(),
            transactions: AtomicU64::new(0),
            refunds: AtomicU32::new(0),
        }
    }

    pub fn refunds(&self) -> u32 {
        self.refunds.load(Ordering::SeqCst)
    }

    /// Tops up the lock under `hashed_secret`.
    pub fn add(&self, sender: &str, hashed_secret: SecretHash, amount: Amount) -> TxId {
        let parameters = serde_json::to_value(AddParameters { hashed_secret }).unwrap();

        self.push(sender, ADD, parameters, amount)
    }

    fn push(
        &self,
        sender: &str,
        entrypoint: &str,
        parameters: serde_json::Value,
        amount: Amount,
    ) -> TxId {
        let number = self.transactions.fetch_add(1, Ordering::SeqCst) + 1;
        let hash = format!("oo{:049}", number);

        self.operations.lock().unwrap().push(Operation {
            hash: hash.clone(),
            sender: sender.to_owned(),
            target: ENTRYPOINT_CONTRACT.to_owned(),
            entrypoint: entrypoint.to_owned(),
            parameters,
            amount,
            status: OperationStatus::Applied,
            timestamp: Utc::now(),
        });

        TxId::new(hash)
    }
}

#[async_trait::async_trait]
impl OperationIndexer for EntrypointLedger {
    async fn operations(&self, contract: &str, _: Timestamp) -> anyhow::Result<Vec<Operation>> {
        Ok(self
            .operations
            .lock()
            .unwrap()
            .iter()
            .filter(|operation| operation.target == contract)
            .cloned()
            .collect())
    }
}

#[async_trait::async_trait]
impl Broadcast for EntrypointLedger {
    async fn broadcast(&self, transaction: SignedTx) -> anyhow::Result<TxId> {
        let tx_id = match decode(&transaction)?.action {
            LockAction::Lock { params } => {
                let parameters = serde_json::to_value(InitiateParameters {
                    participant: params.redeem_address.clone(),
                    settings: InitiateSettings {
                        hashed_secret: params.secret_hash,
                        refund_time: params.refund_time.to_date_time(),
                        payoff: params.reward_for_redeem,
                    },
                })?;
                self.push(&params.refund_address, INITIATE, parameters, params.amount)
            }
            LockAction::Redeem { params, secret, .. } => {
                let parameters = serde_json::to_value(RedeemParameters { secret })?;
                self.push(&params.redeem_address, REDEEM, parameters, Amount::ZERO)
            }
            LockAction::Refund { params, .. } => {
                if self.clock.now() < params.refund_time {
                    anyhow::bail!("lock is not refundable yet");
                }
                self.refunds.fetch_add(1, Ordering::SeqCst);

                let parameters = serde_json::to_value(RefundParameters {
                    hashed_secret: params.secret_hash,
                })?;
                self.push(&params.refund_address, REFUND, parameters, Amount::ZERO)
            }
        };

        Ok(tx_id)
    }
}

#[async_trait::async_trait]
impl LedgerTime for EntrypointLedger {
    async fn ledger_time(&self) -> anyhow::Result<Timestamp> {
        Ok(self.clock.now())
    }
}

/// A UTXO chain holding HTLC outputs. Every broadcast transaction is mined
/// right away with one confirmation.
#[derive(Debug)]
pub struct UtxoLedger {
    transactions: Mutex<HashMap<Txid, UtxoTransaction>>,
    pub clock: Clock,
    fundings: AtomicU32,
    refunds: AtomicU32,
}

impl UtxoLedger {
    pub fn new() -> Self {
        UtxoLedger {
            transactions: Mutex::new(HashMap::new()),
            clock: Clock::new(),
            fundings: AtomicU32::new(0),
            refunds: AtomicU32::new(0),
        }
    }

    pub fn refunds(&self) -> u32 {
        self.refunds.load(Ordering::SeqCst)
    }

    fn mine(&self, transaction: Transaction) -> TxId {
        let txid = transaction.txid();
        self.transactions.lock().unwrap().insert(txid, UtxoTransaction {
            transaction,
            confirmations: 1,
        });

        TxId::new(txid.to_string())
    }

    fn funding(&self, params: &hashlock::observer::LockParams) -> anyhow::Result<Transaction> {
        let htlc = HtlcScript {
            secret_hash: params.secret_hash,
            redeem_pubkey_hash: pubkey_hash(&params.redeem_address)
                .context("redeem address has no key hash")?,
            refund_pubkey_hash: pubkey_hash(&params.refund_address).unwrap_or([0x19; 20]),
            lock_time: params.refund_time,
        };
        let fundings = self.fundings.fetch_add(1, Ordering::SeqCst);

        Ok(Transaction {
            version: 2,
            lock_time: 0,
            input: vec![TxIn {
                previous_output: OutPoint {
                    vout: fundings,
                    ..OutPoint::default()
                },
                script_sig: Script::new(),
                sequence: 0xFFFF_FFFF,
                witness: Vec::new(),
            }],
            output: vec![TxOut {
                value: u64::try_from(params.amount.as_base_units())?,
                script_pubkey: htlc.to_script(),
            }],
        })
    }
}

fn spend(location: LockLocation, script_sig: Script) -> anyhow::Result<Transaction> {
    let outpoints = match location {
        LockLocation::Utxo(outpoints) => outpoints,
        LockLocation::Contract(contract) => anyhow::bail!("{} is not an outpoint", contract),
    };

    let input = outpoints
        .into_iter()
        .map(|Outpoint { txid, vout }| -> anyhow::Result<TxIn> {
            Ok(TxIn {
                previous_output: OutPoint::new(Txid::from_str(txid.as_str())?, vout),
                script_sig: script_sig.clone(),
                sequence: 0xFFFF_FFFE,
                witness: Vec::new(),
            })
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    Ok(Transaction {
        version: 2,
        lock_time: 0,
        input,
        output: Vec::new(),
    })
}

#[async_trait::async_trait]
impl UtxoChain for UtxoLedger {
    async fn transaction(&self, txid: Txid) -> anyhow::Result<Option<UtxoTransaction>> {
        Ok(self.transactions.lock().unwrap().get(&txid).cloned())
    }

    async fn spends(&self, outpoint: OutPoint) -> anyhow::Result<Vec<UtxoTransaction>> {
        Ok(self
            .transactions
            .lock()
            .unwrap()
            .values()
            .filter(|spend| {
                spend
                    .transaction
                    .input
                    .iter()
                    .any(|input| input.previous_output == outpoint)
            })
            .cloned()
            .collect())
    }
}

#[async_trait::async_trait]
impl Broadcast for UtxoLedger {
    async fn broadcast(&self, transaction: SignedTx) -> anyhow::Result<TxId> {
        let transaction = match decode(&transaction)?.action {
            LockAction::Lock { params } => self.funding(&params)?,
            LockAction::Redeem {
                location, secret, ..
            } => spend(
                location,
                redeem_script_sig(&[0x30; 71], &[0x02; 33], &secret),
            )?,
            LockAction::Refund { params, location } => {
                if self.clock.now() < params.refund_time {
                    anyhow::bail!("lock is not refundable yet");
                }
                self.refunds.fetch_add(1, Ordering::SeqCst);

                spend(location, refund_script_sig(&[0x30; 71], &[0x02; 33]))?
            }
        };

        Ok(self.mine(transaction))
    }
}

#[async_trait::async_trait]
impl LedgerTime for UtxoLedger {
    async fn ledger_time(&self) -> anyhow::Result<Timestamp> {
        Ok(self.clock.now())
    }
}

/// Signs by serializing the request, which the fake ledgers decode again.
#[derive(Clone, Copy, Debug)]
pub struct JsonSigner;

#[async_trait::async_trait]
impl WalletSigner for JsonSigner {
    async fn sign(&self, transaction: UnsignedTx, _: &KeyPath) -> anyhow::Result<SignedTx> {
        Ok(SignedTx {
            family: transaction.family,
            bytes: serde_json::to_vec(&transaction)?,
        })
    }
}

type Queues = Mutex<HashMap<(SwapId, MessageKind), VecDeque<Message>>>;

/// One end of an in-process counterparty channel.
#[derive(Debug)]
pub struct ChannelEnd {
    inbox: Arc<Queues>,
    outbox: Arc<Queues>,
}

pub fn channel_pair() -> (Arc<ChannelEnd>, Arc<ChannelEnd>) {
    let left = Arc::new(Queues::default());
    let right = Arc::new(Queues::default());

    (
        Arc::new(ChannelEnd {
            inbox: left.clone(),
            outbox: right.clone(),
        }),
        Arc::new(ChannelEnd {
            inbox: right,
            outbox: left,
        }),
    )
}

#[async_trait::async_trait]
impl CounterpartyChannel for ChannelEnd {
    async fn send(&self, swap_id: SwapId, message: Message) -> anyhow::Result<()> {
        self.outbox
            .lock()
            .unwrap()
            .entry((swap_id, message.kind()))
            .or_default()
            .push_back(message);

        Ok(())
    }

    async fn receive(&self, swap_id: SwapId, kind: MessageKind) -> anyhow::Result<Message> {
        loop {
            let next = self
                .inbox
                .lock()
                .unwrap()
                .get_mut(&(swap_id, kind))
                .and_then(VecDeque::pop_front);

            if let Some(message) = next {
                return Ok(message);
            }

            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

/// The chains of XTZ/ETH and BTC/ETH swaps, shared by the two parties.
#[derive(Debug)]
pub struct World {
    pub xtz: Arc<EntrypointLedger>,
    pub eth: Arc<EventLogLedger>,
    pub btc: Arc<UtxoLedger>,
}

pub struct Party {
    pub engine: SwapEngine,
    pub events: mpsc::UnboundedReceiver<SwapEvent>,
    pub repository: Arc<MemoryRepository>,
    pub channel: Arc<ChannelEnd>,
}

impl World {
    pub fn new() -> Self {
        World {
            xtz: Arc::new(EntrypointLedger::new()),
            eth: Arc::new(EventLogLedger::new()),
            btc: Arc::new(UtxoLedger::new()),
        }
    }

    pub fn entrypoint_observer(&self) -> ChainObserver {
        ChainObserver::Entrypoint(EntrypointObserver::new(
            self.xtz.clone(),
            ENTRYPOINT_CONTRACT,
            Arc::new(RateLimiter::unlimited()),
        ))
    }

    pub fn event_log_observer(&self) -> ChainObserver {
        ChainObserver::EventLog(EventLogObserver::new(
            self.eth.clone(),
            EVENT_LOG_CONTRACT,
            0,
            Arc::new(RateLimiter::unlimited()),
        ))
    }

    pub fn utxo_observer(&self) -> ChainObserver {
        ChainObserver::Utxo(UtxoObserver::new(
            self.btc.clone(),
            1,
            Arc::new(RateLimiter::unlimited()),
        ))
    }

    pub fn ledgers(&self) -> Ledgers {
        Ledgers::default()
            .with("XTZ", LedgerHandle {
                observer: Arc::new(self.entrypoint_observer()),
                broadcaster: self.xtz.clone(),
                clock: self.xtz.clone(),
            })
            .with("ETH", LedgerHandle {
                observer: Arc::new(self.event_log_observer()),
                broadcaster: self.eth.clone(),
                clock: self.eth.clone(),
            })
            .with("BTC", LedgerHandle {
                observer: Arc::new(self.utxo_observer()),
                broadcaster: self.btc.clone(),
                clock: self.btc.clone(),
            })
    }

    pub fn party(&self, channel: Arc<ChannelEnd>) -> Party {
        self.party_with(channel, settings())
    }

    pub fn party_with(&self, channel: Arc<ChannelEnd>, settings: EngineSettings) -> Party {
        let repository = Arc::new(MemoryRepository::default());
        let (engine, events) = SwapEngine::new(
            self.ledgers(),
            Arc::new(JsonSigner),
            channel.clone(),
            repository.clone(),
            settings,
        );

        Party {
            engine,
            events,
            repository,
            channel,
        }
    }

    /// Broadcasts a lock on behalf of a party that is not run by an engine.
    pub async fn lock_manually(&self, params: hashlock::observer::LockParams) -> TxId {
        let signed = JsonSigner
            .sign(UnsignedTx::lock(params.clone()), &KeyPath::new("m/0"))
            .await
            .unwrap();

        match params.currency.family {
            ChainFamily::Entrypoint => self.xtz.broadcast(signed).await.unwrap(),
            ChainFamily::EventLog => self.eth.broadcast(signed).await.unwrap(),
            ChainFamily::Utxo => self.btc.broadcast(signed).await.unwrap(),
        }
    }
}

pub fn settings() -> EngineSettings {
    EngineSettings {
        poll_interval: Duration::from_millis(10),
        max_attempts: None,
        guard_interval: Duration::from_millis(10),
        party_payment_timeout: Duration::from_secs(60),
        message_timeout: Duration::from_secs(10),
        redeem_margin: Duration::from_secs(60 * 60),
    }
}

/// The initiator sells 10 XTZ for 10 ETH.
pub fn terms() -> SwapTerms {
    SwapTerms {
        swap_id: SwapId::default(),
        symbol: Symbol {
            base: Currency::new("XTZ", ChainFamily::Entrypoint, 6),
            quote: Currency::new("ETH", ChainFamily::EventLog, 18),
        },
        position: Position::Sell,
        price: Decimal::from(1),
        qty: Decimal::from(10),
        initiator: PartyTerms {
            receiving_address: INITIATOR_ETH.to_owned(),
            refund_address: INITIATOR_XTZ.to_owned(),
        },
        acceptor: PartyTerms {
            receiving_address: ACCEPTOR_XTZ.to_owned(),
            refund_address: ACCEPTOR_ETH.to_owned(),
        },
        rewards: Rewards::default(),
        lock_times: LockTimes::new(RelativeTime::from_hours(48), RelativeTime::from_hours(24))
            .unwrap(),
        created_at: Timestamp::now(),
    }
}

/// The initiator sells 1 BTC for 10 ETH.
pub fn utxo_terms() -> SwapTerms {
    SwapTerms {
        symbol: Symbol {
            base: Currency::new("BTC", ChainFamily::Utxo, 8),
            quote: Currency::new("ETH", ChainFamily::EventLog, 18),
        },
        price: Decimal::from(10),
        qty: Decimal::from(1),
        initiator: PartyTerms {
            receiving_address: INITIATOR_ETH.to_owned(),
            refund_address: INITIATOR_BTC.to_owned(),
        },
        acceptor: PartyTerms {
            receiving_address: ACCEPTOR_BTC.to_owned(),
            refund_address: ACCEPTOR_ETH.to_owned(),
        },
        ..terms()
    }
}

pub fn record(role: Role, terms: SwapTerms) -> SwapRecord {
    let key_paths = match role {
        Role::Initiator => KeyPaths {
            payment: KeyPath::new("m/44'/1729'/0'/0'"),
            redeem: KeyPath::new("m/44'/60'/0'/0/0"),
        },
        Role::Acceptor => KeyPaths {
            payment: KeyPath::new("m/44'/60'/0'/0/1"),
            redeem: KeyPath::new("m/44'/1729'/1'/0'"),
        },
    };

    SwapRecord::new(role, terms, key_paths)
}

/// Drains every event published so far.
pub fn drain(events: &mut mpsc::UnboundedReceiver<SwapEvent>) -> Vec<SwapEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }

    drained
}
