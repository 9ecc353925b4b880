//! Shared fixtures for the integration tests: mock collaborators, a context
//! builder, and handshake helpers.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use ember_node::chain::{status, BlockId, Chain};
use ember_node::config::{ChainParams, Network, NodeConfig};
use ember_node::network::dispatcher;
use ember_node::network::peer::{Peer, PeerId};
use ember_node::network::protocol::{
    Block, BlockHeader, Hash256, Message, NetAddress, OutPoint, Transaction, TxIn, TxOut,
    VersionMessage, NODE_NETWORK, PROTOCOL_VERSION,
};
use ember_node::network::{
    AddressBook, BlockProcessor, BlockStore, Externals, HeaderRejection, HeaderValidator,
    MempoolView, NetContext, TxAdmissionQueue, TxSource,
};

/// Base wall-clock for the tests, seconds.
pub const TEST_NOW: u64 = 1_750_000_000;

pub fn now_micros() -> u64 {
    TEST_NOW * 1_000_000
}

/// Header validator that accepts anything connecting to the index, with an
/// optional poison list to exercise rejection paths.
pub struct TreeValidator {
    pub poisoned: Mutex<Vec<Hash256>>,
}

impl TreeValidator {
    pub fn new() -> Self {
        Self {
            poisoned: Mutex::new(Vec::new()),
        }
    }

    pub fn poison(&self, hash: Hash256) {
        self.poisoned.lock().push(hash);
    }
}

impl HeaderValidator for TreeValidator {
    fn accept_block_header(
        &self,
        chain: &mut Chain,
        header: &BlockHeader,
    ) -> Result<BlockId, HeaderRejection> {
        if self.poisoned.lock().contains(&header.hash()) {
            return Err(HeaderRejection {
                reason: "bad-header",
                dos_score: 100,
            });
        }
        let id = chain.index.connect_header(*header).map_err(|_| HeaderRejection {
            reason: "prev-blk-not-found",
            dos_score: 10,
        })?;
        chain.update_best_header(id);
        Ok(id)
    }
}

#[derive(Default)]
pub struct MockProcessor {
    pub processed: Mutex<Vec<(Hash256, PeerId)>>,
    pub expedited: Mutex<Vec<(Hash256, PeerId)>>,
}

impl BlockProcessor for MockProcessor {
    fn process_new_block(&self, block: Block, source: PeerId) {
        self.processed.lock().push((block.hash(), source));
    }

    fn forward_expedited(&self, block: &Block, from: PeerId) {
        self.expedited.lock().push((block.hash(), from));
    }
}

#[derive(Default)]
pub struct MockStore {
    pub blocks: Mutex<HashMap<Hash256, Block>>,
}

impl MockStore {
    pub fn put(&self, block: Block) {
        self.blocks.lock().insert(block.hash(), block);
    }
}

impl BlockStore for MockStore {
    fn read_block(&self, hash: &Hash256) -> Option<Block> {
        self.blocks.lock().get(hash).cloned()
    }
}

#[derive(Default)]
pub struct MockMempool {
    pub txs: Mutex<HashMap<Hash256, Transaction>>,
}

impl MockMempool {
    pub fn put(&self, tx: Transaction) {
        self.txs.lock().insert(tx.txid(), tx);
    }
}

impl MempoolView for MockMempool {
    fn get(&self, txid: &Hash256) -> Option<Transaction> {
        self.txs.lock().get(txid).cloned()
    }

    fn query_hashes(&self) -> Vec<Hash256> {
        let mut hashes: Vec<Hash256> = self.txs.lock().keys().copied().collect();
        hashes.sort();
        hashes
    }
}

#[derive(Default)]
pub struct MockAdmission {
    pub enqueued: Mutex<Vec<(Hash256, TxSource)>>,
}

impl TxAdmissionQueue for MockAdmission {
    fn enqueue(&self, tx: Transaction, source: TxSource) {
        self.enqueued.lock().push((tx.txid(), source));
    }
}

#[derive(Default)]
pub struct MockAddrBook {
    pub known: Mutex<Vec<NetAddress>>,
    pub good: Mutex<Vec<std::net::SocketAddr>>,
}

impl AddressBook for MockAddrBook {
    fn add(&self, addrs: &[NetAddress], _source: std::net::SocketAddr, _penalty_seconds: u64) {
        self.known.lock().extend_from_slice(addrs);
    }

    fn good(&self, addr: std::net::SocketAddr) {
        self.good.lock().push(addr);
    }

    fn addresses(&self) -> Vec<NetAddress> {
        self.known.lock().clone()
    }

    fn len(&self) -> usize {
        self.known.lock().len()
    }
}

pub struct Harness {
    pub ctx: Arc<NetContext>,
    pub validator: Arc<TreeValidator>,
    pub processor: Arc<MockProcessor>,
    pub store: Arc<MockStore>,
    pub mempool: Arc<MockMempool>,
    pub admission: Arc<MockAdmission>,
    pub addrbook: Arc<MockAddrBook>,
    pub cancel: CancellationToken,
}

impl Harness {
    pub fn handle(&self, peer: &Arc<Peer>, msg: Message) -> bool {
        dispatcher::handle_message(&self.ctx, peer, msg, now_micros(), &self.cancel)
    }

    /// Register an inbound peer and complete the version/verack handshake,
    /// discarding the handshake chatter from the send queue.
    pub fn connected_peer(&self) -> Arc<Peer> {
        self.connected_peer_with(NODE_NETWORK, PROTOCOL_VERSION)
    }

    pub fn connected_peer_with(&self, services: u64, version: i32) -> Arc<Peer> {
        let n = self.ctx.peer_count() as u8;
        let peer = self.ctx.initialize_peer(
            format!("8.8.4.{}:8343", n + 1).parse().unwrap(),
            true,
            false,
            false,
            false,
            TEST_NOW,
        );
        assert!(self.handle(&peer, Message::Version(version_msg(7, 900_000, services, version))));
        assert!(self.handle(&peer, Message::Verack));
        assert!(peer.is_connected());
        peer.drain_send_queue();
        peer
    }
}

/// Build a linear chain of `len` blocks (including genesis) whose tip time
/// is `tip_time`, spaced 600 seconds, with block data stored.
pub fn build_chain(len: usize, tip_time: u64, store: &MockStore) -> Chain {
    assert!(len >= 1);
    let start = tip_time - 600 * (len as u64 - 1);
    let mut prev = Hash256::ZERO;
    let mut chain = Chain::new();
    for i in 0..len {
        let block = make_block(prev, i as u32, (start + 600 * i as u64) as u32);
        prev = block.hash();
        let id = chain.index.connect_header(block.header).unwrap();
        chain
            .index
            .set_status(id, status::HAVE_DATA | status::VALID_SCRIPTS);
        chain.active.set_tip(&chain.index, id);
        chain.update_best_header(id);
        store.put(block);
    }
    chain
}

/// A block with one synthetic coinbase-ish transaction.
pub fn make_block(prev: Hash256, nonce: u32, time: u32) -> Block {
    let tx = make_tx(nonce);
    Block {
        header: BlockHeader {
            version: 4,
            prev_block: prev,
            merkle_root: tx.txid(),
            time,
            bits: 0x1d00ffff,
            nonce,
        },
        txs: vec![tx],
    }
}

pub fn make_tx(tag: u32) -> Transaction {
    Transaction {
        version: 1,
        inputs: vec![TxIn {
            prev_out: OutPoint {
                txid: Hash256::ZERO,
                index: u32::MAX,
            },
            script_sig: tag.to_le_bytes().to_vec(),
            sequence: 0xffff_ffff,
        }],
        outputs: vec![TxOut {
            value: 50_000_000,
            script_pubkey: vec![0x51],
        }],
        lock_time: 0,
    }
}

pub fn version_msg(nonce: u64, start_height: i32, services: u64, version: i32) -> VersionMessage {
    VersionMessage {
        version,
        services,
        timestamp: TEST_NOW as i64,
        addr_recv: NetAddress::from_socket_addr("44.33.22.11:8343".parse().unwrap(), services, 0),
        addr_from: NetAddress::from_socket_addr("55.44.33.22:8343".parse().unwrap(), services, 0),
        nonce,
        user_agent: "/Ember:0.4.0/".into(),
        start_height,
        relay: true,
    }
}

/// Context over a freshly built chain of `chain_len` blocks ending at
/// `tip_time`.
pub fn harness_with(chain_len: usize, tip_time: u64, config: NodeConfig) -> Harness {
    let validator = Arc::new(TreeValidator::new());
    let processor = Arc::new(MockProcessor::default());
    let store = Arc::new(MockStore::default());
    let mempool = Arc::new(MockMempool::default());
    let admission = Arc::new(MockAdmission::default());
    let addrbook = Arc::new(MockAddrBook::default());

    let chain = build_chain(chain_len, tip_time, &store);
    let ctx = NetContext::new(
        config,
        ChainParams::new(Network::Main),
        chain,
        Externals {
            validator: validator.clone(),
            processor: processor.clone(),
            store: store.clone(),
            mempool: mempool.clone(),
            admission: admission.clone(),
            addrbook: addrbook.clone(),
            thin: None,
        },
    );
    Harness {
        ctx,
        validator,
        processor,
        store,
        mempool,
        admission,
        addrbook,
        cancel: CancellationToken::new(),
    }
}

/// Default harness: synced 101-block chain with a recent tip.
pub fn harness() -> Harness {
    harness_with(101, TEST_NOW - 60, NodeConfig::default())
}

/// Pull every queued message of one kind out of a peer's send queue.
pub fn drain_of(peer: &Arc<Peer>, want: &str) -> Vec<Message> {
    peer.drain_send_queue()
        .into_iter()
        .filter(|m| m.command() == want)
        .collect()
}
