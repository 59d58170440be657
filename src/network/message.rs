use crate::core::Block;
use crate::error::{LedgerError, Result};
use crate::utils::{deserialize, serialize, Hash};
use serde::{Deserialize, Serialize};

/// First message on every connection, sent by both sides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct Handshake {
    pub node_id: String,
    pub chain_height: u64,
    pub tip_hash: Hash,
    pub protocol_version: u32,
    /// Port the sender accepts connections on
    pub listen_port: u16,
}

/// Peer protocol messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Handshake(Handshake),
    PeerListRequest,
    PeerListResponse { addresses: Vec<String> },
    ChainHeightQuery,
    ChainHeightResponse { height: u64, tip_hash: Hash },
    BlockAnnounce { block: Block },
    ChainRequest { from_index: u64 },
    ChainResponse { blocks: Vec<Block> },
}

const TAG_HANDSHAKE: u8 = 0x01;
const TAG_PEER_LIST_REQUEST: u8 = 0x02;
const TAG_PEER_LIST_RESPONSE: u8 = 0x03;
const TAG_CHAIN_HEIGHT_QUERY: u8 = 0x04;
const TAG_CHAIN_HEIGHT_RESPONSE: u8 = 0x05;
const TAG_BLOCK_ANNOUNCE: u8 = 0x06;
const TAG_CHAIN_REQUEST: u8 = 0x07;
const TAG_CHAIN_RESPONSE: u8 = 0x08;

impl Message {
    pub fn tag(&self) -> u8 {
        match self {
            Message::Handshake(_) => TAG_HANDSHAKE,
            Message::PeerListRequest => TAG_PEER_LIST_REQUEST,
            Message::PeerListResponse { .. } => TAG_PEER_LIST_RESPONSE,
            Message::ChainHeightQuery => TAG_CHAIN_HEIGHT_QUERY,
            Message::ChainHeightResponse { .. } => TAG_CHAIN_HEIGHT_RESPONSE,
            Message::BlockAnnounce { .. } => TAG_BLOCK_ANNOUNCE,
            Message::ChainRequest { .. } => TAG_CHAIN_REQUEST,
            Message::ChainResponse { .. } => TAG_CHAIN_RESPONSE,
        }
    }

    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Handshake(_) => "handshake",
            Message::PeerListRequest => "peer-list-request",
            Message::PeerListResponse { .. } => "peer-list-response",
            Message::ChainHeightQuery => "height-query",
            Message::ChainHeightResponse { .. } => "height-response",
            Message::BlockAnnounce { .. } => "block-announce",
            Message::ChainRequest { .. } => "chain-request",
            Message::ChainResponse { .. } => "chain-response",
        }
    }

    /// Tag byte followed by the bincode body.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let body = match self {
            Message::Handshake(handshake) => serialize(handshake)?,
            Message::PeerListRequest | Message::ChainHeightQuery => Vec::new(),
            Message::PeerListResponse { addresses } => serialize(addresses)?,
            Message::ChainHeightResponse { height, tip_hash } => serialize(&(*height, *tip_hash))?,
            Message::BlockAnnounce { block } => serialize(block)?,
            Message::ChainRequest { from_index } => serialize(from_index)?,
            Message::ChainResponse { blocks } => serialize(blocks)?,
        };

        let mut payload = Vec::with_capacity(1 + body.len());
        payload.push(self.tag());
        payload.extend(body);
        Ok(payload)
    }

    pub fn decode(payload: &[u8]) -> Result<Message> {
        let (tag, body) = payload
            .split_first()
            .ok_or_else(|| LedgerError::Protocol("Empty payload".to_string()))?;

        let message = match *tag {
            TAG_HANDSHAKE => Message::Handshake(body_of(body)?),
            TAG_PEER_LIST_REQUEST => empty_body(body, Message::PeerListRequest)?,
            TAG_PEER_LIST_RESPONSE => Message::PeerListResponse {
                addresses: body_of(body)?,
            },
            TAG_CHAIN_HEIGHT_QUERY => empty_body(body, Message::ChainHeightQuery)?,
            TAG_CHAIN_HEIGHT_RESPONSE => {
                let (height, tip_hash) = body_of::<(u64, Hash)>(body)?;
                Message::ChainHeightResponse { height, tip_hash }
            }
            TAG_BLOCK_ANNOUNCE => Message::BlockAnnounce {
                block: body_of(body)?,
            },
            TAG_CHAIN_REQUEST => Message::ChainRequest {
                from_index: body_of(body)?,
            },
            TAG_CHAIN_RESPONSE => Message::ChainResponse {
                blocks: body_of(body)?,
            },
            unknown => {
                return Err(LedgerError::Protocol(format!(
                    "Unknown message tag 0x{unknown:02x}"
                )))
            }
        };
        Ok(message)
    }
}

fn body_of<T>(body: &[u8]) -> Result<T>
where
    T: for<'de> Deserialize<'de> + bincode::Decode<()>,
{
    deserialize(body).map_err(|e| LedgerError::Protocol(format!("Undecodable message body: {e}")))
}

fn empty_body(body: &[u8], message: Message) -> Result<Message> {
    if body.is_empty() {
        Ok(message)
    } else {
        Err(LedgerError::Protocol(format!(
            "Unexpected {} byte body on {}",
            body.len(),
            message.kind()
        )))
    }
}
