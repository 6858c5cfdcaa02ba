//! Topics, opcodes, field tags and stream framing.

use serde::{Deserialize, Serialize};

/// Two-byte protocol discriminator, statically mapped to a port.
///
/// The same two-byte shape keys the entries inside a wire message payload,
/// see [`fields`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Topic(pub [u8; 2]);

impl Topic {
    pub const TRANSACTION: Topic = Topic(*b"TT");
    pub const NONCE: Topic = Topic(*b"NN");
    pub const SELF_NONCE: Topic = Topic(*b"SS");
    pub const SYNC: Topic = Topic(*b"BB");
    pub const RPC: Topic = Topic(*b"RP");

    /// Every topic with a port.
    pub const ALL: [Topic; 5] = [
        Topic::TRANSACTION,
        Topic::NONCE,
        Topic::SELF_NONCE,
        Topic::SYNC,
        Topic::RPC,
    ];

    /// Topics a node dials its peers on.
    pub const PEER_SERVICES: [Topic; 3] = [Topic::NONCE, Topic::SYNC, Topic::TRANSACTION];

    pub fn default_port(self) -> Option<u16> {
        match self {
            Topic::TRANSACTION => Some(9091),
            Topic::NONCE => Some(8091),
            Topic::SELF_NONCE => Some(7091),
            Topic::SYNC => Some(6091),
            Topic::RPC => Some(9009),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> &[u8; 2] {
        &self.0
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0.iter().all(|b| b.is_ascii_graphic()) {
            write!(f, "{}{}", self.0[0] as char, self.0[1] as char)
        } else {
            write!(f, "{}", hex::encode(self.0))
        }
    }
}

/// Message opcode, decoded from the head token before any business logic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// `nn`: nonce transaction opening a proposal round.
    Nonce,
    /// `bl`: a proposed block.
    Block,
    /// `hi`: height announcement.
    HeightAnnounce,
    /// `gh`: request for a range of blocks.
    GetHeaders,
    /// `sh`: a range of blocks.
    SendHeaders,
    /// `tx`: transaction gossip.
    TxGossip,
    /// `st`: fetch transactions from the pools.
    GetTxFromPool,
    /// `bt`: fetch transactions from the ledger store.
    GetTxFromLedger,
}

impl Opcode {
    pub const ALL: [Opcode; 8] = [
        Opcode::Nonce,
        Opcode::Block,
        Opcode::HeightAnnounce,
        Opcode::GetHeaders,
        Opcode::SendHeaders,
        Opcode::TxGossip,
        Opcode::GetTxFromPool,
        Opcode::GetTxFromLedger,
    ];

    pub fn token(self) -> [u8; 2] {
        match self {
            Opcode::Nonce => *b"nn",
            Opcode::Block => *b"bl",
            Opcode::HeightAnnounce => *b"hi",
            Opcode::GetHeaders => *b"gh",
            Opcode::SendHeaders => *b"sh",
            Opcode::TxGossip => *b"tx",
            Opcode::GetTxFromPool => *b"st",
            Opcode::GetTxFromLedger => *b"bt",
        }
    }

    pub fn from_token(token: [u8; 2]) -> Option<Opcode> {
        Opcode::ALL.into_iter().find(|op| op.token() == token)
    }

    /// Whether the payload blobs are serialized transactions.
    pub fn carries_transactions(self) -> bool {
        matches!(self, Opcode::Nonce | Opcode::TxGossip)
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let t = self.token();
        write!(f, "{}{}", t[0] as char, t[1] as char)
    }
}

/// Payload entry keys used by the protocols.
pub mod fields {
    use super::Topic;

    /// Standard pool transactions (also the key of hash requests).
    pub const POOL_STANDARD: Topic = Topic(*b"T0");
    pub const POOL_ESCROW: Topic = Topic(*b"E0");
    pub const POOL_MULTISIG: Topic = Topic(*b"M0");
    /// The nonce transaction of a round.
    pub const NONCE_TX: Topic = Topic(*b"N0");
    /// A proposed block.
    pub const BLOCK: Topic = Topic(*b"N\0");
    /// Announced height, 8 bytes LE.
    pub const LAST_HEIGHT: Topic = Topic(*b"LH");
    /// Announced last block hash.
    pub const LAST_BLOCK: Topic = Topic(*b"LB");
    /// Announced peer addresses, 4 bytes each.
    pub const PEERS: Topic = Topic(*b"PP");
    /// First height of a header request.
    pub const BEGIN_HEIGHT: Topic = Topic(*b"BH");
    /// Last height of a header request.
    pub const END_HEIGHT: Topic = Topic(*b"EH");
    /// Heights of the blocks in a header batch.
    pub const INDICES: Topic = Topic(*b"IH");
    /// Serialized blocks of a header batch.
    pub const HEADERS: Topic = Topic(*b"HV");
}

// ── Stream framing ──

/// Marker opening every data frame.
pub const MESSAGE_MAGIC: [u8; 4] = *b"OKR\x17";
/// Marker closing every data frame.
pub const FRAME_TERMINATOR: &[u8; 7] = b"<-END->";

/// Out-of-band tokens written on the stream between frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlToken {
    /// Peer closes the connection.
    Close,
    /// Peer is shutting down this topic.
    QuitFor,
    /// Peer asks the sender to back off briefly.
    Wait,
    /// Stop the receive loop.
    Exit,
}

impl ControlToken {
    pub const ALL: [ControlToken; 4] = [
        ControlToken::Close,
        ControlToken::QuitFor,
        ControlToken::Wait,
        ControlToken::Exit,
    ];

    pub fn as_bytes(self) -> &'static [u8] {
        match self {
            ControlToken::Close => b"<-CLS->",
            ControlToken::QuitFor => b"QUITFOR",
            ControlToken::Wait => b"WAIT",
            ControlToken::Exit => b"EXIT",
        }
    }
}

/// Wrap a payload into a data frame.
pub fn frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(MESSAGE_MAGIC.len() + payload.len() + FRAME_TERMINATOR.len());
    out.extend_from_slice(&MESSAGE_MAGIC);
    out.extend_from_slice(payload);
    out.extend_from_slice(FRAME_TERMINATOR);
    out
}

/// Something the assembler recognised in the byte stream.
#[derive(Debug, PartialEq, Eq)]
pub enum StreamEvent {
    Frame(Vec<u8>),
    Control(ControlToken),
    /// A frame grew past the size limit and was discarded.
    Oversized,
    /// Bytes that are neither a frame nor a control token.
    BadMagic,
}

/// Reassembles frames from arbitrarily split reads.
///
/// After a fault the assembler discards input up to the next terminator, so
/// the tail of a rejected frame is not reported again.
pub struct FrameAssembler {
    buf: Vec<u8>,
    max_payload: usize,
    discarding: bool,
    /// Frame body bytes already searched for the terminator.
    scanned: usize,
}

impl FrameAssembler {
    pub fn new(max_payload: usize) -> Self {
        FrameAssembler {
            buf: Vec::new(),
            max_payload,
            discarding: false,
            scanned: 0,
        }
    }

    /// Bytes buffered but not yet resolved.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        self.buf.extend_from_slice(chunk);
        let mut events = Vec::new();
        loop {
            if self.buf.is_empty() {
                break;
            }
            if self.discarding {
                match find(&self.buf, FRAME_TERMINATOR) {
                    Some(pos) => {
                        self.buf.drain(..pos + FRAME_TERMINATOR.len());
                        self.discarding = false;
                        self.scanned = 0;
                        continue;
                    }
                    None => {
                        // keep a possible partial terminator
                        let keep = FRAME_TERMINATOR.len() - 1;
                        if self.buf.len() > keep {
                            let cut = self.buf.len() - keep;
                            self.buf.drain(..cut);
                        }
                        break;
                    }
                }
            }
            if self.buf.starts_with(&MESSAGE_MAGIC) {
                let body = &self.buf[MESSAGE_MAGIC.len()..];
                // resume where the last push stopped, minus a straddling terminator
                let from = self.scanned.saturating_sub(FRAME_TERMINATOR.len() - 1);
                match find(&body[from..], FRAME_TERMINATOR).map(|pos| from + pos) {
                    Some(pos) => {
                        let payload = body[..pos].to_vec();
                        self.buf.drain(..MESSAGE_MAGIC.len() + pos + FRAME_TERMINATOR.len());
                        self.scanned = 0;
                        if payload.len() > self.max_payload {
                            events.push(StreamEvent::Oversized);
                        } else {
                            events.push(StreamEvent::Frame(payload));
                        }
                        continue;
                    }
                    None => {
                        self.scanned = body.len();
                        if body.len() > self.max_payload + FRAME_TERMINATOR.len() {
                            events.push(StreamEvent::Oversized);
                            self.buf.clear();
                            self.discarding = true;
                            self.scanned = 0;
                        }
                        break;
                    }
                }
            }
            if let Some(token) = ControlToken::ALL
                .into_iter()
                .find(|t| self.buf.starts_with(t.as_bytes()))
            {
                self.buf.drain(..token.as_bytes().len());
                events.push(StreamEvent::Control(token));
                continue;
            }
            if self.is_partial_prefix() {
                break;
            }
            events.push(StreamEvent::BadMagic);
            self.discarding = true;
        }
        events
    }

    /// The buffer could still grow into the magic or a control token.
    fn is_partial_prefix(&self) -> bool {
        let b = &self.buf[..];
        let prefix_of = |full: &[u8]| b.len() < full.len() && full.starts_with(b);
        prefix_of(&MESSAGE_MAGIC) || ControlToken::ALL.iter().any(|t| prefix_of(t.as_bytes()))
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_ports_match_fixed_map() {
        assert_eq!(Topic::TRANSACTION.default_port(), Some(9091));
        assert_eq!(Topic::NONCE.default_port(), Some(8091));
        assert_eq!(Topic::SELF_NONCE.default_port(), Some(7091));
        assert_eq!(Topic::SYNC.default_port(), Some(6091));
        assert_eq!(Topic::RPC.default_port(), Some(9009));
        assert_eq!(Topic(*b"ZZ").default_port(), None);
    }

    #[test]
    fn opcode_tokens_resolve() {
        for op in Opcode::ALL {
            assert_eq!(Opcode::from_token(op.token()), Some(op));
        }
        assert_eq!(Opcode::from_token(*b"zz"), None);
        assert_eq!(Opcode::GetTxFromLedger.to_string(), "bt");
    }

    #[test]
    fn frame_split_across_chunks() {
        let framed = frame(b"hello world");
        let mut asm = FrameAssembler::new(1024);
        let mut events = Vec::new();
        for chunk in framed.chunks(3) {
            events.extend(asm.push(chunk));
        }
        assert_eq!(events, vec![StreamEvent::Frame(b"hello world".to_vec())]);
        assert_eq!(asm.pending(), 0);
    }

    #[test]
    fn byte_at_a_time_frames_follow_each_other() {
        let first = vec![0x42u8; 4096];
        let mut bytes = frame(&first);
        bytes.extend_from_slice(&frame(b"second"));
        let mut asm = FrameAssembler::new(8192);
        let mut events = Vec::new();
        for byte in &bytes {
            events.extend(asm.push(std::slice::from_ref(byte)));
        }
        assert_eq!(
            events,
            vec![StreamEvent::Frame(first), StreamEvent::Frame(b"second".to_vec())]
        );
        assert_eq!(asm.pending(), 0);
    }

    #[test]
    fn terminator_straddling_reads_is_found() {
        let mut asm = FrameAssembler::new(1024);
        let mut head = MESSAGE_MAGIC.to_vec();
        head.extend_from_slice(b"payload");
        head.extend_from_slice(&FRAME_TERMINATOR[..3]);
        assert!(asm.push(&head).is_empty());
        assert_eq!(
            asm.push(&FRAME_TERMINATOR[3..]),
            vec![StreamEvent::Frame(b"payload".to_vec())]
        );
    }

    #[test]
    fn several_frames_and_tokens_in_one_read() {
        let mut bytes = frame(b"a");
        bytes.extend_from_slice(ControlToken::Wait.as_bytes());
        bytes.extend_from_slice(&frame(b"b"));
        bytes.extend_from_slice(ControlToken::Close.as_bytes());
        let mut asm = FrameAssembler::new(1024);
        assert_eq!(
            asm.push(&bytes),
            vec![
                StreamEvent::Frame(b"a".to_vec()),
                StreamEvent::Control(ControlToken::Wait),
                StreamEvent::Frame(b"b".to_vec()),
                StreamEvent::Control(ControlToken::Close),
            ]
        );
    }

    #[test]
    fn oversized_frame_discarded_once() {
        let mut asm = FrameAssembler::new(8);
        let big = frame(&[7u8; 64]);
        let mut events = Vec::new();
        for chunk in big.chunks(16) {
            events.extend(asm.push(chunk));
        }
        assert_eq!(events, vec![StreamEvent::Oversized]);
        // the stream resynchronises on the next frame
        assert_eq!(asm.push(&frame(b"ok")), vec![StreamEvent::Frame(b"ok".to_vec())]);
    }

    #[test]
    fn bad_magic_reported_and_skipped() {
        let mut asm = FrameAssembler::new(1024);
        let mut bytes = b"XXXXgarbage<-END->".to_vec();
        bytes.extend_from_slice(&frame(b"next"));
        assert_eq!(
            asm.push(&bytes),
            vec![StreamEvent::BadMagic, StreamEvent::Frame(b"next".to_vec())]
        );
    }

    #[test]
    fn partial_magic_waits_for_more() {
        let mut asm = FrameAssembler::new(1024);
        assert!(asm.push(b"OK").is_empty());
        assert!(asm.push(b"R").is_empty());
        assert_eq!(
            asm.push(b"\x17x<-END->"),
            vec![StreamEvent::Frame(b"x".to_vec())]
        );
    }
}
