//! Per-stream bookkeeping shared by every provider translator.
//!
//! Providers number their content differently: Anthropic by block position,
//! Chat Completions by tool-call index, the Responses API by item id plus part
//! index, Gemini not at all. [`TranslatorState`] owns one arena of block slots
//! whose position is the canonical index, and a table from the provider-local
//! [`BlockKey`] to that position, so the emitted indices are always zero-based,
//! gap-free and in allocation order.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::error::LlmError;
use crate::protocol::canonical::{
    BlockKind, ContentBlock, Delta, Event, Response, Role, StopReason, Usage,
};
use crate::protocol::mapping::resolve_stop_reason;

/// Provider-local identity of a content block.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BlockKey {
    /// Provider-assigned position (Anthropic block index, Chat tool-call index).
    Native(u64),
    /// A whole output item, such as a Responses function call.
    Item(String),
    /// A content part of an output item, such as a Responses text part.
    ItemPart(String, u32),
    /// A reasoning summary part of an output item.
    ItemSummary(String, u32),
    /// A single-run slot for providers without block identity (Chat text, Gemini thoughts).
    Slot(&'static str),
    /// Engine-allocated key for blocks that open and close within one record.
    Synthetic(u64),
}

impl BlockKey {
    #[must_use]
    pub fn item_id(&self) -> Option<&str> {
        match self {
            BlockKey::Item(id) | BlockKey::ItemPart(id, _) | BlockKey::ItemSummary(id, _) => Some(id),
            _ => None,
        }
    }
}

/// How superseded blocks are closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseMode {
    /// The provider sends explicit block-stop markers.
    Explicit,
    /// Opening a block first stops every block still open.
    Implicit,
}

#[derive(Debug)]
struct BlockSlot {
    key: BlockKey,
    kind: BlockKind,
    open: bool,
    received_delta: bool,
}

/// The mutable state of one stream translation.
#[derive(Debug)]
pub struct TranslatorState {
    close_mode: CloseMode,
    started: bool,
    terminal: bool,
    blocks: Vec<BlockSlot>,
    index_of: FxHashMap<BlockKey, usize>,
    ignored: FxHashSet<BlockKey>,
    reported_stop: Option<StopReason>,
    usage: Usage,
    saw_tool_call: bool,
    next_synthetic: u64,
}

impl TranslatorState {
    #[must_use]
    pub fn new(close_mode: CloseMode) -> Self {
        Self {
            close_mode,
            started: false,
            terminal: false,
            blocks: Vec::new(),
            index_of: FxHashMap::default(),
            ignored: FxHashSet::default(),
            reported_stop: None,
            usage: Usage::default(),
            saw_tool_call: false,
            next_synthetic: 0,
        }
    }

    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.terminal
    }

    #[must_use]
    pub fn usage(&self) -> &Usage {
        &self.usage
    }

    /// Emit `MessageStart` the first time only.
    pub fn start(&mut self, id: &str, model: &str, usage: Usage, out: &mut Vec<Event>) {
        if self.started || self.terminal {
            return;
        }
        self.started = true;
        self.usage.merge(&usage);
        out.push(Event::MessageStart {
            message: Response {
                id: id.to_string(),
                model: model.to_string(),
                role: Role::Assistant,
                content: Vec::new(),
                usage: self.usage,
                stop_reason: None,
            },
        });
    }

    /// Allocate the next canonical index for `key` and emit `ContentBlockStart`.
    ///
    /// # Errors
    ///
    /// Returns [`LlmError::Decode`] when the message has not started or `key` is still open.
    pub fn open(
        &mut self,
        key: BlockKey,
        block: ContentBlock,
        out: &mut Vec<Event>,
    ) -> Result<usize, LlmError> {
        if !self.started {
            return Err(LlmError::Decode(format!(
                "content block {key:?} opened before message start"
            )));
        }
        if self.lookup_open(&key).is_some() {
            return Err(LlmError::Decode(format!(
                "duplicate start for open content block {key:?}"
            )));
        }
        if self.close_mode == CloseMode::Implicit {
            self.close_all(out);
        }

        let index = self.blocks.len();
        let kind = block.kind();
        self.saw_tool_call |= kind.is_tool_call();
        self.blocks.push(BlockSlot {
            key: key.clone(),
            kind,
            open: true,
            received_delta: false,
        });
        self.ignored.remove(&key);
        self.index_of.insert(key, index);
        out.push(Event::ContentBlockStart {
            index,
            content_block: block,
        });
        Ok(index)
    }

    /// Return the open block for `key`, opening a fresh one built by `make` otherwise.
    ///
    /// # Errors
    ///
    /// Propagates [`TranslatorState::open`] failures.
    pub fn ensure_open(
        &mut self,
        key: BlockKey,
        make: impl FnOnce() -> ContentBlock,
        out: &mut Vec<Event>,
    ) -> Result<usize, LlmError> {
        if let Some(index) = self.lookup_open(&key) {
            return Ok(index);
        }
        self.open(key, make(), out)
    }

    /// Open and immediately close a block that arrived whole.
    ///
    /// # Errors
    ///
    /// Propagates [`TranslatorState::open`] failures.
    pub fn emit_whole(
        &mut self,
        block: ContentBlock,
        out: &mut Vec<Event>,
    ) -> Result<usize, LlmError> {
        let key = self.synthetic_key();
        let index = self.open(key.clone(), block, out)?;
        self.close(&key, out);
        Ok(index)
    }

    /// Fresh key that no provider record can collide with.
    pub fn synthetic_key(&mut self) -> BlockKey {
        let key = BlockKey::Synthetic(self.next_synthetic);
        self.next_synthetic += 1;
        key
    }

    /// Route a fragment to the open block for `key`.
    ///
    /// # Errors
    ///
    /// Returns [`LlmError::Decode`] when `key` has no open block and was not ignored.
    pub fn delta(
        &mut self,
        key: &BlockKey,
        delta: Delta,
        out: &mut Vec<Event>,
    ) -> Result<(), LlmError> {
        if self.ignored.contains(key) {
            return Ok(());
        }
        let Some(index) = self.lookup_open(key) else {
            return Err(LlmError::Decode(format!(
                "delta references content block {key:?} with no open block"
            )));
        };
        self.blocks[index].received_delta = true;
        out.push(Event::ContentBlockDelta { index, delta });
        Ok(())
    }

    /// Emit `ContentBlockStop` for `key`. A second close, or a close for an unknown key, is ignored.
    pub fn close(&mut self, key: &BlockKey, out: &mut Vec<Event>) {
        if let Some(index) = self.lookup_open(key) {
            self.blocks[index].open = false;
            out.push(Event::ContentBlockStop { index });
        }
    }

    /// Close every open block whose key matches, oldest index first.
    pub fn close_where(&mut self, mut pred: impl FnMut(&BlockKey) -> bool, out: &mut Vec<Event>) {
        for (index, slot) in self.blocks.iter_mut().enumerate() {
            if slot.open && pred(&slot.key) {
                slot.open = false;
                out.push(Event::ContentBlockStop { index });
            }
        }
    }

    pub fn close_all(&mut self, out: &mut Vec<Event>) {
        self.close_where(|_| true, out);
    }

    /// Drop every future fragment and close marker for a block kind this crate does not model.
    pub fn ignore(&mut self, key: BlockKey) {
        tracing::debug!(?key, "ignoring content block of unsupported kind");
        self.ignored.insert(key);
    }

    #[must_use]
    pub fn lookup_open(&self, key: &BlockKey) -> Option<usize> {
        let index = *self.index_of.get(key)?;
        self.blocks[index].open.then_some(index)
    }

    #[must_use]
    pub fn kind_of(&self, key: &BlockKey) -> Option<BlockKind> {
        self.lookup_open(key).map(|index| self.blocks[index].kind)
    }

    /// Whether `key` ever had a block, open or closed.
    #[must_use]
    pub fn is_registered(&self, key: &BlockKey) -> bool {
        self.index_of.contains_key(key)
    }

    /// Whether any fragment reached the block registered under `key`.
    #[must_use]
    pub fn received_delta(&self, key: &BlockKey) -> bool {
        self.index_of
            .get(key)
            .is_some_and(|&index| self.blocks[index].received_delta)
    }

    #[must_use]
    pub fn has_open_blocks(&self) -> bool {
        self.blocks.iter().any(|slot| slot.open)
    }

    pub fn record_stop(&mut self, reason: Option<StopReason>) {
        if let Some(reason) = reason {
            // keep an overriding reason once seen
            if !self.reported_stop.is_some_and(StopReason::is_overriding) {
                self.reported_stop = Some(reason);
            }
        }
    }

    pub fn record_usage(&mut self, usage: &Usage) {
        self.usage.merge(usage);
    }

    /// Close what is still open, then emit `MessageDelta` and `MessageStop` once.
    pub fn complete(&mut self, out: &mut Vec<Event>) {
        if self.terminal {
            return;
        }
        self.close_all(out);
        let stop_reason = resolve_stop_reason(self.reported_stop, self.saw_tool_call);
        out.push(Event::MessageDelta {
            stop_reason: Some(stop_reason),
            usage: Some(self.usage),
        });
        out.push(Event::MessageStop);
        self.terminal = true;
    }

    /// Mark the stream failed and build the error to return.
    pub fn fail(&mut self, message: impl Into<String>) -> LlmError {
        self.terminal = true;
        LlmError::Stream(message.into())
    }
}
