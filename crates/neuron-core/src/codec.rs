//! Text frame codec
//!
//! A frame is `[<id> "#"] <head> <tag> ["#" <cmd> {"#" <cmd>}] "**"`. The head
//! is one of `?` (request), `!` (notification) or `~` (reserved). Several
//! frames may be concatenated in one buffer; decoding yields one entry per
//! terminated frame, with `None` standing in for a frame that could not be
//! parsed so one bad frame never poisons the rest of the batch.

use core::fmt;

use tracing::debug;

use crate::errors::{CodecError, Result};

/// Frame terminator
pub const TERMINATOR: &str = "**";

/// Field separator
pub const SEPARATOR: char = '#';

// ----------------------------------------------------------------------------
// Envelope Types
// ----------------------------------------------------------------------------

/// Kind of frame, carried as its first non-id character
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Head {
    /// `?`, asks the peer to run something
    Request,
    /// `!`, informs the peer
    Notification,
    /// `~`, reserved for object frames
    Reserved,
}

impl Head {
    pub fn as_char(self) -> char {
        match self {
            Head::Request => '?',
            Head::Notification => '!',
            Head::Reserved => '~',
        }
    }

    pub fn from_char(c: char) -> Option<Self> {
        match c {
            '?' => Some(Head::Request),
            '!' => Some(Head::Notification),
            '~' => Some(Head::Reserved),
            _ => None,
        }
    }
}

impl fmt::Display for Head {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

/// One decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Correlation id, empty when the frame carries none
    pub id: String,
    pub head: Head,
    pub tag: String,
    pub cmds: Vec<String>,
}

impl Envelope {
    pub fn new(head: Head, tag: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            head,
            tag: tag.into(),
            cmds: Vec::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_cmds<I, S>(mut self, cmds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cmds = cmds.into_iter().map(Into::into).collect();
        self
    }

    /// Correlation id, `None` when empty
    pub fn id(&self) -> Option<&str> {
        (!self.id.is_empty()).then_some(self.id.as_str())
    }

    pub fn cmd(&self, index: usize) -> Option<&str> {
        self.cmds.get(index).map(String::as_str)
    }

    /// True for a frame with the given head and tag
    pub fn is(&self, head: Head, tag: &str) -> bool {
        self.head == head && self.tag == tag
    }

    /// Serialize into a terminated frame
    ///
    /// `#` is stripped from the id and tag.
    pub fn encode(&self) -> String {
        let id = self.id.replace(SEPARATOR, "");
        let tag = self.tag.replace(SEPARATOR, "");
        let mut frame = String::with_capacity(id.len() + tag.len() + 8);
        if !id.is_empty() {
            frame.push_str(&id);
            frame.push(SEPARATOR);
        }
        frame.push(self.head.as_char());
        frame.push_str(&tag);
        for cmd in &self.cmds {
            frame.push(SEPARATOR);
            frame.push_str(cmd);
        }
        frame.push_str(TERMINATOR);
        frame
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// Build a frame from its parts
pub fn generate_message<I, S>(head: Head, tag: &str, cmds: I, id: Option<&str>) -> String
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    Envelope::new(head, tag)
        .with_id(id.unwrap_or_default())
        .with_cmds(cmds)
        .encode()
}

// ----------------------------------------------------------------------------
// Decoding
// ----------------------------------------------------------------------------

/// Split a buffer into frames and parse each one
///
/// The fragment after the last terminator is incomplete and dropped.
pub fn analyze_message(input: &str) -> Vec<Option<Envelope>> {
    let mut fragments: Vec<&str> = input.split(TERMINATOR).collect();
    fragments.pop();
    fragments.into_iter().map(parse_frame).collect()
}

/// Byte-level entry point; the whole buffer must be UTF-8
pub fn analyze_bytes(input: &[u8]) -> Result<Vec<Option<Envelope>>> {
    let text = std::str::from_utf8(input).map_err(CodecError::from)?;
    Ok(analyze_message(text))
}

/// Parse one frame with its terminator already removed
fn parse_frame(fragment: &str) -> Option<Envelope> {
    let frame: String = fragment.chars().filter(|c| *c != '\r' && *c != '\n').collect();

    let Some(head_index) = frame.find(['?', '!', '~']) else {
        debug!("Dropping frame without head marker: {:?}", frame);
        return None;
    };

    let (id, rest) = match frame.find(SEPARATOR) {
        Some(split) if split < head_index => (&frame[..split], &frame[split + 1..]),
        _ => ("", frame.as_str()),
    };

    let mut chars = rest.chars();
    let head = match chars.next().and_then(Head::from_char) {
        Some(head) => head,
        None => {
            debug!("Dropping frame with misplaced head marker: {:?}", frame);
            return None;
        }
    };
    let body = chars.as_str();

    let (tag, cmds) = match body.split_once(SEPARATOR) {
        Some((tag, cmds)) => (tag, cmds.split(SEPARATOR).map(str::to_string).collect()),
        None => (body, Vec::new()),
    };

    Some(Envelope {
        id: id.to_string(),
        head,
        tag: tag.to_string(),
        cmds,
    })
}
