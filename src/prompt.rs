//! Prompt detection for commands that ask for input mid-execution.
//!
//! Prompts such as `Password: ` are not newline terminated, so output is
//! scanned one byte at a time and the partial line is tested against every
//! pattern after each byte.

use crate::drain::MAX_LINE_BYTES;
use crate::error::{Error, Result};
use crate::sink::OutputSink;
use regex::Regex;
use std::collections::HashMap;
use std::io;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

/// Ordered `(pattern, answer)` pairs. The first matching pattern wins.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PromptMap {
    entries: Vec<(String, String)>,
}

impl PromptMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, pattern: &str, answer: &str) -> Self {
        self.insert(pattern, answer);
        self
    }

    /// Add a pair, replacing the answer of an existing identical pattern.
    pub fn insert(&mut self, pattern: &str, answer: &str) {
        match self.entries.iter_mut().find(|(p, _)| p == pattern) {
            Some(entry) => entry.1 = answer.to_string(),
            None => self
                .entries
                .push((pattern.to_string(), answer.to_string())),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(p, a)| (p.as_str(), a.as_str()))
    }

    /// Compile every pattern once, up front.
    pub fn compile(&self) -> Result<Vec<Prompt>> {
        self.entries
            .iter()
            .map(|(pattern, answer)| {
                let regex = Regex::new(pattern).map_err(|source| Error::Prompt {
                    pattern: pattern.clone(),
                    source,
                })?;
                Ok(Prompt {
                    pattern: regex,
                    answer: answer.clone(),
                })
            })
            .collect()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for PromptMap {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut map = PromptMap::new();
        for (pattern, answer) in iter {
            map.insert(&pattern.into(), &answer.into());
        }
        map
    }
}

/// Hash maps carry no order; patterns are sorted so matching is deterministic.
impl From<HashMap<String, String>> for PromptMap {
    fn from(map: HashMap<String, String>) -> Self {
        let mut entries: Vec<_> = map.into_iter().collect();
        entries.sort();
        entries.into_iter().collect()
    }
}

#[derive(Clone, Debug)]
pub struct Prompt {
    pub pattern: Regex,
    pub answer: String,
}

/// Prompts are matched against at most this many trailing bytes of the
/// current partial line.
pub const PROMPT_WINDOW: usize = 512;

/// Scan `output` byte by byte until it closes.
///
/// Complete lines go to the sink's `info` channel with `\r` stripped. When
/// the unanswered tail of the current partial line matches a prompt, its
/// answer plus `\n` is written and flushed to `input` before the next byte
/// is read. Bytes that led to an answer are never matched again, so several
/// prompts on one line are each answered once. Lines longer than
/// [`MAX_LINE_BYTES`] are emitted in pieces.
pub async fn answer_prompts<R, W>(
    output: R,
    mut input: W,
    prompts: &[Prompt],
    sink: &dyn OutputSink,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut output = BufReader::new(output);
    let mut line: Vec<u8> = Vec::new();
    // Start of the bytes not yet consumed by an answered prompt.
    let mut resume_at = 0;

    loop {
        let byte = match output.fill_buf().await?.first() {
            Some(b) => *b,
            None => break,
        };
        output.consume(1);

        if byte == b'\n' {
            emit_line(&mut line, sink);
            resume_at = 0;
            continue;
        }
        line.push(byte);
        if line.len() >= MAX_LINE_BYTES {
            emit_line(&mut line, sink);
            resume_at = 0;
            continue;
        }
        if prompts.is_empty() {
            continue;
        }

        let from = resume_at.max(line.len().saturating_sub(PROMPT_WINDOW));
        let tail = String::from_utf8_lossy(&line[from..]);
        if let Some(prompt) = prompts.iter().find(|p| p.pattern.is_match(&tail)) {
            input.write_all(prompt.answer.as_bytes()).await?;
            input.write_all(b"\n").await?;
            input.flush().await?;
            resume_at = line.len();
        }
    }

    if !line.is_empty() {
        emit_line(&mut line, sink);
    }
    Ok(())
}

fn emit_line(line: &mut Vec<u8>, sink: &dyn OutputSink) {
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    sink.info(&String::from_utf8_lossy(line));
    line.clear();
}
