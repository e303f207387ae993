//! Best-effort NDJSON event decoding for harness output streams.
//!
//! Harnesses interleave JSON events with blank lines, banners and the odd
//! partial write. Decoding never fails: anything that is not a well-formed
//! event of the expected shape is dropped and the stream continues.

use std::io::{self, BufRead, Read, Write};
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use tracing::{trace, warn};

use crate::core::types::UsageRecord;

/// Decode one line into an event. Blank and malformed lines yield `None`.
pub fn decode_line<E: DeserializeOwned>(line: &[u8]) -> Option<E> {
    let trimmed = line.trim_ascii();
    if trimmed.is_empty() {
        return None;
    }
    match serde_json::from_slice(trimmed) {
        Ok(event) => Some(event),
        Err(err) => {
            trace!(err = %err, "skipping undecodable stream line");
            None
        }
    }
}

/// Lazy, single-pass iterator over the events decodable from `reader`.
pub struct Events<E, R> {
    reader: R,
    max_line_bytes: usize,
    _event: PhantomData<fn() -> E>,
}

/// Iterate the events in `reader`, skipping anything that does not decode.
pub fn events<E: DeserializeOwned, R: BufRead>(reader: R) -> Events<E, R> {
    Events {
        reader,
        max_line_bytes: usize::MAX,
        _event: PhantomData,
    }
}

impl<E, R> Events<E, R> {
    /// Lines longer than `limit` are never buffered whole; they are dropped
    /// like any other malformed line.
    pub fn max_line_bytes(mut self, limit: usize) -> Self {
        self.max_line_bytes = limit;
        self
    }
}

impl<E: DeserializeOwned, R: BufRead> Iterator for Events<E, R> {
    type Item = E;

    fn next(&mut self) -> Option<E> {
        let cap = u64::try_from(self.max_line_bytes.saturating_add(1)).unwrap_or(u64::MAX);
        let mut line = Vec::new();
        loop {
            line.clear();
            let read = (&mut self.reader).take(cap).read_until(b'\n', &mut line);
            match read {
                Ok(0) => return None,
                Ok(n) if n > self.max_line_bytes && line.last() != Some(&b'\n') => {
                    match skip_line(&mut self.reader) {
                        Ok(rest) => {
                            warn!(bytes = n + rest, "skipping oversized stream line");
                        }
                        Err(err) => {
                            trace!(err = %err, "stream read failed, ending");
                            return None;
                        }
                    }
                }
                Ok(_) => {
                    if let Some(event) = decode_line(&line) {
                        return Some(event);
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    trace!(err = %err, "stream read failed, ending");
                    return None;
                }
            }
        }
    }
}

/// Discard input through the next newline; returns the bytes dropped.
fn skip_line<R: BufRead>(reader: &mut R) -> io::Result<usize> {
    let mut skipped = 0;
    loop {
        let (used, done) = {
            let buf = match reader.fill_buf() {
                Ok(buf) => buf,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            };
            match buf.iter().position(|&b| b == b'\n') {
                Some(i) => (i + 1, true),
                None => (buf.len(), buf.is_empty()),
            }
        };
        reader.consume(used);
        skipped += used;
        if done {
            return Ok(skipped);
        }
    }
}

/// Accumulated view of one streamed invocation.
#[derive(Debug)]
pub struct StreamState {
    usage: UsageRecord,
    text: String,
    final_text: Option<String>,
    echo: bool,
    limit: usize,
    truncated: usize,
}

impl StreamState {
    pub fn new(echo: bool) -> Self {
        Self {
            usage: UsageRecord::default(),
            text: String::new(),
            final_text: None,
            echo,
            limit: usize::MAX,
            truncated: 0,
        }
    }

    /// Keep at most `limit` bytes of display text; the rest is counted and dropped.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Append incremental display text.
    pub fn push_text(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        let room = self.limit.saturating_sub(self.text.len());
        let kept = char_prefix(text, room);
        self.text.push_str(kept);
        self.truncated += text.len() - kept.len();
        if self.echo {
            print!("{text}");
            let _ = io::stdout().flush();
        }
    }

    /// Informational line shown to a watching user but not kept as output.
    pub fn note(&self, line: &str) {
        if self.echo {
            eprintln!("[{line}]");
        }
    }

    /// Sum a per-step usage report into the running total.
    pub fn add_usage(&mut self, usage: &UsageRecord) {
        self.usage.accumulate(usage);
    }

    /// Replace the running cost with a final figure from the harness.
    pub fn set_cost(&mut self, cost_usd: f64) {
        self.usage.cost_usd = Some(cost_usd);
    }

    /// Final result text; used when no incremental text was streamed.
    pub fn set_final_text(&mut self, text: &str) {
        self.final_text = Some(char_prefix(text, self.limit).to_string());
    }

    /// Bytes of streamed text dropped at the limit.
    pub fn truncated(&self) -> usize {
        self.truncated
    }

    /// Display text and usage, with cost-based estimation applied.
    pub fn finish(self) -> (String, UsageRecord) {
        if self.truncated > 0 {
            warn!(truncated = self.truncated, "streamed display text truncated");
        }
        let text = match self.final_text {
            Some(final_text) if self.text.trim().is_empty() => final_text,
            _ => self.text,
        };
        (text, self.usage.with_cost_estimate())
    }
}

/// Longest prefix of `text` within `max` bytes that ends on a char boundary.
fn char_prefix(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::io::Cursor;

    #[derive(Debug, Deserialize, PartialEq)]
    #[serde(tag = "type", rename_all = "snake_case")]
    enum Sample {
        Tick { n: u32 },
        #[serde(other)]
        Other,
    }

    #[test]
    fn skips_blank_and_malformed_lines() {
        let input = b"\n{\"type\":\"tick\",\"n\":1}\nnot json\n{\"type\":\"tick\",\"n\":\n  \n{\"type\":\"tick\",\"n\":2}\n";
        let got: Vec<Sample> = events(Cursor::new(&input[..])).collect();
        assert_eq!(got, vec![Sample::Tick { n: 1 }, Sample::Tick { n: 2 }]);
    }

    #[test]
    fn unknown_types_decode_as_other_and_bad_utf8_is_skipped() {
        let mut input = b"{\"type\":\"mystery\"}\n".to_vec();
        input.extend_from_slice(&[0xff, 0xfe, b'\n']);
        input.extend_from_slice(b"{\"type\":\"tick\",\"n\":7}");
        let got: Vec<Sample> = events(Cursor::new(input)).collect();
        assert_eq!(got, vec![Sample::Other, Sample::Tick { n: 7 }]);
    }

    #[test]
    fn finish_prefers_streamed_text_over_final_text() {
        let mut state = StreamState::new(false);
        state.push_text("streamed");
        state.set_final_text("final");
        assert_eq!(state.finish().0, "streamed");

        let mut state = StreamState::new(false);
        state.set_final_text("final");
        assert_eq!(state.finish().0, "final");
    }

    #[test]
    fn finish_estimates_from_cost_only() {
        let mut state = StreamState::new(false);
        state.set_cost(0.10);
        let (_, usage) = state.finish();
        assert!(usage.estimated);
        assert!(usage.input_tokens > 0 && usage.output_tokens > 0);
    }

    #[test]
    fn oversized_lines_are_skipped_without_losing_the_next_event() {
        let mut input = b"{\"type\":\"tick\",\"n\":1}\n".to_vec();
        input.extend(std::iter::repeat_n(b'x', 5_000));
        input.extend_from_slice(b"\n{\"type\":\"tick\",\"n\":2}\n");
        let got: Vec<Sample> = events(Cursor::new(input)).max_line_bytes(64).collect();
        assert_eq!(got, vec![Sample::Tick { n: 1 }, Sample::Tick { n: 2 }]);
    }

    #[test]
    fn line_exactly_at_the_limit_still_decodes() {
        let line = b"{\"type\":\"tick\",\"n\":3}";
        let mut input = line.to_vec();
        input.push(b'\n');
        let got: Vec<Sample> = events(Cursor::new(input))
            .max_line_bytes(line.len())
            .collect();
        assert_eq!(got, vec![Sample::Tick { n: 3 }]);
    }

    #[test]
    fn display_text_is_capped_on_a_char_boundary() {
        let mut state = StreamState::new(false).with_limit(10);
        state.push_text("abcdefgh");
        state.push_text("é€z");
        state.push_text("more");
        assert_eq!(state.truncated(), 4 + 4);
        let (text, _) = state.finish();
        assert_eq!(text, "abcdefghé");
        assert!(text.len() <= 10);

        let mut state = StreamState::new(false).with_limit(4);
        state.set_final_text("final answer");
        assert_eq!(state.finish().0, "fina");
    }
}
