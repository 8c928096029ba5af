// Thinking tag parser for streaming responses
//
// Implements a finite state machine extracting <thinking>...</thinking>
// segments from interleaved assistant text that may be split across
// arbitrary network chunks.
//
// Invariants:
// - Tag detection only at the start of the response (leading whitespace
//   allowed); anything else switches the parser to passthrough for good.
// - A closing tag directly preceded or followed by a quote character is
//   literal content, not a terminator (models quoting their own markup).
// - A trailing fragment that is a proper prefix of a tag is carried over,
//   never emitted early.
// - Concatenating all emitted segment text reproduces the input with the
//   one legitimate tag pair stripped.

const OPEN_TAG: &str = "<thinking>";
const CLOSE_TAG: &str = "</thinking>";

/// Quote characters that escape a closing tag
const QUOTE_CHARS: [char; 3] = ['`', '\'', '"'];

/// Parser states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserMode {
    /// Initial state, buffering to detect the opening tag
    Pending,
    /// Inside a thinking block, scanning for the closing tag
    Thinking,
    /// Closing tag seen, remainder is regular text
    Text,
    /// No thinking block in this stream, everything is regular text
    Passthrough,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    Thinking,
    Text,
}

/// A parsed run of homogeneous content
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub kind: SegmentKind,
    pub text: String,
}

impl Segment {
    fn thinking(text: String) -> Self {
        Segment {
            kind: SegmentKind::Thinking,
            text,
        }
    }

    fn text(text: String) -> Self {
        Segment {
            kind: SegmentKind::Text,
            text,
        }
    }
}

/// Incremental parser for <thinking> blocks in streamed text
pub struct ThinkingTagParser {
    mode: ParserMode,
    carry: String,
    /// Last character consumed before the current carry buffer start,
    /// needed for the lookbehind check across retention boundaries
    prev_char: Option<char>,
    flushed: bool,
}

impl ThinkingTagParser {
    pub fn new() -> Self {
        Self {
            mode: ParserMode::Pending,
            carry: String::new(),
            prev_char: None,
            flushed: false,
        }
    }

    pub fn mode(&self) -> ParserMode {
        self.mode
    }

    /// Feed a fragment and collect the segments it completes
    pub fn push_and_parse(&mut self, fragment: &str) -> Vec<Segment> {
        if fragment.is_empty() {
            return Vec::new();
        }

        match self.mode {
            ParserMode::Text | ParserMode::Passthrough => {
                vec![Segment::text(fragment.to_string())]
            }
            ParserMode::Pending => {
                self.carry.push_str(fragment);
                self.scan_pending(false)
            }
            ParserMode::Thinking => {
                self.carry.push_str(fragment);
                self.scan_thinking(false)
            }
        }
    }

    /// Drain any buffered content at end of stream.
    ///
    /// An unterminated thinking block is emitted as a final Thinking
    /// segment. Calling flush a second time emits nothing.
    pub fn flush(&mut self) -> Vec<Segment> {
        if self.flushed {
            return Vec::new();
        }
        self.flushed = true;

        let segments = match self.mode {
            ParserMode::Pending => self.scan_pending(true),
            ParserMode::Thinking => {
                let segments = self.scan_thinking(true);
                if self.mode == ParserMode::Thinking {
                    tracing::warn!("Stream ended inside an unterminated thinking block");
                }
                segments
            }
            ParserMode::Text | ParserMode::Passthrough => Vec::new(),
        };
        self.carry.clear();
        segments
    }

    fn scan_pending(&mut self, at_eof: bool) -> Vec<Segment> {
        let ws_len = self.carry.len() - self.carry.trim_start().len();
        let stripped = &self.carry[ws_len..];

        if stripped.starts_with(OPEN_TAG) {
            let mut segments = Vec::new();
            if ws_len > 0 {
                segments.push(Segment::text(self.carry[..ws_len].to_string()));
            }
            self.carry = self.carry[ws_len + OPEN_TAG.len()..].to_string();
            self.mode = ParserMode::Thinking;
            self.prev_char = Some('>');
            segments.extend(self.scan_thinking(at_eof));
            return segments;
        }

        // Could the buffer still grow into the opening tag?
        if !at_eof && OPEN_TAG.starts_with(stripped) {
            return Vec::new();
        }

        self.mode = ParserMode::Passthrough;
        if self.carry.is_empty() {
            Vec::new()
        } else {
            vec![Segment::text(std::mem::take(&mut self.carry))]
        }
    }

    fn scan_thinking(&mut self, at_eof: bool) -> Vec<Segment> {
        let mut segments = Vec::new();
        let mut emitted = String::new();
        let mut search_from = 0usize;

        loop {
            let Some(rel) = self.carry[search_from..].find(CLOSE_TAG) else {
                // No closing tag; emit everything except a trailing
                // fragment that could still become one.
                let keep = if at_eof {
                    0
                } else {
                    partial_suffix_len(&self.carry, CLOSE_TAG)
                };
                let cut = self.carry.len() - keep;
                emitted.push_str(&self.carry[..cut]);
                self.carry.drain(..cut);
                break;
            };
            let idx = search_from + rel;

            let before = if idx > 0 {
                self.carry[..idx].chars().last()
            } else {
                self.prev_char
            };
            if before.is_some_and(|c| QUOTE_CHARS.contains(&c)) {
                // Escaped by a preceding quote, keep as literal content
                search_from = idx + CLOSE_TAG.len();
                continue;
            }

            let tag_end = idx + CLOSE_TAG.len();
            match self.carry[tag_end..].chars().next() {
                Some(c) if QUOTE_CHARS.contains(&c) => {
                    // Escaped by a following quote
                    search_from = tag_end;
                    continue;
                }
                None if !at_eof => {
                    // Tag sits at the buffer end; the next character decides
                    // whether it is escaped. Retain it.
                    emitted.push_str(&self.carry[..idx]);
                    self.carry.drain(..idx);
                    break;
                }
                _ => {
                    // Genuine terminator
                    emitted.push_str(&self.carry[..idx]);
                    let after_tag = self.carry[tag_end..].to_string();
                    self.carry.clear();
                    self.mode = ParserMode::Text;
                    if !emitted.is_empty() {
                        segments.push(Segment::thinking(emitted));
                    }
                    if !after_tag.is_empty() {
                        segments.push(Segment::text(after_tag));
                    }
                    return segments;
                }
            }
        }

        if !emitted.is_empty() {
            self.prev_char = emitted.chars().last();
            segments.push(Segment::thinking(emitted));
        }
        segments
    }
}

impl Default for ThinkingTagParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Length of the longest suffix of `text` that is a proper prefix of `tag`
fn partial_suffix_len(text: &str, tag: &str) -> usize {
    for i in (1..tag.len()).rev() {
        if text.ends_with(&tag[..i]) {
            return i;
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(parser: &mut ThinkingTagParser, chunks: &[&str]) -> Vec<Segment> {
        let mut all = Vec::new();
        for chunk in chunks {
            all.extend(parser.push_and_parse(chunk));
        }
        all.extend(parser.flush());
        all
    }

    fn concat(segments: &[Segment]) -> String {
        segments.iter().map(|s| s.text.as_str()).collect()
    }

    #[test]
    fn test_basic_thinking_block() {
        let mut parser = ThinkingTagParser::new();
        let segments = collect(&mut parser, &["<thinking>Hello world</thinking>Done"]);

        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0], Segment::thinking("Hello world".into()));
        assert_eq!(segments[1], Segment::text("Done".into()));
    }

    #[test]
    fn test_no_thinking_block_is_passthrough() {
        let mut parser = ThinkingTagParser::new();
        let segments = parser.push_and_parse("Hello world, plain content");

        assert_eq!(parser.mode(), ParserMode::Passthrough);
        assert_eq!(segments, vec![Segment::text("Hello world, plain content".into())]);

        // Later tags are just text once passthrough is decided
        let more = parser.push_and_parse("<thinking>not a block</thinking>");
        assert!(more.iter().all(|s| s.kind == SegmentKind::Text));
    }

    #[test]
    fn test_open_tag_split_across_chunks() {
        let mut parser = ThinkingTagParser::new();
        assert!(parser.push_and_parse("<think").is_empty());
        parser.push_and_parse("ing>Hello");
        assert_eq!(parser.mode(), ParserMode::Thinking);
    }

    #[test]
    fn test_close_tag_split_across_chunks() {
        let mut parser = ThinkingTagParser::new();
        let mut segments = parser.push_and_parse("<thinking>deep thought</thi");
        segments.extend(parser.push_and_parse("nking>answer"));

        assert_eq!(parser.mode(), ParserMode::Text);
        let thinking: String = segments
            .iter()
            .filter(|s| s.kind == SegmentKind::Thinking)
            .map(|s| s.text.as_str())
            .collect();
        let text: String = segments
            .iter()
            .filter(|s| s.kind == SegmentKind::Text)
            .map(|s| s.text.as_str())
            .collect();
        assert_eq!(thinking, "deep thought");
        assert_eq!(text, "answer");
    }

    #[test]
    fn test_leading_whitespace_before_tag() {
        let mut parser = ThinkingTagParser::new();
        let segments = collect(&mut parser, &["  \n<thinking>A</thinking>B"]);

        assert_eq!(concat(&segments), "  \nAB");
        assert_eq!(segments[0], Segment::text("  \n".into()));
    }

    #[test]
    fn test_fake_close_tag_preceded_by_quote() {
        let mut parser = ThinkingTagParser::new();
        let input = "<thinking>the tag is \"</thinking>\" in markup</thinking>done";
        let segments = collect(&mut parser, &[input]);

        let thinking: String = segments
            .iter()
            .filter(|s| s.kind == SegmentKind::Thinking)
            .map(|s| s.text.as_str())
            .collect();
        assert_eq!(thinking, "the tag is \"</thinking>\" in markup");
        assert_eq!(segments.last().unwrap(), &Segment::text("done".into()));
    }

    #[test]
    fn test_fake_close_tag_followed_by_quote() {
        let mut parser = ThinkingTagParser::new();
        let input = "<thinking>write </thinking>' literally";
        let segments = collect(&mut parser, &[input]);

        // Only escaped occurrences: the block never terminates
        assert!(segments.iter().all(|s| s.kind == SegmentKind::Thinking));
        assert_eq!(concat(&segments), "write </thinking>' literally");
    }

    #[test]
    fn test_fake_close_tag_backtick() {
        let mut parser = ThinkingTagParser::new();
        let segments =
            collect(&mut parser, &["<thinking>`</thinking>` is the close tag</thinking>ok"]);

        let thinking: String = segments
            .iter()
            .filter(|s| s.kind == SegmentKind::Thinking)
            .map(|s| s.text.as_str())
            .collect();
        assert_eq!(thinking, "`</thinking>` is the close tag");
        assert_eq!(segments.last().unwrap(), &Segment::text("ok".into()));
    }

    #[test]
    fn test_fake_tag_split_at_quote_boundary() {
        // The escaping quote arrives in a later chunk than the tag
        let mut parser = ThinkingTagParser::new();
        let mut segments = parser.push_and_parse("<thinking>quote: \"</thinking>");
        segments.extend(parser.push_and_parse("\" end</thinking>after"));
        segments.extend(parser.flush());

        assert_eq!(parser.mode(), ParserMode::Text);
        let thinking: String = segments
            .iter()
            .filter(|s| s.kind == SegmentKind::Thinking)
            .map(|s| s.text.as_str())
            .collect();
        assert_eq!(thinking, "quote: \"</thinking>\" end");
    }

    #[test]
    fn test_close_tag_at_buffer_end_is_retained() {
        let mut parser = ThinkingTagParser::new();
        let segments = parser.push_and_parse("<thinking>almost</thinking>");
        // Lookahead unknown, nothing may terminate yet
        assert_eq!(parser.mode(), ParserMode::Thinking);
        let thinking: String = segments.iter().map(|s| s.text.as_str()).collect();
        assert_eq!(thinking, "almost");

        // Non-quote continuation confirms the terminator
        let segments = parser.push_and_parse("x");
        assert_eq!(parser.mode(), ParserMode::Text);
        assert_eq!(segments, vec![Segment::text("x".into())]);
    }

    #[test]
    fn test_flush_terminates_trailing_close_tag() {
        let mut parser = ThinkingTagParser::new();
        parser.push_and_parse("<thinking>final</thinking>");
        let segments = parser.flush();
        // End of stream counts as a non-quote follower
        assert_eq!(parser.mode(), ParserMode::Text);
        assert!(segments.is_empty());
    }

    #[test]
    fn test_flush_unterminated_block() {
        let mut parser = ThinkingTagParser::new();
        parser.push_and_parse("<thinking>never closed");
        let segments = parser.flush();

        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].kind, SegmentKind::Thinking);
    }

    #[test]
    fn test_flush_is_idempotent() {
        let mut parser = ThinkingTagParser::new();
        parser.push_and_parse("<thinking>abc");
        let first = parser.flush();
        assert!(!first.is_empty());
        assert!(parser.flush().is_empty());
        assert!(parser.flush().is_empty());
    }

    #[test]
    fn test_flush_partial_open_tag_as_text() {
        let mut parser = ThinkingTagParser::new();
        assert!(parser.push_and_parse("<thin").is_empty());
        let segments = parser.flush();
        assert_eq!(segments, vec![Segment::text("<thin".into())]);
    }

    #[test]
    fn test_totality_over_fragmentations() {
        let input = "<thinking>alpha \"</thinking>\" beta</thinking>gamma delta";
        let expected = "alpha \"</thinking>\" betagamma delta";

        // Split at every position pair to exercise boundary handling
        for i in 0..input.len() {
            if !input.is_char_boundary(i) {
                continue;
            }
            let mut parser = ThinkingTagParser::new();
            let segments = collect(&mut parser, &[&input[..i], &input[i..]]);
            assert_eq!(concat(&segments), expected, "split at {}", i);
        }
    }

    #[test]
    fn test_totality_without_tags() {
        let input = "just some plain text with no tags at all";
        let mut parser = ThinkingTagParser::new();
        let segments = collect(&mut parser, &[input]);
        assert_eq!(concat(&segments), input);
        assert!(segments.iter().all(|s| s.kind == SegmentKind::Text));
    }

    #[test]
    fn test_many_small_fragments() {
        let input = "<thinking>one two three</thinking>four five";
        let mut parser = ThinkingTagParser::new();
        let mut segments = Vec::new();
        for ch in input.chars() {
            segments.extend(parser.push_and_parse(&ch.to_string()));
        }
        segments.extend(parser.flush());

        let thinking: String = segments
            .iter()
            .filter(|s| s.kind == SegmentKind::Thinking)
            .map(|s| s.text.as_str())
            .collect();
        let text: String = segments
            .iter()
            .filter(|s| s.kind == SegmentKind::Text)
            .map(|s| s.text.as_str())
            .collect();
        assert_eq!(thinking, "one two three");
        assert_eq!(text, "four five");
    }

    #[test]
    fn test_unicode_content() {
        let mut parser = ThinkingTagParser::new();
        let segments = collect(&mut parser, &["<thinking>思考中…</thinking>答案"]);
        assert_eq!(segments[0], Segment::thinking("思考中…".into()));
        assert_eq!(segments[1], Segment::text("答案".into()));
    }
}
