//! Incremental fenced-code detection over a streamed model response.
//!
//! The tracker classifies a growing text buffer, not individual tokens:
//! the opening marker, the language tag, and the closing fence may all be
//! split across token boundaries, so every decision is made against the
//! accumulated text and a cursor of what was already forwarded.

/// Closing delimiter; the opening marker is `FENCE` + language tag.
pub const FENCE: &str = "```";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeBlockPhase {
    Narrative,
    InCode,
    Closed,
}

/// Channel routing produced by one appended token.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TokenOutcome {
    /// Text to forward to the narrative channel.
    pub narrative: Option<String>,
    /// Text to forward to the code channel.
    pub code: Option<String>,
    /// The extracted block (trimmed), set on the token that closes it.
    pub closed: Option<String>,
}

/// State for a single streaming response. Never shared across responses or
/// sessions; a new tracker is created per call into the coordinator.
#[derive(Debug, Clone)]
pub struct CodeBlockTracker {
    open_marker: String,
    buffer: String,
    phase: CodeBlockPhase,
    /// Byte offset of the first code byte (just past the language tag).
    code_start: usize,
    /// Bytes of the code region already forwarded to the code channel.
    emitted: usize,
}

impl CodeBlockTracker {
    pub fn new(language_tag: &str) -> Self {
        Self {
            open_marker: format!("{FENCE}{language_tag}"),
            buffer: String::new(),
            phase: CodeBlockPhase::Narrative,
            code_start: 0,
            emitted: 0,
        }
    }

    pub fn phase(&self) -> CodeBlockPhase {
        self.phase
    }

    /// Full response text accumulated so far.
    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    /// Append one token and decide where its text goes.
    ///
    /// Tokens arriving after the first block closed are accumulated but
    /// routed nowhere: only the first complete block per response is
    /// processed, and the phase never moves backwards.
    pub fn push_token(&mut self, token: &str) -> TokenOutcome {
        self.buffer.push_str(token);
        let mut outcome = TokenOutcome::default();

        if self.phase == CodeBlockPhase::Closed {
            return outcome;
        }

        if self.phase == CodeBlockPhase::Narrative {
            match self.buffer.find(&self.open_marker) {
                Some(idx) => {
                    self.phase = CodeBlockPhase::InCode;
                    self.code_start = idx + self.open_marker.len();
                    self.emitted = 0;
                }
                None => {
                    outcome.narrative = Some(token.to_string());
                    return outcome;
                }
            }
        }

        let region = &self.buffer[self.code_start..];
        match region.find(FENCE) {
            Some(close) => {
                // The literal closing delimiter is fully present: flush the
                // unemitted code tail and seal the block.
                let code_region = &region[..close];
                if self.emitted < code_region.len() {
                    outcome.code = Some(code_region[self.emitted..].to_string());
                    self.emitted = code_region.len();
                }
                outcome.closed = Some(code_region.trim().to_string());
                self.phase = CodeBlockPhase::Closed;
            }
            None => {
                // Withhold a trailing backtick run: it may be the start of
                // the closing fence arriving split across tokens.
                let hold = region
                    .bytes()
                    .rev()
                    .take_while(|b| *b == b'`')
                    .count();
                let emit_end = region.len() - hold;
                if emit_end > self.emitted {
                    outcome.code = Some(region[self.emitted..emit_end].to_string());
                    self.emitted = emit_end;
                }
            }
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Routed {
        narrative: String,
        code: String,
        closed: Option<String>,
    }

    fn route(chunks: &[&str]) -> Routed {
        let mut tracker = CodeBlockTracker::new("python");
        let mut narrative = String::new();
        let mut code = String::new();
        let mut closed = None;
        for chunk in chunks {
            let outcome = tracker.push_token(chunk);
            if let Some(text) = outcome.narrative {
                narrative.push_str(&text);
            }
            if let Some(text) = outcome.code {
                code.push_str(&text);
            }
            if let Some(block) = outcome.closed {
                assert!(closed.is_none(), "block closed twice");
                closed = Some(block);
            }
        }
        Routed {
            narrative,
            code,
            closed,
        }
    }

    fn split_at_positions(source: &str, cuts: &[usize]) -> Vec<String> {
        let mut out = Vec::new();
        let mut start = 0usize;
        for &cut in cuts {
            if cut > start && cut <= source.len() && source.is_char_boundary(cut) {
                out.push(source[start..cut].to_string());
                start = cut;
            }
        }
        if start < source.len() {
            out.push(source[start..].to_string());
        }
        out
    }

    #[test]
    fn no_fence_means_everything_is_narrative() {
        let chunks = ["Here is ", "a plain ", "answer with `inline` code."];
        let routed = route(&chunks);
        assert_eq!(routed.narrative, chunks.concat());
        assert_eq!(routed.code, "");
        assert!(routed.closed.is_none());
    }

    #[test]
    fn extracts_code_between_markers_trimmed() {
        let routed = route(&["intro\n```python\nx = 1\ny = 2\n```\ntail"]);
        assert_eq!(routed.closed.as_deref(), Some("x = 1\ny = 2"));
        assert_eq!(routed.code, "\nx = 1\ny = 2\n");
    }

    #[test]
    fn narrative_before_fence_is_forwarded() {
        let routed = route(&["Making a cube.\n", "```python", "\nbox()", "\n```"]);
        assert_eq!(routed.narrative, "Making a cube.\n");
        assert_eq!(routed.closed.as_deref(), Some("box()"));
    }

    #[test]
    fn language_tag_never_reaches_code_channel_for_any_split() {
        let source = "ok\n```python\nresult = 1\n```";
        for cut in 1..source.len() {
            if !source.is_char_boundary(cut) {
                continue;
            }
            let chunks = split_at_positions(source, &[cut]);
            let refs: Vec<&str> = chunks.iter().map(|s| s.as_str()).collect();
            let routed = route(&refs);
            assert!(
                !routed.code.contains("python"),
                "tag leaked at split {cut}: {:?}",
                routed.code
            );
            assert_eq!(
                routed.closed.as_deref(),
                Some("result = 1"),
                "extraction broke at split {cut}"
            );
        }
    }

    #[test]
    fn extraction_is_chunk_boundary_invariant() {
        let source = "Narrative lead-in.\n```python\nimport cadquery as cq\nresult = cq.Workplane(\"XY\").box(10, 10, 10)\nshow_object(result)\n```\ntrailing prose";
        let expected_code = "import cadquery as cq\nresult = cq.Workplane(\"XY\").box(10, 10, 10)\nshow_object(result)";
        let boundary_sets: [&[usize]; 6] = [
            &[1, 2, 3, 4, 5, 6, 7, 8],
            &[5, 11, 17, 29, 41, 63, 87, 101],
            &[10, 20, 30, 40, 50, 60, 70, 80, 90, 100, 110, 120],
            &[13, 27, 44, 58, 73, 96, 121],
            &[source.len() / 2],
            &[source.len() - 1],
        ];
        let whole = route(&[source]);
        for cuts in boundary_sets {
            let chunks = split_at_positions(source, cuts);
            let refs: Vec<&str> = chunks.iter().map(|s| s.as_str()).collect();
            let routed = route(&refs);
            assert_eq!(
                routed.closed.as_deref(),
                Some(expected_code),
                "failed boundary set: {cuts:?}"
            );
            assert_eq!(routed.code, whole.code, "code deltas diverged: {cuts:?}");
        }
    }

    #[test]
    fn close_fence_split_across_tokens_is_not_emitted_as_code() {
        let routed = route(&["```python\nx = 1\n", "`", "`", "`"]);
        assert_eq!(routed.code, "\nx = 1\n");
        assert_eq!(routed.closed.as_deref(), Some("x = 1"));
    }

    #[test]
    fn inline_backticks_inside_code_are_released() {
        let routed = route(&["```python\ns = \"`", "`\"\nmore\n", "```"]);
        assert_eq!(routed.code, "\ns = \"``\"\nmore\n");
        assert_eq!(routed.closed.as_deref(), Some("s = \"``\"\nmore"));
    }

    #[test]
    fn only_first_complete_block_is_processed() {
        let mut tracker = CodeBlockTracker::new("python");
        tracker.push_token("```python\nfirst\n```");
        assert_eq!(tracker.phase(), CodeBlockPhase::Closed);
        let outcome = tracker.push_token("\n```python\nsecond\n```");
        assert_eq!(outcome, TokenOutcome::default());
        assert_eq!(tracker.phase(), CodeBlockPhase::Closed);
    }

    #[test]
    fn phase_only_advances_forward() {
        let mut tracker = CodeBlockTracker::new("python");
        assert_eq!(tracker.phase(), CodeBlockPhase::Narrative);
        tracker.push_token("```python\n");
        assert_eq!(tracker.phase(), CodeBlockPhase::InCode);
        tracker.push_token("x\n");
        assert_eq!(tracker.phase(), CodeBlockPhase::InCode);
        tracker.push_token("```");
        assert_eq!(tracker.phase(), CodeBlockPhase::Closed);
    }

    #[test]
    fn handles_multibyte_narrative_and_code() {
        let routed = route(&["Größe: 10 mm — ", "```python\n", "# Würfel\nx = 1\n", "```"]);
        assert_eq!(routed.narrative, "Größe: 10 mm — ");
        assert_eq!(routed.closed.as_deref(), Some("# Würfel\nx = 1"));
    }
}
