//! Splits message text into displayable segments.
//!
//! Parsing is a pure function of the current text. While a reply streams in,
//! the same message is re-parsed after every fragment, so partial input must
//! parse into something sensible: an unterminated fence is reported as open
//! code rather than dropped.

const FENCE: &str = "```";

/// Label shown for a fenced block that has no language tag.
pub const DEFAULT_CODE_LABEL: &str = "code";

/// A top-level unit of displayable content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment<'a> {
    /// Plain text with inline code runs.
    Prose(Vec<Inline<'a>>),
    /// A triple-backtick block. `closed` is false while the closing marker
    /// has not arrived yet.
    FencedCode {
        language: &'a str,
        code: &'a str,
        closed: bool,
    },
}

impl<'a> Segment<'a> {
    /// Language label to display for a code block, `None` for prose.
    pub fn code_label(&self) -> Option<&'a str> {
        match self {
            Segment::FencedCode { language, .. } if language.is_empty() => {
                Some(DEFAULT_CODE_LABEL)
            }
            Segment::FencedCode { language, .. } => Some(language),
            Segment::Prose(_) => None,
        }
    }
}

/// A run inside a prose segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inline<'a> {
    Text(&'a str),
    Code(&'a str),
}

/// Parse `text` into its full segment sequence.
pub fn parse(text: &str) -> Vec<Segment<'_>> {
    segments(text).collect()
}

/// Lazily iterate the segments of `text`. Cloning the iterator restarts
/// from the clone point.
pub fn segments(text: &str) -> Segments<'_> {
    Segments {
        rest: text,
        emitted: false,
    }
}

#[derive(Debug, Clone)]
pub struct Segments<'a> {
    rest: &'a str,
    emitted: bool,
}

impl<'a> Iterator for Segments<'a> {
    type Item = Segment<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.is_empty() {
            // Fence-free input, even empty input, always yields one prose segment.
            if self.emitted {
                return None;
            }
            self.emitted = true;
            return Some(Segment::Prose(Vec::new()));
        }
        self.emitted = true;

        match self.rest.find(FENCE) {
            None => {
                let prose = std::mem::take(&mut self.rest);
                Some(Segment::Prose(inlines(prose)))
            }
            Some(0) => {
                let body = &self.rest[FENCE.len()..];
                match body.find(FENCE) {
                    Some(end) => {
                        self.rest = &body[end + FENCE.len()..];
                        Some(fenced(&body[..end], true))
                    }
                    None => {
                        self.rest = "";
                        Some(fenced(body, false))
                    }
                }
            }
            Some(start) => {
                let prose = &self.rest[..start];
                self.rest = &self.rest[start..];
                Some(Segment::Prose(inlines(prose)))
            }
        }
    }
}

fn fenced(inner: &str, closed: bool) -> Segment<'_> {
    let (language, code) = match inner.find('\n') {
        Some(newline) => {
            let code = &inner[newline + 1..];
            let code = if closed {
                code.strip_suffix('\n')
                    .map(|c| c.strip_suffix('\r').unwrap_or(c))
                    .unwrap_or(code)
            } else {
                code
            };
            (inner[..newline].trim(), code)
        }
        // Still typing the info string.
        None if !closed => (inner.trim(), ""),
        None => ("", inner),
    };
    Segment::FencedCode {
        language,
        code,
        closed,
    }
}

/// Split prose into text and inline code runs. A code run is a single
/// backtick, at least one non-backtick character, and a closing backtick.
pub fn inlines(prose: &str) -> Vec<Inline<'_>> {
    let mut runs = Vec::new();
    let mut text_start = 0;
    let mut pos = 0;

    while let Some(offset) = prose[pos..].find('`') {
        let open = pos + offset;
        let body_start = open + 1;
        match prose[body_start..].find('`') {
            // "``": no run can start here, try from the second backtick.
            Some(0) => pos = body_start,
            Some(len) => {
                if open > text_start {
                    runs.push(Inline::Text(&prose[text_start..open]));
                }
                runs.push(Inline::Code(&prose[body_start..body_start + len]));
                pos = body_start + len + 1;
                text_start = pos;
            }
            None => break,
        }
    }

    if text_start < prose.len() {
        runs.push(Inline::Text(&prose[text_start..]));
    }
    runs
}
