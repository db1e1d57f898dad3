//! Terminal rendering of transcript messages.
//!
//! Messages are turned into ratatui `Text`, then into ANSI escapes for the
//! line-mode terminal. Model messages go through the segment parser so code
//! blocks and inline code are highlighted, including while a reply is still
//! streaming in.

use std::io::{self, Write as _};

use crossterm::{
    cursor::{MoveToColumn, MoveUp},
    terminal::{size as terminal_size, Clear, ClearType},
    ExecutableCommand,
};
use ratatui::{
    style::{Color, Modifier, Style},
    text::{Line, Span, Text},
};
use unicode_width::UnicodeWidthStr;

use sensei_core::segment::{self, Inline, Segment};
use sensei_core::{Message, Role, Topic};

pub const API_KEY_URL: &str = "https://aistudio.google.com/app/apikey";

const STREAMING_CURSOR: &str = "▌";
const PENDING_TEXT: &str = "생각 중...";
const CODE_RULE_WIDTH: usize = 40;

struct Palette {
    user_label: Style,
    model_label: Style,
    inline_code: Style,
    code: Style,
    code_frame: Style,
    pending: Style,
    title: Style,
    link: Style,
}

impl Default for Palette {
    fn default() -> Self {
        Self {
            user_label: Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
            model_label: Style::default()
                .fg(Color::Green)
                .add_modifier(Modifier::BOLD),
            inline_code: Style::default().fg(Color::Yellow),
            code: Style::default().fg(Color::Yellow),
            code_frame: Style::default().fg(Color::DarkGray),
            pending: Style::default()
                .fg(Color::DarkGray)
                .add_modifier(Modifier::ITALIC),
            title: Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
            link: Style::default()
                .fg(Color::Blue)
                .add_modifier(Modifier::UNDERLINED),
        }
    }
}

/// Render one transcript message. A settled model message with no text
/// (a reply that failed before its first fragment) renders as nothing.
pub fn render_message(message: &Message, width: usize) -> Text<'static> {
    let palette = Palette::default();
    match message.role {
        Role::User => {
            let mut lines: Vec<Line<'static>> = Vec::new();
            for (i, line) in message.text.lines().enumerate() {
                let mut spans = Vec::new();
                if i == 0 {
                    spans.push(Span::styled("you> ", palette.user_label));
                }
                spans.push(Span::raw(line.to_string()));
                lines.push(Line::from(spans));
            }
            Text::from(lines)
        }
        Role::Model => render_model(message, width, &palette),
    }
}

fn render_model(message: &Message, width: usize, palette: &Palette) -> Text<'static> {
    if message.text.is_empty() && !message.is_streaming {
        return Text::default();
    }

    let mut lines = vec![Line::from(Span::styled("sensei>", palette.model_label))];
    if message.text.is_empty() {
        lines.push(Line::from(Span::styled(PENDING_TEXT, palette.pending)));
        return Text::from(lines);
    }

    for seg in segment::segments(&message.text) {
        match &seg {
            Segment::Prose(inlines) => push_prose(&mut lines, inlines, palette),
            Segment::FencedCode { code, closed, .. } => {
                let label = seg.code_label().unwrap_or(segment::DEFAULT_CODE_LABEL);
                push_code_block(&mut lines, label, code, *closed, width, palette);
            }
        }
    }

    while lines.len() > 1 && lines.last().is_some_and(|l| l.spans.is_empty()) {
        lines.pop();
    }
    if message.is_streaming {
        let cursor = Span::styled(STREAMING_CURSOR, palette.pending);
        let has_body = lines.len() > 1;
        match lines.last_mut() {
            Some(last) if has_body => last.spans.push(cursor),
            _ => lines.push(Line::from(cursor)),
        }
    }
    Text::from(lines)
}

fn push_prose(lines: &mut Vec<Line<'static>>, inlines: &[Inline<'_>], palette: &Palette) {
    let mut current: Vec<Span<'static>> = Vec::new();
    for inline in inlines {
        let (text, style) = match inline {
            Inline::Text(text) => (*text, Style::default()),
            Inline::Code(code) => (*code, palette.inline_code),
        };
        for (i, piece) in text.split('\n').enumerate() {
            if i > 0 {
                lines.push(Line::from(std::mem::take(&mut current)));
            }
            let piece = piece.trim_end_matches('\r');
            if !piece.is_empty() {
                current.push(Span::styled(piece.to_string(), style));
            }
        }
    }
    if !current.is_empty() {
        lines.push(Line::from(current));
    }
}

fn push_code_block(
    lines: &mut Vec<Line<'static>>,
    label: &str,
    code: &str,
    closed: bool,
    width: usize,
    palette: &Palette,
) {
    let rule_width = width.clamp(8, CODE_RULE_WIDTH);
    let header = format!("┌─ {label} ");
    let fill = rule_width.saturating_sub(header.width());
    lines.push(Line::from(Span::styled(
        format!("{header}{}", "─".repeat(fill)),
        palette.code_frame,
    )));

    for code_line in code.lines() {
        lines.push(Line::from(vec![
            Span::styled("│ ", palette.code_frame),
            Span::styled(code_line.to_string(), palette.code),
        ]));
    }

    if closed {
        lines.push(Line::from(Span::styled(
            format!("└{}", "─".repeat(rule_width.saturating_sub(1))),
            palette.code_frame,
        )));
    }
}

/// Shown instead of the chat when no API key is configured.
pub fn remediation_text() -> Text<'static> {
    let palette = Palette::default();
    Text::from(vec![
        Line::from(Span::styled("API 키가 설정되지 않았습니다", palette.title)),
        Line::default(),
        Line::from("알고선생과 대화하려면 Gemini API 키가 필요합니다."),
        Line::from("API_KEY 환경 변수나 ~/.config/sensei/config.toml 의 api_key 항목에 키를 설정한 뒤 다시 실행해주세요."),
        Line::default(),
        Line::from(vec![
            Span::raw("API 키 발급: "),
            Span::styled(API_KEY_URL, palette.link),
        ]),
    ])
}

pub fn print_remediation() {
    println!("{}", text_to_ansi(&remediation_text()));
}

pub fn topics_text(topics: &[Topic], active: Option<&Topic>) -> Text<'static> {
    let palette = Palette::default();
    let lines = topics
        .iter()
        .enumerate()
        .map(|(i, topic)| {
            let marker = if active.is_some_and(|a| a.id == topic.id) {
                "*"
            } else {
                " "
            };
            Line::from(vec![
                Span::raw(format!("{marker}{:>2}. ", i + 1)),
                Span::styled(topic.title, palette.model_label),
                Span::styled(format!(" ({})", topic.id), palette.code_frame),
                Span::raw(format!(" - {}", topic.description)),
            ])
        })
        .collect::<Vec<_>>();
    Text::from(lines)
}

/// Convert ratatui `Text` to an ANSI-escaped string for direct terminal output.
pub fn text_to_ansi(text: &Text) -> String {
    let mut out = String::new();
    for (i, line) in text.lines.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        for span in &line.spans {
            let sgr = style_to_ansi(&span.style);
            if sgr.is_empty() {
                out.push_str(&span.content);
            } else {
                out.push_str(&sgr);
                out.push_str(&span.content);
                out.push_str("\x1b[0m");
            }
        }
    }
    out
}

/// Plain text of a rendered `Text`, without any styling.
pub fn text_to_plain(text: &Text) -> String {
    text.lines
        .iter()
        .map(|line| {
            line.spans
                .iter()
                .map(|s| s.content.as_ref())
                .collect::<String>()
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn style_to_ansi(style: &Style) -> String {
    let mut codes: Vec<String> = [
        (Modifier::BOLD, "1"),
        (Modifier::ITALIC, "3"),
        (Modifier::UNDERLINED, "4"),
        (Modifier::CROSSED_OUT, "9"),
    ]
    .iter()
    .filter(|(modifier, _)| style.add_modifier.contains(*modifier))
    .map(|(_, code)| code.to_string())
    .collect();

    codes.extend(style.fg.and_then(|c| color_code(c, false)));
    codes.extend(style.bg.and_then(|c| color_code(c, true)));

    if codes.is_empty() {
        String::new()
    } else {
        format!("\x1b[{}m", codes.join(";"))
    }
}

/// SGR code for a color; background codes are offset by 10.
fn color_code(color: Color, background: bool) -> Option<String> {
    let offset = if background { 10 } else { 0 };
    let base = match color {
        Color::Black => 30,
        Color::Red => 31,
        Color::Green => 32,
        Color::Yellow => 33,
        Color::Blue => 34,
        Color::Magenta => 35,
        Color::Cyan => 36,
        Color::White | Color::Gray => 37,
        Color::DarkGray => 90,
        Color::LightRed => 91,
        Color::LightGreen => 92,
        Color::LightYellow => 93,
        Color::LightBlue => 94,
        Color::LightMagenta => 95,
        Color::LightCyan => 96,
        Color::Indexed(n) => return Some(format!("{};5;{n}", 38 + offset)),
        Color::Rgb(r, g, b) => return Some(format!("{};2;{r};{g};{b}", 38 + offset)),
        _ => return None,
    };
    Some((base + offset).to_string())
}

/// Terminal rows `text` occupies when wrapped at `width` columns.
fn visual_rows(text: &Text, width: usize) -> usize {
    let width = width.max(1);
    text.lines
        .iter()
        .map(|line| {
            let cols: usize = line.spans.iter().map(|s| s.content.width()).sum();
            cols.div_ceil(width).max(1)
        })
        .sum()
}

fn terminal_width() -> usize {
    let (width, _) = terminal_size().unwrap_or((80, 24));
    width as usize
}

/// Redraws the messages of the current turn in place as they change.
///
/// On a terminal the previously drawn rows are cleared before each redraw.
/// Otherwise nothing is drawn until [`LiveView::finish`], which prints the
/// final text once without styling.
pub struct LiveView {
    interactive: bool,
    rendered_rows: usize,
    width: usize,
    last: Option<Text<'static>>,
}

impl LiveView {
    pub fn new(interactive: bool) -> Self {
        Self {
            interactive,
            rendered_rows: 0,
            width: terminal_width(),
            last: None,
        }
    }

    pub fn redraw(&mut self, messages: &[Message]) -> io::Result<()> {
        let text = render_turn(messages, self.width);
        if self.interactive {
            self.clear()?;
            let output = text_to_ansi(&text);
            self.rendered_rows = if output.is_empty() {
                0
            } else {
                visual_rows(&text, self.width)
            };
            let mut stdout = io::stdout();
            if !output.is_empty() {
                writeln!(stdout, "{output}")?;
            }
            stdout.flush()?;
        }
        self.last = Some(text);
        Ok(())
    }

    /// Leave the last drawn state on screen.
    pub fn finish(&mut self) -> io::Result<()> {
        if !self.interactive {
            if let Some(text) = self.last.take() {
                let plain = text_to_plain(&text);
                if !plain.is_empty() {
                    println!("{plain}");
                }
            }
        }
        self.rendered_rows = 0;
        println!();
        Ok(())
    }

    fn clear(&mut self) -> io::Result<()> {
        if self.rendered_rows == 0 {
            return Ok(());
        }
        let mut stdout = io::stdout();
        for _ in 0..self.rendered_rows {
            stdout.execute(MoveUp(1))?;
            stdout.execute(Clear(ClearType::CurrentLine))?;
        }
        stdout.execute(MoveToColumn(0))?;
        self.rendered_rows = 0;
        Ok(())
    }
}

/// Model messages of a turn, separated by blank lines. User messages are
/// skipped: the line editor already shows what was typed.
fn render_turn(messages: &[Message], width: usize) -> Text<'static> {
    let mut lines: Vec<Line<'static>> = Vec::new();
    for message in messages.iter().filter(|m| m.role == Role::Model) {
        let text = render_message(message, width);
        if text.lines.is_empty() {
            continue;
        }
        if !lines.is_empty() {
            lines.push(Line::default());
        }
        lines.extend(text.lines);
    }
    Text::from(lines)
}
