//! HTML to Markdown conversion
//!
//! The document is parsed with `scraper` (html5ever), so malformed markup is
//! repaired by the parser instead of failing, and entities arrive already
//! decoded. Rendering is a single pass over the tree's open/close edges with
//! an explicit stack, so nesting depth is bounded by the heap rather than the
//! thread stack. Inline constructs that need wrapping (headings, emphasis,
//! links, list items) render into a buffer of their own that is folded into
//! the parent when the element closes.

use ego_tree::iter::Edge;
use ego_tree::NodeRef;
use scraper::node::Node;
use scraper::{ElementRef, Html};
use url::Url;

/// Subtrees dropped entirely, text included
const SKIP_TAGS: &[&str] = &[
    "script", "style", "nav", "header", "footer", "aside", "head", "template", "noscript",
    "iframe", "svg",
];

/// Subtrees dropped from visible text
const TEXT_SKIP_TAGS: &[&str] = &["head", "script", "style", "noscript", "template"];

/// Elements rendered as line-separated blocks
const LINE_BLOCK_TAGS: &[&str] = &[
    "div",
    "section",
    "article",
    "main",
    "table",
    "thead",
    "tbody",
    "tfoot",
    "caption",
    "dl",
    "dt",
    "dd",
    "figure",
    "figcaption",
    "form",
    "fieldset",
    "address",
    "details",
    "summary",
];

/// Convert HTML to markdown
///
/// Relative link and image targets are resolved against `base_url` when one
/// is given and parses; otherwise they are emitted unchanged. Never fails:
/// broken markup degrades to best-effort text.
pub fn to_markdown(html: &str, base_url: Option<&str>) -> String {
    if html.trim().is_empty() {
        return String::new();
    }

    let document = Html::parse_document(html);
    let base_url = base_url.and_then(|b| Url::parse(b).ok());
    let mut renderer = Renderer::new(base_url.as_ref());

    let root: NodeRef<'_, Node> = *document.root_element();
    for edge in root.traverse() {
        match edge {
            Edge::Open(node) => renderer.open(node),
            Edge::Close(node) => renderer.close(node),
        }
    }

    renderer.finish()
}

/// Visible body text, whitespace collapsed
pub fn visible_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let root: NodeRef<'_, Node> = *document.root_element();

    let mut text = String::new();
    let mut skip_depth = 0usize;
    for edge in root.traverse() {
        match edge {
            Edge::Open(node) => match node.value() {
                Node::Element(element) => {
                    if skip_depth > 0 || TEXT_SKIP_TAGS.contains(&element.name()) {
                        skip_depth += 1;
                    }
                }
                Node::Text(t) if skip_depth == 0 => {
                    text.push_str(t);
                    text.push(' ');
                }
                _ => {}
            },
            Edge::Close(node) => {
                if skip_depth > 0 && matches!(node.value(), Node::Element(_)) {
                    skip_depth -= 1;
                }
            }
        }
    }

    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Output being built for one element (or the whole document)
struct Buffer {
    out: String,
    list_depth: usize,
    /// Whether an empty buffer counts as following whitespace
    lead_ws: bool,
}

impl Buffer {
    fn ends_with_ws(&self) -> bool {
        match self.out.chars().next_back() {
            None => self.lead_ws,
            Some(c) => c == ' ' || c == '\n',
        }
    }

    fn trim_trailing_spaces(&mut self) {
        let len = self.out.trim_end_matches(' ').len();
        self.out.truncate(len);
    }

    fn ensure_newline(&mut self) {
        self.trim_trailing_spaces();
        if !self.out.is_empty() && !self.out.ends_with('\n') {
            self.out.push('\n');
        }
    }

    fn ensure_blank_line(&mut self) {
        self.trim_trailing_spaces();
        if self.out.is_empty() {
            return;
        }
        while !self.out.ends_with("\n\n") {
            self.out.push('\n');
        }
    }

    fn push_text(&mut self, text: &str) {
        let mut last_ws = self.ends_with_ws();
        for c in text.chars() {
            if c.is_whitespace() {
                if !last_ws {
                    self.out.push(' ');
                    last_ws = true;
                }
            } else {
                self.out.push(c);
                last_ws = false;
            }
        }
    }

    /// Wrap inline content in markers, keeping outer spacing outside them
    fn wrap_inline(&mut self, content: &str, open: &str, close: &str) {
        let trimmed = content.trim();
        if trimmed.is_empty() {
            if !content.is_empty() && !self.ends_with_ws() {
                self.out.push(' ');
            }
            return;
        }

        if content.starts_with(char::is_whitespace) && !self.ends_with_ws() {
            self.out.push(' ');
        }
        self.out.push_str(open);
        self.out.push_str(trimmed);
        self.out.push_str(close);
        if content.ends_with(char::is_whitespace) {
            self.out.push(' ');
        }
    }

    fn link(&mut self, content: &str, target: Option<String>) {
        let Some(url) = target else {
            self.out.push_str(content);
            return;
        };

        if content.starts_with(char::is_whitespace) && !self.ends_with_ws() {
            self.out.push(' ');
        }
        self.out.push('[');
        self.out.push_str(content.trim());
        self.out.push_str("](");
        self.out.push_str(&url);
        self.out.push(')');
        if content.ends_with(char::is_whitespace) && !content.trim().is_empty() {
            self.out.push(' ');
        }
    }

    /// Emit a list item, continuation lines indented under the marker
    fn list_item(&mut self, marker: &str, content: &str) {
        self.ensure_newline();
        let indent = " ".repeat(marker.len());
        self.out.push_str(marker);
        for (i, line) in content.lines().enumerate() {
            if i > 0 {
                self.out.push('\n');
                if !line.is_empty() {
                    self.out.push_str(&indent);
                }
            }
            self.out.push_str(line);
        }
        self.ensure_newline();
    }

    fn blockquote(&mut self, content: &str) {
        if content.is_empty() {
            return;
        }
        self.ensure_blank_line();
        let quoted = content
            .lines()
            .map(|line| {
                if line.is_empty() {
                    ">".to_string()
                } else {
                    format!("> {}", line)
                }
            })
            .collect::<Vec<_>>()
            .join("\n");
        self.out.push_str(&quoted);
        self.ensure_blank_line();
    }
}

/// What to do when an open element closes
enum Frame {
    Plain,
    LineBlock,
    Paragraph,
    Heading(usize),
    Inline(&'static str, &'static str),
    Anchor(Option<String>),
    List { ordered: bool, next: i64, top_level: bool },
    Item(String),
    Quote,
    /// Cells collected so far; stray row content goes to the row's buffer
    Row(Vec<String>),
    Cell,
}

struct Renderer<'a> {
    base_url: Option<&'a Url>,
    /// Never empty; the first entry is the document
    buffers: Vec<Buffer>,
    frames: Vec<Frame>,
    /// Open elements inside a subtree being ignored
    skip_depth: usize,
}

impl<'a> Renderer<'a> {
    fn new(base_url: Option<&'a Url>) -> Self {
        Self {
            base_url,
            buffers: vec![Buffer {
                out: String::new(),
                list_depth: 0,
                lead_ws: true,
            }],
            frames: Vec::new(),
            skip_depth: 0,
        }
    }

    fn top(&mut self) -> &mut Buffer {
        let last = self.buffers.len() - 1;
        &mut self.buffers[last]
    }

    /// Start a nested buffer continuing where the current one stands
    fn push_buffer(&mut self, fresh_line: bool, nested_list: bool) {
        let parent = self.top();
        let buffer = Buffer {
            out: String::new(),
            list_depth: parent.list_depth + usize::from(nested_list),
            lead_ws: fresh_line || parent.ends_with_ws(),
        };
        self.buffers.push(buffer);
    }

    fn pop_buffer(&mut self) -> String {
        if self.buffers.len() > 1 {
            self.buffers.pop().map(|b| b.out).unwrap_or_default()
        } else {
            String::new()
        }
    }

    /// Ignore the rest of the element just opened
    fn consume(&mut self) {
        self.skip_depth = 1;
    }

    fn open(&mut self, node: NodeRef<'_, Node>) {
        let is_element = matches!(node.value(), Node::Element(_));
        if self.skip_depth > 0 {
            if is_element {
                self.skip_depth += 1;
            }
            return;
        }

        match node.value() {
            Node::Text(text) => {
                // Whitespace between list items is layout, not content
                if matches!(self.frames.last(), Some(Frame::List { .. })) && text.trim().is_empty()
                {
                    return;
                }
                self.top().push_text(text);
            }
            Node::Element(_) => {
                if let Some(element) = ElementRef::wrap(node) {
                    self.open_element(element);
                }
            }
            _ => {}
        }
    }

    fn close(&mut self, node: NodeRef<'_, Node>) {
        if !matches!(node.value(), Node::Element(_)) {
            return;
        }
        if self.skip_depth > 0 {
            self.skip_depth -= 1;
            return;
        }
        if let Some(frame) = self.frames.pop() {
            self.close_frame(frame);
        }
    }

    fn open_element(&mut self, element: ElementRef<'_>) {
        let tag = element.value().name().to_ascii_lowercase();
        let tag = tag.as_str();

        if SKIP_TAGS.contains(&tag) {
            self.consume();
            return;
        }

        let frame = match tag {
            "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => {
                self.top().ensure_blank_line();
                self.push_buffer(false, false);
                Frame::Heading(usize::from(tag.as_bytes()[1] - b'0'))
            }
            "p" => {
                self.top().ensure_blank_line();
                Frame::Paragraph
            }
            "br" => {
                let buffer = self.top();
                buffer.trim_trailing_spaces();
                buffer.out.push('\n');
                return self.consume();
            }
            "hr" => {
                let buffer = self.top();
                buffer.ensure_blank_line();
                buffer.out.push_str("---");
                buffer.ensure_blank_line();
                return self.consume();
            }
            "ul" | "ol" => {
                let buffer = self.top();
                let top_level = buffer.list_depth == 0;
                if top_level {
                    buffer.ensure_blank_line();
                } else {
                    buffer.ensure_newline();
                }
                let start = element
                    .value()
                    .attr("start")
                    .and_then(|s| s.trim().parse().ok())
                    .unwrap_or(1);
                Frame::List {
                    ordered: tag == "ol",
                    next: start,
                    top_level,
                }
            }
            "li" => {
                let marker = match self.frames.last_mut() {
                    Some(Frame::List {
                        ordered: true,
                        next,
                        ..
                    }) => {
                        let marker = format!("{}. ", next);
                        *next = next.saturating_add(1);
                        marker
                    }
                    _ => "- ".to_string(),
                };
                self.push_buffer(true, true);
                Frame::Item(marker)
            }
            "blockquote" => {
                self.push_buffer(true, false);
                Frame::Quote
            }
            "pre" => {
                self.preformatted(element);
                return self.consume();
            }
            "code" | "kbd" | "samp" => {
                let code: String = element.text().collect();
                let code = code.split_whitespace().collect::<Vec<_>>().join(" ");
                if code.contains('`') {
                    self.top().wrap_inline(&code, "`` ", " ``");
                } else {
                    self.top().wrap_inline(&code, "`", "`");
                }
                return self.consume();
            }
            "strong" | "b" => {
                self.push_buffer(false, false);
                Frame::Inline("**", "**")
            }
            "em" | "i" => {
                self.push_buffer(false, false);
                Frame::Inline("*", "*")
            }
            "a" => {
                let target = element
                    .value()
                    .attr("href")
                    .and_then(|href| resolve_url(href, self.base_url));
                self.push_buffer(false, false);
                Frame::Anchor(target)
            }
            "img" => {
                self.image(element);
                return self.consume();
            }
            "tr" => {
                self.top().ensure_newline();
                self.push_buffer(false, false);
                Frame::Row(Vec::new())
            }
            "td" | "th" if matches!(self.frames.last(), Some(Frame::Row(_))) => {
                self.push_buffer(true, false);
                Frame::Cell
            }
            _ if LINE_BLOCK_TAGS.contains(&tag) => {
                self.top().ensure_newline();
                Frame::LineBlock
            }
            _ => Frame::Plain,
        };
        self.frames.push(frame);
    }

    fn close_frame(&mut self, frame: Frame) {
        match frame {
            Frame::Plain => {}
            Frame::LineBlock => self.top().ensure_newline(),
            Frame::Paragraph => self.top().ensure_blank_line(),
            Frame::Heading(level) => {
                let text = single_line(&self.pop_buffer());
                let buffer = self.top();
                if !text.is_empty() {
                    buffer.out.push_str(&"#".repeat(level));
                    buffer.out.push(' ');
                    buffer.out.push_str(&text);
                }
                buffer.ensure_blank_line();
            }
            Frame::Inline(open, close) => {
                let content = self.pop_buffer();
                self.top().wrap_inline(&content, open, close);
            }
            Frame::Anchor(target) => {
                let content = self.pop_buffer();
                self.top().link(&content, target);
            }
            Frame::List { top_level, .. } => {
                if top_level {
                    self.top().ensure_blank_line();
                } else {
                    self.top().ensure_newline();
                }
            }
            Frame::Item(marker) => {
                let content = normalize(&self.pop_buffer());
                self.top().list_item(&marker, &content);
            }
            Frame::Quote => {
                let content = normalize(&self.pop_buffer());
                self.top().blockquote(&content);
            }
            Frame::Row(cells) => {
                let stray = self.pop_buffer();
                let buffer = self.top();
                buffer.ensure_newline();
                if cells.is_empty() {
                    buffer.out.push_str(&stray);
                } else {
                    buffer.out.push_str(&cells.join(" | "));
                }
                buffer.ensure_newline();
            }
            Frame::Cell => {
                let cell = single_line(&self.pop_buffer());
                if let Some(Frame::Row(cells)) = self.frames.last_mut() {
                    cells.push(cell);
                }
            }
        }
    }

    fn preformatted(&mut self, element: ElementRef<'_>) {
        let text: String = element.text().collect();
        let text = text.trim_start_matches('\n').trim_end();
        if text.is_empty() {
            return;
        }

        let language = element
            .descendants()
            .filter_map(ElementRef::wrap)
            .filter(|el| el.value().name() == "code")
            .flat_map(|el| el.value().classes())
            .find_map(|class| {
                class
                    .strip_prefix("language-")
                    .or_else(|| class.strip_prefix("lang-"))
            })
            .unwrap_or("");
        let fence = if text.contains("```") { "````" } else { "```" };

        let buffer = self.top();
        buffer.ensure_blank_line();
        buffer.out.push_str(fence);
        buffer.out.push_str(language);
        buffer.out.push('\n');
        buffer.out.push_str(text);
        buffer.out.push('\n');
        buffer.out.push_str(fence);
        buffer.ensure_blank_line();
    }

    fn image(&mut self, element: ElementRef<'_>) {
        let src = element.value().attr("src").map(str::trim).unwrap_or("");
        if src.is_empty() {
            return;
        }
        let Some(url) = resolve_url(src, self.base_url) else {
            return;
        };
        let alt = element.value().attr("alt").map(str::trim).unwrap_or("");
        self.top().out.push_str(&format!("![{}]({})", alt, url));
    }

    fn finish(&self) -> String {
        self.buffers
            .first()
            .map(|b| normalize(&b.out))
            .unwrap_or_default()
    }
}

/// Resolve a link target; `None` means the link must be dropped
fn resolve_url(raw: &str, base: Option<&Url>) -> Option<String> {
    let href = raw.trim();
    let lower = href.to_ascii_lowercase();

    if lower.starts_with("javascript:") {
        return None;
    }
    if href.starts_with("//") {
        return Some(format!("https:{}", href));
    }
    if lower.starts_with("http://") || lower.starts_with("https://") {
        return Some(href.to_string());
    }

    Some(
        base.and_then(|b| b.join(href).ok())
            .map(|u| u.to_string())
            .unwrap_or_else(|| href.to_string()),
    )
}

fn single_line(s: &str) -> String {
    s.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Strip trailing spaces, keep at most one blank line outside fences, trim
fn normalize(s: &str) -> String {
    let mut lines = Vec::new();
    let mut in_fence = false;
    let mut blank_run = 0;

    for line in s.lines() {
        let line = if in_fence { line } else { line.trim_end() };
        if line.trim_start().starts_with("```") {
            in_fence = !in_fence;
        }

        if line.is_empty() && !in_fence {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        lines.push(line);
    }

    lines.join("\n").trim().to_string()
}
