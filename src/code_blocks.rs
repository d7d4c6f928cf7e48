//! Fenced code blocks inside model replies, so a front-end can offer to
//! save each one as a file.

use pulldown_cmark::{ CodeBlockKind, Event, Parser, Tag, TagEnd };
use std::path::Path;

use crate::error::ChatError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeBlock {
    /// Language tag from the opening fence, lowercased. Empty when absent.
    pub language: String,
    pub file_extension: String,
    pub content: String,
}

impl CodeBlock {
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ChatError> {
        let path = path.as_ref();
        std::fs::write(path, self.content.as_bytes()).map_err(|e|
            ChatError::Persistence(format!("Failed to save code block to {}: {}", path.display(), e))
        )
    }
}

pub fn file_extension_for(language: &str) -> &'static str {
    match language.to_lowercase().as_str() {
        "rust" | "rs" => "rs",
        "csharp" | "cs" | "c#" => "cs",
        "python" | "py" => "py",
        "javascript" | "js" => "js",
        "typescript" | "ts" => "ts",
        "json" => "json",
        "yaml" | "yml" => "yaml",
        "toml" => "toml",
        "shell" | "bash" | "sh" | "zsh" => "sh",
        "powershell" | "ps1" => "ps1",
        "c" => "c",
        "cpp" | "c++" => "cpp",
        "java" => "java",
        "go" => "go",
        "lua" => "lua",
        "html" => "html",
        "css" => "css",
        "xml" => "xml",
        "sql" => "sql",
        "shader" | "shaderlab" | "hlsl" => "shader",
        "markdown" | "md" => "md",
        _ => "txt",
    }
}

struct OpenBlock {
    language: String,
    start: usize,
    content: String,
}

/// True when the block spanning `source` ends with a closing fence. The
/// parser runs an unterminated fence to the end of the document instead.
fn is_closed(source: &str) -> bool {
    let strip = |line: &str| {
        line.trim_start_matches(|c: char| c.is_whitespace() || c == '>')
            .trim_end()
            .to_string()
    };
    let mut lines = source.trim_end_matches(['\r', '\n']).lines();
    let opening = match lines.next() {
        Some(line) => strip(line),
        None => {
            return false;
        }
    };
    let fence = match opening.chars().next() {
        Some(c @ ('`' | '~')) => c,
        _ => {
            return false;
        }
    };
    let opening_len = opening.chars().take_while(|c| *c == fence).count();
    match lines.last().map(strip) {
        Some(closing) => closing.len() >= opening_len && closing.chars().all(|c| c == fence),
        None => false,
    }
}

/// Finds every terminated fenced block, backtick or tilde, including ones
/// nested in lists and block quotes. Indented code blocks are skipped.
pub fn extract(content: &str) -> Vec<CodeBlock> {
    let mut blocks = Vec::new();
    let mut open: Option<OpenBlock> = None;

    for (event, range) in Parser::new(content).into_offset_iter() {
        match event {
            Event::Start(Tag::CodeBlock(CodeBlockKind::Fenced(info))) => {
                let language = info.split_whitespace().next().unwrap_or("").to_lowercase();
                open = Some(OpenBlock {
                    language,
                    start: range.start,
                    content: String::new(),
                });
            }
            Event::Text(text) => {
                if let Some(block) = open.as_mut() {
                    block.content.push_str(&text);
                }
            }
            Event::End(TagEnd::CodeBlock) => {
                let Some(block) = open.take() else {
                    continue;
                };
                if !is_closed(&content[block.start..range.end]) {
                    continue;
                }
                let body = block.content.strip_suffix('\n').unwrap_or(&block.content).to_string();
                blocks.push(CodeBlock {
                    file_extension: file_extension_for(&block.language).to_string(),
                    language: block.language,
                    content: body,
                });
            }
            _ => {}
        }
    }

    blocks
}
