//! Tool command grammar.
//!
//! A tool line is `<name> [positional...] [--flag value | --flag=value | --flag]...`.
//! Tools with an end marker also accept a multi-line body:
//!
//! ```text
//! edit 10:15
//! replacement line 1
//! replacement line 2
//! end_of_edit
//! ```

use super::{Tool, ToolArgs, ToolCommand};

/// Argument names that absorb surplus positional words.
const REST_ARGUMENTS: &[&str] = &["query", "search_term", "content"];

/// A word of a tool command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub text: String,
    /// Whether the word began inside a quote. Such words are never flags;
    /// `--name="a b"` starts unquoted and stays a flag.
    pub quoted: bool,
}

/// Split a command line into words.
///
/// `"..."` and `'...'` group words; the other quote kind inside a quoted span
/// is literal. Returns `None` for an unterminated quote.
pub fn tokenize(input: &str) -> Option<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    // Set once the current word has started, even if its text is still empty.
    let mut started = false;
    let mut leading_quote = false;
    let mut open: Option<char> = None;

    for c in input.chars() {
        match open {
            Some(q) if c == q => open = None,
            Some(_) => current.push(c),
            None if c == '"' || c == '\'' => {
                if !started {
                    leading_quote = true;
                }
                started = true;
                open = Some(c);
            }
            None if c.is_whitespace() => {
                if started {
                    tokens.push(Token {
                        text: std::mem::take(&mut current),
                        quoted: leading_quote,
                    });
                    started = false;
                    leading_quote = false;
                }
            }
            None => {
                started = true;
                current.push(c);
            }
        }
    }

    if open.is_some() {
        return None;
    }
    if started {
        tokens.push(Token {
            text: current,
            quoted: leading_quote,
        });
    }
    Some(tokens)
}

/// Parse `input` as an invocation of `tool`.
///
/// Returns `None` when the line does not name this tool or cannot be parsed.
pub fn parse_for_tool(tool: &dyn Tool, input: &str) -> Option<ToolCommand> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Some(cmd) = parse_multiline(tool, trimmed) {
        return Some(cmd);
    }

    let tokens = tokenize(trimmed)?;
    let (head, rest) = tokens.split_first()?;
    if head.quoted || head.text != tool.name() {
        return None;
    }

    let mut args = ToolArgs::new();
    let mut positional: Vec<String> = Vec::new();

    let mut i = 0;
    while i < rest.len() {
        let token = &rest[i];
        match flag_name(token) {
            Some(flag) => {
                if let Some((name, value)) = flag.split_once('=') {
                    args.insert_text(name, value);
                    i += 1;
                } else if let Some(next) = rest.get(i + 1).filter(|t| flag_name(t).is_none()) {
                    args.insert_text(flag, next.text.clone());
                    i += 2;
                } else {
                    args.insert_flag(flag, true);
                    i += 1;
                }
            }
            None => {
                positional.push(token.text.clone());
                i += 1;
            }
        }
    }

    let mut words = positional.into_iter();
    for arg in tool.arguments() {
        let name = arg.name.trim_start_matches("--");
        if args.contains(name) {
            continue;
        }
        match words.next() {
            Some(word) => args.insert_text(name, word),
            None => break,
        }
    }

    let surplus: Vec<String> = words.collect();
    if !surplus.is_empty() {
        let rest_arg = tool
            .arguments()
            .iter()
            .map(|a| a.name)
            .find(|n| REST_ARGUMENTS.contains(n));
        if let Some(name) = rest_arg.filter(|n| !args.contains(n)) {
            args.insert_text(name, surplus.join(" "));
        }
    }

    Some(ToolCommand {
        name: tool.name().to_string(),
        args,
    })
}

fn flag_name(token: &Token) -> Option<&str> {
    if token.quoted {
        return None;
    }
    token.text.strip_prefix("--").filter(|name| !name.is_empty())
}

fn parse_multiline(tool: &dyn Tool, trimmed: &str) -> Option<ToolCommand> {
    let marker = tool.end_marker()?.trim();
    let lines: Vec<&str> = trimmed.lines().collect();
    if lines.len() < 2 {
        return None;
    }
    let end = lines
        .iter()
        .enumerate()
        .skip(1)
        .find(|(_, line)| line.trim() == marker)
        .map(|(idx, _)| idx)?;

    let mut head = lines[0].split_whitespace();
    if head.next()? != tool.name() {
        return None;
    }
    let first = head.next()?;
    let (start_line, end_line) = match first.split_once(':') {
        Some((s, e)) => (s.parse::<u64>().ok()?, e.parse::<u64>().ok()?),
        None => (first.parse::<u64>().ok()?, head.next()?.parse::<u64>().ok()?),
    };

    let args = ToolArgs::new()
        .with("start_line", start_line.to_string())
        .with("end_line", end_line.to_string())
        .with("content", lines[1..end].join("\n"));

    Some(ToolCommand {
        name: tool.name().to_string(),
        args,
    })
}
