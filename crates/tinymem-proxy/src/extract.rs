//! Fenced code-block extraction from assistant output.
//!
//! Blocks are delimited by triple-backtick fences. The info string names
//! the language and may carry a filepath as its second token; failing
//! that, a `// file: path` (or `# file: path`) first line inside the block
//! is honored and stripped. Blocks over the byte cap are dropped whole, a
//! truncated artifact being worse than none.

/// One extracted block.
#[derive(Debug, Clone, PartialEq)]
pub struct CodeBlock {
    /// Language tag from the fence info string, lowercased.
    pub language: Option<String>,
    /// Filepath hint from the info string or a leading file comment.
    pub filepath: Option<String>,
    /// Block content, exactly as fenced (minus a consumed file comment).
    pub content: String,
}

/// Extract all fenced blocks from `text`, dropping any over `max_bytes`.
pub fn extract_code_blocks(text: &str, max_bytes: usize) -> Vec<CodeBlock> {
    let mut blocks = Vec::new();
    let mut lines = text.lines();

    while let Some(line) = lines.next() {
        let trimmed = line.trim_start();
        let Some(info) = trimmed.strip_prefix("```") else {
            continue;
        };
        // A bare ``` here would be a stray closer; skip it.
        let info = info.trim();

        let mut content = String::new();
        let mut closed = false;
        for body_line in lines.by_ref() {
            if body_line.trim_start().starts_with("```") {
                closed = true;
                break;
            }
            content.push_str(body_line);
            content.push('\n');
        }
        if !closed || content.trim().is_empty() {
            continue;
        }

        let (language, mut filepath) = parse_info_string(info);
        if filepath.is_none() {
            if let Some((path, stripped)) = take_file_comment(&content) {
                filepath = Some(path);
                content = stripped;
            }
        }

        if content.len() > max_bytes {
            continue;
        }
        // Trim the trailing newline we appended after the last line.
        if content.ends_with('\n') {
            content.pop();
        }
        blocks.push(CodeBlock {
            language,
            filepath,
            content,
        });
    }
    blocks
}

fn parse_info_string(info: &str) -> (Option<String>, Option<String>) {
    let mut parts = info.split_whitespace();
    let language = parts.next().map(|l| l.to_lowercase());
    // Second token is a filepath when it looks like one.
    let filepath = parts
        .next()
        .filter(|t| t.contains('.') || t.contains('/'))
        .map(str::to_string);
    (language, filepath)
}

/// Recognize and strip a `// file: path` or `# file: path` first line.
fn take_file_comment(content: &str) -> Option<(String, String)> {
    let first_line = content.lines().next()?;
    let lowered = first_line.trim().to_lowercase();
    let path_start = ["// file:", "// filepath:", "# file:", "# filepath:"]
        .iter()
        .find_map(|prefix| lowered.starts_with(prefix).then(|| prefix.len()))?;
    let path = first_line.trim()[path_start..].trim().to_string();
    if path.is_empty() {
        return None;
    }
    let rest = content
        .lines()
        .skip(1)
        .map(|l| format!("{l}\n"))
        .collect::<String>();
    Some((path, rest))
}
