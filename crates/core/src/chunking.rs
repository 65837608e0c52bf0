use crate::models::{ChunkType, ChunkingStrategy};
use pulldown_cmark::{Event, Parser, Tag, TagEnd};
use regex::Regex;
use std::sync::OnceLock;

pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .replace('\u{a0}', " ")
}

/// Collapses runs of spaces and tabs and drops blank lines, keeping line structure.
pub fn collapse_inline_whitespace(text: &str) -> String {
    text.lines()
        .map(normalize_whitespace)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn url_and_email_regex() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"(?i)(https?://\S+|www\.\S+|[\w.+-]+@[\w-]+\.[\w.-]+)").ok())
        .as_ref()
}

pub fn strip_urls_and_emails(text: &str) -> String {
    match url_and_email_regex() {
        Some(pattern) => pattern.replace_all(text, "").into_owned(),
        None => text.to_string(),
    }
}

pub fn chunk_text(text: &str, strategy: &ChunkingStrategy) -> Vec<String> {
    let mut prepared = text.replace("\r\n", "\n");
    if strategy.trim_url_and_email {
        prepared = strip_urls_and_emails(&prepared);
    }
    if strategy.trim_space {
        prepared = collapse_inline_whitespace(&prepared);
    }

    match strategy.chunk_type {
        ChunkType::LevelByHeading => split_by_heading(&prepared, strategy),
        ChunkType::Default | ChunkType::Custom => split_fixed(&prepared, strategy),
    }
}

pub fn split_fixed(text: &str, strategy: &ChunkingStrategy) -> Vec<String> {
    let max_chars = strategy.chunk_size.max(1);
    let overlap_chars = (max_chars * strategy.overlap.min(100) / 100).min(max_chars - 1);

    let pieces: Vec<&str> = if strategy.separator.is_empty() {
        vec![text.trim()]
    } else {
        text.split(strategy.separator.as_str())
            .map(str::trim)
            .filter(|piece| !piece.is_empty())
            .collect()
    };
    let separator_len = strategy.separator.chars().count();

    let mut merged = Vec::new();
    let mut current = String::new();
    for piece in pieces {
        let piece_len = piece.chars().count();
        if current.is_empty() {
            current.push_str(piece);
            continue;
        }

        if current.chars().count() + separator_len + piece_len <= max_chars {
            current.push_str(&strategy.separator);
            current.push_str(piece);
            continue;
        }

        let tail = char_tail(&current, overlap_chars);
        merged.push(std::mem::take(&mut current));
        if !tail.is_empty() && tail.chars().count() + separator_len + piece_len <= max_chars {
            current.push_str(&tail);
            current.push_str(&strategy.separator);
        }
        current.push_str(piece);
    }
    if !current.trim().is_empty() {
        merged.push(current);
    }

    let mut chunks = Vec::new();
    for chunk in merged {
        let chars: Vec<char> = chunk.chars().collect();
        if chars.len() <= max_chars {
            chunks.push(chunk);
            continue;
        }

        let mut start = 0;
        while start < chars.len() {
            let end = (start + max_chars).min(chars.len());
            chunks.push(chars[start..end].iter().collect());
            if end == chars.len() {
                break;
            }
            start = start.saturating_add(max_chars - overlap_chars);
        }
    }

    chunks
}

fn char_tail(text: &str, count: usize) -> String {
    if count == 0 {
        return String::new();
    }
    let total = text.chars().count();
    text.chars().skip(total.saturating_sub(count)).collect()
}

/// Splits markdown into one chunk per heading section up to `max_depth`.
/// Deeper headings stay inside their parent section.
pub fn split_by_heading(markdown: &str, strategy: &ChunkingStrategy) -> Vec<String> {
    let max_depth = strategy.max_depth.max(1);
    let mut sections: Vec<(Vec<String>, String)> = Vec::new();
    let mut titles: Vec<(usize, String)> = Vec::new();
    let mut body = String::new();
    let mut open_heading: Option<(usize, String)> = None;

    for event in Parser::new(markdown) {
        match event {
            Event::Start(Tag::Heading { level, .. }) if (level as usize) <= max_depth => {
                let path = titles.iter().map(|(_, title)| title.clone()).collect();
                sections.push((path, std::mem::take(&mut body)));
                open_heading = Some((level as usize, String::new()));
            }
            Event::End(TagEnd::Heading(_)) => match open_heading.take() {
                Some((level, text)) => {
                    titles.retain(|(existing, _)| *existing < level);
                    titles.push((level, text.trim().to_string()));
                }
                None => body.push('\n'),
            },
            Event::Text(text) | Event::Code(text) => match open_heading.as_mut() {
                Some((_, heading)) => heading.push_str(&text),
                None => body.push_str(&text),
            },
            Event::SoftBreak | Event::HardBreak => body.push('\n'),
            Event::End(TagEnd::Paragraph | TagEnd::Item | TagEnd::CodeBlock) => body.push('\n'),
            _ => {}
        }
    }
    let path = titles.iter().map(|(_, title)| title.clone()).collect();
    sections.push((path, body));

    let fixed = ChunkingStrategy {
        chunk_type: ChunkType::Custom,
        ..strategy.clone()
    };
    let mut chunks = Vec::new();
    for (path, body) in sections {
        let body = body.trim();
        if body.is_empty() {
            continue;
        }
        let mut section = String::new();
        if strategy.save_title && !path.is_empty() {
            section.push_str(&path.join("\n"));
            section.push('\n');
        }
        section.push_str(body);
        chunks.extend(split_fixed(&section, &fixed));
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitespace_is_normalized() {
        let input = "A  \t  lot\nof   spacing";
        let normalized = normalize_whitespace(input);
        assert_eq!(normalized, "A lot of spacing");
    }

    #[test]
    fn fixed_split_merges_pieces_up_to_chunk_size() {
        let strategy = ChunkingStrategy::custom(12, "\n", 0);
        let chunks = split_fixed("alpha\nbeta\ngamma\ndelta", &strategy);
        assert_eq!(chunks, vec!["alpha\nbeta", "gamma\ndelta"]);
    }

    #[test]
    fn overlong_pieces_are_cut_with_overlap() {
        let strategy = ChunkingStrategy::custom(10, "\n", 20);
        let chunks = split_fixed("abcdefghijklmnopqrstuvwxyz", &strategy);
        assert_eq!(chunks[0], "abcdefghij");
        assert_eq!(chunks[1], "ijklmnopqr");
        assert!(chunks.iter().all(|chunk| chunk.chars().count() <= 10));
    }

    #[test]
    fn heading_split_keeps_title_path_when_requested() {
        let strategy = ChunkingStrategy {
            chunk_type: ChunkType::LevelByHeading,
            max_depth: 2,
            save_title: true,
            ..ChunkingStrategy::custom(500, "\n", 0)
        };
        let markdown = "# Pumps\nintro text\n\n## Seals\nseal details\n\n### Deep\ndeep text\n";
        let chunks = split_by_heading(markdown, &strategy);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].starts_with("Pumps\nintro text"));
        assert!(chunks[1].starts_with("Pumps\nSeals\nseal details"));
        assert!(chunks[1].contains("deep text"));
    }

    #[test]
    fn urls_and_emails_are_removed() {
        let cleaned = strip_urls_and_emails("mail ops@example.com or see https://example.com/x now");
        assert_eq!(normalize_whitespace(&cleaned), "mail or see now");
    }
}
