use crate::config::IngestConfig;

/// Split document text into overlapping chunks for embedding.
///
/// Sizes use the ~4 characters per token approximation. Chunk ends are pulled
/// back to the last whitespace or sentence punctuation within the final fifth
/// of the window when one exists. All cuts land on UTF-8 boundaries.
pub fn chunk_text(text: &str, config: &IngestConfig) -> Vec<String> {
    split_with_overlap(text, config.chunk_size_tokens * 4, config.chunk_overlap_tokens * 4)
}

fn split_with_overlap(text: &str, window: usize, overlap: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    if text.trim().is_empty() || window == 0 {
        return chunks;
    }

    let mut start = 0;
    while start < text.len() {
        let hard_end = floor_boundary(text, start + window);
        let end = if hard_end < text.len() {
            soft_break(text, start, hard_end, window / 5)
        } else {
            hard_end
        };
        // A window narrower than one character still has to make progress.
        let end = if end <= start { ceil_boundary(text, start + 1) } else { end };

        let piece = text[start..end].trim();
        if !piece.is_empty() {
            chunks.push(piece.to_string());
        }
        if end >= text.len() {
            break;
        }

        // Overlap restarts at a word start inside the trailing `overlap` bytes.
        let back = floor_boundary(text, end.saturating_sub(overlap));
        let next = text[back..end]
            .char_indices()
            .find(|(_, c)| c.is_whitespace())
            .map(|(offset, c)| back + offset + c.len_utf8())
            .unwrap_or(back);
        start = if next > start && next < end { next } else { end };
    }

    chunks
}

/// Last break point in `(hard_end - lookback, hard_end]`, or `hard_end` if none.
fn soft_break(text: &str, start: usize, hard_end: usize, lookback: usize) -> usize {
    let from = floor_boundary(text, hard_end.saturating_sub(lookback).max(start));
    text[from..hard_end]
        .char_indices()
        .rev()
        .find(|(_, c)| c.is_whitespace() || matches!(c, '.' | '!' | '?'))
        .map(|(offset, c)| from + offset + c.len_utf8())
        .unwrap_or(hard_end)
}

fn floor_boundary(text: &str, idx: usize) -> usize {
    if idx >= text.len() {
        return text.len();
    }
    (0..=idx).rev().find(|&i| text.is_char_boundary(i)).unwrap_or(0)
}

fn ceil_boundary(text: &str, idx: usize) -> usize {
    (idx..text.len()).find(|&i| text.is_char_boundary(i)).unwrap_or(text.len())
}
